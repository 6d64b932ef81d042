//! Query translator
//!
//! Rewrites statements written in the embedded engine's dialect into the
//! dialect of one backend provider:
//!
//! 1. The lexer drops comments, uppercases keywords and numbers parameters
//!    the way the embedded engine does (`?`, `?NNN`, `:name`, `@name`,
//!    `$name`).
//! 2. Tokens are nested into a parenthesis tree.
//! 3. The rewriter walks the tree level by level, consulting the
//!    [`ProviderAdapter`] for every construct that is spelled differently.
//! 4. Placeholders are emitted last, in target order, which yields the map
//!    from target parameter ordinal to source parameter index.
//!
//! Results are cached per (normalized statement, provider) in a bounded LRU
//! cache owned by the [`QueryTranslator`].

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::dialect::{Affinity, DeclaredType, FunctionRewrite, Provider, ProviderAdapter, UpsertStyle};
use crate::error::{Error, Result};
use crate::types::Value;

/// Highest parameter number the embedded engine accepts
const MAX_PARAM_INDEX: usize = 32766;

const MARK_OPEN: char = '\u{E000}';
const MARK_CLOSE: char = '\u{E001}';

/// Words emitted in uppercase
const KEYWORDS: &[&str] = &[
    "ABORT", "ADD", "ALL", "ALTER", "ANALYZE", "AND", "AS", "ASC", "ATTACH", "AUTOINCREMENT",
    "BEGIN", "BETWEEN", "BY", "CASE", "CAST", "CHECK", "COLLATE", "COLUMN", "COMMIT", "CONFLICT",
    "CONSTRAINT", "CREATE", "CROSS", "CURRENT", "CURRENT_DATE", "CURRENT_TIME",
    "CURRENT_TIMESTAMP", "DEFAULT", "DEFERRED", "DELETE", "DESC", "DETACH", "DISTINCT", "DO",
    "DROP", "ELSE", "END", "ESCAPE", "EXCEPT", "EXCLUSIVE", "EXISTS", "EXPLAIN", "FAIL", "FALSE",
    "FILTER", "FIRST", "FOLLOWING", "FOREIGN", "FROM", "FULL", "GLOB", "GROUP", "GROUPS",
    "HAVING", "IF", "IGNORE", "IMMEDIATE", "IN", "INDEX", "INDEXED", "INNER", "INSERT",
    "INTERSECT", "INTO", "IS", "ISNULL", "JOIN", "KEY", "LAST", "LEFT", "LIKE", "LIMIT", "MATCH",
    "NATURAL", "NOT", "NOTHING", "NOTNULL", "NULL", "NULLS", "OFFSET", "ON", "OR", "ORDER",
    "OUTER", "OVER", "PARTITION", "PRAGMA", "PRECEDING", "PRIMARY", "RANGE", "RECURSIVE",
    "REFERENCES", "REGEXP", "REINDEX", "RELEASE", "RENAME", "REPLACE", "RETURNING", "RIGHT",
    "ROLLBACK", "ROW", "ROWID", "ROWS", "SAVEPOINT", "SELECT", "SET", "STRICT", "TABLE", "TEMP",
    "TEMPORARY", "THEN", "TO", "TRANSACTION", "TRIGGER", "TRUE", "UNBOUNDED", "UNION", "UNIQUE",
    "UPDATE", "USING", "VACUUM", "VALUES", "VIEW", "VIRTUAL", "WHEN", "WHERE", "WINDOW", "WITH",
    "WITHOUT",
];

/// Keywords that may precede a parenthesized group without forming a call
const CLAUSE_KEYWORDS: &[&str] = &[
    "ALL", "AND", "AS", "BETWEEN", "BY", "CASE", "CHECK", "DEFAULT", "DISTINCT", "ELSE", "EXCEPT",
    "EXISTS", "FILTER", "FROM", "HAVING", "IN", "INTERSECT", "INTO", "IS", "JOIN", "KEY", "LIKE",
    "LIMIT", "NOT", "OFFSET", "ON", "OR", "OVER", "RECURSIVE", "RETURNING", "SELECT", "SET",
    "THEN", "UNION", "UNIQUE", "USING", "VALUES", "WHEN", "WHERE", "WITH",
];

/// Keywords that stand for a value
const OPERAND_KEYWORDS: &[&str] = &[
    "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "NULL", "ROWID",
];

/// Words that end the type of a column definition
const CONSTRAINT_WORDS: &[&str] = &[
    "AS", "CHECK", "COLLATE", "CONSTRAINT", "DEFAULT", "GENERATED", "NOT", "NULL", "PRIMARY",
    "REFERENCES", "UNIQUE",
];

/// Statement classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Returns rows
    Query,
    /// INSERT, UPDATE, DELETE
    Dml,
    /// CREATE, ALTER, DROP
    Ddl,
    /// Transaction control
    Transaction,
    /// Accepted and dropped (PRAGMA)
    Noop,
}

/// A translated statement
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedQuery {
    /// Hash of the normalized source statement
    pub fingerprint: u64,
    /// Target provider
    pub provider: Provider,
    /// Translated SQL, empty for no-ops
    pub sql: String,
    /// Source parameter index (0-based) for each target placeholder
    pub param_order: Vec<usize>,
    /// Number of parameters the source statement declares
    pub source_param_count: usize,
    /// Statement class
    pub kind: StatementKind,
    /// Whether executing the statement yields rows
    pub returns_rows: bool,
}

impl TranslatedQuery {
    /// Whether there is nothing to send to the backend
    pub fn is_noop(&self) -> bool {
        self.kind == StatementKind::Noop || self.sql.is_empty()
    }

    /// Reorder parameters given in source order into target order
    pub fn bind(&self, params: &[Value]) -> Result<Vec<Value>> {
        if params.len() != self.source_param_count {
            return Err(Error::query_with_sql(
                format!(
                    "statement expects {} parameters, got {}",
                    self.source_param_count,
                    params.len()
                ),
                self.sql.clone(),
            ));
        }
        self.param_order
            .iter()
            .map(|&idx| {
                params
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| Error::internal(format!("parameter {} out of range", idx + 1)))
            })
            .collect()
    }
}

/// Translation cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatorStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that ran the translator
    pub misses: u64,
    /// Cached translations
    pub entries: u64,
}

/// Caching translator, one per bridge
pub struct QueryTranslator {
    cache: Cache<(String, Provider), Arc<TranslatedQuery>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryTranslator {
    /// Create a translator caching up to `capacity` statements
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity.max(1))
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Translate a statement, serving repeated statements from the cache
    pub fn translate(&self, sql: &str, provider: Provider) -> Result<Arc<TranslatedQuery>> {
        let lexed = lex(sql)?;
        let key = (source_text(&lexed.tokens), provider);

        if let Some(hit) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(fingerprint = hit.fingerprint, %provider, "Translation cache hit");
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let translated = Arc::new(translate_lexed(&lexed, &key.0, provider)?);
        debug!(
            fingerprint = translated.fingerprint,
            %provider,
            kind = ?translated.kind,
            "Translated statement"
        );
        self.cache.insert(key, translated.clone());
        Ok(translated)
    }

    /// Cache statistics
    pub fn stats(&self) -> TranslatorStats {
        self.cache.run_pending_tasks();
        TranslatorStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }

    /// Drop every cached translation
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }
}

impl std::fmt::Debug for QueryTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryTranslator")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Translate a statement without caching
pub fn translate(sql: &str, provider: Provider) -> Result<TranslatedQuery> {
    let lexed = lex(sql)?;
    let normalized = source_text(&lexed.tokens);
    translate_lexed(&lexed, &normalized, provider)
}

fn translate_lexed(lexed: &Lexed, normalized: &str, provider: Provider) -> Result<TranslatedQuery> {
    let statements: Vec<&[Token]> = lexed
        .tokens
        .split(|t| matches!(t, Token::Semicolon))
        .filter(|s| !s.is_empty())
        .collect();
    let tokens = match statements.as_slice() {
        [] => return Err(Error::translation("empty statement")),
        [single] => *single,
        _ => {
            return Err(Error::translation_with_sql(
                "multiple statements are not supported",
                normalized,
            ))
        }
    };

    let adapter = provider.adapter();
    let mut rewriter = Rewriter::new(adapter);
    let (marked, kind, returns_rows) = rewriter
        .statement(tokens)
        .map_err(|e| match e {
            Error::Translation { message, sql: None } => {
                Error::translation_with_sql(message, normalized)
            }
            other => other,
        })?;
    let (sql, param_order) = assign_placeholders(adapter, &marked)?;

    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);

    Ok(TranslatedQuery {
        fingerprint: hasher.finish(),
        provider,
        sql,
        param_order,
        source_param_count: lexed.param_count,
        kind,
        returns_rows,
    })
}

/// Replace parameter markers with target placeholders
fn assign_placeholders(adapter: &dyn ProviderAdapter, marked: &str) -> Result<(String, Vec<usize>)> {
    let mut out = String::with_capacity(marked.len());
    let mut order: Vec<usize> = Vec::new();
    let mut rest = marked;

    while let Some(start) = rest.find(MARK_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + MARK_OPEN.len_utf8()..];
        let end = after
            .find(MARK_CLOSE)
            .ok_or_else(|| Error::internal("unterminated parameter marker"))?;
        let source = after[..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .ok_or_else(|| Error::internal("malformed parameter marker"))?;

        let ordinal = match order.iter().position(|&s| s == source) {
            Some(existing) if adapter.numbered_placeholders() => existing + 1,
            _ => {
                order.push(source);
                order.len()
            }
        };
        out.push_str(&adapter.placeholder(ordinal));
        rest = &after[end + MARK_CLOSE.len_utf8()..];
    }
    out.push_str(rest);
    Ok((out, order))
}

// ===========================================================================
// Lexer
// ===========================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Unquoted word; keywords are uppercased
    Word(String),
    /// Quoted identifier, unescaped
    Ident(String),
    /// String literal, unescaped
    Str(String),
    /// Blob literal hex digits
    Blob(String),
    Number(String),
    /// 1-based source parameter index
    Param(usize),
    Op(&'static str),
    Comma,
    Dot,
    Semicolon,
    Group(Vec<Token>),
}

impl Token {
    fn is_kw(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    fn is_name(&self) -> bool {
        matches!(self, Token::Word(_) | Token::Ident(_))
    }
}

fn kw_at(tokens: &[Token], idx: usize, kw: &str) -> bool {
    tokens.get(idx).is_some_and(|t| t.is_kw(kw))
}

enum Raw {
    Tok(Token),
    Open,
    Close,
}

struct Lexed {
    tokens: Vec<Token>,
    param_count: usize,
}

#[derive(Default)]
struct ParamNumbering {
    max: usize,
    named: HashMap<String, usize>,
}

impl ParamNumbering {
    fn next(&mut self) -> Result<usize> {
        self.numbered(self.max + 1)
    }

    fn numbered(&mut self, index: usize) -> Result<usize> {
        if index == 0 || index > MAX_PARAM_INDEX {
            return Err(Error::translation(format!(
                "parameter index must be between 1 and {}",
                MAX_PARAM_INDEX
            )));
        }
        self.max = self.max.max(index);
        Ok(index)
    }

    fn named(&mut self, name: String) -> Result<usize> {
        if let Some(&index) = self.named.get(&name) {
            return Ok(index);
        }
        let index = self.next()?;
        self.named.insert(name, index);
        Ok(index)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || (!c.is_ascii() && !c.is_whitespace())
}

fn is_ident_char(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit() || c == '$'
}

fn normalize_word(word: &str) -> String {
    let upper = word.to_ascii_uppercase();
    if KEYWORDS.contains(&upper.as_str()) {
        upper
    } else {
        word.to_string()
    }
}

/// Read a quoted run starting at the opening quote; doubled quotes escape
fn read_quoted(chars: &[char], start: usize, quote: char) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut i = start + 1;
    loop {
        match chars.get(i) {
            None => return Err(Error::translation("unterminated quoted literal")),
            Some(&c) if c == quote => {
                if chars.get(i + 1) == Some(&quote) {
                    out.push(quote);
                    i += 2;
                } else {
                    return Ok((out, i + 1));
                }
            }
            Some(&c) => {
                out.push(c);
                i += 1;
            }
        }
    }
}

fn lex(sql: &str) -> Result<Lexed> {
    if sql.contains([MARK_OPEN, MARK_CLOSE]) {
        return Err(Error::translation("statement contains reserved characters"));
    }

    let chars: Vec<char> = sql.chars().collect();
    let mut raw: Vec<Raw> = Vec::new();
    let mut params = ParamNumbering::default();
    let mut i = 0;

    let take_while = |from: usize, pred: &dyn Fn(char) -> bool| -> usize {
        let mut end = from;
        while end < chars.len() && pred(chars[end]) {
            end += 1;
        }
        end
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match c {
            c if c.is_whitespace() => i += 1,
            '-' if next == Some('-') => {
                i = take_while(i, &|c| c != '\n');
            }
            '/' if next == Some('*') => {
                let mut end = i + 2;
                while end < chars.len() && !(chars[end] == '*' && chars.get(end + 1) == Some(&'/')) {
                    end += 1;
                }
                i = (end + 2).min(chars.len());
            }
            '\'' => {
                let (s, end) = read_quoted(&chars, i, '\'')?;
                raw.push(Raw::Tok(Token::Str(s)));
                i = end;
            }
            '"' | '`' => {
                let (s, end) = read_quoted(&chars, i, c)?;
                raw.push(Raw::Tok(Token::Ident(s)));
                i = end;
            }
            '[' => {
                let end = take_while(i + 1, &|c| c != ']');
                if end >= chars.len() {
                    return Err(Error::translation("unterminated bracketed identifier"));
                }
                raw.push(Raw::Tok(Token::Ident(chars[i + 1..end].iter().collect())));
                i = end + 1;
            }
            'x' | 'X' if next == Some('\'') => {
                let (hex, end) = read_quoted(&chars, i + 1, '\'')?;
                if hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(Error::translation("malformed blob literal"));
                }
                raw.push(Raw::Tok(Token::Blob(hex.to_ascii_uppercase())));
                i = end;
            }
            '0' if matches!(next, Some('x' | 'X'))
                && chars.get(i + 2).is_some_and(|c| c.is_ascii_hexdigit()) =>
            {
                let end = take_while(i + 2, &|c| c.is_ascii_hexdigit());
                let digits: String = chars[i + 2..end].iter().collect();
                let value = u64::from_str_radix(&digits, 16)
                    .map_err(|_| Error::translation("hex literal out of range"))?;
                raw.push(Raw::Tok(Token::Number((value as i64).to_string())));
                i = end;
            }
            '0'..='9' => {
                let end = scan_number(&chars, i)?;
                raw.push(Raw::Tok(Token::Number(chars[i..end].iter().collect())));
                i = end;
            }
            '.' if next.is_some_and(|c| c.is_ascii_digit()) && !prev_is_operand(&raw) => {
                let end = scan_number(&chars, i)?;
                raw.push(Raw::Tok(Token::Number(format!(
                    "0{}",
                    chars[i..end].iter().collect::<String>()
                ))));
                i = end;
            }
            '?' => {
                let end = take_while(i + 1, &|c| c.is_ascii_digit());
                let index = if end > i + 1 {
                    let digits: String = chars[i + 1..end].iter().collect();
                    let n = digits
                        .parse()
                        .map_err(|_| Error::translation("parameter index out of range"))?;
                    params.numbered(n)?
                } else {
                    params.next()?
                };
                raw.push(Raw::Tok(Token::Param(index)));
                i = end;
            }
            ':' | '@' | '$' if next.is_some_and(|c| is_ident_char(c)) => {
                let end = take_while(i + 1, &is_ident_char);
                let name: String = chars[i..end].iter().collect();
                raw.push(Raw::Tok(Token::Param(params.named(name)?)));
                i = end;
            }
            c if is_ident_start(c) => {
                let end = take_while(i, &is_ident_char);
                let word: String = chars[i..end].iter().collect();
                raw.push(Raw::Tok(Token::Word(normalize_word(&word))));
                i = end;
            }
            '(' => {
                raw.push(Raw::Open);
                i += 1;
            }
            ')' => {
                raw.push(Raw::Close);
                i += 1;
            }
            ',' => {
                raw.push(Raw::Tok(Token::Comma));
                i += 1;
            }
            '.' => {
                raw.push(Raw::Tok(Token::Dot));
                i += 1;
            }
            ';' => {
                raw.push(Raw::Tok(Token::Semicolon));
                i += 1;
            }
            _ => {
                let (op, len) = scan_operator(c, next, chars.get(i + 2).copied()).ok_or_else(|| {
                    Error::translation(format!("unrecognized token '{}'", c))
                })?;
                raw.push(Raw::Tok(Token::Op(op)));
                i += len;
            }
        }
    }

    Ok(Lexed {
        tokens: build_tree(raw)?,
        param_count: params.max,
    })
}

fn prev_is_operand(raw: &[Raw]) -> bool {
    matches!(
        raw.last(),
        Some(Raw::Close)
            | Some(Raw::Tok(
                Token::Word(_) | Token::Ident(_) | Token::Number(_) | Token::Str(_) | Token::Param(_)
            ))
    )
}

fn scan_number(chars: &[char], start: usize) -> Result<usize> {
    let digits = |mut i: usize| {
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        i
    };
    let mut i = digits(start);
    if chars.get(i) == Some(&'.') {
        i = digits(i + 1);
    }
    if matches!(chars.get(i), Some('e' | 'E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+' | '-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
            i = digits(j);
        }
    }
    if chars.get(i).is_some_and(|&c| is_ident_start(c)) {
        return Err(Error::translation("malformed numeric literal"));
    }
    Ok(i)
}

fn scan_operator(c: char, next: Option<char>, third: Option<char>) -> Option<(&'static str, usize)> {
    let op = match (c, next) {
        ('|', Some('|')) => ("||", 2),
        ('|', _) => ("|", 1),
        ('=', Some('=')) => ("==", 2),
        ('=', _) => ("=", 1),
        ('!', Some('=')) => ("!=", 2),
        ('<', Some('=')) => ("<=", 2),
        ('<', Some('>')) => ("<>", 2),
        ('<', Some('<')) => ("<<", 2),
        ('<', _) => ("<", 1),
        ('>', Some('=')) => (">=", 2),
        ('>', Some('>')) => (">>", 2),
        ('>', _) => (">", 1),
        ('-', Some('>')) if third == Some('>') => ("->>", 3),
        ('-', Some('>')) => ("->", 2),
        ('-', _) => ("-", 1),
        ('+', _) => ("+", 1),
        ('*', _) => ("*", 1),
        ('/', _) => ("/", 1),
        ('%', _) => ("%", 1),
        ('&', _) => ("&", 1),
        ('~', _) => ("~", 1),
        _ => return None,
    };
    Some(op)
}

fn build_tree(raw: Vec<Raw>) -> Result<Vec<Token>> {
    let mut stack: Vec<Vec<Token>> = vec![Vec::new()];
    for item in raw {
        match item {
            Raw::Tok(token) => {
                if let Some(top) = stack.last_mut() {
                    top.push(token);
                }
            }
            Raw::Open => stack.push(Vec::new()),
            Raw::Close => {
                if stack.len() < 2 {
                    return Err(Error::translation("unbalanced ')'"));
                }
                let group = stack.pop().unwrap_or_default();
                if let Some(top) = stack.last_mut() {
                    top.push(Token::Group(group));
                }
            }
        }
    }
    if stack.len() != 1 {
        return Err(Error::translation("unbalanced '('"));
    }
    Ok(stack.pop().unwrap_or_default())
}

/// Canonical source-dialect text, used as the cache key
fn source_text(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        if !out.is_empty() {
            out.push(' ');
        }
        match token {
            Token::Word(w) => out.push_str(w),
            Token::Ident(s) => {
                out.push('"');
                out.push_str(&s.replace('"', "\"\""));
                out.push('"');
            }
            Token::Str(s) => {
                out.push('\'');
                out.push_str(&s.replace('\'', "''"));
                out.push('\'');
            }
            Token::Blob(h) => {
                out.push_str("X'");
                out.push_str(h);
                out.push('\'');
            }
            Token::Number(n) => out.push_str(n),
            Token::Param(i) => {
                out.push('?');
                out.push_str(&i.to_string());
            }
            Token::Op(o) => out.push_str(o),
            Token::Comma => out.push(','),
            Token::Dot => out.push('.'),
            Token::Semicolon => out.push(';'),
            Token::Group(g) => {
                out.push('(');
                out.push_str(&source_text(g));
                out.push(')');
            }
        }
    }
    out
}

fn split_commas(tokens: &[Token]) -> Vec<&[Token]> {
    if tokens.is_empty() {
        return Vec::new();
    }
    tokens.split(|t| matches!(t, Token::Comma)).collect()
}

fn marker(index: usize) -> String {
    format!("{}{}{}", MARK_OPEN, index, MARK_CLOSE)
}

/// Substitute `{n}` with the n-th argument in a single pass
fn expand(template: &str, args: &[String]) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let slot = after
            .find('}')
            .and_then(|close| after[..close].parse::<usize>().ok().map(|n| (n, close)));
        match slot {
            Some((n, close)) => {
                let arg = args
                    .get(n)
                    .ok_or_else(|| Error::internal(format!("template refers to missing argument {}", n)))?;
                out.push_str(arg);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

// ===========================================================================
// Rewriter
// ===========================================================================

/// Rendered fragment of one nesting level
#[derive(Debug, Clone)]
enum Unit {
    /// Self-contained operand
    Term(String),
    Op(String),
    Word(String),
    Comma,
}

fn join_units(units: Vec<Unit>) -> String {
    let mut out = String::new();
    for unit in units {
        match unit {
            Unit::Comma => out.push(','),
            Unit::Term(s) | Unit::Op(s) | Unit::Word(s) => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&s);
            }
        }
    }
    out
}

/// Attach prefix operators to their operand
fn fold_unary(units: Vec<Unit>) -> Vec<Unit> {
    let mut out: Vec<Unit> = Vec::with_capacity(units.len());
    let mut iter = units.into_iter().peekable();
    while let Some(unit) = iter.next() {
        let prefix = matches!(&unit, Unit::Op(o) if o == "-" || o == "+" || o == "~")
            && !matches!(out.last(), Some(Unit::Term(_)));
        if prefix {
            if let (Unit::Op(op), Some(Unit::Term(_))) = (&unit, iter.peek()) {
                if let Some(Unit::Term(operand)) = iter.next() {
                    out.push(Unit::Term(format!("{}{}", op, operand)));
                    continue;
                }
            }
        }
        out.push(unit);
    }
    out
}

fn is_concat(unit: &Unit) -> bool {
    matches!(unit, Unit::Op(o) if o == "||")
}

/// Rewrite `a || b || c` chains into `CONCAT(a, b, c)`
fn fold_concat(units: Vec<Unit>) -> Result<Vec<Unit>> {
    let operand_error = || Error::translation("operands of || must be simple expressions");
    let mut out = Vec::with_capacity(units.len());
    let mut i = 0;
    while i < units.len() {
        if is_concat(&units[i]) {
            return Err(operand_error());
        }
        if let Unit::Term(first) = &units[i] {
            if units.get(i + 1).is_some_and(is_concat) {
                let mut parts = vec![first.clone()];
                while units.get(i + 1).is_some_and(is_concat) {
                    match units.get(i + 2) {
                        Some(Unit::Term(next)) => parts.push(next.clone()),
                        _ => return Err(operand_error()),
                    }
                    i += 2;
                }
                out.push(Unit::Term(format!("CONCAT({})", parts.join(", "))));
                i += 1;
                continue;
            }
        }
        out.push(units[i].clone());
        i += 1;
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertMode {
    Plain,
    Ignore,
    Replace,
}

struct Rewriter<'a> {
    adapter: &'a dyn ProviderAdapter,
    /// Inside column definitions, where `NOT NULL` and `CURRENT_TIMESTAMP`
    /// keep their DDL meaning
    ddl: bool,
    /// Rewrite `excluded.col` as `VALUES(col)`
    excluded_as_values: bool,
}

impl<'a> Rewriter<'a> {
    fn new(adapter: &'a dyn ProviderAdapter) -> Self {
        Self {
            adapter,
            ddl: false,
            excluded_as_values: false,
        }
    }

    fn unsupported(&self, what: &str) -> Error {
        Error::translation(format!("{} has no equivalent on {}", what, self.adapter.name()))
    }

    fn statement(&mut self, tokens: &[Token]) -> Result<(String, StatementKind, bool)> {
        let first = match tokens.first() {
            Some(Token::Word(w)) => w.to_ascii_uppercase(),
            _ => return Err(Error::translation("statement must start with a keyword")),
        };
        let has_returning = tokens.iter().any(|t| t.is_kw("RETURNING"));

        match first.as_str() {
            "SELECT" | "VALUES" => Ok((self.level(tokens)?, StatementKind::Query, true)),
            "WITH" => {
                let writes = tokens.iter().any(|t| {
                    t.is_kw("INSERT") || t.is_kw("UPDATE") || t.is_kw("DELETE") || t.is_kw("REPLACE")
                });
                let kind = if writes {
                    StatementKind::Dml
                } else {
                    StatementKind::Query
                };
                let returns_rows = !writes || has_returning;
                Ok((self.level(tokens)?, kind, returns_rows))
            }
            "INSERT" | "REPLACE" => Ok((self.insert(tokens)?, StatementKind::Dml, has_returning)),
            "UPDATE" => {
                if kw_at(tokens, 1, "OR") {
                    return Err(self.unsupported("UPDATE OR <conflict>"));
                }
                Ok((self.write(tokens)?, StatementKind::Dml, has_returning))
            }
            "DELETE" => Ok((self.write(tokens)?, StatementKind::Dml, has_returning)),
            "CREATE" => Ok((self.create(tokens)?, StatementKind::Ddl, false)),
            "ALTER" => Ok((self.alter(tokens)?, StatementKind::Ddl, false)),
            "DROP" => Ok((self.level(tokens)?, StatementKind::Ddl, false)),
            "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
                let sql = self.transaction(&first, tokens)?;
                let kind = if sql.is_empty() {
                    StatementKind::Noop
                } else {
                    StatementKind::Transaction
                };
                Ok((sql, kind, false))
            }
            "PRAGMA" => Ok((String::new(), StatementKind::Noop, false)),
            "ATTACH" | "DETACH" | "VACUUM" | "ANALYZE" | "REINDEX" | "EXPLAIN" => {
                Err(self.unsupported(&first))
            }
            other => Err(Error::translation(format!("unsupported statement '{}'", other))),
        }
    }

    /// UPDATE or DELETE; a row-count LIMIT needs backend support and never
    /// carries an offset
    fn write(&mut self, tokens: &[Token]) -> Result<String> {
        if let Some(i) = tokens.iter().position(|t| t.is_kw("LIMIT")) {
            let paging = &tokens[i + 1..];
            let unbounded = matches!(paging, [Token::Op("-"), Token::Number(_)]);
            if !unbounded {
                if !self.adapter.capabilities().dml_limit {
                    return Err(self.unsupported("LIMIT on UPDATE or DELETE"));
                }
                if paging
                    .iter()
                    .any(|t| t.is_kw("OFFSET") || matches!(t, Token::Comma))
                {
                    return Err(self.unsupported("OFFSET on UPDATE or DELETE"));
                }
            }
        }
        self.level(tokens)
    }

    /// Render one nesting level, including its pagination clause
    fn level(&mut self, tokens: &[Token]) -> Result<String> {
        let limit_at = tokens.iter().position(|t| t.is_kw("LIMIT"));
        let (body, paging) = match limit_at {
            Some(i) => (&tokens[..i], Some(&tokens[i + 1..])),
            None => (tokens, None),
        };

        let mut sql = self.expression(body)?;
        if let Some(paging) = paging {
            let clause = self.pagination(body, paging)?;
            if !clause.is_empty() {
                if !sql.is_empty() {
                    sql.push(' ');
                }
                sql.push_str(&clause);
            }
        }
        Ok(sql)
    }

    fn expression(&mut self, tokens: &[Token]) -> Result<String> {
        let mut units = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            i += self.unit(tokens, i, &mut units)?;
        }

        let units = fold_unary(units);
        let units = if self.adapter.capabilities().pipe_concat {
            units
        } else {
            fold_concat(units)?
        };
        Ok(join_units(units))
    }

    fn pagination(&mut self, body: &[Token], paging: &[Token]) -> Result<String> {
        let (limit, offset) = if let Some(i) = paging.iter().position(|t| t.is_kw("OFFSET")) {
            (&paging[..i], Some(&paging[i + 1..]))
        } else if let Some(i) = paging.iter().position(|t| matches!(t, Token::Comma)) {
            // LIMIT <offset>, <limit>
            (&paging[i + 1..], Some(&paging[..i]))
        } else {
            (paging, None)
        };
        if limit.is_empty() || offset.is_some_and(<[Token]>::is_empty) {
            return Err(Error::translation("malformed LIMIT clause"));
        }

        let unbounded = matches!(limit, [Token::Op("-"), Token::Number(_)]);
        let limit = if unbounded {
            None
        } else {
            Some(self.level(limit)?)
        };
        let offset = offset.map(|o| self.level(o)).transpose()?;
        if limit.is_none() && offset.is_none() {
            return Ok(String::new());
        }

        let mut clause = String::new();
        let has_order = body
            .windows(2)
            .any(|w| w[0].is_kw("ORDER") && w[1].is_kw("BY"));
        if self.adapter.capabilities().pagination_requires_order && !has_order {
            clause.push_str("ORDER BY (SELECT NULL) ");
        }
        clause.push_str(&self.adapter.pagination_sql(limit.as_deref(), offset.as_deref()));
        Ok(clause)
    }

    /// Render the unit starting at `tokens[i]`, returning how many tokens it used
    fn unit(&mut self, tokens: &[Token], i: usize, out: &mut Vec<Unit>) -> Result<usize> {
        match &tokens[i] {
            Token::Word(_) => self.word(tokens, i, out),
            Token::Ident(_) => self.name(tokens, i, out),
            Token::Str(s) => {
                out.push(Unit::Term(self.adapter.string_literal(s)));
                Ok(1)
            }
            Token::Blob(hex) => {
                out.push(Unit::Term(self.adapter.blob_literal(hex)));
                Ok(1)
            }
            Token::Number(n) => {
                out.push(Unit::Term(n.clone()));
                Ok(1)
            }
            Token::Param(index) => {
                out.push(Unit::Term(marker(*index)));
                Ok(1)
            }
            Token::Op(op) => {
                let op = match *op {
                    "==" => "=",
                    "!=" => "<>",
                    other => other,
                };
                out.push(Unit::Op(op.to_string()));
                Ok(1)
            }
            Token::Comma => {
                out.push(Unit::Comma);
                Ok(1)
            }
            Token::Group(inner) => {
                out.push(Unit::Term(format!("({})", self.level(inner)?)));
                Ok(1)
            }
            Token::Dot => Err(Error::translation("unexpected '.'")),
            Token::Semicolon => Err(Error::translation("unexpected ';'")),
        }
    }

    fn word(&mut self, tokens: &[Token], i: usize, out: &mut Vec<Unit>) -> Result<usize> {
        let Token::Word(word) = &tokens[i] else {
            return Err(Error::internal("word expected"));
        };
        let upper = word.to_ascii_uppercase();
        let next = tokens.get(i + 1);
        let next_is_group = matches!(next, Some(Token::Group(_)));

        match upper.as_str() {
            "TRUE" | "FALSE" => {
                out.push(Unit::Term(self.adapter.boolean_literal(upper == "TRUE").to_string()));
                Ok(1)
            }
            "CAST" if next_is_group => {
                let Some(Token::Group(inner)) = next else {
                    return Err(Error::internal("group expected"));
                };
                out.push(Unit::Term(self.cast(inner)?));
                Ok(2)
            }
            "CURRENT_TIMESTAMP" | "CURRENT_DATE" | "CURRENT_TIME" if !self.ddl => {
                let key = match upper.as_str() {
                    "CURRENT_DATE" => "date('now')",
                    "CURRENT_TIME" => "time('now')",
                    _ => "datetime('now')",
                };
                let term = match self.adapter.map_function(key, 1) {
                    Some(FunctionRewrite::Template(t)) => t.to_string(),
                    _ => upper,
                };
                out.push(Unit::Term(term));
                Ok(1)
            }
            "LIKE" => {
                out.push(Unit::Word(self.adapter.like_operator().to_string()));
                Ok(1)
            }
            "GLOB" | "MATCH" => Err(self.unsupported(&upper)),
            "REGEXP" => {
                let op = self
                    .adapter
                    .regexp_operator(false)
                    .ok_or_else(|| self.unsupported("REGEXP"))?;
                out.push(Unit::Op(op.to_string()));
                Ok(1)
            }
            "NOT" if kw_at(tokens, i + 1, "REGEXP") => {
                let op = self
                    .adapter
                    .regexp_operator(true)
                    .ok_or_else(|| self.unsupported("REGEXP"))?;
                out.push(Unit::Op(op.to_string()));
                Ok(2)
            }
            "NOT" if kw_at(tokens, i + 1, "INDEXED") => Ok(2),
            "NOT" if kw_at(tokens, i + 1, "NULL") && !self.ddl => {
                out.push(Unit::Word("IS NOT NULL".to_string()));
                Ok(2)
            }
            "INDEXED" if kw_at(tokens, i + 1, "BY") => Ok(3.min(tokens.len() - i)),
            "ISNULL" if !next_is_group => {
                out.push(Unit::Word("IS NULL".to_string()));
                Ok(1)
            }
            "NOTNULL" => {
                out.push(Unit::Word("IS NOT NULL".to_string()));
                Ok(1)
            }
            "IS" => self.is_operator(tokens, i, out),
            "RETURNING" => {
                if !self.adapter.capabilities().returning {
                    return Err(self.unsupported("RETURNING"));
                }
                out.push(Unit::Word(upper));
                Ok(1)
            }
            "COLLATE" => {
                let collation = match tokens.get(i + 1) {
                    Some(Token::Word(w)) | Some(Token::Ident(w)) => w.to_ascii_uppercase(),
                    _ => return Err(Error::translation("COLLATE needs a collation name")),
                };
                match collation.as_str() {
                    "BINARY" => {}
                    "NOCASE" if !self.adapter.capabilities().ilike => {}
                    "NOCASE" | "RTRIM" => {
                        return Err(self.unsupported(&format!("COLLATE {}", collation)))
                    }
                    _ => {
                        out.push(Unit::Word(upper));
                        out.push(Unit::Word(collation));
                    }
                }
                Ok(2)
            }
            "AUTOINCREMENT" => Err(Error::translation(
                "AUTOINCREMENT is only allowed on an INTEGER PRIMARY KEY column",
            )),
            "INTO" | "REFERENCES" => {
                out.push(Unit::Word(upper));
                if tokens.get(i + 1).is_some_and(Token::is_name) {
                    let used = self.table_name(tokens, i + 1, out)?;
                    return Ok(1 + used);
                }
                Ok(1)
            }
            _ => {
                if matches!(next, Some(Token::Dot)) {
                    return self.name(tokens, i, out);
                }
                if next_is_group && !CLAUSE_KEYWORDS.contains(&upper.as_str()) {
                    return self.call(word, tokens, i, out);
                }
                if KEYWORDS.contains(&upper.as_str()) && !OPERAND_KEYWORDS.contains(&upper.as_str()) {
                    out.push(Unit::Word(upper));
                } else {
                    out.push(Unit::Term(word.clone()));
                }
                Ok(1)
            }
        }
    }

    /// Render one name part
    fn name_part(&self, token: &Token) -> Result<String> {
        match token {
            Token::Word(w) => Ok(w.clone()),
            Token::Ident(s) => Ok(self.adapter.quote_identifier(s)),
            Token::Op("*") => Ok("*".to_string()),
            _ => Err(Error::translation("malformed qualified name")),
        }
    }

    /// Collect `a.b.c`, returning the rendered parts and tokens used
    fn qualified(&self, tokens: &[Token], i: usize) -> Result<(Vec<String>, usize)> {
        let mut parts = vec![self.name_part(&tokens[i])?];
        let mut j = i + 1;
        while matches!(tokens.get(j), Some(Token::Dot)) {
            let part = tokens
                .get(j + 1)
                .ok_or_else(|| Error::translation("qualified name ends with '.'"))?;
            parts.push(self.name_part(part)?);
            j += 2;
        }
        Ok((parts, j - i))
    }

    /// Qualified name, `excluded.col`, or a quoted name with a column list
    fn name(&mut self, tokens: &[Token], i: usize, out: &mut Vec<Unit>) -> Result<usize> {
        let (parts, used) = self.qualified(tokens, i)?;

        if self.excluded_as_values
            && parts.len() == 2
            && tokens[i].is_kw("EXCLUDED")
        {
            out.push(Unit::Term(format!("VALUES({})", parts[1])));
            return Ok(used);
        }

        let name = parts.join(".");
        if let Some(Token::Group(inner)) = tokens.get(i + used) {
            out.push(Unit::Term(format!("{}({})", name, self.level(inner)?)));
            return Ok(used + 1);
        }
        out.push(Unit::Term(name));
        Ok(used)
    }

    /// Table name with an optional column list, never treated as a call
    fn table_name(&mut self, tokens: &[Token], i: usize, out: &mut Vec<Unit>) -> Result<usize> {
        let (parts, used) = self.qualified(tokens, i)?;
        out.push(Unit::Term(parts.join(".")));
        if let Some(Token::Group(inner)) = tokens.get(i + used) {
            out.push(Unit::Term(format!("({})", self.level(inner)?)));
            return Ok(used + 1);
        }
        Ok(used)
    }

    fn is_operator(&mut self, tokens: &[Token], i: usize, out: &mut Vec<Unit>) -> Result<usize> {
        let mut j = i + 1;
        let mut negated = false;
        if kw_at(tokens, j, "NOT") {
            negated = true;
            j += 1;
        }
        if kw_at(tokens, j, "NULL") {
            let op = if negated { "IS NOT NULL" } else { "IS NULL" };
            out.push(Unit::Word(op.to_string()));
            return Ok(j + 1 - i);
        }
        if kw_at(tokens, j, "DISTINCT") && kw_at(tokens, j + 1, "FROM") {
            negated = !negated;
            j += 2;
        }

        let op = self.adapter.null_safe_operator(negated).ok_or_else(|| {
            self.unsupported(if negated {
                "IS NOT with a non-NULL operand"
            } else {
                "IS with a non-NULL operand"
            })
        })?;
        out.push(Unit::Op(op.to_string()));
        Ok(j - i)
    }

    fn cast(&mut self, inner: &[Token]) -> Result<String> {
        let as_at = inner
            .iter()
            .rposition(|t| t.is_kw("AS"))
            .ok_or_else(|| Error::translation("CAST without AS"))?;
        let expr = self.level(&inner[..as_at])?;
        let declared = source_text(&inner[as_at + 1..]);
        Ok(format!("CAST({} AS {})", expr, self.adapter.cast_type(&declared)))
    }

    fn call(&mut self, name: &str, tokens: &[Token], i: usize, out: &mut Vec<Unit>) -> Result<usize> {
        let Some(Token::Group(inner)) = tokens.get(i + 1) else {
            return Err(Error::internal("call without arguments"));
        };
        let lname = name.to_ascii_lowercase();
        let args = split_commas(inner);
        let distinct = args.first().is_some_and(|a| kw_at(a, 0, "DISTINCT"));
        let is_now = |arg: &[Token]| matches!(arg, [Token::Str(s)] if s.eq_ignore_ascii_case("now"));

        let rendered = match lname.as_str() {
            "strftime" => self.strftime(&args)?,
            "unixepoch" => {
                if args.len() > 1 {
                    return Err(self.unsupported("date/time modifiers"));
                }
                let ts = match args.first() {
                    None => self.adapter.datetime().now_utc.to_string(),
                    Some(arg) if is_now(arg) => self.adapter.datetime().now_utc.to_string(),
                    Some(arg) => self.level(arg)?,
                };
                expand(self.adapter.datetime().epoch_template, &[ts])?
            }
            "date" | "time" | "datetime" if args.len() > 1 => {
                return Err(self.unsupported("date/time modifiers"))
            }
            _ => {
                let now_rewrite = if args.len() == 1 && is_now(args[0]) {
                    self.adapter.map_function(&format!("{}('now')", lname), 1)
                } else {
                    None
                };
                let rewrite = match now_rewrite {
                    Some(rewrite) => Some(rewrite),
                    None => self.adapter.map_function(&lname, args.len()),
                };
                let rendered_args = args
                    .iter()
                    .map(|arg| self.level(arg))
                    .collect::<Result<Vec<_>>>()?;

                match rewrite {
                    None => format!("{}({})", name, rendered_args.join(", ")),
                    Some(FunctionRewrite::Rename(target)) => {
                        format!("{}({})", target, rendered_args.join(", "))
                    }
                    Some(FunctionRewrite::Template(template)) => {
                        if distinct {
                            return Err(self.unsupported(&format!("{}(DISTINCT ..)", lname)));
                        }
                        expand(template, &rendered_args)?
                    }
                    Some(FunctionRewrite::Unsupported(reason)) => {
                        return Err(Error::translation(format!(
                            "{} on {}",
                            reason,
                            self.adapter.name()
                        )))
                    }
                }
            }
        };

        // agg(..) FILTER (WHERE ..)
        if kw_at(tokens, i + 2, "FILTER") {
            if let Some(Token::Group(filter)) = tokens.get(i + 3) {
                if !self.adapter.capabilities().aggregate_filter {
                    return Err(self.unsupported("aggregate FILTER clause"));
                }
                let filter = self.level(filter)?;
                out.push(Unit::Term(format!("{} FILTER ({})", rendered, filter)));
                return Ok(4);
            }
        }

        out.push(Unit::Term(rendered));
        Ok(2)
    }

    fn strftime(&mut self, args: &[&[Token]]) -> Result<String> {
        let format = match args.first() {
            Some([Token::Str(format)]) => format.clone(),
            _ => return Err(Error::translation("strftime() needs a literal format")),
        };
        if args.len() > 2 {
            return Err(self.unsupported("date/time modifiers"));
        }
        let datetime = self.adapter.datetime();
        let ts = match args.get(1) {
            None => datetime.now_utc.to_string(),
            Some([Token::Str(s)]) if s.eq_ignore_ascii_case("now") => datetime.now_utc.to_string(),
            Some(arg) => self.level(arg)?,
        };

        if format == "%s" {
            return expand(datetime.epoch_template, &[ts]);
        }
        let converted = datetime
            .convert_format(&format)
            .ok_or_else(|| self.unsupported(&format!("strftime format '{}'", format)))?;
        expand(
            datetime.format_template,
            &[self.adapter.string_literal(&converted), ts],
        )
    }

    // -----------------------------------------------------------------------
    // INSERT
    // -----------------------------------------------------------------------

    fn insert(&mut self, tokens: &[Token]) -> Result<String> {
        let (mode, rest) = if tokens[0].is_kw("REPLACE") {
            (InsertMode::Replace, &tokens[1..])
        } else if kw_at(tokens, 1, "OR") {
            let action = match tokens.get(2) {
                Some(Token::Word(w)) => w.to_ascii_uppercase(),
                _ => return Err(Error::translation("INSERT OR needs a conflict action")),
            };
            let mode = match action.as_str() {
                "IGNORE" => InsertMode::Ignore,
                "REPLACE" => InsertMode::Replace,
                "ABORT" => InsertMode::Plain,
                other => return Err(self.unsupported(&format!("INSERT OR {}", other))),
            };
            (mode, tokens.get(3..).unwrap_or_default())
        } else {
            (InsertMode::Plain, &tokens[1..])
        };

        let returning_at = rest.iter().position(|t| t.is_kw("RETURNING"));
        let head_end = returning_at.unwrap_or(rest.len());
        let conflict_at = rest[..head_end]
            .windows(2)
            .position(|w| w[0].is_kw("ON") && w[1].is_kw("CONFLICT"));
        let body_end = conflict_at.unwrap_or(head_end);

        let body = self.level(&rest[..body_end])?;
        let style = self.adapter.upsert_style();
        let mut verb = match mode {
            InsertMode::Plain => "INSERT".to_string(),
            InsertMode::Replace => {
                if !self.adapter.supports_replace() {
                    return Err(self.unsupported("REPLACE"));
                }
                "REPLACE".to_string()
            }
            InsertMode::Ignore => match (self.adapter.insert_ignore_prefix(), style) {
                (Some(prefix), _) => prefix.to_string(),
                (None, UpsertStyle::OnConflict) => "INSERT".to_string(),
                (None, _) => return Err(self.unsupported("INSERT OR IGNORE")),
            },
        };

        let mut tail = String::new();
        if mode == InsertMode::Ignore && style == UpsertStyle::OnConflict && conflict_at.is_none() {
            tail.push_str(" ON CONFLICT DO NOTHING");
        }

        if let Some(start) = conflict_at {
            let clause = &rest[start..head_end];
            match style {
                UpsertStyle::OnConflict => {
                    tail.push(' ');
                    tail.push_str(&self.level(clause)?);
                }
                UpsertStyle::OnDuplicateKey => {
                    let do_at = clause
                        .iter()
                        .position(|t| t.is_kw("DO"))
                        .ok_or_else(|| Error::translation("ON CONFLICT without DO"))?;
                    if kw_at(clause, do_at + 1, "NOTHING") {
                        if let Some(prefix) = self.adapter.insert_ignore_prefix() {
                            verb = prefix.to_string();
                        }
                    } else if kw_at(clause, do_at + 1, "UPDATE") && kw_at(clause, do_at + 2, "SET") {
                        let assignments = &clause[do_at + 3..];
                        if assignments.iter().any(|t| t.is_kw("WHERE")) {
                            return Err(self.unsupported("ON CONFLICT DO UPDATE .. WHERE"));
                        }
                        self.excluded_as_values = true;
                        let rendered = self.level(assignments);
                        self.excluded_as_values = false;
                        tail.push_str(" ON DUPLICATE KEY UPDATE ");
                        tail.push_str(&rendered?);
                    } else {
                        return Err(Error::translation("malformed ON CONFLICT clause"));
                    }
                }
                UpsertStyle::None => return Err(self.unsupported("ON CONFLICT")),
            }
        }

        if let Some(start) = returning_at {
            tail.push(' ');
            tail.push_str(&self.level(&rest[start..])?);
        }

        Ok(format!("{} {}{}", verb, body, tail))
    }

    // -----------------------------------------------------------------------
    // DDL
    // -----------------------------------------------------------------------

    fn create(&mut self, tokens: &[Token]) -> Result<String> {
        let what = match tokens.get(1) {
            Some(Token::Word(w)) => w.to_ascii_uppercase(),
            _ => return Err(Error::translation("malformed CREATE statement")),
        };
        match what.as_str() {
            "TABLE" => self.create_table(tokens),
            "INDEX" | "UNIQUE" => self.create_index(tokens),
            "VIEW" => self.level(tokens),
            "TEMP" | "TEMPORARY" => Err(Error::translation(
                "temporary objects are session-local and cannot be shared through a pool",
            )),
            other => Err(self.unsupported(&format!("CREATE {}", other))),
        }
    }

    fn if_not_exists(&self, tokens: &[Token], i: usize) -> Result<bool> {
        if kw_at(tokens, i, "IF") && kw_at(tokens, i + 1, "NOT") && kw_at(tokens, i + 2, "EXISTS") {
            if !self.adapter.capabilities().create_if_not_exists {
                return Err(self.unsupported("IF NOT EXISTS"));
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn create_table(&mut self, tokens: &[Token]) -> Result<String> {
        let mut i = 2;
        let mut head = String::from("CREATE TABLE");
        if self.if_not_exists(tokens, i)? {
            head.push_str(" IF NOT EXISTS");
            i += 3;
        }
        if !tokens.get(i).is_some_and(Token::is_name) {
            return Err(Error::translation("CREATE TABLE needs a table name"));
        }
        let (parts, used) = self.qualified(tokens, i)?;
        let name = parts.join(".");
        i += used;

        match tokens.get(i) {
            Some(Token::Group(defs)) => {
                for option in &tokens[i + 1..] {
                    let dropped = option.is_kw("WITHOUT")
                        || option.is_kw("ROWID")
                        || option.is_kw("STRICT")
                        || matches!(option, Token::Comma);
                    if !dropped {
                        return Err(Error::translation("unsupported table option"));
                    }
                }
                self.ddl = true;
                let columns = split_commas(defs)
                    .into_iter()
                    .map(|def| self.column_def(def))
                    .collect::<Result<Vec<_>>>();
                self.ddl = false;
                Ok(format!("{} {} ({})", head, name, columns?.join(", ")))
            }
            Some(t) if t.is_kw("AS") => {
                if self.adapter.provider() == Provider::SqlServer {
                    return Err(self.unsupported("CREATE TABLE .. AS SELECT"));
                }
                let select = self.level(&tokens[i + 1..])?;
                Ok(format!("{} {} AS {}", head, name, select))
            }
            _ => Err(Error::translation("CREATE TABLE needs a column list")),
        }
    }

    fn create_index(&mut self, tokens: &[Token]) -> Result<String> {
        let on_at = tokens
            .iter()
            .position(|t| t.is_kw("ON"))
            .ok_or_else(|| Error::translation("CREATE INDEX needs ON <table>"))?;
        let exists_at = if tokens[1].is_kw("UNIQUE") { 3 } else { 2 };
        self.if_not_exists(tokens, exists_at)?;

        let head = self.expression(&tokens[..on_at])?;
        let mut units = vec![Unit::Word("ON".to_string())];
        let used = match tokens.get(on_at + 1) {
            Some(t) if t.is_name() => self.table_name(tokens, on_at + 1, &mut units)?,
            _ => return Err(Error::translation("CREATE INDEX needs ON <table>")),
        };
        let tail = self.expression(&tokens[on_at + 1 + used..])?;
        let mut sql = format!("{} {}", head, join_units(units));
        if !tail.is_empty() {
            sql.push(' ');
            sql.push_str(&tail);
        }
        Ok(sql)
    }

    fn column_def(&mut self, def: &[Token]) -> Result<String> {
        let first = def
            .first()
            .ok_or_else(|| Error::translation("empty column definition"))?;
        let table_constraint = ["PRIMARY", "UNIQUE", "CHECK", "FOREIGN", "CONSTRAINT"]
            .iter()
            .any(|kw| first.is_kw(kw));
        if table_constraint {
            return self.expression(def);
        }

        let name = match first {
            Token::Word(w) => w.clone(),
            Token::Ident(s) => self.adapter.quote_identifier(s),
            _ => return Err(Error::translation("column definition needs a name")),
        };

        let mut i = 1;
        let mut type_words: Vec<&str> = Vec::new();
        let mut type_args: Option<String> = None;
        while let Some(token) = def.get(i) {
            match token {
                Token::Word(w) if !CONSTRAINT_WORDS.contains(&w.to_ascii_uppercase().as_str()) => {
                    type_words.push(w);
                    i += 1;
                }
                Token::Group(args) if !type_words.is_empty() => {
                    type_args = Some(source_text(args));
                    i += 1;
                    break;
                }
                _ => break,
            }
        }
        let declared = match &type_args {
            Some(args) => format!("{}({})", type_words.join(" "), args),
            None => type_words.join(" "),
        };
        let constraints = &def[i..];

        if constraints.iter().any(|t| t.is_kw("AUTOINCREMENT")) {
            if DeclaredType::parse(&declared).affinity != Affinity::Integer
                || !constraints.iter().any(|t| t.is_kw("PRIMARY"))
            {
                return Err(Error::translation(
                    "AUTOINCREMENT is only allowed on an INTEGER PRIMARY KEY column",
                ));
            }
            let mut kept: Vec<Token> = Vec::new();
            let mut j = 0;
            while j < constraints.len() {
                let t = &constraints[j];
                if t.is_kw("NOT") && kw_at(constraints, j + 1, "NULL") {
                    j += 2;
                    continue;
                }
                let dropped = ["PRIMARY", "KEY", "ASC", "DESC", "AUTOINCREMENT"]
                    .iter()
                    .any(|kw| t.is_kw(kw));
                if !dropped {
                    kept.push(t.clone());
                }
                j += 1;
            }
            let rest = self.expression(&kept)?;
            let mut sql = format!("{} {}", name, self.adapter.autoincrement_column());
            if !rest.is_empty() {
                sql.push(' ');
                sql.push_str(&rest);
            }
            return Ok(sql);
        }

        let mut sql = format!("{} {}", name, self.adapter.native_type(&declared));
        let rest = self.expression(constraints)?;
        if !rest.is_empty() {
            sql.push(' ');
            sql.push_str(&rest);
        }
        Ok(sql)
    }

    fn alter(&mut self, tokens: &[Token]) -> Result<String> {
        if !kw_at(tokens, 1, "TABLE") || !tokens.get(2).is_some_and(Token::is_name) {
            return Err(Error::translation("malformed ALTER TABLE statement"));
        }
        let (parts, used) = self.qualified(tokens, 2)?;
        let name = parts.join(".");
        let rest = &tokens[2 + used..];
        let sqlserver = self.adapter.provider() == Provider::SqlServer;

        let action = if kw_at(rest, 0, "ADD") {
            let def_start = if kw_at(rest, 1, "COLUMN") { 2 } else { 1 };
            self.ddl = true;
            let def = self.column_def(&rest[def_start..]);
            self.ddl = false;
            let keyword = if sqlserver { "ADD" } else { "ADD COLUMN" };
            format!("{} {}", keyword, def?)
        } else if kw_at(rest, 0, "RENAME") {
            if sqlserver {
                return Err(self.unsupported("ALTER TABLE .. RENAME"));
            }
            self.expression(rest)?
        } else if kw_at(rest, 0, "DROP") {
            self.expression(rest)?
        } else {
            return Err(Error::translation("unsupported ALTER TABLE action"));
        };
        Ok(format!("ALTER TABLE {} {}", name, action))
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    fn transaction(&mut self, verb: &str, tokens: &[Token]) -> Result<String> {
        let sqlserver = self.adapter.provider() == Provider::SqlServer;
        let savepoint_name = |rewriter: &Self, at: usize| -> Result<String> {
            tokens
                .get(at)
                .filter(|t| t.is_name())
                .ok_or_else(|| Error::translation("savepoint name expected"))
                .and_then(|t| rewriter.name_part(t))
        };

        match verb {
            "BEGIN" => Ok(self.adapter.begin_transaction().to_string()),
            "COMMIT" | "END" => Ok("COMMIT".to_string()),
            "ROLLBACK" => {
                let mut j = 1;
                if kw_at(tokens, j, "TRANSACTION") {
                    j += 1;
                }
                if !kw_at(tokens, j, "TO") {
                    return Ok("ROLLBACK".to_string());
                }
                j += 1;
                if kw_at(tokens, j, "SAVEPOINT") {
                    j += 1;
                }
                let name = savepoint_name(self, j)?;
                Ok(if sqlserver {
                    format!("ROLLBACK TRANSACTION {}", name)
                } else {
                    format!("ROLLBACK TO SAVEPOINT {}", name)
                })
            }
            "SAVEPOINT" => {
                let name = savepoint_name(self, 1)?;
                Ok(if sqlserver {
                    format!("SAVE TRANSACTION {}", name)
                } else {
                    format!("SAVEPOINT {}", name)
                })
            }
            "RELEASE" => {
                let at = if kw_at(tokens, 1, "SAVEPOINT") { 2 } else { 1 };
                let name = savepoint_name(self, at)?;
                // SQL Server savepoints live until the transaction ends
                Ok(if sqlserver {
                    String::new()
                } else {
                    format!("RELEASE SAVEPOINT {}", name)
                })
            }
            _ => Err(Error::internal("not a transaction statement")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(source: &str, provider: Provider) -> String {
        translate(source, provider).unwrap().sql
    }

    #[test]
    fn test_lexer_numbers_parameters() {
        let lexed = lex("SELECT ?, ?5, ?, :a, @b, :a").unwrap();
        let params: Vec<usize> = lexed
            .tokens
            .iter()
            .filter_map(|t| match t {
                Token::Param(i) => Some(*i),
                _ => None,
            })
            .collect();
        assert_eq!(params, vec![1, 5, 6, 7, 8, 7]);
        assert_eq!(lexed.param_count, 8);
    }

    #[test]
    fn test_lexer_drops_comments_and_uppercases_keywords() {
        let lexed = lex("select a -- trailing\n from /* inline */ t").unwrap();
        assert_eq!(source_text(&lexed.tokens), "SELECT a FROM t");
    }

    #[test]
    fn test_lexer_rejects_malformed_input() {
        assert!(lex("SELECT 'open").is_err());
        assert!(lex("SELECT (1").is_err());
        assert!(lex("SELECT 1)").is_err());
        assert!(lex("SELECT X'ABC'").is_err());
        assert!(lex("SELECT ?0").is_err());
        assert!(lex("SELECT 1 # 2").is_err());
    }

    #[test]
    fn test_lexer_literals() {
        let lexed = lex("SELECT 'it''s', x'0aff', 0x10, .5, 1e3").unwrap();
        assert_eq!(
            source_text(&lexed.tokens),
            "SELECT 'it''s' , X'0AFF' , 16 , 0.5 , 1e3"
        );
    }

    #[test]
    fn test_expand_is_single_pass() {
        let out = expand("F({1}, {0})", &["'{1}'".to_string(), "b".to_string()]).unwrap();
        assert_eq!(out, "F(b, '{1}')");
        assert_eq!(expand("{x}", &[]).unwrap(), "{x}");
    }

    #[test]
    fn test_placeholders_per_provider() {
        let q = translate("SELECT * FROM t WHERE a = ?1 OR b = ?1", Provider::Postgres).unwrap();
        assert_eq!(q.sql, "SELECT * FROM t WHERE a = $1 OR b = $1");
        assert_eq!(q.param_order, vec![0]);

        let q = translate("SELECT * FROM t WHERE a = ?1 OR b = ?1", Provider::MySql).unwrap();
        assert_eq!(q.sql, "SELECT * FROM t WHERE a = ? OR b = ?");
        assert_eq!(q.param_order, vec![0, 0]);
    }

    #[test]
    fn test_unary_and_concat_folding() {
        assert_eq!(sql("SELECT -1, a - b", Provider::Postgres), "SELECT -1, a - b");
        assert_eq!(
            sql("SELECT a || '-' || b FROM t", Provider::MySql),
            "SELECT CONCAT(a, '-', b) FROM t"
        );
        assert_eq!(
            sql("SELECT a || '-' || b FROM t", Provider::Postgres),
            "SELECT a || '-' || b FROM t"
        );
    }

    #[test]
    fn test_statement_kinds() {
        assert_eq!(translate("SELECT 1", Provider::Postgres).unwrap().kind, StatementKind::Query);
        let pragma = translate("PRAGMA foreign_keys = ON", Provider::MySql).unwrap();
        assert!(pragma.is_noop());
        assert!(translate("VACUUM", Provider::Postgres).is_err());
        assert!(translate("SELECT 1; SELECT 2", Provider::Postgres).is_err());
        assert_eq!(translate("SELECT 1;", Provider::Postgres).unwrap().sql, "SELECT 1");
    }

    #[test]
    fn test_bind_reorders() {
        let q = translate(
            "SELECT * FROM t LIMIT ? OFFSET ?",
            Provider::SqlServer,
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM t ORDER BY (SELECT NULL) OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY"
        );
        let bound = q.bind(&[Value::Int64(10), Value::Int64(20)]).unwrap();
        assert_eq!(bound, vec![Value::Int64(20), Value::Int64(10)]);
        assert!(q.bind(&[Value::Int64(10)]).is_err());
    }
}
