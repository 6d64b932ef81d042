//! Provider adapters
//!
//! The set of backends is closed: [`Provider`] selects one of four static
//! [`ProviderAdapter`] implementations, each a table of pure functions and
//! flags describing how the backend spells things the embedded dialect
//! spells differently:
//!
//! - identifier quoting and placeholder syntax
//! - pagination (LIMIT/OFFSET vs OFFSET/FETCH)
//! - autoincrement columns, boolean and string literals
//! - upsert support
//! - function name mapping, date formatting, type names for DDL and CAST
//! - introspection SQL
//!
//! Adapters hold no state and never look at query content; the translator
//! decides where each rule applies.

use crate::error::{Error, Result};
use crate::security::escape_string_literal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported backend providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// PostgreSQL 12+
    Postgres,
    /// MySQL 8+
    MySql,
    /// MariaDB 10.5+
    MariaDb,
    /// SQL Server 2017+
    SqlServer,
}

impl Provider {
    /// All providers, in declaration order
    pub const ALL: [Provider; 4] = [
        Provider::Postgres,
        Provider::MySql,
        Provider::MariaDb,
        Provider::SqlServer,
    ];

    /// Resolve a provider from a connection URL scheme
    pub fn from_scheme(scheme: &str) -> Result<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::MySql),
            "mariadb" => Ok(Self::MariaDb),
            "sqlserver" | "mssql" => Ok(Self::SqlServer),
            other => Err(Error::config(format!(
                "unsupported provider scheme '{}'",
                other
            ))),
        }
    }

    /// Stable identifier, used in cache keys and logs
    pub const fn id(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::MariaDb => "mariadb",
            Self::SqlServer => "sqlserver",
        }
    }

    /// Default TCP port of the provider
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::MySql | Self::MariaDb => 3306,
            Self::SqlServer => 1433,
        }
    }

    /// The static adapter for this provider
    pub fn adapter(self) -> &'static dyn ProviderAdapter {
        match self {
            Self::Postgres => &POSTGRES,
            Self::MySql => &MYSQL,
            Self::MariaDb => &MARIADB,
            Self::SqlServer => &SQLSERVER,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_scheme(s)
    }
}

/// Pagination clause form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// `LIMIT n OFFSET m`
    LimitOffset,
    /// `OFFSET m ROWS FETCH NEXT n ROWS ONLY`, only valid after ORDER BY
    OffsetFetch,
}

/// How the backend expresses "insert or update on key conflict"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStyle {
    /// `INSERT .. ON CONFLICT (..) DO UPDATE/NOTHING`
    OnConflict,
    /// `INSERT .. ON DUPLICATE KEY UPDATE`
    OnDuplicateKey,
    /// No single-statement upsert
    None,
}

/// Backend feature flags consulted by the translator and planner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `INSERT .. RETURNING`
    pub returning: bool,
    /// `agg(..) FILTER (WHERE ..)`
    pub aggregate_filter: bool,
    /// Case-insensitive `ILIKE`
    pub ilike: bool,
    /// Native `a || b` string concatenation
    pub pipe_concat: bool,
    /// Pagination is only valid after an ORDER BY
    pub pagination_requires_order: bool,
    /// Row-count `LIMIT n` on UPDATE and DELETE
    pub dml_limit: bool,
    /// Null-safe equality between arbitrary expressions
    pub null_safe_equality: bool,
    /// `CREATE TABLE IF NOT EXISTS`
    pub create_if_not_exists: bool,
    /// A regular-expression match operator
    pub regexp: bool,
}

/// Number of arguments a function mapping applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly n arguments
    Exact(usize),
    /// n or more arguments
    AtLeast(usize),
    /// Any number of arguments
    Any,
}

impl Arity {
    fn accepts(self, count: usize) -> bool {
        match self {
            Self::Exact(n) => count == n,
            Self::AtLeast(n) => count >= n,
            Self::Any => true,
        }
    }
}

/// Rewrite applied to an embedded-dialect function call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionRewrite {
    /// Same arguments, different name
    Rename(&'static str),
    /// Replacement expression; `{0}`, `{1}`, .. are the translated arguments
    Template(&'static str),
    /// No equivalent; the message explains why
    Unsupported(&'static str),
}

/// One entry of a provider's function table
#[derive(Debug, Clone, Copy)]
pub struct FunctionMapping {
    /// Lowercase embedded function name; `name('now')` keys match calls
    /// whose only argument is the literal `'now'`
    pub name: &'static str,
    /// Argument counts this entry applies to
    pub arity: Arity,
    /// The rewrite
    pub rewrite: FunctionRewrite,
}

const fn map(name: &'static str, arity: Arity, rewrite: FunctionRewrite) -> FunctionMapping {
    FunctionMapping {
        name,
        arity,
        rewrite,
    }
}

/// Date/time syntax of a provider
#[derive(Debug, Clone, Copy)]
pub struct DateTimeSyntax {
    /// Expression for the current UTC timestamp
    pub now_utc: &'static str,
    /// `strftime` equivalent; `{0}` is the translated format literal,
    /// `{1}` the timestamp expression
    pub format_template: &'static str,
    /// Seconds since the Unix epoch of `{0}`
    pub epoch_template: &'static str,
    /// `strftime` conversion specifiers and their backend spelling
    pub tokens: &'static [(char, &'static str)],
}

impl DateTimeSyntax {
    /// Convert a `strftime` format string to the backend's format syntax.
    ///
    /// Returns `None` if a specifier has no backend equivalent.
    pub fn convert_format(&self, format: &str) -> Option<String> {
        let mut out = String::with_capacity(format.len() + 8);
        let mut chars = format.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            let spec = chars.next()?;
            let (_, target) = self.tokens.iter().find(|(k, _)| *k == spec)?;
            out.push_str(target);
        }
        Some(out)
    }
}

/// SQLite type affinity of a declared column type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// INTEGER affinity
    Integer,
    /// TEXT affinity
    Text,
    /// BLOB affinity (also no declared type)
    Blob,
    /// REAL affinity
    Real,
    /// NUMERIC affinity
    Numeric,
}

/// A column type as written in embedded-dialect DDL or CAST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredType {
    /// Uppercased type name without arguments, e.g. `VARCHAR`
    pub base: String,
    /// Raw argument list between parentheses, e.g. `10,2`
    pub args: Option<String>,
    /// Affinity under the embedded engine's rules
    pub affinity: Affinity,
}

impl DeclaredType {
    /// Parse a declared type such as `VARCHAR(40)` or `UNSIGNED BIG INT`
    pub fn parse(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        let (name, args) = match (upper.find('('), upper.rfind(')')) {
            (Some(open), Some(close)) if close > open => (
                upper[..open].trim().to_string(),
                Some(upper[open + 1..close].replace(' ', "")),
            ),
            _ => (upper.clone(), None),
        };
        let base = name.split_whitespace().collect::<Vec<_>>().join(" ");

        let affinity = if base.contains("INT") {
            Affinity::Integer
        } else if base.contains("CHAR") || base.contains("CLOB") || base.contains("TEXT") {
            Affinity::Text
        } else if base.contains("BLOB") || base.is_empty() {
            Affinity::Blob
        } else if base.contains("REAL") || base.contains("FLOA") || base.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        };

        Self {
            base,
            args,
            affinity,
        }
    }
}

/// Backend spellings of the embedded type vocabulary
#[derive(Debug)]
struct TypeNames {
    bigint: &'static str,
    int: &'static str,
    smallint: &'static str,
    tinyint: &'static str,
    boolean: &'static str,
    real: &'static str,
    numeric: &'static str,
    text: &'static str,
    varchar: &'static str,
    char: &'static str,
    blob: &'static str,
    date: &'static str,
    time: &'static str,
    timestamp: &'static str,
    uuid: &'static str,
    json: &'static str,
    cast_integer: &'static str,
    cast_text: &'static str,
    cast_blob: &'static str,
}

impl TypeNames {
    fn column_type(&self, declared: &str) -> String {
        let ty = DeclaredType::parse(declared);
        let with_args = |name: &str| match &ty.args {
            Some(args) => format!("{}({})", name, args),
            None => name.to_string(),
        };
        match ty.base.as_str() {
            "BOOLEAN" | "BOOL" => self.boolean.to_string(),
            "DATE" => self.date.to_string(),
            "TIME" => self.time.to_string(),
            "DATETIME" | "TIMESTAMP" => self.timestamp.to_string(),
            "UUID" => self.uuid.to_string(),
            "JSON" | "JSONB" => self.json.to_string(),
            "BIGINT" | "INT8" | "UNSIGNED BIG INT" => self.bigint.to_string(),
            "SMALLINT" | "INT2" => self.smallint.to_string(),
            "TINYINT" => self.tinyint.to_string(),
            "MEDIUMINT" => self.int.to_string(),
            "VARCHAR" | "NVARCHAR" | "VARYING CHARACTER" | "NATIVE CHARACTER"
                if ty.args.is_some() =>
            {
                with_args(self.varchar)
            }
            "CHAR" | "NCHAR" | "CHARACTER" if ty.args.is_some() => with_args(self.char),
            "DECIMAL" | "NUMERIC" if ty.args.is_some() => with_args(self.numeric_base()),
            _ => match ty.affinity {
                Affinity::Integer => self.bigint.to_string(),
                Affinity::Text => self.text.to_string(),
                Affinity::Blob => self.blob.to_string(),
                Affinity::Real => self.real.to_string(),
                Affinity::Numeric => self.numeric.to_string(),
            },
        }
    }

    fn cast_type(&self, declared: &str) -> String {
        let ty = DeclaredType::parse(declared);
        match ty.affinity {
            Affinity::Integer => self.cast_integer.to_string(),
            Affinity::Text => self.cast_text.to_string(),
            Affinity::Blob => self.cast_blob.to_string(),
            Affinity::Real | Affinity::Numeric => self.column_type(declared),
        }
    }

    fn numeric_base(&self) -> &'static str {
        self.numeric.split('(').next().unwrap_or(self.numeric)
    }
}

/// Provider-specific SQL generation rules
pub trait ProviderAdapter: Send + Sync {
    /// The provider this adapter describes
    fn provider(&self) -> Provider;

    /// Human-readable name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Placeholder for the parameter at 1-based `ordinal` (e.g. `$1`, `?`, `@p1`)
    fn placeholder(&self, ordinal: usize) -> String;

    /// Whether a numbered placeholder may be referenced more than once
    fn numbered_placeholders(&self) -> bool;

    /// Pagination clause form
    fn pagination(&self) -> Pagination;

    /// Render a pagination clause from already-translated expressions
    fn pagination_sql(&self, limit: Option<&str>, offset: Option<&str>) -> String;

    /// Column definition replacing `INTEGER PRIMARY KEY AUTOINCREMENT`
    fn autoincrement_column(&self) -> &'static str;

    /// Boolean literal
    fn boolean_literal(&self, value: bool) -> &'static str;

    /// Render a string literal from its unescaped content
    fn string_literal(&self, value: &str) -> String;

    /// Render a blob literal from its hex digits
    fn blob_literal(&self, hex: &str) -> String;

    /// Upsert form
    fn upsert_style(&self) -> UpsertStyle;

    /// Statement prefix for insert-or-ignore, when the backend has one
    fn insert_ignore_prefix(&self) -> Option<&'static str>;

    /// Whether `REPLACE INTO` is native
    fn supports_replace(&self) -> bool;

    /// Function mapping table
    fn functions(&self) -> &'static [FunctionMapping];

    /// Date/time syntax
    fn datetime(&self) -> &'static DateTimeSyntax;

    /// Backend column type for an embedded-dialect declared type
    fn native_type(&self, declared: &str) -> String;

    /// Backend type for an embedded-dialect `CAST(.. AS type)`
    fn cast_type(&self, declared: &str) -> String;

    /// Feature flags
    fn capabilities(&self) -> Capabilities;

    /// Statement that opens a transaction
    fn begin_transaction(&self) -> &'static str;

    /// Schema assumed when a table name is unqualified
    fn default_schema(&self) -> Option<&'static str>;

    /// SQL listing base tables; yields `table_schema`, `table_name`
    fn list_tables_sql(&self, schema: Option<&str>) -> String;

    /// SQL listing the columns of a table. Yields `column_name`,
    /// `data_type`, `nullable`, `ordinal_position`,
    /// `character_maximum_length`, `numeric_precision`, `numeric_scale`,
    /// `pk_ordinal`, `auto_increment` and `charset_name`.
    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String;

    /// Look up the rewrite for a function call, `None` meaning pass through
    fn map_function(&self, name: &str, arity: usize) -> Option<FunctionRewrite> {
        let name = name.to_ascii_lowercase();
        self.functions()
            .iter()
            .find(|m| m.name == name && m.arity.accepts(arity))
            .map(|m| m.rewrite)
    }

    /// Operator implementing the embedded engine's case-insensitive LIKE
    fn like_operator(&self) -> &'static str {
        if self.capabilities().ilike {
            "ILIKE"
        } else {
            "LIKE"
        }
    }

    /// Null-safe (in)equality operator, when the backend has one
    fn null_safe_operator(&self, negated: bool) -> Option<&'static str> {
        match (self.capabilities().null_safe_equality, negated) {
            (false, _) => None,
            (true, false) => Some("IS NOT DISTINCT FROM"),
            (true, true) => Some("IS DISTINCT FROM"),
        }
    }

    /// Regular-expression match operator, when the backend has one
    fn regexp_operator(&self, negated: bool) -> Option<&'static str> {
        match (self.capabilities().regexp, negated) {
            (false, _) => None,
            (true, false) => Some("REGEXP"),
            (true, true) => Some("NOT REGEXP"),
        }
    }
}

// ===========================================================================
// Function tables
// ===========================================================================

use Arity::{Any, AtLeast, Exact};
use FunctionRewrite::{Rename, Template, Unsupported};

const COMMON_UNSUPPORTED: [FunctionMapping; 7] = [
    map("typeof", Any, Unsupported("typeof() reports embedded storage classes")),
    map("printf", Any, Unsupported("printf() has no portable equivalent")),
    map("format", Any, Unsupported("format() has no portable equivalent")),
    map("changes", Any, Unsupported("changes() is connection-local")),
    map("total_changes", Any, Unsupported("total_changes() is connection-local")),
    map("julianday", Any, Unsupported("julian day numbers are not supported")),
    map("zeroblob", Any, Unsupported("zeroblob() has no portable equivalent")),
];

static POSTGRES_FUNCTIONS: [FunctionMapping; 24] = [
    map("datetime('now')", Exact(1), Template("TO_CHAR(NOW() AT TIME ZONE 'UTC', 'YYYY-MM-DD HH24:MI:SS')")),
    map("date('now')", Exact(1), Template("TO_CHAR(NOW() AT TIME ZONE 'UTC', 'YYYY-MM-DD')")),
    map("time('now')", Exact(1), Template("TO_CHAR(NOW() AT TIME ZONE 'UTC', 'HH24:MI:SS')")),
    map("datetime", Exact(1), Template("TO_CHAR(CAST({0} AS TIMESTAMP), 'YYYY-MM-DD HH24:MI:SS')")),
    map("date", Exact(1), Template("TO_CHAR(CAST({0} AS TIMESTAMP), 'YYYY-MM-DD')")),
    map("time", Exact(1), Template("TO_CHAR(CAST({0} AS TIME), 'HH24:MI:SS')")),
    map("ifnull", Exact(2), Rename("COALESCE")),
    map("instr", Exact(2), Rename("STRPOS")),
    map("group_concat", Exact(1), Template("STRING_AGG(CAST({0} AS TEXT), ',')")),
    map("group_concat", Exact(2), Template("STRING_AGG(CAST({0} AS TEXT), {1})")),
    map("total", Exact(1), Template("COALESCE(SUM({0}), 0.0)")),
    map("iif", Exact(3), Template("CASE WHEN {0} THEN {1} ELSE {2} END")),
    map("hex", Exact(1), Template("UPPER(ENCODE(CAST({0} AS BYTEA), 'hex'))")),
    map("unicode", Exact(1), Rename("ASCII")),
    map("char", Exact(1), Rename("CHR")),
    map("max", AtLeast(2), Rename("GREATEST")),
    map("min", AtLeast(2), Rename("LEAST")),
    map("last_insert_rowid", Exact(0), Template("LASTVAL()")),
    COMMON_UNSUPPORTED[0],
    COMMON_UNSUPPORTED[1],
    COMMON_UNSUPPORTED[2],
    COMMON_UNSUPPORTED[3],
    COMMON_UNSUPPORTED[4],
    COMMON_UNSUPPORTED[5],
];

static MYSQL_FUNCTIONS: [FunctionMapping; 23] = [
    map("datetime('now')", Exact(1), Template("DATE_FORMAT(UTC_TIMESTAMP(), '%Y-%m-%d %H:%i:%s')")),
    map("date('now')", Exact(1), Template("DATE_FORMAT(UTC_TIMESTAMP(), '%Y-%m-%d')")),
    map("time('now')", Exact(1), Template("DATE_FORMAT(UTC_TIMESTAMP(), '%H:%i:%s')")),
    map("datetime", Exact(1), Template("DATE_FORMAT({0}, '%Y-%m-%d %H:%i:%s')")),
    map("date", Exact(1), Template("DATE_FORMAT({0}, '%Y-%m-%d')")),
    map("time", Exact(1), Template("TIME_FORMAT({0}, '%H:%i:%s')")),
    map("length", Exact(1), Rename("CHAR_LENGTH")),
    map("group_concat", Exact(2), Template("GROUP_CONCAT({0} SEPARATOR {1})")),
    map("total", Exact(1), Template("COALESCE(SUM({0}), 0.0)")),
    map("iif", Exact(3), Rename("IF")),
    map("random", Exact(0), Template("CAST(FLOOR((RAND() - 0.5) * 18446744073709551615) AS SIGNED)")),
    map("unicode", Exact(1), Rename("ORD")),
    map("max", AtLeast(2), Rename("GREATEST")),
    map("min", AtLeast(2), Rename("LEAST")),
    map("last_insert_rowid", Exact(0), Template("LAST_INSERT_ID()")),
    map("substring", Any, Rename("SUBSTRING")),
    COMMON_UNSUPPORTED[0],
    COMMON_UNSUPPORTED[1],
    COMMON_UNSUPPORTED[2],
    COMMON_UNSUPPORTED[3],
    COMMON_UNSUPPORTED[4],
    COMMON_UNSUPPORTED[5],
    COMMON_UNSUPPORTED[6],
];

static SQLSERVER_FUNCTIONS: [FunctionMapping; 28] = [
    map("datetime('now')", Exact(1), Template("CONVERT(VARCHAR(19), SYSUTCDATETIME(), 120)")),
    map("date('now')", Exact(1), Template("CONVERT(VARCHAR(10), SYSUTCDATETIME(), 23)")),
    map("time('now')", Exact(1), Template("CONVERT(VARCHAR(8), SYSUTCDATETIME(), 108)")),
    map("datetime", Exact(1), Template("CONVERT(VARCHAR(19), CAST({0} AS DATETIME2), 120)")),
    map("date", Exact(1), Template("CONVERT(VARCHAR(10), CAST({0} AS DATETIME2), 23)")),
    map("time", Exact(1), Template("CONVERT(VARCHAR(8), CAST({0} AS TIME), 108)")),
    map("ifnull", Exact(2), Rename("COALESCE")),
    map("instr", Exact(2), Template("CHARINDEX({1}, {0})")),
    map("length", Exact(1), Rename("LEN")),
    map("substr", Exact(2), Template("SUBSTRING({0}, {1}, LEN({0}))")),
    map("substr", Exact(3), Rename("SUBSTRING")),
    map("group_concat", Exact(1), Template("STRING_AGG(CAST({0} AS NVARCHAR(MAX)), ',')")),
    map("group_concat", Exact(2), Template("STRING_AGG(CAST({0} AS NVARCHAR(MAX)), {1})")),
    map("total", Exact(1), Template("COALESCE(SUM({0}), 0.0)")),
    map("random", Exact(0), Template("CAST(CHECKSUM(NEWID()) AS BIGINT)")),
    map("hex", Exact(1), Template("CONVERT(VARCHAR(MAX), CAST({0} AS VARBINARY(MAX)), 2)")),
    map("round", Exact(1), Template("ROUND({0}, 0)")),
    map("max", AtLeast(2), Rename("GREATEST")),
    map("min", AtLeast(2), Rename("LEAST")),
    map("char", Exact(1), Rename("NCHAR")),
    map("last_insert_rowid", Exact(0), Template("CAST(@@IDENTITY AS BIGINT)")),
    COMMON_UNSUPPORTED[0],
    COMMON_UNSUPPORTED[1],
    COMMON_UNSUPPORTED[2],
    COMMON_UNSUPPORTED[3],
    COMMON_UNSUPPORTED[4],
    COMMON_UNSUPPORTED[5],
    COMMON_UNSUPPORTED[6],
];

static POSTGRES_DATETIME: DateTimeSyntax = DateTimeSyntax {
    now_utc: "(NOW() AT TIME ZONE 'UTC')",
    format_template: "TO_CHAR(CAST({1} AS TIMESTAMP), {0})",
    epoch_template: "CAST(EXTRACT(EPOCH FROM CAST({0} AS TIMESTAMP)) AS BIGINT)",
    tokens: &[
        ('Y', "YYYY"),
        ('m', "MM"),
        ('d', "DD"),
        ('H', "HH24"),
        ('M', "MI"),
        ('S', "SS"),
        ('j', "DDD"),
        ('%', "%"),
    ],
};

static MYSQL_DATETIME: DateTimeSyntax = DateTimeSyntax {
    now_utc: "UTC_TIMESTAMP()",
    format_template: "DATE_FORMAT({1}, {0})",
    epoch_template: "UNIX_TIMESTAMP({0})",
    tokens: &[
        ('Y', "%Y"),
        ('m', "%m"),
        ('d', "%d"),
        ('H', "%H"),
        ('M', "%i"),
        ('S', "%s"),
        ('j', "%j"),
        ('%', "%%"),
    ],
};

static SQLSERVER_DATETIME: DateTimeSyntax = DateTimeSyntax {
    now_utc: "SYSUTCDATETIME()",
    format_template: "FORMAT(CAST({1} AS DATETIME2), {0})",
    epoch_template: "DATEDIFF_BIG(SECOND, '1970-01-01', CAST({0} AS DATETIME2))",
    tokens: &[
        ('Y', "yyyy"),
        ('m', "MM"),
        ('d', "dd"),
        ('H', "HH"),
        ('M', "mm"),
        ('S', "ss"),
        ('%', "%"),
    ],
};

static POSTGRES_TYPES: TypeNames = TypeNames {
    bigint: "BIGINT",
    int: "INTEGER",
    smallint: "SMALLINT",
    tinyint: "SMALLINT",
    boolean: "BOOLEAN",
    real: "DOUBLE PRECISION",
    numeric: "NUMERIC",
    text: "TEXT",
    varchar: "VARCHAR",
    char: "CHAR",
    blob: "BYTEA",
    date: "DATE",
    time: "TIME",
    timestamp: "TIMESTAMP",
    uuid: "UUID",
    json: "JSONB",
    cast_integer: "BIGINT",
    cast_text: "TEXT",
    cast_blob: "BYTEA",
};

const MYSQL_TYPE_NAMES: TypeNames = TypeNames {
    bigint: "BIGINT",
    int: "MEDIUMINT",
    smallint: "SMALLINT",
    tinyint: "TINYINT",
    boolean: "TINYINT(1)",
    real: "DOUBLE",
    numeric: "DECIMAL(65,30)",
    text: "TEXT",
    varchar: "VARCHAR",
    char: "CHAR",
    blob: "LONGBLOB",
    date: "DATE",
    time: "TIME(6)",
    timestamp: "DATETIME(6)",
    uuid: "CHAR(36)",
    json: "JSON",
    cast_integer: "SIGNED",
    cast_text: "CHAR",
    cast_blob: "BINARY",
};

static MYSQL_TYPES: TypeNames = MYSQL_TYPE_NAMES;

static MARIADB_TYPES: TypeNames = TypeNames {
    uuid: "UUID",
    ..MYSQL_TYPE_NAMES
};

static SQLSERVER_TYPES: TypeNames = TypeNames {
    bigint: "BIGINT",
    int: "INT",
    smallint: "SMALLINT",
    tinyint: "SMALLINT",
    boolean: "BIT",
    real: "FLOAT",
    numeric: "DECIMAL(38,10)",
    text: "NVARCHAR(MAX)",
    varchar: "NVARCHAR",
    char: "NCHAR",
    blob: "VARBINARY(MAX)",
    date: "DATE",
    time: "TIME",
    timestamp: "DATETIME2",
    uuid: "UNIQUEIDENTIFIER",
    json: "NVARCHAR(MAX)",
    cast_integer: "BIGINT",
    cast_text: "NVARCHAR(MAX)",
    cast_blob: "VARBINARY(MAX)",
};

// ===========================================================================
// PostgreSQL
// ===========================================================================

/// PostgreSQL adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

static POSTGRES: PostgresAdapter = PostgresAdapter;

impl ProviderAdapter for PostgresAdapter {
    fn provider(&self) -> Provider {
        Provider::Postgres
    }

    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, ordinal: usize) -> String {
        format!("${}", ordinal)
    }

    fn numbered_placeholders(&self) -> bool {
        true
    }

    fn pagination(&self) -> Pagination {
        Pagination::LimitOffset
    }

    fn pagination_sql(&self, limit: Option<&str>, offset: Option<&str>) -> String {
        limit_offset(limit, offset, "ALL")
    }

    fn autoincrement_column(&self) -> &'static str {
        "BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY"
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", escape_string_literal(value))
    }

    fn blob_literal(&self, hex: &str) -> String {
        format!("DECODE('{}', 'hex')", hex)
    }

    fn upsert_style(&self) -> UpsertStyle {
        UpsertStyle::OnConflict
    }

    fn insert_ignore_prefix(&self) -> Option<&'static str> {
        None
    }

    fn supports_replace(&self) -> bool {
        false
    }

    fn functions(&self) -> &'static [FunctionMapping] {
        &POSTGRES_FUNCTIONS
    }

    fn datetime(&self) -> &'static DateTimeSyntax {
        &POSTGRES_DATETIME
    }

    fn native_type(&self, declared: &str) -> String {
        POSTGRES_TYPES.column_type(declared)
    }

    fn cast_type(&self, declared: &str) -> String {
        POSTGRES_TYPES.cast_type(declared)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            returning: true,
            aggregate_filter: true,
            ilike: true,
            pipe_concat: true,
            pagination_requires_order: false,
            dml_limit: false,
            null_safe_equality: true,
            create_if_not_exists: true,
            regexp: true,
        }
    }

    fn regexp_operator(&self, negated: bool) -> Option<&'static str> {
        Some(if negated { "!~" } else { "~" })
    }

    fn begin_transaction(&self) -> &'static str {
        "BEGIN"
    }

    fn default_schema(&self) -> Option<&'static str> {
        Some("public")
    }

    fn list_tables_sql(&self, schema: Option<&str>) -> String {
        format!(
            "SELECT table_schema::text AS table_schema, table_name::text AS table_name \
             FROM information_schema.tables \
             WHERE table_schema = '{}' AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            escape_string_literal(schema.unwrap_or("public"))
        )
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.column_name::text AS column_name,
                CASE WHEN c.data_type IN ('USER-DEFINED', 'ARRAY') THEN c.udt_name::text ELSE c.data_type::text END AS data_type,
                c.is_nullable = 'YES' AS nullable,
                c.ordinal_position::int AS ordinal_position,
                c.character_maximum_length::int AS character_maximum_length,
                c.numeric_precision::int AS numeric_precision,
                c.numeric_scale::int AS numeric_scale,
                pk.ordinal_position::int AS pk_ordinal,
                (c.is_identity = 'YES' OR COALESCE(c.column_default, '') LIKE 'nextval(%') AS auto_increment,
                NULL::text AS charset_name
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT ku.column_name, ku.ordinal_position
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                    ON tc.constraint_name = ku.constraint_name
                    AND tc.table_schema = ku.table_schema
                    AND tc.table_name = ku.table_name
                WHERE tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema = '{schema}'
                    AND tc.table_name = '{table}'
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_schema = '{schema}' AND c.table_name = '{table}'
            ORDER BY c.ordinal_position"#
        )
    }
}

// ===========================================================================
// MySQL
// ===========================================================================

/// MySQL adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlAdapter;

static MYSQL: MySqlAdapter = MySqlAdapter;

fn mysql_string_literal(value: &str) -> String {
    format!(
        "'{}'",
        value.replace('\\', "\\\\").replace('\'', "''")
    )
}

fn mysql_list_tables_sql(schema: Option<&str>) -> String {
    let filter = schema
        .map(|s| format!("'{}'", escape_string_literal(s)))
        .unwrap_or_else(|| "DATABASE()".to_string());
    format!(
        "SELECT table_schema AS table_schema, table_name AS table_name \
         FROM information_schema.tables \
         WHERE table_schema = {} AND table_type = 'BASE TABLE' \
         ORDER BY table_name",
        filter
    )
}

fn mysql_list_columns_sql(schema: Option<&str>, table: &str) -> String {
    let schema = schema
        .map(|s| format!("'{}'", escape_string_literal(s)))
        .unwrap_or_else(|| "DATABASE()".to_string());
    let table = escape_string_literal(table);
    format!(
        r#"SELECT
            c.column_name AS column_name,
            c.column_type AS data_type,
            c.is_nullable = 'YES' AS nullable,
            c.ordinal_position AS ordinal_position,
            c.character_maximum_length AS character_maximum_length,
            c.numeric_precision AS numeric_precision,
            c.numeric_scale AS numeric_scale,
            (SELECT k.ordinal_position
                FROM information_schema.key_column_usage k
                WHERE k.table_schema = c.table_schema
                    AND k.table_name = c.table_name
                    AND k.column_name = c.column_name
                    AND k.constraint_name = 'PRIMARY') AS pk_ordinal,
            c.extra LIKE '%auto_increment%' AS auto_increment,
            c.character_set_name AS charset_name
        FROM information_schema.columns c
        WHERE c.table_schema = {schema} AND c.table_name = '{table}'
        ORDER BY c.ordinal_position"#
    )
}

impl ProviderAdapter for MySqlAdapter {
    fn provider(&self) -> Provider {
        Provider::MySql
    }

    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _ordinal: usize) -> String {
        "?".to_string()
    }

    fn numbered_placeholders(&self) -> bool {
        false
    }

    fn pagination(&self) -> Pagination {
        Pagination::LimitOffset
    }

    fn pagination_sql(&self, limit: Option<&str>, offset: Option<&str>) -> String {
        limit_offset(limit, offset, "18446744073709551615")
    }

    fn autoincrement_column(&self) -> &'static str {
        "BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY"
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn string_literal(&self, value: &str) -> String {
        mysql_string_literal(value)
    }

    fn blob_literal(&self, hex: &str) -> String {
        format!("X'{}'", hex)
    }

    fn upsert_style(&self) -> UpsertStyle {
        UpsertStyle::OnDuplicateKey
    }

    fn insert_ignore_prefix(&self) -> Option<&'static str> {
        Some("INSERT IGNORE")
    }

    fn supports_replace(&self) -> bool {
        true
    }

    fn functions(&self) -> &'static [FunctionMapping] {
        &MYSQL_FUNCTIONS
    }

    fn datetime(&self) -> &'static DateTimeSyntax {
        &MYSQL_DATETIME
    }

    fn native_type(&self, declared: &str) -> String {
        MYSQL_TYPES.column_type(declared)
    }

    fn cast_type(&self, declared: &str) -> String {
        MYSQL_TYPES.cast_type(declared)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            returning: false,
            aggregate_filter: false,
            ilike: false,
            pipe_concat: false,
            pagination_requires_order: false,
            dml_limit: true,
            null_safe_equality: true,
            create_if_not_exists: true,
            regexp: true,
        }
    }

    fn null_safe_operator(&self, negated: bool) -> Option<&'static str> {
        (!negated).then_some("<=>")
    }

    fn begin_transaction(&self) -> &'static str {
        "START TRANSACTION"
    }

    fn default_schema(&self) -> Option<&'static str> {
        None
    }

    fn list_tables_sql(&self, schema: Option<&str>) -> String {
        mysql_list_tables_sql(schema)
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        mysql_list_columns_sql(schema, table)
    }
}

// ===========================================================================
// MariaDB
// ===========================================================================

/// MariaDB adapter (MySQL wire protocol, RETURNING and native UUID)
#[derive(Debug, Clone, Copy, Default)]
pub struct MariaDbAdapter;

static MARIADB: MariaDbAdapter = MariaDbAdapter;

impl ProviderAdapter for MariaDbAdapter {
    fn provider(&self) -> Provider {
        Provider::MariaDb
    }

    fn name(&self) -> &'static str {
        "MariaDB"
    }

    fn quote_identifier(&self, name: &str) -> String {
        MYSQL.quote_identifier(name)
    }

    fn placeholder(&self, ordinal: usize) -> String {
        MYSQL.placeholder(ordinal)
    }

    fn numbered_placeholders(&self) -> bool {
        false
    }

    fn pagination(&self) -> Pagination {
        Pagination::LimitOffset
    }

    fn pagination_sql(&self, limit: Option<&str>, offset: Option<&str>) -> String {
        MYSQL.pagination_sql(limit, offset)
    }

    fn autoincrement_column(&self) -> &'static str {
        MYSQL.autoincrement_column()
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn string_literal(&self, value: &str) -> String {
        mysql_string_literal(value)
    }

    fn blob_literal(&self, hex: &str) -> String {
        MYSQL.blob_literal(hex)
    }

    fn upsert_style(&self) -> UpsertStyle {
        UpsertStyle::OnDuplicateKey
    }

    fn insert_ignore_prefix(&self) -> Option<&'static str> {
        Some("INSERT IGNORE")
    }

    fn supports_replace(&self) -> bool {
        true
    }

    fn functions(&self) -> &'static [FunctionMapping] {
        &MYSQL_FUNCTIONS
    }

    fn datetime(&self) -> &'static DateTimeSyntax {
        &MYSQL_DATETIME
    }

    fn native_type(&self, declared: &str) -> String {
        MARIADB_TYPES.column_type(declared)
    }

    fn cast_type(&self, declared: &str) -> String {
        MARIADB_TYPES.cast_type(declared)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            returning: true,
            ..MYSQL.capabilities()
        }
    }

    fn null_safe_operator(&self, negated: bool) -> Option<&'static str> {
        MYSQL.null_safe_operator(negated)
    }

    fn begin_transaction(&self) -> &'static str {
        MYSQL.begin_transaction()
    }

    fn default_schema(&self) -> Option<&'static str> {
        None
    }

    fn list_tables_sql(&self, schema: Option<&str>) -> String {
        mysql_list_tables_sql(schema)
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        mysql_list_columns_sql(schema, table)
    }
}

// ===========================================================================
// SQL Server
// ===========================================================================

/// SQL Server adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerAdapter;

static SQLSERVER: SqlServerAdapter = SqlServerAdapter;

impl ProviderAdapter for SqlServerAdapter {
    fn provider(&self) -> Provider {
        Provider::SqlServer
    }

    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn placeholder(&self, ordinal: usize) -> String {
        format!("@P{}", ordinal)
    }

    fn numbered_placeholders(&self) -> bool {
        true
    }

    fn pagination(&self) -> Pagination {
        Pagination::OffsetFetch
    }

    fn pagination_sql(&self, limit: Option<&str>, offset: Option<&str>) -> String {
        let offset = offset.unwrap_or("0");
        match limit {
            Some(l) => format!("OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", offset, l),
            None => format!("OFFSET {} ROWS", offset),
        }
    }

    fn autoincrement_column(&self) -> &'static str {
        "BIGINT IDENTITY(1,1) PRIMARY KEY"
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn string_literal(&self, value: &str) -> String {
        format!("N'{}'", escape_string_literal(value))
    }

    fn blob_literal(&self, hex: &str) -> String {
        format!("0x{}", hex)
    }

    fn upsert_style(&self) -> UpsertStyle {
        UpsertStyle::None
    }

    fn insert_ignore_prefix(&self) -> Option<&'static str> {
        None
    }

    fn supports_replace(&self) -> bool {
        false
    }

    fn functions(&self) -> &'static [FunctionMapping] {
        &SQLSERVER_FUNCTIONS
    }

    fn datetime(&self) -> &'static DateTimeSyntax {
        &SQLSERVER_DATETIME
    }

    fn native_type(&self, declared: &str) -> String {
        SQLSERVER_TYPES.column_type(declared)
    }

    fn cast_type(&self, declared: &str) -> String {
        SQLSERVER_TYPES.cast_type(declared)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            returning: false,
            aggregate_filter: false,
            ilike: false,
            pipe_concat: false,
            pagination_requires_order: true,
            dml_limit: false,
            null_safe_equality: false,
            create_if_not_exists: false,
            regexp: false,
        }
    }

    fn begin_transaction(&self) -> &'static str {
        "BEGIN TRANSACTION"
    }

    fn default_schema(&self) -> Option<&'static str> {
        Some("dbo")
    }

    fn list_tables_sql(&self, schema: Option<&str>) -> String {
        format!(
            "SELECT TABLE_SCHEMA AS table_schema, TABLE_NAME AS table_name \
             FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = '{}' AND TABLE_TYPE = 'BASE TABLE' \
             ORDER BY TABLE_NAME",
            escape_string_literal(schema.unwrap_or("dbo"))
        )
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("dbo"));
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.COLUMN_NAME AS column_name,
                c.DATA_TYPE AS data_type,
                CASE c.IS_NULLABLE WHEN 'YES' THEN 1 ELSE 0 END AS nullable,
                c.ORDINAL_POSITION AS ordinal_position,
                c.CHARACTER_MAXIMUM_LENGTH AS character_maximum_length,
                CAST(c.NUMERIC_PRECISION AS INT) AS numeric_precision,
                c.NUMERIC_SCALE AS numeric_scale,
                pk.ORDINAL_POSITION AS pk_ordinal,
                COLUMNPROPERTY(OBJECT_ID(c.TABLE_SCHEMA + '.' + c.TABLE_NAME), c.COLUMN_NAME, 'IsIdentity') AS auto_increment,
                CAST(NULL AS NVARCHAR(128)) AS charset_name
            FROM INFORMATION_SCHEMA.COLUMNS c
            LEFT JOIN (
                SELECT ku.COLUMN_NAME, ku.ORDINAL_POSITION
                FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku
                    ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME
                    AND tc.TABLE_SCHEMA = ku.TABLE_SCHEMA
                WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
                    AND tc.TABLE_SCHEMA = '{schema}'
                    AND tc.TABLE_NAME = '{table}'
            ) pk ON c.COLUMN_NAME = pk.COLUMN_NAME
            WHERE c.TABLE_SCHEMA = '{schema}' AND c.TABLE_NAME = '{table}'
            ORDER BY c.ORDINAL_POSITION"#
        )
    }
}

fn limit_offset(limit: Option<&str>, offset: Option<&str>, unbounded: &str) -> String {
    match (limit, offset) {
        (Some(l), Some(o)) => format!("LIMIT {} OFFSET {}", l, o),
        (Some(l), None) => format!("LIMIT {}", l),
        (None, Some(o)) => format!("LIMIT {} OFFSET {}", unbounded, o),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_scheme() {
        assert_eq!(Provider::from_scheme("postgresql").unwrap(), Provider::Postgres);
        assert_eq!(Provider::from_scheme("MSSQL").unwrap(), Provider::SqlServer);
        assert_eq!("mariadb".parse::<Provider>().unwrap(), Provider::MariaDb);
        assert!(Provider::from_scheme("oracle").is_err());
    }

    #[test]
    fn test_adapter_matches_provider() {
        for provider in Provider::ALL {
            assert_eq!(provider.adapter().provider(), provider);
        }
    }

    #[test]
    fn test_declared_type_affinity() {
        assert_eq!(DeclaredType::parse("INTEGER").affinity, Affinity::Integer);
        assert_eq!(DeclaredType::parse("varchar(40)").affinity, Affinity::Text);
        assert_eq!(DeclaredType::parse("varchar(40)").args.as_deref(), Some("40"));
        assert_eq!(DeclaredType::parse("").affinity, Affinity::Blob);
        assert_eq!(DeclaredType::parse("DOUBLE").affinity, Affinity::Real);
        assert_eq!(DeclaredType::parse("DECIMAL(10, 2)").affinity, Affinity::Numeric);
        assert_eq!(DeclaredType::parse("DECIMAL(10, 2)").args.as_deref(), Some("10,2"));
        // "POINT" contains "INT"
        assert_eq!(DeclaredType::parse("POINT").affinity, Affinity::Integer);
    }

    #[test]
    fn test_native_types() {
        assert_eq!(PostgresAdapter.native_type("INTEGER"), "BIGINT");
        assert_eq!(PostgresAdapter.native_type("BLOB"), "BYTEA");
        assert_eq!(MySqlAdapter.native_type("decimal(10,2)"), "DECIMAL(10,2)");
        assert_eq!(MySqlAdapter.native_type("BOOLEAN"), "TINYINT(1)");
        assert_eq!(MariaDbAdapter.native_type("UUID"), "UUID");
        assert_eq!(SqlServerAdapter.native_type("TEXT"), "NVARCHAR(MAX)");
        assert_eq!(SqlServerAdapter.native_type("VARCHAR(20)"), "NVARCHAR(20)");
    }

    #[test]
    fn test_cast_types() {
        assert_eq!(MySqlAdapter.cast_type("INTEGER"), "SIGNED");
        assert_eq!(MySqlAdapter.cast_type("TEXT"), "CHAR");
        assert_eq!(PostgresAdapter.cast_type("REAL"), "DOUBLE PRECISION");
        assert_eq!(SqlServerAdapter.cast_type("BLOB"), "VARBINARY(MAX)");
    }

    #[test]
    fn test_function_lookup_respects_arity() {
        let pg = Provider::Postgres.adapter();
        assert_eq!(pg.map_function("IFNULL", 2), Some(Rename("COALESCE")));
        assert_eq!(pg.map_function("max", 1), None);
        assert_eq!(pg.map_function("max", 3), Some(Rename("GREATEST")));
        assert_eq!(pg.map_function("lower", 1), None);

        let mysql = Provider::MySql.adapter();
        assert_eq!(mysql.map_function("ifnull", 2), None);
        assert!(matches!(mysql.map_function("typeof", 1), Some(Unsupported(_))));
    }

    #[test]
    fn test_pagination() {
        assert_eq!(
            PostgresAdapter.pagination_sql(Some("10"), Some("5")),
            "LIMIT 10 OFFSET 5"
        );
        assert_eq!(
            MySqlAdapter.pagination_sql(None, Some("5")),
            "LIMIT 18446744073709551615 OFFSET 5"
        );
        assert_eq!(
            SqlServerAdapter.pagination_sql(Some("10"), None),
            "OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
        assert_eq!(PostgresAdapter.pagination_sql(None, None), "");
    }

    #[test]
    fn test_strftime_conversion() {
        assert_eq!(
            POSTGRES_DATETIME.convert_format("%Y-%m-%d %H:%M").as_deref(),
            Some("YYYY-MM-DD HH24:MI")
        );
        assert_eq!(
            MYSQL_DATETIME.convert_format("%H:%M:%S").as_deref(),
            Some("%H:%i:%s")
        );
        assert_eq!(SQLSERVER_DATETIME.convert_format("%j"), None);
        assert_eq!(POSTGRES_DATETIME.convert_format("100%"), None);
    }

    #[test]
    fn test_string_literals() {
        assert_eq!(PostgresAdapter.string_literal("it's"), "'it''s'");
        assert_eq!(MySqlAdapter.string_literal(r"a\b"), r"'a\\b'");
        assert_eq!(SqlServerAdapter.string_literal("x"), "N'x'");
    }

    #[test]
    fn test_null_safe_operators() {
        assert_eq!(
            PostgresAdapter.null_safe_operator(true),
            Some("IS DISTINCT FROM")
        );
        assert_eq!(MySqlAdapter.null_safe_operator(false), Some("<=>"));
        assert_eq!(MySqlAdapter.null_safe_operator(true), None);
        assert_eq!(SqlServerAdapter.null_safe_operator(false), None);
    }

    #[test]
    fn test_regexp_operators() {
        assert_eq!(PostgresAdapter.regexp_operator(true), Some("!~"));
        assert_eq!(MariaDbAdapter.regexp_operator(false), Some("REGEXP"));
        assert_eq!(SqlServerAdapter.regexp_operator(false), None);
    }

    #[test]
    fn test_introspection_sql_escapes_names() {
        let sql = PostgresAdapter.list_columns_sql(None, "o'brien");
        assert!(sql.contains("c.table_name = 'o''brien'"));
        assert!(sql.contains("c.table_schema = 'public'"));

        let sql = MySqlAdapter.list_tables_sql(None);
        assert!(sql.contains("DATABASE()"));
    }
}
