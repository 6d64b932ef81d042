//! SQLite front end
//!
//! Registers the `rivven` module on a rusqlite connection:
//!
//! ```sql
//! -- columns from the backend table of the same name
//! CREATE VIRTUAL TABLE users USING rivven;
//! -- columns from another backend table
//! CREATE VIRTUAL TABLE customers USING rivven(sales.customers);
//! -- explicit columns, optionally naming the backend table
//! CREATE VIRTUAL TABLE items USING rivven(table=inventory.items, id INTEGER PRIMARY KEY, name TEXT NOT NULL);
//! ```
//!
//! SQLite callbacks are synchronous; each one drives the async table or
//! cursor operation to completion on the runtime handle given at
//! registration. Call into SQLite from a thread outside the runtime, from
//! `spawn_blocking`, or from a multi-threaded runtime worker.

use rusqlite::ffi;
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::vtab::{
    update_module, Context, CreateVTab, IndexConstraintOp, IndexInfo, UpdateVTab, VTab,
    VTabConnection, VTabCursor, VTabKind, Values,
};
use std::future::Future;
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::error::Error;
use crate::mapper::{ColumnSpec, RemoteTable, SqlValue};
use crate::vtab::{
    ConstraintOp, Cursor, IndexConstraint, IndexPlan, OrderTerm, SchemaSource, VirtualTable,
};

/// Name used in `CREATE VIRTUAL TABLE .. USING rivven(..)`
pub const MODULE_NAME: &str = "rivven";

/// State shared by every table the module creates
pub struct ModuleHost {
    bridge: Arc<Bridge>,
    runtime: Handle,
}

impl ModuleHost {
    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        match Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| self.runtime.block_on(fut)),
            Err(_) => self.runtime.block_on(fut),
        }
    }
}

/// Register the `rivven` module on `conn`
pub fn register_module(
    conn: &rusqlite::Connection,
    bridge: Arc<Bridge>,
    runtime: Handle,
) -> rusqlite::Result<()> {
    debug!(provider = %bridge.provider(), "Registering SQLite module");
    conn.create_module(
        MODULE_NAME,
        update_module::<BridgeTable>(),
        Some(Arc::new(ModuleHost { bridge, runtime })),
    )
}

fn to_sqlite_error(e: Error) -> rusqlite::Error {
    match e {
        Error::Constraint { .. } => rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT),
            Some(e.to_string()),
        ),
        other => rusqlite::Error::ModuleError(other.to_string()),
    }
}

fn module_error(message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::ModuleError(message.into())
}

fn sql_value(value: ValueRef<'_>) -> rusqlite::Result<SqlValue> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Integer(n),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(
            std::str::from_utf8(t)
                .map_err(rusqlite::Error::Utf8Error)?
                .to_string(),
        ),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    })
}

fn sqlite_value(value: SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Integer(n) => SqliteValue::Integer(n),
        SqlValue::Real(f) => SqliteValue::Real(f),
        SqlValue::Text(s) => SqliteValue::Text(s),
        SqlValue::Blob(b) => SqliteValue::Blob(b),
    }
}

fn constraint_op(op: IndexConstraintOp) -> ConstraintOp {
    match op {
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ => ConstraintOp::Eq,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_NE => ConstraintOp::Ne,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GT => ConstraintOp::Gt,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GE => ConstraintOp::Ge,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LT => ConstraintOp::Lt,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LE => ConstraintOp::Le,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LIKE => ConstraintOp::Like,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GLOB => ConstraintOp::Glob,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_MATCH => ConstraintOp::Match,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_REGEXP => ConstraintOp::Regexp,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_ISNULL => ConstraintOp::IsNull,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_ISNOTNULL => ConstraintOp::IsNotNull,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_IS => ConstraintOp::Is,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_ISNOT => ConstraintOp::IsNot,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LIMIT => ConstraintOp::Limit,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_OFFSET => ConstraintOp::Offset,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_FUNCTION(_) => ConstraintOp::Function,
    }
}

fn unquote(ident: &str) -> &str {
    let ident = ident.trim();
    let pairs = [('"', '"'), ('`', '`'), ('[', ']'), ('\'', '\'')];
    for (open, close) in pairs {
        if ident.len() >= 2 && ident.starts_with(open) && ident.ends_with(close) {
            return &ident[1..ident.len() - 1];
        }
    }
    ident
}

/// Parse `name TYPE [NOT NULL] [PRIMARY KEY] [AUTOINCREMENT]`
fn parse_column(def: &str) -> crate::Result<ColumnSpec> {
    let mut words = def.split_whitespace();
    let name = words
        .next()
        .map(unquote)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::config(format!("empty column definition in '{}'", def)))?;

    let mut type_words = Vec::new();
    let mut not_null = false;
    let mut primary_key = false;
    let mut auto_increment = false;
    let mut previous = String::new();

    for word in words {
        let upper = word.to_ascii_uppercase();
        match upper.as_str() {
            "NOT" | "KEY" => {}
            "NULL" if previous == "NOT" => not_null = true,
            "NULL" => {}
            "PRIMARY" => primary_key = true,
            "AUTOINCREMENT" | "AUTO_INCREMENT" => auto_increment = true,
            _ if previous == "PRIMARY" || previous == "NOT" => {
                return Err(Error::config(format!(
                    "unexpected '{}' in column definition '{}'",
                    word, def
                )));
            }
            _ if not_null || primary_key || auto_increment => {
                return Err(Error::config(format!(
                    "unsupported column constraint '{}' in '{}'",
                    word, def
                )));
            }
            _ => type_words.push(word),
        }
        previous = upper;
    }

    let type_name = if type_words.is_empty() {
        "text".to_string()
    } else {
        type_words.join(" ")
    };
    crate::security::validate_sql_type_name(&type_name)?;

    let mut spec = ColumnSpec::new(name, type_name);
    if not_null {
        spec = spec.not_null();
    }
    if primary_key {
        spec = spec.primary_key();
    }
    if auto_increment {
        spec = spec.auto_increment();
    }
    Ok(spec)
}

/// Build the schema source from the module arguments
fn schema_source(args: &[String]) -> crate::Result<SchemaSource> {
    let mut table = None;
    let mut columns = Vec::new();

    for arg in args {
        let arg = arg.trim();
        if arg.is_empty() {
            continue;
        }
        if let Some((key, value)) = arg.split_once('=') {
            if key.trim().eq_ignore_ascii_case("table") {
                table = Some(RemoteTable::parse(unquote(value))?);
                continue;
            }
        }
        if !arg.contains(char::is_whitespace) && columns.is_empty() && table.is_none() {
            table = Some(RemoteTable::parse(unquote(arg))?);
            continue;
        }
        columns.push(parse_column(arg)?);
    }

    Ok(if columns.is_empty() {
        SchemaSource::Introspect { table }
    } else {
        SchemaSource::Explicit { table, columns }
    })
}

/// Table name and user arguments from the raw `xCreate` argv
fn module_arguments(args: &[&[u8]]) -> rusqlite::Result<(String, Vec<String>)> {
    let text = |raw: &[u8]| {
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(rusqlite::Error::Utf8Error)
    };
    let name = args
        .get(2)
        .map(|raw| text(*raw))
        .transpose()?
        .ok_or_else(|| module_error("missing table name"))?;
    let rest = args
        .iter()
        .skip(3)
        .map(|raw| text(*raw))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((unquote(&name).to_string(), rest))
}

/// A virtual table as SQLite sees it
#[repr(C)]
pub struct BridgeTable {
    base: ffi::sqlite3_vtab,
    host: Arc<ModuleHost>,
    table: Arc<VirtualTable>,
}

impl BridgeTable {
    fn column_values(args: &Values<'_>) -> rusqlite::Result<Vec<SqlValue>> {
        args.iter().skip(2).map(sql_value).collect()
    }
}

#[allow(unsafe_code)]
unsafe impl<'vtab> VTab<'vtab> for BridgeTable {
    type Aux = Arc<ModuleHost>;
    type Cursor = BridgeCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let host = aux
            .cloned()
            .ok_or_else(|| module_error("module registered without a bridge"))?;
        let (name, module_args) = module_arguments(args)?;

        let table = match host.bridge.table(&name) {
            Some(table) => table,
            None => {
                let source = schema_source(&module_args).map_err(to_sqlite_error)?;
                host.block_on(host.bridge.register_virtual_table(&name, source))
                    .map_err(to_sqlite_error)?
            }
        };

        Ok((
            table.declaration_sql(),
            Self {
                base: ffi::sqlite3_vtab::default(),
                host,
                table,
            },
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let constraints: Vec<IndexConstraint> = info
            .constraints()
            .map(|c| IndexConstraint {
                column: usize::try_from(c.column()).ok(),
                op: constraint_op(c.operator()),
                usable: c.is_usable(),
            })
            .collect();
        let order_by: Vec<OrderTerm> = info
            .order_bys()
            .map(|o| OrderTerm {
                column: usize::try_from(o.column()).ok(),
                desc: o.is_order_by_desc(),
            })
            .collect();

        let plan = self.table.best_index(&constraints, &order_by);

        for (i, usage) in plan.usage.iter().enumerate() {
            if let Some(argv) = usage.argv_index {
                let argv = c_int::try_from(argv)
                    .map_err(|_| module_error("too many pushed-down constraints"))?;
                let mut slot = info.constraint_usage(i);
                slot.set_argv_index(argv);
                slot.set_omit(usage.omit);
            }
        }
        info.set_order_by_consumed(plan.order_by_consumed);
        info.set_estimated_cost(plan.estimated_cost);
        info.set_estimated_rows(plan.estimated_rows);
        info.set_idx_num(plan.idx_num);
        info.set_idx_str(&plan.idx_str);
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<BridgeCursor<'vtab>> {
        let cursor = self
            .host
            .block_on(self.table.open())
            .map_err(to_sqlite_error)?;
        Ok(BridgeCursor {
            base: ffi::sqlite3_vtab_cursor::default(),
            host: Arc::clone(&self.host),
            cursor,
            phantom: PhantomData,
        })
    }
}

impl<'vtab> CreateVTab<'vtab> for BridgeTable {
    const KIND: VTabKind = VTabKind::Default;

    fn destroy(&self) -> rusqlite::Result<()> {
        match self.host.bridge.drop_table(self.table.name()) {
            Ok(()) | Err(Error::TableNotFound { .. }) => Ok(()),
            Err(e) => Err(to_sqlite_error(e)),
        }
    }
}

impl<'vtab> UpdateVTab<'vtab> for BridgeTable {
    fn delete(&mut self, arg: ValueRef<'_>) -> rusqlite::Result<()> {
        let rowid = arg
            .as_i64()
            .map_err(|e| module_error(format!("rowid: {}", e)))?;
        self.host
            .block_on(self.table.delete(rowid))
            .map(|_| ())
            .map_err(to_sqlite_error)
    }

    fn insert(&mut self, args: &Values<'_>) -> rusqlite::Result<i64> {
        let values = Self::column_values(args)?;
        self.host
            .block_on(self.table.insert(&values))
            .map_err(to_sqlite_error)
    }

    fn update(&mut self, args: &Values<'_>) -> rusqlite::Result<()> {
        let rowid: i64 = args.get(0)?;
        let values = Self::column_values(args)?;
        let affected = self
            .host
            .block_on(self.table.update(rowid, &values))
            .map_err(to_sqlite_error)?;
        if affected == 0 {
            warn!(table = self.table.name(), rowid, "UPDATE matched no backend row");
        }
        Ok(())
    }
}

/// A scan as SQLite sees it
#[repr(C)]
pub struct BridgeCursor<'vtab> {
    base: ffi::sqlite3_vtab_cursor,
    host: Arc<ModuleHost>,
    cursor: Cursor,
    phantom: PhantomData<&'vtab BridgeTable>,
}

#[allow(unsafe_code)]
unsafe impl VTabCursor for BridgeCursor<'_> {
    fn filter(
        &mut self,
        _idx_num: c_int,
        idx_str: Option<&str>,
        args: &Values<'_>,
    ) -> rusqlite::Result<()> {
        let plan = IndexPlan::from_idx_str(idx_str.unwrap_or_default()).map_err(to_sqlite_error)?;
        let args = args
            .iter()
            .map(sql_value)
            .collect::<rusqlite::Result<Vec<_>>>()?;
        self.host
            .block_on(self.cursor.filter(plan, &args))
            .map_err(to_sqlite_error)
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.host
            .block_on(self.cursor.next())
            .map_err(to_sqlite_error)
    }

    fn eof(&self) -> bool {
        self.cursor.eof()
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let idx = usize::try_from(i).map_err(|_| module_error("negative column index"))?;
        let value = self.cursor.column(idx).map_err(to_sqlite_error)?;
        ctx.set_result(&sqlite_value(value))
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        self.cursor.rowid().map_err(to_sqlite_error)
    }
}

impl Drop for BridgeCursor<'_> {
    fn drop(&mut self) {
        self.host.block_on(self.cursor.close());
    }
}
