//! Virtual table protocol
//!
//! A [`VirtualTable`] stands for one backend table inside the embedded
//! engine. Reads go through a [`Cursor`], which holds one pool lease from
//! [`VirtualTable::open`] until it is closed or exhausted and pulls rows in
//! batches. Writes run immediately on a short-lived lease and are never
//! retried.
//!
//! Every statement is built in the embedded dialect with sea-query and then
//! passes through the [`QueryTranslator`], so pushdown, writes and ad-hoc
//! queries share one translation path.

use parking_lot::{Mutex, RwLock};
use sea_query::{
    Alias, BinOper, Expr, IntoIden, Order, Query, SimpleExpr, SqliteQueryBuilder, TableRef,
};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::BridgeConfig;
use crate::connection::{Connection, RowStream};
use crate::dialect::Provider;
use crate::error::{Error, ErrorCategory, Result};
use crate::mapper::{
    ColumnDeclaration, ColumnSpec, DataMapper, RemoteTable, SqlValue, StorageClass, TableSchema,
    TypeFamily,
};
use crate::pool::{ConnectionManager, Lease};
use crate::translator::QueryTranslator;
use crate::types::{ColumnMetadata, Row, TableMetadata, Value};

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

fn param() -> SimpleExpr {
    Expr::cust("?")
}

/// Run a backend call under the statement timeout
pub(crate) async fn timed<T>(limit: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            Error::timeout(format!("statement exceeded {}ms", limit.as_millis()))
        })?,
        None => fut.await,
    }
}

/// Everything a table needs to reach the backend
#[derive(Clone)]
pub struct TableContext {
    /// Connection pool
    pub pool: Arc<ConnectionManager>,
    /// Statement translator
    pub translator: Arc<QueryTranslator>,
    /// Value mapper
    pub mapper: Arc<DataMapper>,
    /// Backend provider
    pub provider: Provider,
    /// Rows pulled per round trip
    pub fetch_batch_size: usize,
    /// Per-statement deadline
    pub statement_timeout: Option<Duration>,
    /// Schema for tables declared without one
    pub default_schema: Option<String>,
}

impl TableContext {
    /// Build a context from a pool and bridge settings
    pub fn new(
        pool: Arc<ConnectionManager>,
        translator: Arc<QueryTranslator>,
        mapper: Arc<DataMapper>,
        config: &BridgeConfig,
    ) -> Self {
        let provider_config = pool.provider_config();
        let provider = provider_config.provider();
        let default_schema = provider_config
            .schema()
            .map(str::to_string)
            .or_else(|| provider.adapter().default_schema().map(str::to_string));
        let statement_timeout = provider_config.statement_timeout();
        Self {
            pool,
            translator,
            mapper,
            provider,
            fetch_batch_size: config.fetch_batch_size.max(1) as usize,
            statement_timeout,
            default_schema,
        }
    }

    fn resolve_schema<'a>(&'a self, remote: &'a RemoteTable) -> Option<&'a str> {
        remote.schema.as_deref().or(self.default_schema.as_deref())
    }

    /// Run one statement on a short-lived lease.
    ///
    /// The connection is invalidated when the statement poisons it.
    pub(crate) async fn with_connection<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.pool.acquire_default().await?;
        let conn = match self.pool.checkout(&lease) {
            Ok(conn) => conn,
            Err(e) => {
                self.pool.invalidate(lease).await;
                return Err(e);
            }
        };

        lease.begin_statement();
        let result = timed(self.statement_timeout, f(conn)).await;
        match &result {
            Err(e) if e.poisons_connection() => {
                warn!(error = %e, "Statement poisoned its connection");
                self.pool.invalidate(lease).await;
            }
            _ => {
                lease.end_statement();
                self.pool.release(lease).await;
            }
        }
        result
    }

    /// Introspect a backend table
    pub(crate) async fn introspect(&self, remote: &RemoteTable) -> Result<TableMetadata> {
        let schema = self.resolve_schema(remote).map(str::to_string);
        let sql = self
            .provider
            .adapter()
            .list_columns_sql(schema.as_deref(), &remote.name);
        let rows = self
            .with_connection(|conn| async move { conn.query(&sql, &[]).await })
            .await?;

        let mut table = TableMetadata::new(remote.name.clone());
        table.schema = remote.schema.clone();
        table.columns = rows.iter().map(column_from_row).collect::<Result<_>>()?;
        if table.columns.is_empty() {
            return Err(Error::TableNotFound {
                table: remote.to_string(),
            });
        }
        debug!(table = %remote, columns = table.columns.len(), "Introspected table");
        Ok(table)
    }

    /// List backend base tables in the default schema
    pub(crate) async fn list_tables(&self) -> Result<Vec<RemoteTable>> {
        let sql = self
            .provider
            .adapter()
            .list_tables_sql(self.default_schema.as_deref());
        let rows = self
            .with_connection(|conn| async move { conn.query(&sql, &[]).await })
            .await?;
        rows.iter()
            .map(|row| {
                let name = row_text(row, "table_name")
                    .ok_or_else(|| Error::schema("table listing without table_name"))?;
                Ok(RemoteTable {
                    schema: row_text(row, "table_schema"),
                    name,
                })
            })
            .collect()
    }
}

impl fmt::Debug for TableContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableContext")
            .field("provider", &self.provider)
            .field("fetch_batch_size", &self.fetch_batch_size)
            .field("statement_timeout", &self.statement_timeout)
            .field("default_schema", &self.default_schema)
            .finish()
    }
}

fn row_text(row: &Row, name: &str) -> Option<String> {
    match row.get_by_name(name)? {
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        other => other.as_string(),
    }
}

fn row_u32(row: &Row, name: &str) -> Option<u32> {
    row.get_by_name(name)
        .and_then(Value::as_i64)
        .and_then(|n| u32::try_from(n).ok())
}

fn column_from_row(row: &Row) -> Result<ColumnMetadata> {
    let name = row_text(row, "column_name")
        .ok_or_else(|| Error::schema("column listing without column_name"))?;
    let type_name = row_text(row, "data_type").unwrap_or_else(|| "text".to_string());
    let mut column = ColumnMetadata::new(name, type_name);
    column.nullable = row
        .get_by_name("nullable")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    column.ordinal = row_u32(row, "ordinal_position").unwrap_or(0);
    column.max_length = row_u32(row, "character_maximum_length");
    column.precision = row_u32(row, "numeric_precision");
    column.scale = row_u32(row, "numeric_scale");
    column.primary_key_ordinal = row_u32(row, "pk_ordinal");
    column.auto_increment = row
        .get_by_name("auto_increment")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    column.charset = row_text(row, "charset_name");
    Ok(column)
}

/// Where a table's columns come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SchemaSource {
    /// Ask the backend; `table` defaults to the virtual table's name
    Introspect {
        /// Backend table
        #[serde(default)]
        table: Option<RemoteTable>,
    },
    /// Use the given columns as-is
    Explicit {
        /// Backend table
        #[serde(default)]
        table: Option<RemoteTable>,
        /// Column declarations in order
        columns: Vec<ColumnSpec>,
    },
}

impl SchemaSource {
    /// Introspect the backend table of the same name
    pub fn introspect() -> Self {
        Self::Introspect { table: None }
    }

    /// Introspect a differently named backend table
    pub fn introspect_table(table: RemoteTable) -> Self {
        Self::Introspect { table: Some(table) }
    }

    /// Declare the columns explicitly
    pub fn explicit(columns: Vec<ColumnSpec>) -> Self {
        Self::Explicit {
            table: None,
            columns,
        }
    }
}

/// Lifecycle of a virtual table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Not declared yet
    Unregistered,
    /// Schema declared, cursors may open
    SchemaDeclared,
    /// Destroyed, nothing may open
    Destroyed,
}

/// Constraint operator offered by the embedded planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `LIKE`
    Like,
    /// `GLOB`
    Glob,
    /// `MATCH`
    Match,
    /// `REGEXP`
    Regexp,
    /// `IS NULL`
    IsNull,
    /// `IS NOT NULL`
    IsNotNull,
    /// `IS`
    Is,
    /// `IS NOT`
    IsNot,
    /// `LIMIT`
    Limit,
    /// `OFFSET`
    Offset,
    /// Overloaded function
    Function,
}

impl ConstraintOp {
    fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Gt | Self::Ge | Self::Lt | Self::Le | Self::Is | Self::IsNot
        )
    }

    fn takes_argument(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }

    fn selectivity(self) -> f64 {
        match self {
            Self::Eq | Self::Is => 0.01,
            Self::Gt | Self::Ge | Self::Lt | Self::Le => 0.25,
            Self::Like | Self::IsNull => 0.1,
            _ => 0.9,
        }
    }
}

/// One WHERE term offered to [`VirtualTable::best_index`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConstraint {
    /// Column index, `None` for the rowid
    pub column: Option<usize>,
    /// Operator
    pub op: ConstraintOp,
    /// Whether the planner can supply the right-hand side
    pub usable: bool,
}

impl IndexConstraint {
    /// Usable constraint on a column
    pub fn new(column: usize, op: ConstraintOp) -> Self {
        Self {
            column: Some(column),
            op,
            usable: true,
        }
    }
}

/// One ORDER BY term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTerm {
    /// Column index, `None` for the rowid
    pub column: Option<usize>,
    /// Descending
    pub desc: bool,
}

/// How the planner should feed one constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConstraintUsage {
    /// 1-based position among filter arguments, `None` if kept local
    pub argv_index: Option<usize>,
    /// The backend fully applies the constraint
    pub omit: bool,
}

/// A pushed-down term, in filter argument order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedTerm {
    /// Column index (rowid constraints resolve to the key column)
    pub column: Option<usize>,
    /// Operator
    pub op: ConstraintOp,
}

/// Outcome of planning a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPlan {
    /// Per-constraint usage, parallel to the offered constraints
    #[serde(skip)]
    pub usage: Vec<ConstraintUsage>,
    /// Pushed terms; each one with an argument consumes one filter argument
    pub terms: Vec<PushedTerm>,
    /// ORDER BY terms sent to the backend
    pub order_by: Vec<OrderTerm>,
    /// Whether the backend's ordering satisfies the planner
    pub order_by_consumed: bool,
    /// Relative cost
    pub estimated_cost: f64,
    /// Estimated rows
    pub estimated_rows: i64,
    /// Opaque plan number
    pub idx_num: i32,
    /// Serialized plan, restored by [`IndexPlan::from_idx_str`]
    #[serde(skip)]
    pub idx_str: String,
}

impl IndexPlan {
    /// Full scan without pushdown
    pub fn full_scan() -> Self {
        Self {
            usage: Vec::new(),
            terms: Vec::new(),
            order_by: Vec::new(),
            order_by_consumed: false,
            estimated_cost: 1_000_000.0,
            estimated_rows: 1_000_000,
            idx_num: 0,
            idx_str: String::new(),
        }
    }

    /// Restore a plan from its serialized form
    pub fn from_idx_str(idx_str: &str) -> Result<Self> {
        if idx_str.is_empty() {
            return Ok(Self::full_scan());
        }
        let mut plan: Self = serde_json::from_str(idx_str)
            .map_err(|e| Error::protocol(format!("malformed index plan: {}", e)))?;
        plan.idx_str = idx_str.to_string();
        Ok(plan)
    }

    /// Number of filter arguments the plan expects
    pub fn argument_count(&self) -> usize {
        self.terms.iter().filter(|t| t.op.takes_argument()).count()
    }
}

/// A pushed term once its filter argument is known
enum Resolved {
    /// Send the term with this parameter
    Bind(PushedTerm, Value),
    /// Send an argument-free term instead
    Term(PushedTerm),
    /// The term holds for every row
    Always,
    /// The term holds for no row
    Never,
}

/// Key of a row without an integer primary key
#[derive(Debug, Clone)]
struct SyntheticKey {
    cursor: u64,
    columns: Vec<usize>,
    values: Vec<Value>,
}

#[derive(Debug, Default)]
struct RowidRegistry {
    keys: HashMap<i64, SyntheticKey>,
    closed: HashSet<u64>,
}

impl RowidRegistry {
    /// Forget keys handed out by closed cursors
    fn purge_closed(&mut self) {
        if self.closed.is_empty() {
            return;
        }
        let closed = std::mem::take(&mut self.closed);
        self.keys.retain(|_, key| !closed.contains(&key.cursor));
    }
}

/// A backend table projected into the embedded engine
pub struct VirtualTable {
    ctx: TableContext,
    schema: TableSchema,
    state: RwLock<TableState>,
    rowids: Mutex<RowidRegistry>,
    next_rowid: AtomicI64,
    next_cursor: AtomicU64,
}

impl VirtualTable {
    /// Declare a table, introspecting the backend when asked to
    pub async fn declare(ctx: TableContext, name: &str, source: SchemaSource) -> Result<Arc<Self>> {
        crate::security::validate_sql_identifier(name)?;
        let schema = match source {
            SchemaSource::Introspect { table } => {
                let remote = table.unwrap_or_else(|| RemoteTable::new(name));
                let metadata = ctx.introspect(&remote).await?;
                ctx.mapper.schema_from_metadata(name, &metadata)?
            }
            SchemaSource::Explicit { table, columns } => {
                for column in &columns {
                    crate::security::validate_sql_identifier(&column.name)?;
                }
                let remote = table.unwrap_or_else(|| RemoteTable::new(name));
                ctx.mapper.schema_from_specs(name, remote, &columns)?
            }
        };
        Ok(Self::with_schema(ctx, schema))
    }

    /// Wrap an already derived schema
    pub fn with_schema(ctx: TableContext, schema: TableSchema) -> Arc<Self> {
        debug!(
            table = schema.name(),
            remote = %schema.remote(),
            columns = schema.columns().len(),
            "Virtual table declared"
        );
        Arc::new(Self {
            ctx,
            schema,
            state: RwLock::new(TableState::SchemaDeclared),
            rowids: Mutex::new(RowidRegistry::default()),
            next_rowid: AtomicI64::new(1),
            next_cursor: AtomicU64::new(1),
        })
    }

    /// Virtual table name
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Declared schema
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Current lifecycle state
    pub fn state(&self) -> TableState {
        *self.state.read()
    }

    /// Statement declaring the table to the embedded engine
    pub fn declaration_sql(&self) -> String {
        self.schema.declaration_sql()
    }

    /// Release schema-level resources. Open cursors keep their lease until
    /// they close.
    pub fn destroy(&self) {
        let mut state = self.state.write();
        if *state == TableState::Destroyed {
            return;
        }
        *state = TableState::Destroyed;
        let mut rowids = self.rowids.lock();
        rowids.keys.clear();
        rowids.closed.clear();
        debug!(table = self.name(), "Virtual table destroyed");
    }

    fn ensure_declared(&self) -> Result<()> {
        match self.state() {
            TableState::SchemaDeclared => Ok(()),
            state => Err(Error::protocol(format!(
                "table '{}' is {:?}",
                self.name(),
                state
            ))),
        }
    }

    fn is_numeric(&self, column: Option<usize>) -> bool {
        let column = column.or(self.schema.rowid_column());
        column
            .and_then(|i| self.schema.column(i))
            .is_some_and(|c| matches!(c.storage_class, StorageClass::Integer | StorageClass::Real))
    }

    /// Decide which constraints and ordering the backend takes over
    pub fn best_index(&self, constraints: &[IndexConstraint], order_by: &[OrderTerm]) -> IndexPlan {
        let adapter = self.ctx.provider.adapter();
        let mut usage = vec![ConstraintUsage::default(); constraints.len()];
        let mut terms = Vec::new();
        let mut everything_omitted = true;
        let mut rows = 1_000_000f64;
        let single_key = self.schema.rowid_column().or_else(|| match self.schema.primary_key().as_slice() {
            [only] => Some(*only),
            _ => None,
        });

        for (i, constraint) in constraints.iter().enumerate() {
            if matches!(constraint.op, ConstraintOp::Limit | ConstraintOp::Offset) {
                continue;
            }
            let column = match constraint.column {
                Some(c) if c < self.schema.columns().len() => Some(c),
                Some(_) => None,
                None => self.schema.rowid_column(),
            };
            // Backend collations are not BINARY, so non-numeric columns only
            // push terms whose backend result is a superset of SQLite's
            let numeric = self.is_numeric(column);
            let pushable = constraint.usable
                && column.is_some()
                && match constraint.op {
                    ConstraintOp::Eq
                    | ConstraintOp::Like
                    | ConstraintOp::IsNull
                    | ConstraintOp::IsNotNull => true,
                    ConstraintOp::Ne
                    | ConstraintOp::Gt
                    | ConstraintOp::Ge
                    | ConstraintOp::Lt
                    | ConstraintOp::Le => numeric,
                    ConstraintOp::Is => adapter.null_safe_operator(false).is_some(),
                    ConstraintOp::IsNot => numeric && adapter.null_safe_operator(false).is_some(),
                    _ => false,
                };
            if !pushable {
                everything_omitted = false;
                continue;
            }

            let omit = match constraint.op {
                ConstraintOp::IsNull | ConstraintOp::IsNotNull => true,
                op if op.is_comparison() => numeric,
                _ => false,
            };
            everything_omitted &= omit;

            terms.push(PushedTerm {
                column,
                op: constraint.op,
            });
            if constraint.op.takes_argument() {
                let argv = terms.iter().filter(|t| t.op.takes_argument()).count();
                usage[i] = ConstraintUsage {
                    argv_index: Some(argv),
                    omit,
                };
            } else {
                usage[i] = ConstraintUsage {
                    argv_index: None,
                    omit,
                };
            }

            rows = if constraint.op == ConstraintOp::Eq && column == single_key {
                1.0
            } else {
                (rows * constraint.op.selectivity()).max(1.0)
            };
        }

        let order_by_consumed = !order_by.is_empty()
            && order_by.iter().all(|term| match term.column {
                None => self.schema.rowid_column().is_some(),
                Some(c) => c < self.schema.columns().len() && self.is_numeric(Some(c)),
            });

        // Row limits only hold when the backend sees the whole predicate
        if everything_omitted && (order_by.is_empty() || order_by_consumed) {
            let limit = constraints
                .iter()
                .position(|c| c.usable && c.op == ConstraintOp::Limit);
            let offset = constraints
                .iter()
                .position(|c| c.usable && c.op == ConstraintOp::Offset);
            if let Some(limit) = limit {
                for (i, op) in [(Some(limit), ConstraintOp::Limit), (offset, ConstraintOp::Offset)]
                    .into_iter()
                    .filter_map(|(i, op)| i.map(|i| (i, op)))
                {
                    terms.push(PushedTerm { column: None, op });
                    let argv = terms.iter().filter(|t| t.op.takes_argument()).count();
                    usage[i] = ConstraintUsage {
                        argv_index: Some(argv),
                        omit: true,
                    };
                }
                rows = rows.min(100.0);
            }
        }

        let mut estimated_cost = 100.0 + rows;
        if !order_by.is_empty() && !order_by_consumed {
            estimated_cost += rows * rows.log2().max(1.0) / 10.0;
        }

        let mut plan = IndexPlan {
            usage,
            terms,
            order_by: if order_by_consumed {
                order_by.to_vec()
            } else {
                Vec::new()
            },
            order_by_consumed,
            estimated_cost,
            estimated_rows: rows.ceil() as i64,
            idx_num: 0,
            idx_str: String::new(),
        };
        plan.idx_num = plan.terms.len() as i32;
        plan.idx_str = serde_json::to_string(&plan).unwrap_or_default();
        trace!(
            table = self.name(),
            pushed = plan.terms.len(),
            order_by_consumed,
            estimated_rows = plan.estimated_rows,
            "Planned scan"
        );
        plan
    }

    fn remote_ref(&self) -> TableRef {
        let remote = self.schema.remote();
        sea_table_ref(self.ctx.resolve_schema(remote), &remote.name)
    }

    /// SELECT for a plan, in the embedded dialect
    pub fn select_sql(&self, plan: &IndexPlan) -> Result<String> {
        self.build_select(&plan.terms, &plan.order_by)
    }

    fn build_select(&self, terms: &[PushedTerm], order_by: &[OrderTerm]) -> Result<String> {
        let mut stmt = Query::select();
        stmt.from(self.remote_ref());
        for column in self.schema.columns() {
            stmt.column(Alias::new(&column.name));
        }

        let mut limit = false;
        let mut offset = false;
        for term in terms {
            match term.op {
                ConstraintOp::Limit => {
                    limit = true;
                    continue;
                }
                ConstraintOp::Offset => {
                    offset = true;
                    continue;
                }
                _ => {}
            }
            let column = term
                .column
                .and_then(|c| self.schema.column(c))
                .ok_or_else(|| Error::protocol("pushed term without a column"))?;
            let col = Expr::col(Alias::new(&column.name));
            stmt.and_where(match term.op {
                ConstraintOp::Eq => col.eq(param()),
                ConstraintOp::Ne => col.ne(param()),
                ConstraintOp::Gt => col.gt(param()),
                ConstraintOp::Ge => col.gte(param()),
                ConstraintOp::Lt => col.lt(param()),
                ConstraintOp::Le => col.lte(param()),
                ConstraintOp::Like => col.binary(BinOper::Like, param()),
                ConstraintOp::Is => col.binary(BinOper::Is, param()),
                ConstraintOp::IsNot => col.binary(BinOper::IsNot, param()),
                ConstraintOp::IsNull => col.is_null(),
                ConstraintOp::IsNotNull => col.is_not_null(),
                other => {
                    return Err(Error::protocol(format!("{:?} cannot be pushed down", other)))
                }
            });
        }

        for term in order_by {
            let column = term
                .column
                .or(self.schema.rowid_column())
                .and_then(|c| self.schema.column(c))
                .ok_or_else(|| Error::protocol("ORDER BY term without a column"))?;
            stmt.order_by(
                Alias::new(&column.name),
                if term.desc { Order::Desc } else { Order::Asc },
            );
        }

        let mut sql = stmt.to_string(SqliteQueryBuilder);
        match (limit, offset) {
            (true, true) => sql.push_str(" LIMIT ? OFFSET ?"),
            (true, false) => sql.push_str(" LIMIT ?"),
            (false, true) => return Err(Error::protocol("OFFSET pushed without LIMIT")),
            (false, false) => {}
        }
        Ok(sql)
    }

    /// Bind filter arguments to the plan's terms, in argument order.
    ///
    /// Returns `None` when no row can satisfy the filter.
    fn resolve_filter(
        &self,
        plan: &IndexPlan,
        args: &[SqlValue],
    ) -> Result<Option<(Vec<PushedTerm>, Vec<Value>)>> {
        if args.len() != plan.argument_count() {
            return Err(Error::protocol(format!(
                "plan expects {} arguments, got {}",
                plan.argument_count(),
                args.len()
            )));
        }
        let mut args = args.iter();
        let mut terms = Vec::with_capacity(plan.terms.len());
        let mut params = Vec::with_capacity(plan.argument_count());
        for term in &plan.terms {
            if !term.op.takes_argument() {
                terms.push(*term);
                continue;
            }
            let Some(arg) = args.next() else { break };
            let resolved = match term.op {
                ConstraintOp::Limit | ConstraintOp::Offset => {
                    let n = arg.as_i64().ok_or_else(|| {
                        Error::type_conversion(format!("{:?} expects an integer", term.op))
                    })?;
                    Resolved::Bind(*term, Value::Int64(n))
                }
                ConstraintOp::Like => Resolved::Bind(*term, DataMapper::untyped_param(arg)),
                _ => match term.column.and_then(|c| self.schema.column(c)) {
                    Some(column) => self.resolve_argument(*term, column, arg)?,
                    None => Resolved::Bind(*term, DataMapper::untyped_param(arg)),
                },
            };
            match resolved {
                Resolved::Bind(term, value) => {
                    terms.push(term);
                    params.push(value);
                }
                Resolved::Term(term) => terms.push(term),
                Resolved::Always => {}
                Resolved::Never => return Ok(None),
            }
        }
        Ok(Some((terms, params)))
    }

    /// Convert one comparison argument to the column type.
    ///
    /// Arguments the column type cannot hold are resolved the way SQLite
    /// compares across storage classes (NULL < numbers < text < blob), with
    /// fractional bounds on integer columns rounded to the equivalent integer.
    fn resolve_argument(
        &self,
        term: PushedTerm,
        column: &ColumnDeclaration,
        arg: &SqlValue,
    ) -> Result<Resolved> {
        let mapper = &self.ctx.mapper;
        let mut ty = column.provider_type.clone();
        // Range bounds must not be rounded to the column scale
        if ty.family == TypeFamily::Decimal {
            ty.scale = None;
        }
        let err = match mapper.to_provider_param(arg, &ty) {
            Ok(value) => return Ok(Resolved::Bind(term, value)),
            Err(e) if e.category() == ErrorCategory::TypeConversion => e,
            Err(e) => return Err(e),
        };

        let numeric = matches!(column.storage_class, StorageClass::Integer | StorageClass::Real);
        if !numeric {
            return match term.op {
                ConstraintOp::Eq | ConstraintOp::Is => Ok(Resolved::Never),
                _ => Err(err),
            };
        }

        let not_null = Resolved::Term(PushedTerm {
            column: term.column,
            op: ConstraintOp::IsNotNull,
        });
        let number = match arg {
            SqlValue::Integer(n) => Some(*n as f64),
            SqlValue::Real(f) => Some(*f),
            SqlValue::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            SqlValue::Blob(_) | SqlValue::Null => None,
        };
        let Some(x) = number else {
            // Text and blobs sort after every number
            return Ok(match term.op {
                ConstraintOp::Ne | ConstraintOp::Lt | ConstraintOp::Le => not_null,
                ConstraintOp::IsNot => Resolved::Always,
                _ => Resolved::Never,
            });
        };
        if x.is_nan() {
            return Ok(Resolved::Bind(term, Value::Null));
        }
        if column.storage_class == StorageClass::Real {
            return Ok(Resolved::Bind(term, Value::Float64(x)));
        }

        let bound = match term.op {
            ConstraintOp::Gt | ConstraintOp::Le => x.floor(),
            ConstraintOp::Ge | ConstraintOp::Lt => x.ceil(),
            _ => x,
        };
        if bound.fract() == 0.0 && bound.abs() < 9.2e18 {
            if let Ok(value) = mapper.to_provider_param(&SqlValue::Integer(bound as i64), &ty) {
                return Ok(Resolved::Bind(term, value));
            }
        }
        // No value of the column type equals the bound
        Ok(match term.op {
            ConstraintOp::Ne => not_null,
            ConstraintOp::IsNot => Resolved::Always,
            ConstraintOp::Gt | ConstraintOp::Ge if x > 0.0 => Resolved::Never,
            ConstraintOp::Lt | ConstraintOp::Le if x < 0.0 => Resolved::Never,
            ConstraintOp::Gt | ConstraintOp::Ge | ConstraintOp::Lt | ConstraintOp::Le => not_null,
            _ => Resolved::Never,
        })
    }

    /// Open a cursor, acquiring a lease for its lifetime
    pub async fn open(self: &Arc<Self>) -> Result<Cursor> {
        self.ensure_declared()?;
        self.rowids.lock().purge_closed();

        let lease = self.ctx.pool.acquire_default().await?;
        let conn = match self.ctx.pool.checkout(&lease) {
            Ok(conn) => conn,
            Err(e) => {
                self.ctx.pool.invalidate(lease).await;
                return Err(e);
            }
        };
        let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
        trace!(table = self.name(), cursor = id, slot = lease.slot(), "Cursor opened");

        Ok(Cursor {
            id,
            table: self.clone(),
            lease: Some(lease),
            conn: Some(conn),
            stream: None,
            buffer: VecDeque::new(),
            current: None,
            current_rowid: Cell::new(None),
            drained: false,
            plan: None,
            state: Cell::new(CursorState::Opened),
        })
    }

    fn write_values(&self, values: &[SqlValue]) -> Result<()> {
        if values.len() != self.schema.columns().len() {
            return Err(Error::protocol(format!(
                "table '{}' has {} columns, got {} values",
                self.name(),
                self.schema.columns().len(),
                values.len()
            )));
        }
        Ok(())
    }

    fn provider_param(&self, column: &ColumnDeclaration, value: &SqlValue) -> Result<Value> {
        self.ctx.mapper.to_provider_param(value, &column.provider_type)
    }

    async fn execute_write(&self, sql: String, params: Vec<Value>) -> Result<u64> {
        let translated = self.ctx.translator.translate(&sql, self.ctx.provider)?;
        let bound = translated.bind(&params)?;
        debug!(table = self.name(), sql = %translated.sql, "Executing write");
        self.ctx
            .with_connection(|conn| async move { conn.execute(&translated.sql, &bound).await })
            .await
    }

    /// Insert a row, returning its rowid
    pub async fn insert(&self, values: &[SqlValue]) -> Result<i64> {
        self.ensure_declared()?;
        self.write_values(values)?;

        let rowid_column = self.schema.rowid_column();
        let mut columns = Vec::new();
        let mut params = Vec::new();
        for (i, (column, value)) in self.schema.columns().iter().zip(values).enumerate() {
            if value.is_null() && (column.auto_increment || Some(i) == rowid_column) {
                continue;
            }
            DataMapper::check_not_null(column, value)?;
            columns.push(Alias::new(&column.name).into_iden());
            params.push(self.provider_param(column, value)?);
        }

        if let Some(idx) = rowid_column {
            if let Some(id) = values[idx].as_i64() {
                let sql = self.insert_sql(columns, None);
                self.execute_write(sql, params).await?;
                return Ok(id);
            }
        }

        let returning = rowid_column
            .filter(|_| self.ctx.provider.adapter().capabilities().returning)
            .and_then(|idx| self.schema.column(idx));
        let sql = self.insert_sql(columns, returning);
        let translated = self.ctx.translator.translate(&sql, self.ctx.provider)?;
        let bound = translated.bind(&params)?;
        debug!(table = self.name(), sql = %translated.sql, "Executing insert");

        let mapper = self.ctx.mapper.clone();
        let generated = self
            .ctx
            .with_connection(|conn| async move {
                match returning {
                    Some(column) => {
                        let row = conn.query_one(&translated.sql, &bound).await?;
                        match row.and_then(|r| r.into_values().into_iter().next()) {
                            Some(value) => Ok(mapper
                                .to_storage_class(&column.provider_type, value)?
                                .as_i64()),
                            None => Ok(None),
                        }
                    }
                    None => {
                        conn.execute(&translated.sql, &bound).await?;
                        conn.last_insert_id().await
                    }
                }
            })
            .await?;

        Ok(match (rowid_column, generated) {
            (Some(_), Some(id)) => id,
            _ => self.next_rowid.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn insert_sql(
        &self,
        columns: Vec<sea_query::DynIden>,
        returning: Option<&ColumnDeclaration>,
    ) -> String {
        let mut stmt = Query::insert();
        stmt.into_table(self.remote_ref());
        if columns.is_empty() {
            stmt.or_default_values();
        } else {
            let values: Vec<SimpleExpr> = columns.iter().map(|_| param()).collect();
            stmt.columns(columns).values_panic(values);
        }
        if let Some(column) = returning {
            stmt.returning_col(Alias::new(&column.name));
        }
        stmt.to_string(SqliteQueryBuilder)
    }

    /// WHERE terms identifying the row behind a rowid
    fn key_condition(&self, rowid: i64) -> Result<Vec<(usize, Value)>> {
        if let Some(idx) = self.schema.rowid_column() {
            let column = &self.schema.columns()[idx];
            return Ok(vec![(idx, self.provider_param(column, &SqlValue::Integer(rowid))?)]);
        }
        let rowids = self.rowids.lock();
        let key = rowids.keys.get(&rowid).ok_or_else(|| {
            Error::protocol(format!("rowid {} was not produced by a cursor on '{}'", rowid, self.name()))
        })?;
        Ok(key.columns.iter().copied().zip(key.values.iter().cloned()).collect())
    }

    fn apply_key(&self, key: Vec<(usize, Value)>, params: &mut Vec<Value>) -> Vec<SimpleExpr> {
        key.into_iter()
            .map(|(idx, value)| {
                let col = Expr::col(Alias::new(&self.schema.columns()[idx].name));
                if value.is_null() {
                    col.is_null()
                } else {
                    params.push(value);
                    col.eq(param())
                }
            })
            .collect()
    }

    /// Update the row behind `rowid`
    pub async fn update(&self, rowid: i64, values: &[SqlValue]) -> Result<u64> {
        self.ensure_declared()?;
        self.write_values(values)?;

        let mut stmt = Query::update();
        stmt.table(self.remote_ref());
        let mut params = Vec::new();
        for (column, value) in self.schema.columns().iter().zip(values) {
            if column.auto_increment {
                continue;
            }
            DataMapper::check_not_null(column, value)?;
            stmt.value(Alias::new(&column.name), param());
            params.push(self.provider_param(column, value)?);
        }
        if params.is_empty() {
            return Ok(0);
        }
        let key = self.key_condition(rowid)?;
        for condition in self.apply_key(key, &mut params) {
            stmt.and_where(condition);
        }

        self.execute_write(stmt.to_string(SqliteQueryBuilder), params)
            .await
    }

    /// Delete the row behind `rowid`
    pub async fn delete(&self, rowid: i64) -> Result<u64> {
        self.ensure_declared()?;
        let mut stmt = Query::delete();
        stmt.from_table(self.remote_ref());
        let mut params = Vec::new();
        let key = self.key_condition(rowid)?;
        for condition in self.apply_key(key, &mut params) {
            stmt.and_where(condition);
        }

        let affected = self
            .execute_write(stmt.to_string(SqliteQueryBuilder), params)
            .await?;
        if self.schema.rowid_column().is_none() {
            self.rowids.lock().keys.remove(&rowid);
        }
        Ok(affected)
    }

    fn register_rowid(&self, cursor: u64, row: &Row) -> i64 {
        let primary_key = self.schema.primary_key();
        let columns: Vec<usize> = if primary_key.is_empty() {
            (0..self.schema.columns().len()).collect()
        } else {
            primary_key
        };
        let values = columns
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
            .collect();
        let rowid = self.next_rowid.fetch_add(1, Ordering::Relaxed);
        self.rowids.lock().keys.insert(
            rowid,
            SyntheticKey {
                cursor,
                columns,
                values,
            },
        );
        rowid
    }

    fn cursor_closed(&self, cursor: u64) {
        self.rowids.lock().closed.insert(cursor);
    }

    /// Synthetic keys currently remembered
    pub fn synthetic_rowids(&self) -> usize {
        self.rowids.lock().keys.len()
    }
}

impl fmt::Debug for VirtualTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTable")
            .field("name", &self.name())
            .field("remote", self.schema.remote())
            .field("state", &self.state())
            .finish()
    }
}

/// Lifecycle of a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Lease held, no plan yet
    Opened,
    /// Plan recorded
    FilterPlanned,
    /// Statement sent
    Executing,
    /// Positioned on a row
    Iterating,
    /// No more rows
    Exhausted,
    /// Closed, lease returned
    Closed,
    /// Misused; only `close` is allowed
    Failed,
}

/// Pull-based scan over a virtual table
pub struct Cursor {
    id: u64,
    table: Arc<VirtualTable>,
    lease: Option<Lease>,
    conn: Option<Arc<dyn Connection>>,
    stream: Option<Box<dyn RowStream>>,
    buffer: VecDeque<Row>,
    current: Option<Row>,
    current_rowid: Cell<Option<i64>>,
    drained: bool,
    plan: Option<IndexPlan>,
    state: Cell<CursorState>,
}

impl Cursor {
    /// Cursor state
    pub fn state(&self) -> CursorState {
        self.state.get()
    }

    /// Table this cursor scans
    pub fn table(&self) -> &Arc<VirtualTable> {
        &self.table
    }

    /// Rows fetched but not yet visited
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn protocol_error(&self, message: impl Into<String>) -> Error {
        let message = message.into();
        warn!(table = self.table.name(), cursor = self.id, %message, "Cursor protocol error");
        self.state.set(CursorState::Failed);
        Error::protocol(message)
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            CursorState::Closed => Err(self.protocol_error("cursor is closed")),
            CursorState::Failed => Err(Error::protocol("cursor has failed")),
            _ => Ok(()),
        }
    }

    /// Record the plan the next [`execute`](Self::execute) runs
    pub fn plan(&mut self, plan: IndexPlan) -> Result<()> {
        self.ensure_usable()?;
        self.plan = Some(plan);
        self.state.set(CursorState::FilterPlanned);
        Ok(())
    }

    /// Record `plan` and run it with `args`, positioning on the first row
    pub async fn filter(&mut self, plan: IndexPlan, args: &[SqlValue]) -> Result<()> {
        self.plan(plan)?;
        self.execute(args).await
    }

    /// Run the recorded plan
    pub async fn execute(&mut self, args: &[SqlValue]) -> Result<()> {
        if self.state() != CursorState::FilterPlanned {
            return Err(self.protocol_error(format!("execute in state {:?}", self.state())));
        }
        let Some(plan) = self.plan.clone() else {
            return Err(self.protocol_error("no plan recorded"));
        };
        self.table.ensure_declared().map_err(|e| {
            self.state.set(CursorState::Failed);
            e
        })?;
        self.reset().await?;

        let result = self.start(&plan, args).await;
        self.settle(result).await
    }

    /// Drop the previous result set and make sure a lease is held
    async fn reset(&mut self) -> Result<()> {
        self.buffer.clear();
        self.current = None;
        self.current_rowid.set(None);
        self.drained = false;
        if self.stream.take().is_some() {
            // An unfinished result set leaves the session mid-protocol
            if let Some(lease) = self.lease.take() {
                self.table.ctx.pool.invalidate(lease).await;
            }
            self.conn = None;
        }
        if self.lease.is_none() {
            let lease = self.table.ctx.pool.acquire_default().await?;
            let conn = self.table.ctx.pool.checkout(&lease)?;
            self.lease = Some(lease);
            self.conn = Some(conn);
        }
        Ok(())
    }

    async fn start(&mut self, plan: &IndexPlan, args: &[SqlValue]) -> Result<()> {
        let Some((terms, params)) = self.table.resolve_filter(plan, args)? else {
            debug!(table = self.table.name(), cursor = self.id, "Filter matches no rows");
            self.state.set(CursorState::Iterating);
            self.drained = true;
            return self.advance().await;
        };
        let sql = self.table.build_select(&terms, &plan.order_by)?;
        let translated = self.table.ctx.translator.translate(&sql, self.table.ctx.provider)?;
        let bound = translated.bind(&params)?;
        let conn = self
            .conn
            .clone()
            .ok_or_else(|| Error::internal("cursor has no connection"))?;

        debug!(
            table = self.table.name(),
            cursor = self.id,
            sql = %translated.sql,
            params = bound.len(),
            "Executing scan"
        );
        self.state.set(CursorState::Executing);
        if let Some(lease) = &self.lease {
            lease.begin_statement();
        }
        let stream = timed(
            self.table.ctx.statement_timeout,
            conn.query_stream(&translated.sql, &bound),
        )
        .await?;
        self.stream = Some(stream);
        self.state.set(CursorState::Iterating);
        self.advance().await
    }

    /// Move to the next row, refilling the buffer when it runs dry
    async fn advance(&mut self) -> Result<()> {
        self.current_rowid.set(None);
        if self.buffer.is_empty() && !self.drained {
            let batch_size = self.table.ctx.fetch_batch_size;
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| Error::internal("cursor has no result stream"))?;
            let batch = timed(self.table.ctx.statement_timeout, stream.next_batch(batch_size)).await?;
            trace!(cursor = self.id, rows = batch.len(), "Fetched batch");
            if batch.is_empty() {
                self.drained = true;
            }
            self.buffer.extend(batch);
        }

        self.current = self.buffer.pop_front();
        if self.current.is_none() {
            self.finish().await;
        }
        Ok(())
    }

    /// Backend is drained: return the lease early
    async fn finish(&mut self) {
        self.state.set(CursorState::Exhausted);
        self.stream = None;
        self.conn = None;
        if let Some(lease) = self.lease.take() {
            lease.end_statement();
            self.table.ctx.pool.release(lease).await;
        }
        trace!(cursor = self.id, "Cursor exhausted");
    }

    /// Fail the cursor on error, invalidating the lease if the session is
    /// in an unknown state
    async fn settle(&mut self, result: Result<()>) -> Result<()> {
        let Err(e) = result else {
            return Ok(());
        };
        self.state.set(CursorState::Failed);
        self.stream = None;
        self.conn = None;
        self.buffer.clear();
        self.current = None;
        if let Some(lease) = self.lease.take() {
            if e.poisons_connection() || e.category() == ErrorCategory::Protocol {
                self.table.ctx.pool.invalidate(lease).await;
            } else {
                lease.end_statement();
                self.table.ctx.pool.release(lease).await;
            }
        }
        Err(e)
    }

    /// Advance to the next row
    pub async fn next(&mut self) -> Result<()> {
        match self.state() {
            CursorState::Iterating => {
                let result = self.advance().await;
                self.settle(result).await
            }
            CursorState::Exhausted => Err(self.protocol_error("next() after end of rows")),
            state => Err(self.protocol_error(format!("next() in state {:?}", state))),
        }
    }

    /// Whether the cursor is past the last row
    pub fn eof(&self) -> bool {
        self.state() != CursorState::Iterating || self.current.is_none()
    }

    fn current_row(&self, what: &str) -> Result<&Row> {
        if self.state() != CursorState::Iterating {
            return Err(self.protocol_error(format!("{} in state {:?}", what, self.state())));
        }
        self.current
            .as_ref()
            .ok_or_else(|| self.protocol_error(format!("{} without a current row", what)))
    }

    /// Value of column `idx` on the current row
    pub fn column(&self, idx: usize) -> Result<SqlValue> {
        let row = self.current_row("column()")?;
        let column = self
            .table
            .schema
            .column(idx)
            .ok_or_else(|| self.protocol_error(format!("column {} out of range", idx)))?;
        let value = row.get(idx).cloned().unwrap_or(Value::Null);
        self.table.ctx.mapper.to_storage_class(&column.provider_type, value)
    }

    /// Rowid of the current row
    pub fn rowid(&self) -> Result<i64> {
        let row = self.current_row("rowid()")?;
        if let Some(id) = self.current_rowid.get() {
            return Ok(id);
        }
        let id = match self.table.schema.rowid_column() {
            Some(idx) => self.column(idx)?.as_i64().ok_or_else(|| {
                Error::type_conversion(format!("row of '{}' has a NULL key", self.table.name()))
            })?,
            None => self.table.register_rowid(self.id, row),
        };
        self.current_rowid.set(Some(id));
        Ok(id)
    }

    /// Return the lease and discard buffered rows
    pub async fn close(&mut self) {
        if self.state() == CursorState::Closed {
            return;
        }
        let failed = self.state() == CursorState::Failed;
        self.buffer.clear();
        self.current = None;
        self.conn = None;
        let unfinished = self.stream.take().is_some();
        if let Some(lease) = self.lease.take() {
            if failed || unfinished {
                self.table.ctx.pool.invalidate(lease).await;
            } else {
                self.table.ctx.pool.release(lease).await;
            }
        }
        self.table.cursor_closed(self.id);
        self.state.set(CursorState::Closed);
        trace!(table = self.table.name(), cursor = self.id, "Cursor closed");
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.state() != CursorState::Closed {
            // The lease settles itself on drop
            self.table.cursor_closed(self.id);
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("table", &self.table.name())
            .field("state", &self.state())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
