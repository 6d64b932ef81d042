//! Bridge facade
//!
//! A [`Bridge`] owns everything tied to one backend: the connection pool, the
//! translation cache, the data mapper and the registry of virtual tables.
//! Dropping it shuts the pool down.

use futures::stream::{self, Stream};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, ProviderConfig};
use crate::connection::{Connection, ConnectionFactory, RowStream};
use crate::dialect::Provider;
use crate::error::{Error, Result};
use crate::mapper::{DataMapper, SqlValue};
use crate::pool::{ConnectionManager, Lease, PoolStats};
use crate::translator::{QueryTranslator, StatementKind, TranslatedQuery, TranslatorStats};
use crate::types::{Row, Value};
use crate::vtab::{timed, SchemaSource, TableContext, VirtualTable};

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Pool counters
    pub pool: PoolStats,
    /// Translation cache counters
    pub translator: TranslatorStats,
    /// Registered virtual tables
    pub tables: usize,
}

/// Connection factory for a provider, as far as its driver is compiled in
pub fn default_factory(provider: Provider) -> Result<Arc<dyn ConnectionFactory>> {
    match provider {
        #[cfg(feature = "postgres")]
        Provider::Postgres => Ok(Arc::new(crate::postgres::PgConnectionFactory)),
        #[cfg(feature = "mysql")]
        Provider::MySql | Provider::MariaDb => {
            Ok(Arc::new(crate::mysql::MySqlConnectionFactory::new(provider)))
        }
        #[cfg(feature = "sqlserver")]
        Provider::SqlServer => Ok(Arc::new(crate::sqlserver::SqlServerConnectionFactory)),
        #[allow(unreachable_patterns)]
        other => Err(Error::unsupported(format!(
            "{} support is not compiled in",
            other
        ))),
    }
}

/// Entry point tying a backend to the embedded engine
pub struct Bridge {
    ctx: TableContext,
    config: BridgeConfig,
    tables: RwLock<BTreeMap<String, Arc<VirtualTable>>>,
}

impl Bridge {
    /// Connect with the driver matching the URL scheme
    pub async fn connect(provider: ProviderConfig, config: BridgeConfig) -> Result<Self> {
        let factory = default_factory(provider.provider())?;
        Self::with_factory(provider, config, factory).await
    }

    /// Connect through a caller-supplied factory
    pub async fn with_factory(
        provider: ProviderConfig,
        config: BridgeConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        config.check()?;
        if factory.provider() != provider.provider() {
            return Err(Error::config(format!(
                "factory speaks {} but the target is {}",
                factory.provider(),
                provider.provider()
            )));
        }

        let pool_config = config.pool_config(&provider);
        let pool = ConnectionManager::new(provider, factory, pool_config).await?;
        let translator = QueryTranslator::new(config.translation_cache_capacity);
        let mapper = DataMapper::new(&config)?;
        let ctx = TableContext::new(
            Arc::new(pool),
            Arc::new(translator),
            Arc::new(mapper),
            &config,
        );

        info!(
            provider = %ctx.provider,
            target_url = %ctx.pool.provider_config().redacted_url(),
            "Bridge connected"
        );
        Ok(Self {
            ctx,
            config,
            tables: RwLock::new(BTreeMap::new()),
        })
    }

    /// Backend provider
    pub fn provider(&self) -> Provider {
        self.ctx.provider
    }

    /// Bridge settings
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Shared table context
    pub fn context(&self) -> &TableContext {
        &self.ctx
    }

    /// Value mapper
    pub fn mapper(&self) -> &DataMapper {
        &self.ctx.mapper
    }

    /// Declare a virtual table
    pub async fn register_virtual_table(
        &self,
        name: &str,
        source: SchemaSource,
    ) -> Result<Arc<VirtualTable>> {
        if self.tables.read().contains_key(name) {
            return Err(Error::schema(format!("table '{}' is already registered", name)));
        }
        let table = VirtualTable::declare(self.ctx.clone(), name, source).await?;

        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            table.destroy();
            return Err(Error::schema(format!("table '{}' is already registered", name)));
        }
        tables.insert(name.to_string(), table.clone());
        info!(table = name, remote = %table.schema().remote(), "Virtual table registered");
        Ok(table)
    }

    /// Introspect and register every backend table not registered yet
    pub async fn register_all(&self) -> Result<Vec<Arc<VirtualTable>>> {
        let remotes = self.ctx.list_tables().await?;
        let mut registered = Vec::new();
        for remote in remotes {
            if self.tables.read().contains_key(&remote.name) {
                continue;
            }
            let name = remote.name.clone();
            match self
                .register_virtual_table(&name, SchemaSource::introspect_table(remote))
                .await
            {
                Ok(table) => registered.push(table),
                Err(e @ Error::Configuration { .. }) => {
                    warn!(table = %name, error = %e, "Skipping table with unusable name");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(count = registered.len(), "Registered backend tables");
        Ok(registered)
    }

    /// Look up a registered table
    pub fn table(&self, name: &str) -> Option<Arc<VirtualTable>> {
        self.tables.read().get(name).cloned()
    }

    /// Names of the registered tables
    pub fn tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Destroy and unregister a table
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let table = self
            .tables
            .write()
            .remove(name)
            .ok_or_else(|| Error::TableNotFound {
                table: name.to_string(),
            })?;
        table.destroy();
        info!(table = name, "Virtual table dropped");
        Ok(())
    }

    fn prepare(&self, sql: &str, params: &[SqlValue]) -> Result<(Arc<TranslatedQuery>, Vec<Value>)> {
        let translated = self.ctx.translator.translate(sql, self.ctx.provider)?;
        let values: Vec<Value> = params.iter().map(DataMapper::untyped_param).collect();
        let bound = translated.bind(&values)?;
        Ok((translated, bound))
    }

    /// Run an ad-hoc query written in the embedded dialect.
    ///
    /// The stream holds one lease until it is drained or dropped.
    pub async fn execute_query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryStream> {
        let (translated, bound) = self.prepare(sql, params)?;
        if translated.is_noop() {
            return Ok(QueryStream::empty(&self.ctx));
        }
        if translated.kind == StatementKind::Transaction {
            return Err(Error::unsupported(
                "transaction control needs a pinned connection; use Bridge::session",
            ));
        }

        let lease = self.ctx.pool.acquire_default().await?;
        let mut stream = QueryStream {
            ctx: self.ctx.clone(),
            lease: Some(lease),
            stream: None,
            buffer: VecDeque::new(),
            columns: Vec::new(),
        };
        let opened = stream.open(&translated, &bound).await;
        stream.settle(opened).await?;
        Ok(stream)
    }

    /// Run a statement that returns no rows, returning the affected count
    pub async fn execute_dml(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let (translated, bound) = self.prepare(sql, params)?;
        if translated.is_noop() {
            return Ok(0);
        }
        if translated.kind == StatementKind::Transaction {
            return Err(Error::unsupported(
                "transaction control needs a pinned connection; use Bridge::session",
            ));
        }
        debug!(sql = %translated.sql, "Executing statement");
        self.ctx
            .with_connection(|conn| async move { conn.execute(&translated.sql, &bound).await })
            .await
    }

    /// Pin one connection, for statements that span several calls
    pub async fn session(&self) -> Result<Session> {
        let lease = self.ctx.pool.acquire_default().await?;
        let conn = self.ctx.pool.checkout(&lease)?;
        Ok(Session {
            ctx: self.ctx.clone(),
            lease: Some(lease),
            conn,
            in_transaction: false,
        })
    }

    /// Round-trip to the backend on a pooled connection
    pub async fn health_check(&self) -> Result<()> {
        self.ctx
            .with_connection(|conn| async move {
                if conn.is_valid().await {
                    Ok(())
                } else {
                    Err(Error::connection("backend did not answer the health check"))
                }
            })
            .await
    }

    /// Snapshot statistics
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            pool: self.ctx.pool.stats(),
            translator: self.ctx.translator.stats(),
            tables: self.tables.read().len(),
        }
    }

    /// Destroy all tables and close the pool
    pub async fn close(&self) -> Result<()> {
        let tables = std::mem::take(&mut *self.tables.write());
        for table in tables.values() {
            table.destroy();
        }
        self.ctx.translator.clear();
        self.ctx.pool.close().await?;
        info!(provider = %self.ctx.provider, "Bridge closed");
        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.ctx.pool.shutdown_now();
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("provider", &self.ctx.provider)
            .field("target", &self.ctx.pool.provider_config().redacted_url())
            .field("tables", &self.tables())
            .finish()
    }
}

/// Rows of an ad-hoc query, pulled in batches
pub struct QueryStream {
    ctx: TableContext,
    lease: Option<Lease>,
    stream: Option<Box<dyn RowStream>>,
    buffer: VecDeque<Row>,
    columns: Vec<String>,
}

impl QueryStream {
    fn empty(ctx: &TableContext) -> Self {
        Self {
            ctx: ctx.clone(),
            lease: None,
            stream: None,
            buffer: VecDeque::new(),
            columns: Vec::new(),
        }
    }

    async fn open(&mut self, translated: &TranslatedQuery, params: &[Value]) -> Result<()> {
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| Error::internal("query stream without a lease"))?;
        let conn = self.ctx.pool.checkout(lease)?;
        debug!(sql = %translated.sql, params = params.len(), "Executing query");

        lease.begin_statement();
        if !translated.returns_rows {
            timed(self.ctx.statement_timeout, conn.execute(&translated.sql, params)).await?;
            self.finish().await;
            return Ok(());
        }
        let stream = timed(
            self.ctx.statement_timeout,
            conn.query_stream(&translated.sql, params),
        )
        .await?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.stream = None;
            self.buffer.clear();
            if let Some(lease) = self.lease.take() {
                if e.poisons_connection() {
                    self.ctx.pool.invalidate(lease).await;
                } else {
                    lease.end_statement();
                    self.ctx.pool.release(lease).await;
                }
            }
        }
        result
    }

    async fn finish(&mut self) {
        self.stream = None;
        if let Some(lease) = self.lease.take() {
            lease.end_statement();
            self.ctx.pool.release(lease).await;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let batch = timed(
            self.ctx.statement_timeout,
            stream.next_batch(self.ctx.fetch_batch_size),
        )
        .await?;
        if batch.is_empty() {
            self.finish().await;
        }
        self.buffer.extend(batch);
        Ok(())
    }

    /// Next row, `None` once the result set is drained
    pub async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        let filled = self.fill().await;
        self.settle(filled).await?;

        let Some(row) = self.buffer.pop_front() else {
            return Ok(None);
        };
        if self.columns.is_empty() {
            self.columns = row.columns().to_vec();
        }
        let mapped = row
            .into_values()
            .into_iter()
            .map(|v| self.ctx.mapper.map_untyped(v))
            .collect::<Result<Vec<_>>>();
        self.settle(mapped).await.map(Some)
    }

    /// Column names, known once the first row has been read
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Drain the remaining rows
    pub async fn collect(mut self) -> Result<Vec<Vec<SqlValue>>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Adapt into a `futures` stream
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<SqlValue>>> {
        stream::unfold(self, |mut rows| async move {
            match rows.next_row().await {
                Ok(Some(row)) => Some((Ok(row), rows)),
                Ok(None) => None,
                Err(e) => Some((Err(e), rows)),
            }
        })
    }
}

impl fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStream")
            .field("columns", &self.columns)
            .field("buffered", &self.buffer.len())
            .field("open", &self.lease.is_some())
            .finish()
    }
}

/// One pinned backend connection
pub struct Session {
    ctx: TableContext,
    lease: Option<Lease>,
    conn: Arc<dyn Connection>,
    in_transaction: bool,
}

impl Session {
    /// Whether a transaction was begun and not yet ended
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn lease(&self) -> Result<&Lease> {
        self.lease
            .as_ref()
            .ok_or_else(|| Error::protocol("session lost its connection"))
    }

    async fn run<T, Fut>(&mut self, fut: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.lease()?.begin_statement();
        let result = timed(self.ctx.statement_timeout, fut).await;
        match &result {
            Err(e) if e.poisons_connection() => {
                if let Some(lease) = self.lease.take() {
                    self.ctx.pool.invalidate(lease).await;
                }
                self.in_transaction = false;
            }
            _ => {
                if let Some(lease) = &self.lease {
                    lease.end_statement();
                }
            }
        }
        result
    }

    /// Execute a statement, including transaction control
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let translated = self.ctx.translator.translate(sql, self.ctx.provider)?;
        if translated.is_noop() {
            return Ok(0);
        }
        let values: Vec<Value> = params.iter().map(DataMapper::untyped_param).collect();
        let bound = translated.bind(&values)?;
        let conn = self.conn.clone();
        let affected = self
            .run(async { conn.execute(&translated.sql, &bound).await })
            .await?;

        if translated.kind == StatementKind::Transaction {
            let verb = sql
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            let rollback_to = sql.to_ascii_uppercase().contains(" TO ");
            match verb.as_str() {
                "BEGIN" | "START" => self.in_transaction = true,
                "COMMIT" | "END" => self.in_transaction = false,
                "ROLLBACK" if !rollback_to => self.in_transaction = false,
                _ => {}
            }
        }
        Ok(affected)
    }

    /// Run a query and collect its rows
    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let translated = self.ctx.translator.translate(sql, self.ctx.provider)?;
        if translated.is_noop() {
            return Ok(Vec::new());
        }
        let values: Vec<Value> = params.iter().map(DataMapper::untyped_param).collect();
        let bound = translated.bind(&values)?;
        let conn = self.conn.clone();
        let rows = self
            .run(async { conn.query(&translated.sql, &bound).await })
            .await?;
        rows.into_iter()
            .map(|row| {
                row.into_values()
                    .into_iter()
                    .map(|v| self.ctx.mapper.map_untyped(v))
                    .collect()
            })
            .collect()
    }

    /// Return the connection; an open transaction is discarded with it
    pub async fn close(mut self) {
        if let Some(lease) = self.lease.take() {
            if self.in_transaction {
                warn!("Session closed inside a transaction, discarding connection");
                self.ctx.pool.invalidate(lease).await;
            } else {
                self.ctx.pool.release(lease).await;
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(lease) = &self.lease {
                // Dropping an in-flight lease discards its connection
                lease.begin_statement();
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("in_transaction", &self.in_transaction)
            .field("open", &self.lease.is_some())
            .finish()
    }
}
