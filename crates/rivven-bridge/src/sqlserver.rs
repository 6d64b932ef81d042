//! SQL Server backend
//!
//! TDS over tiberius. Parameters are always sent as typed RPC parameters
//! (`sp_executesql`); transaction control goes through a plain SQL batch
//! so the server does not see a transaction count mismatch.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::StreamExt;
use rust_decimal::Decimal;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::connection::{Connection, ConnectionFactory, ReaderRowStream, RowStream};
use crate::dialect::Provider;
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Rows decoded ahead of the consumer
const STREAM_READ_AHEAD: usize = 512;

type TdsClient = Client<Compat<TcpStream>>;

/// Typed TDS parameter
struct SqlParam(Value);

impl tiberius::ToSql for SqlParam {
    fn to_sql(&self) -> ColumnData<'_> {
        use Value::*;

        match &self.0 {
            Null => ColumnData::String(None),
            Bool(b) => ColumnData::Bit(Some(*b)),
            Int8(n) => ColumnData::I16(Some(i16::from(*n))), // TDS has no i8
            Int16(n) => ColumnData::I16(Some(*n)),
            Int32(n) => ColumnData::I32(Some(*n)),
            Int64(n) => ColumnData::I64(Some(*n)),
            UInt64(n) => match i64::try_from(*n) {
                Ok(n) => ColumnData::I64(Some(n)),
                Err(_) => ColumnData::String(Some(Cow::Owned(n.to_string()))),
            },
            Float32(n) => ColumnData::F32(Some(*n)),
            Float64(n) => ColumnData::F64(Some(*n)),
            String(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            Bytes(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
            Uuid(u) => ColumnData::Guid(Some(*u)),
            // ISO 8601 text; the server converts to the column type
            Date(d) => ColumnData::String(Some(Cow::Owned(d.format("%Y-%m-%d").to_string()))),
            Time(t) => ColumnData::String(Some(Cow::Owned(t.format("%H:%M:%S%.f").to_string()))),
            DateTime(dt) => ColumnData::String(Some(Cow::Owned(
                dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            ))),
            DateTimeTz(dt) => ColumnData::String(Some(Cow::Owned(
                dt.format("%Y-%m-%dT%H:%M:%S%.f%:z").to_string(),
            ))),
            Decimal(d) => ColumnData::String(Some(Cow::Owned(d.to_string()))),
            Json(j) => ColumnData::String(Some(Cow::Owned(j.to_string()))),
        }
    }
}

fn param_refs(tib_params: &[SqlParam]) -> Vec<&dyn tiberius::ToSql> {
    tib_params
        .iter()
        .map(|p| p as &dyn tiberius::ToSql)
        .collect()
}

fn to_params(params: &[Value]) -> Vec<SqlParam> {
    params.iter().cloned().map(SqlParam).collect()
}

fn chrono_value<'a, T: FromSql<'a>>(data: &'a ColumnData<'static>) -> Result<Option<T>> {
    T::from_sql(data).map_err(|e| Error::type_conversion(e.to_string()))
}

/// Convert a TDS value to a bridge value
fn column_data_to_value(data: ColumnData<'static>) -> Result<Value> {
    Ok(match &data {
        ColumnData::U8(v) => v.map_or(Value::Null, |n| Value::Int16(i16::from(n))),
        ColumnData::I16(v) => v.map_or(Value::Null, Value::Int16),
        ColumnData::I32(v) => v.map_or(Value::Null, Value::Int32),
        ColumnData::I64(v) => v.map_or(Value::Null, Value::Int64),
        ColumnData::F32(v) => v.map_or(Value::Null, Value::Float32),
        ColumnData::F64(v) => v.map_or(Value::Null, Value::Float64),
        ColumnData::Bit(v) => v.map_or(Value::Null, Value::Bool),
        ColumnData::Guid(v) => v.map_or(Value::Null, Value::Uuid),
        ColumnData::String(v) => v
            .as_ref()
            .map_or(Value::Null, |s| Value::String(s.to_string())),
        ColumnData::Binary(v) => v
            .as_ref()
            .map_or(Value::Null, |b| Value::Bytes(b.to_vec())),
        ColumnData::Numeric(v) => match v {
            None => Value::Null,
            Some(n) => {
                match Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale())) {
                    Ok(d) => Value::Decimal(d),
                    // Wider than 28 digits: keep the exact text
                    Err(_) => Value::String(n.to_string()),
                }
            }
        },
        ColumnData::Xml(v) => v
            .as_ref()
            .map_or(Value::Null, |x| Value::String(x.clone().into_owned().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono_value::<NaiveDateTime>(&data)?.map_or(Value::Null, Value::DateTime)
        }
        ColumnData::Date(_) => chrono_value::<NaiveDate>(&data)?.map_or(Value::Null, Value::Date),
        ColumnData::Time(_) => chrono_value::<NaiveTime>(&data)?.map_or(Value::Null, Value::Time),
        ColumnData::DateTimeOffset(_) => chrono_value::<DateTime<FixedOffset>>(&data)?
            .map_or(Value::Null, |ts| Value::DateTimeTz(ts.with_timezone(&chrono::Utc))),
    })
}

fn tiberius_row_to_row(tib_row: tiberius::Row) -> Result<Row> {
    let columns: Vec<String> = tib_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values = tib_row
        .into_iter()
        .map(column_data_to_value)
        .collect::<Result<Vec<_>>>()?;

    Ok(Row::new(columns, values))
}

/// Constraint name quoted in messages like
/// `Violation of PRIMARY KEY constraint 'PK_users'.`
fn quoted_constraint(message: &str) -> Option<&str> {
    let start = message.find("constraint '")? + "constraint '".len();
    let rest = &message[start..];
    rest.find('\'').map(|end| &rest[..end])
}

/// Map a driver error onto the bridge taxonomy
fn map_tds_error(e: tiberius::error::Error, sql: &str) -> Error {
    match e {
        tiberius::error::Error::Server(token) => {
            let message = token.message().to_string();
            match token.code() {
                2627 | 2601 => Error::constraint(
                    quoted_constraint(&message).unwrap_or("unique").to_string(),
                    message,
                ),
                547 => Error::constraint(
                    quoted_constraint(&message).unwrap_or("foreign_key").to_string(),
                    message,
                ),
                515 => Error::constraint("not_null", message),
                18456 | 18452 | 4060 => Error::authentication(message),
                _ => Error::query_with_sql(message, sql),
            }
        }
        e @ tiberius::error::Error::Io { .. } => Error::connection_with_source("TDS I/O error", e),
        e @ (tiberius::error::Error::Tls(_) | tiberius::error::Error::Routing { .. }) => {
            Error::connection_with_source("TDS session error", e)
        }
        e @ tiberius::error::Error::Protocol(_) => Error::protocol(e.to_string()),
        other => Error::type_conversion(other.to_string()),
    }
}

/// Statements that must run as a SQL batch instead of through `sp_executesql`
fn is_transaction_control(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or("");
    ["BEGIN", "COMMIT", "ROLLBACK", "SAVE"]
        .iter()
        .any(|kw| first.eq_ignore_ascii_case(kw))
}

/// SQL Server connection
pub struct SqlServerConnection {
    client: Arc<Mutex<TdsClient>>,
    broken: Arc<AtomicBool>,
}

impl SqlServerConnection {
    /// Wrap an authenticated client
    pub fn new(client: TdsClient) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.broken.load(Ordering::Relaxed) {
            return Err(Error::connection(
                "connection abandoned with an unread result set",
            ));
        }
        Ok(())
    }
}

/// Marks the session broken unless every token of the response was read
struct UnreadTokens {
    broken: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for UnreadTokens {
    fn drop(&mut self) {
        if self.armed {
            self.broken.store(true, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl Connection for SqlServerConnection {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_usable()?;
        let mut client = self.client.lock().await;

        if params.is_empty() && is_transaction_control(sql) {
            client
                .simple_query(sql)
                .await
                .map_err(|e| map_tds_error(e, sql))?
                .into_results()
                .await
                .map_err(|e| map_tds_error(e, sql))?;
            return Ok(0);
        }

        let tib_params = to_params(params);
        let result = client
            .execute(sql, &param_refs(&tib_params))
            .await
            .map_err(|e| map_tds_error(e, sql))?;

        Ok(result.total())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_usable()?;
        let tib_params = to_params(params);
        let mut client = self.client.lock().await;

        let stream = client
            .query(sql, &param_refs(&tib_params))
            .await
            .map_err(|e| map_tds_error(e, sql))?;

        let tib_rows = stream
            .into_first_result()
            .await
            .map_err(|e| map_tds_error(e, sql))?;

        tib_rows.into_iter().map(tiberius_row_to_row).collect()
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Box<dyn RowStream>> {
        self.ensure_usable()?;
        let mut client = Arc::clone(&self.client).lock_owned().await;
        let broken = Arc::clone(&self.broken);
        let sql = sql.to_string();
        let tib_params = to_params(params);

        // The reader owns the client until the response is read or the
        // stream is dropped; a dropped stream leaves the session unusable
        let stream = ReaderRowStream::new(STREAM_READ_AHEAD, move |tx| async move {
            let refs = param_refs(&tib_params);
            let mut unread = UnreadTokens {
                broken,
                armed: true,
            };
            let mut rows = match client.query(sql.as_str(), &refs).await {
                Ok(stream) => stream.into_row_stream(),
                Err(e) => {
                    let _ = tx.send(Err(map_tds_error(e, &sql))).await;
                    return;
                }
            };
            while let Some(item) = rows.next().await {
                let row = item
                    .map_err(|e| map_tds_error(e, &sql))
                    .and_then(tiberius_row_to_row);
                let failed = row.is_err();
                if tx.send(row).await.is_err() || failed {
                    return;
                }
            }
            unread.armed = false;
        });

        Ok(Box::new(stream))
    }

    async fn last_insert_id(&self) -> Result<Option<i64>> {
        // SCOPE_IDENTITY() is empty outside the sp_executesql scope
        let row = self
            .query_one("SELECT CAST(@@IDENTITY AS BIGINT) AS id", &[])
            .await?;
        Ok(row.and_then(|r| r.get(0).and_then(Value::as_i64)))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_usable().is_err() {
            return false;
        }
        let mut client = self.client.lock().await;
        match client.simple_query("SELECT 1").await {
            Ok(stream) => stream.into_results().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn close(&self) -> Result<()> {
        // The TCP stream closes when the client is dropped
        self.broken.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// SQL Server connection factory
#[derive(Debug, Clone, Default)]
pub struct SqlServerConnectionFactory;

impl SqlServerConnectionFactory {
    fn tds_config(config: &ProviderConfig) -> Result<Config> {
        let user = config
            .user()
            .ok_or_else(|| Error::config("SQL Server connections require a user"))?;
        let password = config.password().map_or("", |p| p.expose_secret());

        let mut tib_config = Config::new();
        tib_config.host(config.host());
        tib_config.port(config.port());
        tib_config.database(config.database());
        tib_config.application_name("rivven-bridge");
        tib_config.authentication(AuthMethod::sql_server(user, password));
        if config.option("trust_cert") == Some("true") {
            tib_config.trust_cert();
        }
        Ok(tib_config)
    }

    async fn open(config: &ProviderConfig) -> Result<TdsClient> {
        let tib_config = Self::tds_config(config)?;

        let tcp = TcpStream::connect(tib_config.get_addr())
            .await
            .map_err(|e| Error::connection_with_source("failed to reach SQL Server", e))?;
        if let Err(e) = tcp.set_nodelay(true) {
            warn!(error = %e, "could not disable Nagle on SQL Server socket");
        }

        Client::connect(tib_config, tcp.compat_write())
            .await
            .map_err(|e| map_tds_error(e, ""))
    }
}

#[async_trait]
impl ConnectionFactory for SqlServerConnectionFactory {
    async fn connect(&self, config: &ProviderConfig) -> Result<Box<dyn Connection>> {
        let client = tokio::time::timeout(config.connect_timeout(), Self::open(config))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "connecting to {}:{} took longer than {:?}",
                    config.host(),
                    config.port(),
                    config.connect_timeout()
                ))
            })??;

        debug!(host = config.host(), database = config.database(), "SQL Server session ready");
        Ok(Box::new(SqlServerConnection::new(client)))
    }

    fn provider(&self) -> Provider {
        Provider::SqlServer
    }
}
