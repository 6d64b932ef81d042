//! MySQL and MariaDB backend
//!
//! Both servers speak the same wire protocol through mysql_async. They
//! differ in how the session statement timeout is set.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Params};
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::connection::{Connection, ConnectionFactory, ReaderRowStream, RowStream};
use crate::dialect::Provider;
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Rows decoded ahead of the consumer
const STREAM_READ_AHEAD: usize = 512;

/// Character set id MySQL reports for binary columns
const BINARY_CHARSET: u16 = 63;

/// Convert a bridge value to a MySQL parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int8(n) => mysql_async::Value::from(*n),
        Value::Int16(n) => mysql_async::Value::from(*n),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::UInt64(n) => mysql_async::Value::from(*n),
        Value::Float32(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        // DECIMAL travels as text to keep every digit
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => datetime_to_sql(dt),
        Value::DateTimeTz(dt) => datetime_to_sql(&dt.naive_utc()),
        Value::Uuid(u) => mysql_async::Value::from(u.to_string()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
    }
}

fn datetime_to_sql(dt: &NaiveDateTime) -> mysql_async::Value {
    let (date, time) = (dt.date(), dt.time());
    mysql_async::Value::Date(
        date.year() as u16,
        date.month() as u8,
        date.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond() / 1000,
    )
}

fn to_params(params: &[Value]) -> Params {
    if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(params.iter().map(value_to_sql).collect())
    }
}

/// Render a MySQL TIME that does not fit a time of day
fn duration_text(neg: bool, days: u32, hour: u8, min: u8, sec: u8, micro: u32) -> String {
    let hours = days * 24 + u32::from(hour);
    let mut text = format!(
        "{}{:02}:{:02}:{:02}",
        if neg { "-" } else { "" },
        hours,
        min,
        sec
    );
    if micro > 0 {
        text.push_str(&format!(".{:06}", micro));
    }
    text
}

/// BINARY, VARBINARY, BLOB and BIT columns
fn is_binary(column: &mysql_async::Column) -> bool {
    column.character_set() == BINARY_CHARSET
        && matches!(
            column.column_type(),
            ColumnType::MYSQL_TYPE_STRING
                | ColumnType::MYSQL_TYPE_VAR_STRING
                | ColumnType::MYSQL_TYPE_VARCHAR
                | ColumnType::MYSQL_TYPE_TINY_BLOB
                | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
                | ColumnType::MYSQL_TYPE_LONG_BLOB
                | ColumnType::MYSQL_TYPE_BLOB
                | ColumnType::MYSQL_TYPE_BIT
                | ColumnType::MYSQL_TYPE_GEOMETRY
        )
}

/// Convert a MySQL value to a bridge value
fn mysql_value_to_value(val: mysql_async::Value, column: &mysql_async::Column) -> Result<Value> {
    let invalid = |what: &str| {
        Error::type_conversion(format!(
            "column {} holds an invalid {}",
            column.name_str(),
            what
        ))
    };

    Ok(match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => {
            if is_binary(column) {
                Value::Bytes(b)
            } else {
                match String::from_utf8(b) {
                    Ok(s) => Value::String(s),
                    Err(e) => Value::Bytes(e.into_bytes()),
                }
            }
        }
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => match i64::try_from(n) {
            Ok(n) => Value::Int64(n),
            Err(_) => Value::UInt64(n),
        },
        mysql_async::Value::Float(f) => Value::Float32(f),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let date = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
                .ok_or_else(|| invalid("date"))?;
            if column.column_type() == ColumnType::MYSQL_TYPE_DATE {
                Value::Date(date)
            } else {
                let time = NaiveTime::from_hms_micro_opt(
                    u32::from(hour),
                    u32::from(min),
                    u32::from(sec),
                    micro,
                )
                .ok_or_else(|| invalid("time"))?;
                Value::DateTime(NaiveDateTime::new(date, time))
            }
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            if neg || days > 0 {
                Value::String(duration_text(neg, days, hour, min, sec, micro))
            } else {
                Value::Time(
                    NaiveTime::from_hms_micro_opt(
                        u32::from(hour),
                        u32::from(min),
                        u32::from(sec),
                        micro,
                    )
                    .ok_or_else(|| invalid("time"))?,
                )
            }
        }
    })
}

fn mysql_row_to_row(row: mysql_async::Row) -> Result<Row> {
    let columns = row.columns();
    let names: Vec<String> = columns.iter().map(|c| c.name_str().to_string()).collect();
    let values = columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let val: mysql_async::Value = row.get(i).unwrap_or(mysql_async::Value::NULL);
            mysql_value_to_value(val, column)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(names, values))
}

/// Constraint name quoted in a server message such as
/// `Duplicate entry 'x' for key 'users.email'`
fn quoted_key(message: &str) -> Option<&str> {
    let start = message.find("for key '")? + "for key '".len();
    let rest = &message[start..];
    rest.find('\'').map(|end| &rest[..end])
}

/// Map a driver error onto the bridge taxonomy
fn map_mysql_error(e: mysql_async::Error, sql: &str) -> Error {
    match e {
        mysql_async::Error::Server(server) => match server.code {
            1062 | 1586 => Error::constraint(
                quoted_key(&server.message).unwrap_or("unique").to_string(),
                server.message,
            ),
            1451 | 1452 | 1216 | 1217 => Error::constraint("foreign_key", server.message),
            1048 | 1364 => Error::constraint("not_null", server.message),
            3819 | 4025 => Error::constraint("check", server.message),
            1044 | 1045 | 1698 => Error::authentication(server.message),
            3024 | 1969 => Error::timeout(server.message),
            1053 | 1927 | 2006 | 2013 => Error::connection(server.message),
            _ => Error::query_with_sql(server.message, sql),
        },
        mysql_async::Error::Io(io) => Error::connection_with_source("MySQL I/O error", io),
        mysql_async::Error::Driver(driver) => {
            Error::connection_with_source("MySQL driver error", driver)
        }
        mysql_async::Error::Url(url) => Error::config(url.to_string()),
        other => Error::query_with_sql(other.to_string(), sql),
    }
}

/// MySQL or MariaDB connection
pub struct MySqlConnection {
    conn: Arc<Mutex<Option<Conn>>>,
    last_insert_id: SyncMutex<Option<i64>>,
    /// A stream was dropped before its result set was read to the end
    broken: Arc<AtomicBool>,
}

impl MySqlConnection {
    /// Wrap an established connection
    pub fn new(conn: Conn) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            last_insert_id: SyncMutex::new(None),
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    fn closed() -> Error {
        Error::connection("connection is closed")
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

/// Marks the session broken unless the result set was read to the end
struct UnreadResult {
    broken: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for UnreadResult {
    fn drop(&mut self) {
        if self.armed {
            self.broken.store(true, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_usable()?;
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::closed)?;

        // Text protocol for parameterless statements; some commands are
        // rejected by the prepared-statement protocol
        if params.is_empty() {
            conn.query_drop(sql).await
        } else {
            conn.exec_drop(sql, to_params(params)).await
        }
        .map_err(|e| map_mysql_error(e, sql))?;

        if let Some(id) = conn.last_insert_id().filter(|id| *id > 0) {
            *self.last_insert_id.lock() = i64::try_from(id).ok();
        }
        Ok(conn.affected_rows())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_usable()?;
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::closed)?;

        // Binary protocol so column values keep their wire types
        let rows: Vec<mysql_async::Row> = conn
            .exec(sql, to_params(params))
            .await
            .map_err(|e| map_mysql_error(e, sql))?;

        rows.into_iter().map(mysql_row_to_row).collect()
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Box<dyn RowStream>> {
        self.ensure_usable()?;
        let mut guard = Arc::clone(&self.conn).lock_owned().await;
        if guard.is_none() {
            return Err(Self::closed());
        }

        let sql = sql.to_string();
        let params = to_params(params);
        let broken = Arc::clone(&self.broken);

        // The reader owns the session lock and the open result set
        let stream = ReaderRowStream::new(STREAM_READ_AHEAD, move |tx| async move {
            let Some(conn) = guard.as_mut() else {
                let _ = tx.send(Err(Self::closed())).await;
                return;
            };
            let mut unread = UnreadResult {
                broken,
                armed: true,
            };
            let mut result = match conn.exec_iter(sql.as_str(), params).await {
                Ok(result) => result,
                Err(e) => {
                    unread.armed = false;
                    let _ = tx.send(Err(map_mysql_error(e, &sql))).await;
                    return;
                }
            };
            loop {
                let row = match result.next().await {
                    Ok(Some(row)) => mysql_row_to_row(row),
                    Ok(None) => {
                        unread.armed = false;
                        return;
                    }
                    Err(e) => Err(map_mysql_error(e, &sql)),
                };
                let failed = row.is_err();
                if tx.send(row).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(Box::new(stream))
    }

    async fn last_insert_id(&self) -> Result<Option<i64>> {
        Ok(*self.last_insert_id.lock())
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_usable().is_err() {
            return false;
        }
        let mut guard = self.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        let Some(conn) = self.conn.lock().await.take() else {
            return Ok(());
        };
        if self.broken.load(Ordering::Relaxed) {
            // Unread rows are never drained
            warn!("Dropping MySQL session with an unread result set");
            drop(conn);
            return Ok(());
        }
        conn.disconnect()
            .await
            .map_err(|e| Error::connection_with_source("failed to disconnect", e))
    }
}

/// Connection factory for MySQL and MariaDB
#[derive(Debug, Clone)]
pub struct MySqlConnectionFactory {
    provider: Provider,
}

impl MySqlConnectionFactory {
    /// Create a factory for `provider`; anything but MariaDB speaks MySQL
    pub fn new(provider: Provider) -> Self {
        let provider = match provider {
            Provider::MariaDb => Provider::MariaDb,
            _ => Provider::MySql,
        };
        Self { provider }
    }

    /// Session statements run on every new connection
    fn init_statements(&self, timeout: Option<Duration>) -> Vec<String> {
        let mut init = vec!["SET NAMES utf8mb4".to_string()];
        if let Some(timeout) = timeout {
            init.push(match self.provider {
                Provider::MariaDb => format!(
                    "SET SESSION max_statement_time = {:.3}",
                    timeout.as_secs_f64()
                ),
                _ => format!("SET SESSION max_execution_time = {}", timeout.as_millis()),
            });
        }
        init
    }

    fn opts(&self, config: &ProviderConfig) -> OptsBuilder {
        OptsBuilder::default()
            .ip_or_hostname(config.host())
            .tcp_port(config.port())
            .db_name(Some(config.database()))
            .user(config.user())
            .pass(config.password().map(|p| p.expose_secret()))
            .prefer_socket(false)
            .init(self.init_statements(config.statement_timeout()))
    }
}

impl Default for MySqlConnectionFactory {
    fn default() -> Self {
        Self::new(Provider::MySql)
    }
}

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self, config: &ProviderConfig) -> Result<Box<dyn Connection>> {
        let conn = tokio::time::timeout(config.connect_timeout(), Conn::new(self.opts(config)))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "connecting to {}:{} took longer than {:?}",
                    config.host(),
                    config.port(),
                    config.connect_timeout()
                ))
            })?
            .map_err(|e| map_mysql_error(e, ""))?;

        debug!(
            provider = %self.provider,
            host = config.host(),
            database = config.database(),
            "MySQL session ready"
        );
        Ok(Box::new(MySqlConnection::new(conn)))
    }

    fn provider(&self) -> Provider {
        self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_keeps_mariadb() {
        assert_eq!(
            MySqlConnectionFactory::new(Provider::MariaDb).provider(),
            Provider::MariaDb
        );
        assert_eq!(MySqlConnectionFactory::default().provider(), Provider::MySql);
    }

    #[test]
    fn test_timeout_statement_per_server() {
        let timeout = Some(Duration::from_millis(1500));
        let mysql = MySqlConnectionFactory::new(Provider::MySql).init_statements(timeout);
        assert_eq!(mysql[1], "SET SESSION max_execution_time = 1500");

        let maria = MySqlConnectionFactory::new(Provider::MariaDb).init_statements(timeout);
        assert_eq!(maria[1], "SET SESSION max_statement_time = 1.500");

        assert_eq!(
            MySqlConnectionFactory::default().init_statements(None).len(),
            1
        );
    }

    #[test]
    fn test_quoted_key() {
        assert_eq!(
            quoted_key("Duplicate entry 'a@x' for key 'users.email'"),
            Some("users.email")
        );
        assert_eq!(quoted_key("Column 'name' cannot be null"), None);
    }

    #[test]
    fn test_value_to_sql_keeps_decimal_digits() {
        let d: rust_decimal::Decimal = "12345678901234567890.12".parse().unwrap();
        assert_eq!(
            value_to_sql(&Value::Decimal(d)),
            mysql_async::Value::from("12345678901234567890.12".to_string())
        );
        assert_eq!(value_to_sql(&Value::Null), mysql_async::Value::NULL);
    }

    #[test]
    fn test_long_time_renders_as_text() {
        assert_eq!(duration_text(false, 1, 6, 0, 0, 0), "30:00:00");
        assert_eq!(duration_text(true, 0, 12, 30, 5, 250), "-12:30:05.000250");
    }
}
