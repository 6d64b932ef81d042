//! # rivven-bridge
//!
//! Expose tables of a remote relational database to SQLite as virtual
//! tables. Reads and writes issued against the virtual table are translated
//! into the backend's SQL dialect and executed on a pooled connection.
//!
//! ## Features
//!
//! - **Four backends**: PostgreSQL, MySQL, MariaDB and SQL Server behind one
//!   capability interface
//! - **Dialect translation**: SQLite statements rewritten for the target
//!   (placeholders, quoting, pagination, functions, upserts), cached in an LRU
//! - **Connection pooling**: bounded leases with acquire timeouts, health
//!   checks and retry on connect
//! - **Value mapping**: backend types folded into SQLite storage classes with
//!   time zone, charset and precision handling
//! - **Pushdown**: WHERE, ORDER BY and LIMIT/OFFSET planned into the remote
//!   query when the backend can honor them
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_bridge::prelude::*;
//!
//! let provider = ProviderConfig::from_url("postgres://app@localhost/shop")?
//!     .with_env_credentials();
//! let bridge = Bridge::connect(provider, BridgeConfig::default()).await?;
//!
//! // Columns come from the backend table
//! let users = bridge
//!     .register_virtual_table("users", SchemaSource::introspect())
//!     .await?;
//!
//! let mut cursor = users.open().await?;
//! let plan = users.best_index(&[IndexConstraint::new(0, ConstraintOp::Eq)], &[]);
//! cursor.filter(plan, &[SqlValue::Integer(5)]).await?;
//! while !cursor.eof() {
//!     println!("{:?}", cursor.column(1)?);
//!     cursor.next().await?;
//! }
//! cursor.close().await;
//!
//! // Ad-hoc statements in the SQLite dialect
//! let rows = bridge
//!     .execute_query("SELECT name FROM users WHERE email LIKE ?", &["%@example.com".into()])
//!     .await?
//!     .collect()
//!     .await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL support via tokio-postgres (default)
//! - `mysql` - MySQL/MariaDB support via mysql_async (default)
//! - `sqlserver` - SQL Server support via tiberius
//! - `sqlite` - the `rivven` rusqlite virtual-table module
//! - `full` - All features enabled

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod mapper;
pub mod pool;
pub mod security;
pub mod translator;
pub mod types;
pub mod vtab;

// Backend implementations (conditionally compiled)
#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "sqlserver")]
pub mod sqlserver;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Backend value model
    pub use crate::types::{ColumnMetadata, Row, TableMetadata, Value};

    // Connection traits
    pub use crate::connection::{Connection, ConnectionFactory, RowStream, VecRowStream};

    // Configuration
    pub use crate::config::{BridgeConfig, ProviderConfig, SensitiveString};

    // Pool types
    pub use crate::pool::{ConnectionManager, Lease, PoolConfig, PoolStats, RetryPolicy};

    // Dialects and translation
    pub use crate::dialect::{Capabilities, Provider, ProviderAdapter};
    pub use crate::translator::{QueryTranslator, StatementKind, TranslatedQuery};

    // Value mapping and schemas
    pub use crate::mapper::{
        ColumnDeclaration, ColumnSpec, DataMapper, ProviderType, RemoteTable, SqlValue,
        StorageClass, TableSchema,
    };

    // Virtual tables
    pub use crate::vtab::{
        ConstraintOp, Cursor, CursorState, IndexConstraint, IndexPlan, OrderTerm, SchemaSource,
        TableState, VirtualTable,
    };

    // Bridge
    pub use crate::bridge::{Bridge, BridgeStats, QueryStream, Session};
}

// Re-export commonly used items at crate root
pub use bridge::Bridge;
pub use error::{Error, Result};
pub use mapper::SqlValue;
pub use types::Value;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int32(42);
        let _sql = SqlValue::from("hello");
        let _config = BridgeConfig::default();
        let _source = SchemaSource::introspect();
    }

    #[test]
    fn test_error_types() {
        let err = Error::connection("test error");
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }

    #[test]
    fn test_provider_from_url() {
        let config = ProviderConfig::from_url("mariadb://app@db.internal/shop").unwrap();
        assert_eq!(config.provider(), Provider::MariaDb);
        assert_eq!(config.port(), 3306);
    }

    #[test]
    fn test_storage_class_names() {
        assert_eq!(StorageClass::Integer.declared_type(), "INTEGER");
        assert_eq!(SqlValue::Real(1.5).storage_class(), StorageClass::Real);
    }
}
