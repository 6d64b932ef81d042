//! Error types for rivven-bridge
//!
//! Every failure the bridge can surface is classified so callers can decide
//! what to do with it:
//! - Connection-level errors are retried, but only while opening a connection
//! - Translation and conversion errors abort the current statement
//! - Constraint violations are never retried
//! - Protocol errors are fatal to the cursor that raised them

use std::fmt;
use thiserror::Error;

/// Result type for rivven-bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Credentials rejected by the backend
    Authentication,
    /// No lease became available within the acquire timeout
    PoolExhausted,
    /// Statement has no equivalent in the target dialect
    Translation,
    /// Value could not be converted between storage classes and backend types
    TypeConversion,
    /// Constraint violation (not retriable)
    Constraint,
    /// Cursor/lease protocol misuse
    Protocol,
    /// Schema-related errors
    Schema,
    /// Query execution errors reported by the backend
    Query,
    /// Timeout errors
    Timeout,
    /// Configuration error
    Configuration,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::PoolExhausted
        )
    }
}

/// Main error type for rivven-bridge
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed or was lost
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication failed
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Statement could not be translated for the target provider
    #[error("translation error: {message}")]
    Translation { message: String, sql: Option<String> },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Constraint violation (PK, FK, unique, check, not null)
    #[error("constraint violation: {constraint_name} - {message}")]
    Constraint {
        constraint_name: String,
        message: String,
    },

    /// Cursor or lease used out of order
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Schema error (table not found, column mismatch)
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Table not found
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Translation { .. } => ErrorCategory::Translation,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Schema { .. } | Self::TableNotFound { .. } => ErrorCategory::Schema,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether the session that produced this error must be discarded.
    ///
    /// Only connection failures and timeouts leave the backend session in an
    /// unknown state; everything else is reported by a healthy connection.
    #[inline]
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connection | ErrorCategory::Timeout
        )
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a translation error
    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation {
            message: message.into(),
            sql: None,
        }
    }

    /// Create a translation error carrying the offending statement
    pub fn translation_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Translation {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a constraint violation
    pub fn constraint(constraint_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            constraint_name: constraint_name.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Authentication => write!(f, "authentication"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Translation => write!(f, "translation"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Constraint => write!(f, "constraint"),
            Self::Protocol => write!(f, "protocol"),
            Self::Schema => write!(f, "schema"),
            Self::Query => write!(f, "query"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::Other => write!(f, "other"),
        }
    }
}
