//! Unit tests for rivven-bridge error module

use rivven_bridge::error::{Error, ErrorCategory};
use std::error::Error as _;

#[test]
fn test_error_connection() {
    let err = Error::connection("Failed to connect");

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.to_string().contains("Failed to connect"));
    assert!(err.is_retriable());
    assert!(err.poisons_connection());
}

#[test]
fn test_error_connection_with_source() {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
    let err = Error::connection_with_source("Failed to connect", io);

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.source().is_some_and(|s| s.to_string() == "refused"));
}

#[test]
fn test_error_authentication() {
    let err = Error::authentication("password rejected for app");

    assert_eq!(err.category(), ErrorCategory::Authentication);
    assert!(!err.is_retriable());
    assert!(!err.poisons_connection());
}

#[test]
fn test_error_config() {
    let err = Error::config("Invalid URL format");

    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("Invalid URL format"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_query() {
    let err = Error::query("Syntax error in SQL");

    assert_eq!(err.category(), ErrorCategory::Query);
    assert!(err.to_string().contains("Syntax error"));
    assert!(!err.is_retriable());
    assert!(!err.poisons_connection());
}

#[test]
fn test_query_with_sql() {
    let err = Error::query_with_sql("Syntax error", "SELECT * FORM users");

    assert_eq!(err.category(), ErrorCategory::Query);
    assert!(err.to_string().contains("Syntax error"));
    assert!(matches!(err, Error::Query { sql: Some(ref s), .. } if s == "SELECT * FORM users"));
}

#[test]
fn test_error_translation() {
    let err = Error::translation_with_sql("GLOB has no equivalent on PostgreSQL", "SELECT 1");

    assert_eq!(err.category(), ErrorCategory::Translation);
    assert!(err.to_string().contains("GLOB"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_unsupported() {
    let err = Error::unsupported("Feature X not available");

    assert_eq!(err.category(), ErrorCategory::Other);
    assert!(err.to_string().contains("Feature X"));
}

#[test]
fn test_error_timeout() {
    let err = Error::timeout("statement timeout after 30s");

    assert_eq!(err.category(), ErrorCategory::Timeout);
    assert!(err.to_string().contains("timeout"));
    assert!(err.is_retriable());
    assert!(err.poisons_connection());
}

#[test]
fn test_error_schema() {
    let err = Error::schema("column count mismatch");
    assert_eq!(err.category(), ErrorCategory::Schema);

    let err = Error::TableNotFound {
        table: "public.orders".to_string(),
    };
    assert_eq!(err.category(), ErrorCategory::Schema);
    assert!(err.to_string().contains("public.orders"));
}

#[test]
fn test_error_type_conversion() {
    let err = Error::type_conversion("70000 is out of range for smallint");

    assert_eq!(err.category(), ErrorCategory::TypeConversion);
    assert!(err.to_string().contains("out of range"));
}

#[test]
fn test_error_constraint() {
    let err = Error::constraint("users_email_key", "duplicate key value");

    assert_eq!(err.category(), ErrorCategory::Constraint);
    assert!(!err.is_retriable());
    assert!(err.to_string().contains("users_email_key"));
}

#[test]
fn test_error_protocol() {
    let err = Error::protocol("cursor advanced past end");

    assert_eq!(err.category(), ErrorCategory::Protocol);
    assert!(!err.is_retriable());
}

#[test]
fn test_pool_exhausted() {
    let err = Error::pool_exhausted("No connections available");

    assert_eq!(err.category(), ErrorCategory::PoolExhausted);
    assert!(err.is_retriable());
    // Nothing ran, so there is no session to discard
    assert!(!err.poisons_connection());
}

#[test]
fn test_error_internal() {
    let err = Error::internal("unterminated parameter marker");
    assert_eq!(err.category(), ErrorCategory::Other);
}

#[test]
fn test_category_display() {
    assert_eq!(ErrorCategory::PoolExhausted.to_string(), "pool_exhausted");
    assert_eq!(ErrorCategory::TypeConversion.to_string(), "type_conversion");
    assert_eq!(ErrorCategory::Connection.to_string(), "connection");
}

#[test]
fn test_error_debug() {
    let err = Error::query("SELECT * FROM invalid_table");
    let debug = format!("{:?}", err);

    assert!(debug.contains("Query"));
}

#[test]
fn test_result_type() {
    fn parse(input: &str) -> rivven_bridge::Result<i32> {
        input
            .parse()
            .map_err(|_| Error::type_conversion(format!("'{}' is not a number", input)))
    }

    assert_eq!(parse("42").unwrap(), 42);
    assert_eq!(
        parse("forty-two").unwrap_err().category(),
        ErrorCategory::TypeConversion
    );
}

#[test]
fn test_errors_are_send_sync() {
    fn assert_send_sync<T: Send + Sync + 'static>() {}
    assert_send_sync::<Error>();
}
