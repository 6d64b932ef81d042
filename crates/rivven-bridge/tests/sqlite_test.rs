//! Tests for the rusqlite module over the mock backend
#![cfg(feature = "sqlite")]

mod common;

use common::MockBackend;
use rivven_bridge::prelude::*;
use rivven_bridge::sqlite::register_module;
use rusqlite::Connection as SqliteConnection;
use std::sync::Arc;
use tokio::runtime::Runtime;

struct Harness {
    // Dropped before the runtime
    conn: SqliteConnection,
    bridge: Arc<Bridge>,
    backend: Arc<MockBackend>,
    _runtime: Runtime,
}

fn harness() -> Harness {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let backend = common::backend();
    let bridge = Arc::new(runtime.block_on(common::bridge(&backend)));

    let conn = SqliteConnection::open_in_memory().unwrap();
    register_module(&conn, bridge.clone(), runtime.handle().clone()).unwrap();

    Harness {
        conn,
        bridge,
        backend,
        _runtime: runtime,
    }
}

fn email_of(backend: &MockBackend, id: i64) -> Option<Value> {
    backend
        .rows("users")
        .into_iter()
        .find(|row| row[0].as_i64() == Some(id))
        .map(|row| row[2].clone())
}

#[test]
fn test_select_through_virtual_table() {
    let h = harness();
    h.conn
        .execute_batch("CREATE VIRTUAL TABLE users USING rivven")
        .unwrap();
    assert_eq!(h.bridge.tables(), vec!["users".to_string()]);

    let (name, email): (String, Option<String>) = h
        .conn
        .query_row("SELECT name, email FROM users WHERE id = 1", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(name, "ada");
    assert_eq!(email.as_deref(), Some("ada@example.com"));

    let count: i64 = h
        .conn
        .query_row("SELECT count(*) FROM users", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);

    let missing: i64 = h
        .conn
        .query_row("SELECT count(*) FROM users WHERE email IS NULL", [], |row| row.get(0))
        .unwrap();
    assert_eq!(missing, 1);
}

#[test]
fn test_writes_through_virtual_table() {
    let h = harness();
    h.conn
        .execute_batch("CREATE VIRTUAL TABLE users USING rivven")
        .unwrap();

    h.conn
        .execute("INSERT INTO users (name, email) VALUES ('barbara', NULL)", [])
        .unwrap();
    assert_eq!(h.conn.last_insert_rowid(), 6);
    assert_eq!(h.backend.rows("users").len(), 3);

    let updated = h
        .conn
        .execute("UPDATE users SET email = 'grace@example.com' WHERE id = 5", [])
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(
        email_of(&h.backend, 5),
        Some(Value::String("grace@example.com".into()))
    );

    let deleted = h.conn.execute("DELETE FROM users WHERE id = 1", []).unwrap();
    assert_eq!(deleted, 1);
    assert!(email_of(&h.backend, 1).is_none());
}

#[test]
fn test_backend_constraint_fails_statement() {
    let h = harness();
    h.conn
        .execute_batch("CREATE VIRTUAL TABLE users USING rivven")
        .unwrap();

    let result = h
        .conn
        .execute("INSERT INTO users (id, name) VALUES (1, 'impostor')", []);
    assert!(result.is_err());
    assert_eq!(h.backend.rows("users").len(), 2);
}

#[test]
fn test_explicit_columns() {
    let h = harness();
    h.conn
        .execute_batch(
            "CREATE VIRTUAL TABLE people USING rivven(table=users, id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        )
        .unwrap();

    let names: Vec<String> = h
        .conn
        .prepare("SELECT name FROM people ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(names, vec!["ada".to_string(), "grace".to_string()]);
}

#[test]
fn test_missing_remote_table_fails_create() {
    let h = harness();
    let result = h
        .conn
        .execute_batch("CREATE VIRTUAL TABLE ghosts USING rivven");
    assert!(result.is_err());
    assert!(h.bridge.tables().is_empty());
}

#[test]
fn test_drop_table_unregisters() {
    let h = harness();
    h.conn
        .execute_batch("CREATE VIRTUAL TABLE users USING rivven; DROP TABLE users;")
        .unwrap();
    assert!(h.bridge.tables().is_empty());
    // The backend table is untouched
    assert_eq!(h.backend.rows("users").len(), 2);
}
