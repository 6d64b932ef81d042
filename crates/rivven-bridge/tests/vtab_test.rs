//! Tests for virtual tables and cursors over the mock backend

mod common;

use common::{MockBackend, MockColumn, MockTable};
use rivven_bridge::prelude::*;

async fn users(bridge: &Bridge) -> std::sync::Arc<VirtualTable> {
    bridge
        .register_virtual_table("users", SchemaSource::introspect())
        .await
        .unwrap()
}

async fn scan(table: &std::sync::Arc<VirtualTable>, plan: IndexPlan, args: &[SqlValue]) -> Vec<Vec<SqlValue>> {
    let width = table.schema().columns().len();
    let mut cursor = table.open().await.unwrap();
    cursor.filter(plan, args).await.unwrap();
    let mut rows = Vec::new();
    while !cursor.eof() {
        rows.push((0..width).map(|i| cursor.column(i).unwrap()).collect());
        cursor.next().await.unwrap();
    }
    cursor.close().await;
    rows
}

// ==================== Declaration ====================

#[tokio::test]
async fn test_introspected_schema() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let schema = table.schema();
    assert_eq!(schema.columns().len(), 3);
    assert_eq!(schema.rowid_column(), Some(0));
    assert!(!schema.columns()[1].nullable);
    assert_eq!(schema.columns()[0].storage_class, StorageClass::Integer);
    assert_eq!(schema.columns()[1].storage_class, StorageClass::Text);
    assert_eq!(table.state(), TableState::SchemaDeclared);
    assert!(table.declaration_sql().starts_with("CREATE TABLE"));
}

#[tokio::test]
async fn test_missing_remote_table() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;

    let err = bridge
        .register_virtual_table("ghosts", SchemaSource::introspect())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TableNotFound { .. }));
    assert_eq!(err.category(), ErrorCategory::Schema);
    assert!(bridge.table("ghosts").is_none());
}

#[tokio::test]
async fn test_explicit_columns_skip_introspection() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;

    let table = bridge
        .register_virtual_table(
            "people",
            SchemaSource::Explicit {
                table: Some(RemoteTable::new("users")),
                columns: vec![
                    ColumnSpec::new("id", "bigint").primary_key(),
                    ColumnSpec::new("name", "varchar(40)").not_null(),
                ],
            },
        )
        .await
        .unwrap();

    assert!(backend.executed().is_empty());
    assert_eq!(table.schema().remote().name, "users");
    let rows = scan(&table, table.best_index(&[], &[]), &[]).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], vec![SqlValue::Integer(1), SqlValue::Text("ada".into())]);
}

#[tokio::test]
async fn test_invalid_table_name_rejected() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;

    let err = bridge
        .register_virtual_table("users; DROP TABLE users", SchemaSource::introspect())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

// ==================== Scans ====================

#[tokio::test]
async fn test_equality_on_key_returns_one_row() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    backend.clear_log();

    let plan = table.best_index(&[IndexConstraint::new(0, ConstraintOp::Eq)], &[]);
    assert_eq!(plan.usage[0].argv_index, Some(1));
    assert!(plan.usage[0].omit);
    assert_eq!(plan.estimated_rows, 1);

    let mut cursor = table.open().await.unwrap();
    cursor.filter(plan, &[SqlValue::Integer(5)]).await.unwrap();
    assert!(!cursor.eof());
    assert_eq!(cursor.column(0).unwrap(), SqlValue::Integer(5));
    assert_eq!(cursor.column(1).unwrap(), SqlValue::Text("grace".into()));
    assert_eq!(cursor.column(2).unwrap(), SqlValue::Null);
    assert_eq!(cursor.rowid().unwrap(), 5);

    cursor.next().await.unwrap();
    assert!(cursor.eof());
    assert_eq!(cursor.state(), CursorState::Exhausted);

    let statements = backend.statements();
    assert_eq!(statements.len(), 1);
    let sql = &statements[0].sql;
    assert!(sql.starts_with(r#"SELECT "id", "name", "email" FROM "public"."users""#), "{}", sql);
    assert!(sql.ends_with(r#"WHERE "id" = $1"#), "{}", sql);
    assert_eq!(statements[0].params.len(), 1);
    assert_eq!(statements[0].params[0].as_i64(), Some(5));
    cursor.close().await;
}

#[tokio::test]
async fn test_next_after_eof_is_protocol_error() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let mut cursor = table.open().await.unwrap();
    let plan = table.best_index(&[IndexConstraint::new(0, ConstraintOp::Eq)], &[]);
    cursor.filter(plan, &[SqlValue::Integer(404)]).await.unwrap();
    assert!(cursor.eof());

    let err = cursor.next().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Protocol);
    assert_eq!(cursor.state(), CursorState::Failed);
    assert!(cursor.column(0).is_err());

    cursor.close().await;
    assert_eq!(cursor.state(), CursorState::Closed);
}

#[tokio::test]
async fn test_full_scan_in_backend_order() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let rows = scan(&table, table.best_index(&[], &[]), &[]).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][1], SqlValue::Text("ada".into()));
    assert_eq!(rows[1][1], SqlValue::Text("grace".into()));
}

#[tokio::test]
async fn test_order_by_and_limit_pushdown() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    backend.clear_log();

    let plan = table.best_index(
        &[IndexConstraint::new(0, ConstraintOp::Limit)],
        &[OrderTerm {
            column: Some(0),
            desc: true,
        }],
    );
    assert!(plan.order_by_consumed);
    assert_eq!(plan.usage[0].argv_index, Some(1));

    let rows = scan(&table, plan, &[SqlValue::Integer(1)]).await;
    assert_eq!(rows, vec![vec![
        SqlValue::Integer(5),
        SqlValue::Text("grace".into()),
        SqlValue::Null
    ]]);
    let sql = &backend.statements()[0].sql;
    assert!(sql.ends_with(r#"ORDER BY "id" DESC LIMIT $1"#), "{}", sql);
}

#[tokio::test]
async fn test_text_comparison_is_rechecked_locally() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let plan = table.best_index(
        &[
            IndexConstraint::new(1, ConstraintOp::Eq),
            IndexConstraint::new(0, ConstraintOp::Limit),
        ],
        &[],
    );
    assert!(!plan.usage[0].omit);
    assert_eq!(plan.usage[1].argv_index, None);

    let rows = scan(&table, plan, &[SqlValue::Text("ada".into())]).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], SqlValue::Integer(1));
}

#[tokio::test]
async fn test_text_ranges_stay_local() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    for op in [
        ConstraintOp::Ne,
        ConstraintOp::Gt,
        ConstraintOp::Ge,
        ConstraintOp::Lt,
        ConstraintOp::Le,
        ConstraintOp::IsNot,
    ] {
        let plan = table.best_index(&[IndexConstraint::new(1, op)], &[]);
        assert_eq!(plan.usage[0].argv_index, None, "{:?}", op);
        assert!(plan.terms.is_empty(), "{:?}", op);

        if op != ConstraintOp::IsNot {
            let plan = table.best_index(&[IndexConstraint::new(0, op)], &[]);
            assert!(plan.usage[0].omit, "{:?}", op);
        }
    }
}

#[tokio::test]
async fn test_fractional_bounds_on_integer_key() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    let ids = |rows: Vec<Vec<SqlValue>>| rows.into_iter().map(|r| r[0].clone()).collect::<Vec<_>>();

    let cases = [
        (ConstraintOp::Gt, vec![SqlValue::Integer(5)]),
        (ConstraintOp::Ge, vec![SqlValue::Integer(5)]),
        (ConstraintOp::Lt, vec![SqlValue::Integer(1)]),
        (ConstraintOp::Le, vec![SqlValue::Integer(1)]),
        (ConstraintOp::Eq, vec![]),
        (ConstraintOp::Ne, vec![SqlValue::Integer(1), SqlValue::Integer(5)]),
    ];
    for (op, expected) in cases {
        let plan = table.best_index(&[IndexConstraint::new(0, op)], &[]);
        let rows = scan(&table, plan, &[SqlValue::Real(1.5)]).await;
        assert_eq!(ids(rows), expected, "{:?}", op);
    }

    backend.clear_log();
    let plan = table.best_index(&[IndexConstraint::new(0, ConstraintOp::Gt)], &[]);
    scan(&table, plan, &[SqlValue::Real(1.5)]).await;
    let statements = backend.statements();
    assert!(statements[0].sql.ends_with(r#""id" > $1"#), "{}", statements[0].sql);
    assert_eq!(statements[0].params[0].as_i64(), Some(1));
}

#[tokio::test]
async fn test_text_argument_on_integer_key() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    // Numeric text converts like column affinity would
    let plan = table.best_index(&[IndexConstraint::new(0, ConstraintOp::Eq)], &[]);
    let rows = scan(&table, plan, &[SqlValue::Text("5".into())]).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], SqlValue::Integer(5));

    // Other text sorts after every number
    backend.clear_log();
    let plan = table.best_index(&[IndexConstraint::new(0, ConstraintOp::Eq)], &[]);
    let rows = scan(&table, plan, &[SqlValue::Text("abc".into())]).await;
    assert!(rows.is_empty());
    assert!(backend.statements().is_empty());

    let plan = table.best_index(&[IndexConstraint::new(0, ConstraintOp::Gt)], &[]);
    assert!(scan(&table, plan, &[SqlValue::Text("abc".into())]).await.is_empty());

    let plan = table.best_index(&[IndexConstraint::new(0, ConstraintOp::Lt)], &[]);
    let rows = scan(&table, plan, &[SqlValue::Text("abc".into())]).await;
    assert_eq!(rows.len(), 2);
    let statements = backend.statements();
    let sql = &statements.last().unwrap().sql;
    assert!(sql.ends_with(r#""id" IS NOT NULL"#), "{}", sql);
}

#[tokio::test]
async fn test_scans_agree_across_providers() {
    let pg = common::backend();
    let mysql = MockBackend::new(Provider::MySql);
    mysql.add_table("users", common::users());

    let pg_bridge = common::bridge(&pg).await;
    let mysql_bridge = common::bridge(&mysql).await;
    let pg_users = users(&pg_bridge).await;
    let mysql_users = users(&mysql_bridge).await;

    let by_id = [OrderTerm {
        column: Some(0),
        desc: true,
    }];
    let cases: Vec<(Vec<IndexConstraint>, Vec<SqlValue>)> = vec![
        (vec![], vec![]),
        (vec![IndexConstraint::new(0, ConstraintOp::Eq)], vec![SqlValue::Integer(5)]),
        (vec![IndexConstraint::new(0, ConstraintOp::Ge)], vec![SqlValue::Real(0.5)]),
        (vec![IndexConstraint::new(0, ConstraintOp::Lt)], vec![SqlValue::Text("abc".into())]),
        (vec![IndexConstraint::new(1, ConstraintOp::Eq)], vec![SqlValue::Text("ada".into())]),
        (vec![IndexConstraint::new(1, ConstraintOp::Gt)], vec![SqlValue::Text("b".into())]),
        (vec![IndexConstraint::new(2, ConstraintOp::IsNull)], vec![]),
    ];

    for (constraints, args) in cases {
        let expected = scan(&pg_users, pg_users.best_index(&constraints, &by_id), &args).await;
        let actual = scan(&mysql_users, mysql_users.best_index(&constraints, &by_id), &args).await;
        assert_eq!(actual, expected, "{:?}", constraints);
    }

    let sql = mysql
        .statements()
        .into_iter()
        .map(|s| s.sql)
        .find(|sql| sql.contains("WHERE"))
        .unwrap();
    assert!(sql.contains("`users`") && sql.contains('?'), "{}", sql);
}

#[tokio::test]
async fn test_is_null_pushdown() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let plan = table.best_index(&[IndexConstraint::new(2, ConstraintOp::IsNull)], &[]);
    assert_eq!(plan.usage[0].argv_index, None);
    assert!(plan.usage[0].omit);

    let rows = scan(&table, plan, &[]).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][1], SqlValue::Text("grace".into()));
}

#[tokio::test]
async fn test_filter_twice_restarts_scan() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    let plan = table.best_index(&[IndexConstraint::new(0, ConstraintOp::Eq)], &[]);

    let mut cursor = table.open().await.unwrap();
    cursor.filter(plan.clone(), &[SqlValue::Integer(1)]).await.unwrap();
    assert_eq!(cursor.column(1).unwrap(), SqlValue::Text("ada".into()));
    cursor.filter(plan, &[SqlValue::Integer(5)]).await.unwrap();
    assert_eq!(cursor.column(1).unwrap(), SqlValue::Text("grace".into()));
    cursor.close().await;
}

#[tokio::test]
async fn test_wrong_argument_count_fails_cursor() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    let plan = table.best_index(&[IndexConstraint::new(0, ConstraintOp::Eq)], &[]);

    let mut cursor = table.open().await.unwrap();
    let err = cursor.filter(plan, &[]).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Protocol);
    assert_eq!(cursor.state(), CursorState::Failed);
    cursor.close().await;
}

#[tokio::test]
async fn test_drained_cursor_returns_lease() {
    let backend = common::backend();
    let bridge = common::bridge_with(&backend, 1).await;
    let table = users(&bridge).await;

    let mut cursor = table.open().await.unwrap();
    cursor.filter(table.best_index(&[], &[]), &[]).await.unwrap();
    while !cursor.eof() {
        cursor.next().await.unwrap();
    }
    assert_eq!(bridge.stats().pool.in_use, 0);

    // The only connection is free for writes while the cursor is still open
    let affected = bridge
        .execute_dml("UPDATE users SET email = ? WHERE id = ?", &["a@b.c".into(), SqlValue::Integer(1)])
        .await
        .unwrap();
    assert_eq!(affected, 1);
    cursor.close().await;
}

#[tokio::test]
async fn test_backend_error_fails_cursor_and_keeps_connection() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    let connects = backend.connects();

    backend.fail_next(|| Error::query("relation is locked"));
    let mut cursor = table.open().await.unwrap();
    let err = cursor
        .filter(table.best_index(&[], &[]), &[])
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Query);
    assert_eq!(cursor.state(), CursorState::Failed);
    cursor.close().await;

    assert_eq!(backend.connects(), connects);
}

#[tokio::test]
async fn test_connection_error_invalidates_lease() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    let connects = backend.connects();

    backend.fail_next(|| Error::connection("server closed the connection unexpectedly"));
    let mut cursor = table.open().await.unwrap();
    assert!(cursor.filter(table.best_index(&[], &[]), &[]).await.is_err());
    cursor.close().await;

    assert_eq!(backend.connects(), connects + 1);
}

// ==================== Writes ====================

#[tokio::test]
async fn test_insert_returns_generated_rowid() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    backend.clear_log();

    let rowid = table
        .insert(&[SqlValue::Null, SqlValue::Text("linus".into()), SqlValue::Null])
        .await
        .unwrap();
    assert_eq!(rowid, 6);

    let statements = backend.statements();
    assert_eq!(statements.len(), 1);
    let sql = &statements[0].sql;
    assert!(sql.starts_with(r#"INSERT INTO "public"."users""#), "{}", sql);
    assert!(sql.ends_with(r#"RETURNING "id""#), "{}", sql);
    assert_eq!(statements[0].params.len(), 2);
    assert_eq!(backend.rows("users").len(), 3);
}

#[tokio::test]
async fn test_write_during_scan_uses_its_own_lease() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let mut cursor = table.open().await.unwrap();
    cursor.filter(table.best_index(&[], &[]), &[]).await.unwrap();
    assert_eq!(cursor.column(0).unwrap(), SqlValue::Integer(1));
    assert_eq!(bridge.stats().pool.in_use, 1);

    table
        .insert(&[SqlValue::Null, SqlValue::Text("linus".into()), SqlValue::Null])
        .await
        .unwrap();
    assert_eq!(bridge.stats().pool.in_use, 1);

    let mut seen = 1;
    cursor.next().await.unwrap();
    while !cursor.eof() {
        seen += 1;
        cursor.next().await.unwrap();
    }
    assert_eq!(seen, 2);
    cursor.close().await;
    assert_eq!(bridge.stats().pool.in_use, 0);
    assert_eq!(backend.rows("users").len(), 3);
}

#[tokio::test]
async fn test_insert_with_explicit_key() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let rowid = table
        .insert(&[SqlValue::Integer(42), SqlValue::Text("ken".into()), SqlValue::Null])
        .await
        .unwrap();
    assert_eq!(rowid, 42);
    assert!(!backend.statements()[0].sql.contains("RETURNING"));
}

#[tokio::test]
async fn test_null_into_not_null_column_sends_nothing() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    backend.clear_log();

    let err = table
        .insert(&[SqlValue::Null, SqlValue::Null, SqlValue::Text("x@y.z".into())])
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Constraint);
    assert!(backend.executed().is_empty());
    assert_eq!(backend.rows("users").len(), 2);
}

#[tokio::test]
async fn test_duplicate_key_is_constraint_error() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let err = table
        .insert(&[SqlValue::Integer(1), SqlValue::Text("again".into()), SqlValue::Null])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Constraint { ref constraint_name, .. } if constraint_name == "users_pkey"));
}

#[tokio::test]
async fn test_wrong_value_count_is_rejected() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let err = table.insert(&[SqlValue::Null]).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Protocol);
}

#[tokio::test]
async fn test_update_and_delete_by_rowid() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    let affected = table
        .update(
            5,
            &[
                SqlValue::Integer(5),
                SqlValue::Text("grace hopper".into()),
                SqlValue::Text("grace@navy.mil".into()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);
    let rows = backend.rows("users");
    assert_eq!(rows[1][1], Value::String("grace hopper".into()));

    assert_eq!(table.delete(1).await.unwrap(), 1);
    assert_eq!(backend.rows("users").len(), 1);
    assert_eq!(table.delete(1).await.unwrap(), 0);
}

#[tokio::test]
async fn test_update_cannot_null_required_column() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;
    backend.clear_log();

    let err = table
        .update(5, &[SqlValue::Integer(5), SqlValue::Null, SqlValue::Null])
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Constraint);
    assert!(backend.executed().is_empty());
}

#[tokio::test]
async fn test_synthetic_rowids_survive_cursor_close() {
    let backend = common::backend();
    backend.add_table(
        "notes",
        MockTable::new(vec![MockColumn::new("body", "text")])
            .with_row(vec![Value::String("first".into())])
            .with_row(vec![Value::String("second".into())]),
    );
    let bridge = common::bridge(&backend).await;
    let table = bridge
        .register_virtual_table("notes", SchemaSource::introspect())
        .await
        .unwrap();
    assert_eq!(table.schema().rowid_column(), None);

    let mut cursor = table.open().await.unwrap();
    cursor.filter(table.best_index(&[], &[]), &[]).await.unwrap();
    let first = cursor.rowid().unwrap();
    assert_eq!(cursor.rowid().unwrap(), first);
    cursor.next().await.unwrap();
    let second = cursor.rowid().unwrap();
    assert_ne!(first, second);
    cursor.close().await;

    // Keys stay until the next cursor opens
    assert_eq!(table.synthetic_rowids(), 2);
    assert_eq!(table.delete(second).await.unwrap(), 1);
    assert_eq!(backend.rows("notes"), vec![vec![Value::String("first".into())]]);

    let cursor = table.open().await.unwrap();
    assert_eq!(table.synthetic_rowids(), 0);
    drop(cursor);

    let err = table.delete(first).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Protocol);
}

#[tokio::test]
async fn test_dropped_table_refuses_work() {
    let backend = common::backend();
    let bridge = common::bridge(&backend).await;
    let table = users(&bridge).await;

    bridge.drop_table("users").unwrap();
    assert_eq!(table.state(), TableState::Destroyed);
    assert!(table.open().await.is_err());
    assert!(table.delete(1).await.is_err());
    assert!(matches!(
        bridge.drop_table("users"),
        Err(Error::TableNotFound { .. })
    ));
}
