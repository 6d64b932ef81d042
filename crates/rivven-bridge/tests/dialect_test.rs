//! Tests for rivven-bridge provider adapters

use rivven_bridge::dialect::{
    MariaDbAdapter, MySqlAdapter, Pagination, PostgresAdapter, Provider, ProviderAdapter,
    SqlServerAdapter, UpsertStyle,
};

#[test]
fn test_postgres_quote_identifier() {
    let adapter = PostgresAdapter;

    assert_eq!(adapter.quote_identifier("users"), "\"users\"");
    // Embedded quotes are doubled
    assert_eq!(adapter.quote_identifier("my\"table"), "\"my\"\"table\"");
}

#[test]
fn test_mysql_quote_identifier() {
    let adapter = MySqlAdapter;

    assert_eq!(adapter.quote_identifier("users"), "`users`");
    assert_eq!(adapter.quote_identifier("my`table"), "`my``table`");
    assert_eq!(MariaDbAdapter.quote_identifier("users"), "`users`");
}

#[test]
fn test_sqlserver_quote_identifier() {
    let adapter = SqlServerAdapter;

    assert_eq!(adapter.quote_identifier("users"), "[users]");
    assert_eq!(adapter.quote_identifier("odd]name"), "[odd]]name]");
}

#[test]
fn test_placeholders() {
    assert_eq!(PostgresAdapter.placeholder(1), "$1");
    assert_eq!(PostgresAdapter.placeholder(10), "$10");
    assert_eq!(MySqlAdapter.placeholder(1), "?");
    assert_eq!(MySqlAdapter.placeholder(7), "?");
    assert_eq!(SqlServerAdapter.placeholder(2), "@P2");

    assert!(PostgresAdapter.numbered_placeholders());
    assert!(!MySqlAdapter.numbered_placeholders());
    assert!(SqlServerAdapter.numbered_placeholders());
}

#[test]
fn test_pagination_forms() {
    assert_eq!(PostgresAdapter.pagination(), Pagination::LimitOffset);
    assert_eq!(MySqlAdapter.pagination(), Pagination::LimitOffset);
    assert_eq!(SqlServerAdapter.pagination(), Pagination::OffsetFetch);
    assert_eq!(
        SqlServerAdapter.pagination_sql(Some("10"), Some("20")),
        "OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"
    );
    assert_eq!(PostgresAdapter.pagination_sql(None, Some("5")), "LIMIT ALL OFFSET 5");
}

#[test]
fn test_capability_matrix() {
    let pg = Provider::Postgres.adapter().capabilities();
    assert!(pg.returning && pg.ilike && pg.aggregate_filter && pg.pipe_concat);

    let mysql = Provider::MySql.adapter().capabilities();
    assert!(!mysql.returning);
    assert!(!mysql.pipe_concat);
    assert!(mysql.null_safe_equality);

    // MariaDB differs from MySQL only in RETURNING
    let mariadb = Provider::MariaDb.adapter().capabilities();
    assert!(mariadb.returning);
    assert_eq!(mariadb.pipe_concat, mysql.pipe_concat);
    assert_eq!(mariadb.regexp, mysql.regexp);

    let mssql = Provider::SqlServer.adapter().capabilities();
    assert!(mssql.pagination_requires_order);
    assert!(!mssql.regexp);
    assert!(!mssql.create_if_not_exists);

    assert!(mysql.dml_limit && mariadb.dml_limit);
    assert!(!pg.dml_limit && !mssql.dml_limit);
}

#[test]
fn test_upsert_styles() {
    assert_eq!(PostgresAdapter.upsert_style(), UpsertStyle::OnConflict);
    assert_eq!(MySqlAdapter.upsert_style(), UpsertStyle::OnDuplicateKey);
    assert_eq!(SqlServerAdapter.upsert_style(), UpsertStyle::None);
}

#[test]
fn test_like_operator() {
    assert_eq!(PostgresAdapter.like_operator(), "ILIKE");
    assert_eq!(MySqlAdapter.like_operator(), "LIKE");
    assert_eq!(SqlServerAdapter.like_operator(), "LIKE");
}

#[test]
fn test_default_schemas() {
    assert_eq!(PostgresAdapter.default_schema(), Some("public"));
    assert_eq!(MySqlAdapter.default_schema(), None);
    assert_eq!(SqlServerAdapter.default_schema(), Some("dbo"));
}

#[test]
fn test_provider_identity() {
    for provider in Provider::ALL {
        assert_eq!(provider.to_string().parse::<Provider>().unwrap(), provider);
        assert_eq!(provider.adapter().provider(), provider);
    }
    assert_eq!(Provider::Postgres.default_port(), 5432);
    assert_eq!(Provider::MariaDb.default_port(), 3306);
    assert_eq!(Provider::SqlServer.default_port(), 1433);
}

#[test]
fn test_boolean_literals() {
    assert_eq!(PostgresAdapter.boolean_literal(true), "TRUE");
    assert_eq!(MySqlAdapter.boolean_literal(true), "1");
    assert_eq!(SqlServerAdapter.boolean_literal(false), "0");
}

#[test]
fn test_introspection_sql_names_the_table() {
    for provider in Provider::ALL {
        let sql = provider.adapter().list_columns_sql(Some("sales"), "orders");
        assert!(sql.contains("'orders'"), "{}: {}", provider, sql);
        assert!(sql.contains("'sales'"), "{}: {}", provider, sql);
        assert!(sql.contains("column_name"), "{}: {}", provider, sql);
    }
}
