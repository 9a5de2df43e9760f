use dbatlas_core::{
    BoundParams, ConstraintKind, DbError, Dialect, DialectCatalog, Value, extract_schema,
};
use dbatlas_test_support::fixtures::{
    self, column_row, constraint_row, foreign_key_row, index_row, recent_query_row, sql,
    table_row, upper_case,
};
use dbatlas_test_support::{FakeDriver, FakeShape};

fn shop_driver(dialect: Dialect) -> FakeDriver {
    FakeDriver::new(dialect)
        .with_rows(
            sql::TABLES,
            vec![
                table_row("public", "orders"),
                table_row("information_schema", "tables"),
                table_row("public", "customers"),
                table_row("pg_catalog", "pg_class"),
            ],
        )
        .with_rows_when(
            sql::COLUMNS,
            "orders",
            vec![
                column_row("id", "integer", false, false),
                column_row("customer_id", "integer", false, false),
                column_row("note", "text", true, false),
            ],
        )
        .with_rows_when(
            sql::COLUMNS,
            "customers",
            vec![column_row("id", "integer", false, true)],
        )
        .with_rows_when(
            sql::FOREIGN_KEYS,
            "orders",
            vec![foreign_key_row(
                "orders_customer_fk",
                "customer_id",
                "public",
                "customers",
                "id",
            )],
        )
        .with_rows_when(
            sql::CONSTRAINTS,
            "orders",
            vec![
                constraint_row("orders_pkey", "PRIMARY KEY", Some("id")),
                constraint_row("orders_customer_fk", "FOREIGN KEY", Some("customer_id")),
            ],
        )
        .with_rows_when(
            sql::INDEXES,
            "orders",
            vec![
                index_row("orders_pkey", "id", true, "btree"),
                index_row("orders_note_idx", "note", false, "btree"),
            ],
        )
        .with_rows(
            sql::RECENT_QUERIES,
            vec![recent_query_row("SELECT * FROM orders", 42, 1.25)],
        )
}

#[tokio::test]
async fn system_schemas_are_excluded_and_order_is_kept() {
    let driver = shop_driver(Dialect::Postgres);
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);

    let schema = extract_schema(driver.handle().as_ref(), &catalog, None)
        .await
        .expect("schema");

    let names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["orders", "customers"]);
    assert!(schema.skipped_tables.is_empty());

    // excluded tables are never queried
    let stats = driver.stats();
    assert_eq!(stats.executions_matching(sql::COLUMNS), 2);
}

#[tokio::test]
async fn keys_constraints_and_indexes_are_folded_into_tables() {
    let driver = shop_driver(Dialect::Postgres);
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);

    let schema = extract_schema(driver.handle().as_ref(), &catalog, None)
        .await
        .expect("schema");
    let orders = schema.table(Some("public"), "orders").expect("orders");

    let id = orders.column("id").expect("id column");
    assert!(id.is_primary_key);
    assert!(!id.nullable);

    let customer_id = orders.column("customer_id").expect("customer_id column");
    assert!(customer_id.is_foreign_key);
    let reference = customer_id.reference.as_ref().expect("reference");
    assert_eq!(reference.table, "customers");
    assert_eq!(reference.column, "id");

    assert!(orders.column("note").expect("note").nullable);

    let kinds: Vec<ConstraintKind> = orders.constraints.iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![ConstraintKind::PrimaryKey, ConstraintKind::ForeignKey]);

    assert_eq!(orders.indexes.len(), 2);
    assert!(orders.indexes[0].is_unique);
    assert_eq!(orders.indexes[1].columns, vec!["note".to_string()]);

    let customers = schema.table(None, "customers").expect("customers");
    assert!(customers.column("id").expect("id").is_primary_key);

    let recent = schema.recent_queries.expect("recent queries source");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].calls, 42);
}

#[tokio::test]
async fn optional_recent_queries_failure_keeps_the_rest() {
    let driver = shop_driver(Dialect::Postgres)
        .with_error(sql::RECENT_QUERIES, "relation \"pg_stat_statements\" does not exist");
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);

    let schema = extract_schema(driver.handle().as_ref(), &catalog, None)
        .await
        .expect("optional failure is not fatal");

    assert_eq!(schema.tables.len(), 2);
    assert_eq!(schema.recent_queries, Some(Vec::new()));
}

#[tokio::test]
async fn optional_recent_queries_timeout_keeps_the_rest() {
    let driver = shop_driver(Dialect::Postgres).with_timeout(sql::RECENT_QUERIES);
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);

    let schema = extract_schema(driver.handle().as_ref(), &catalog, None)
        .await
        .expect("optional timeout is not fatal");

    assert_eq!(schema.tables.len(), 2);
    assert!(schema.skipped_tables.is_empty());
    assert_eq!(schema.recent_queries, Some(Vec::new()));
}

#[tokio::test]
async fn temporary_schemas_are_excluded() {
    let driver = FakeDriver::new(Dialect::Postgres)
        .with_rows(
            sql::TABLES,
            vec![
                table_row("pg_temp_3", "scratch"),
                table_row("public", "orders"),
            ],
        )
        .with_rows_when(
            sql::COLUMNS,
            "orders",
            vec![column_row("id", "integer", false, true)],
        );
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);

    let schema = extract_schema(driver.handle().as_ref(), &catalog, None)
        .await
        .expect("schema");

    let names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["orders"]);
    assert_eq!(driver.stats().executions_matching(sql::COLUMNS), 1);
}

#[tokio::test]
async fn catalog_without_recent_source_reports_none() {
    let driver = shop_driver(Dialect::Postgres);
    let mut catalog = fixtures::sentinel_catalog(Dialect::Postgres);
    catalog.queries.recent_queries = None;

    let schema = extract_schema(driver.handle().as_ref(), &catalog, None)
        .await
        .expect("schema");

    assert!(schema.recent_queries.is_none());
    assert_eq!(driver.stats().executions_matching(sql::RECENT_QUERIES), 0);
}

#[tokio::test]
async fn table_listing_failure_aborts() {
    let driver = shop_driver(Dialect::Postgres).with_error(sql::TABLES, "permission denied");
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);

    let err = extract_schema(driver.handle().as_ref(), &catalog, None)
        .await
        .expect_err("tables query is required");
    assert!(matches!(err, DbError::QueryFailed(_)));
}

#[tokio::test]
async fn failing_table_is_skipped_with_reason() {
    let driver = shop_driver(Dialect::Postgres).with_error_when(
        sql::COLUMNS,
        "customers",
        "canceling statement due to lock timeout",
    );
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);

    let schema = extract_schema(driver.handle().as_ref(), &catalog, None)
        .await
        .expect("partial schema");

    assert_eq!(schema.tables.len(), 1);
    assert_eq!(schema.tables[0].name, "orders");
    assert_eq!(schema.skipped_tables.len(), 1);
    assert_eq!(schema.skipped_tables[0].name, "customers");
    assert!(schema.skipped_tables[0].reason.contains("lock timeout"));
}

#[tokio::test]
async fn target_database_is_bound_as_scope() {
    let driver = shop_driver(Dialect::Postgres);
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);
    let handle = driver.handle();

    extract_schema(handle.as_ref(), &catalog, Some("sales"))
        .await
        .expect("scoped schema");
    extract_schema(handle.as_ref(), &catalog, None)
        .await
        .expect("unscoped schema");

    let tables: Vec<BoundParams> = driver
        .stats()
        .executed_statements
        .into_iter()
        .filter(|s| s.sql.contains(sql::TABLES))
        .map(|s| s.params)
        .collect();

    assert_eq!(
        tables,
        vec![
            BoundParams::Positional(vec![Value::text("sales")]),
            BoundParams::Positional(vec![Value::Null]),
        ]
    );
}

#[tokio::test]
async fn mysql_tuple_rows_map_like_any_other_shape() {
    let driver = FakeDriver::new(Dialect::Mysql)
        .with_shape(FakeShape::TupleRows)
        .with_rows(
            sql::TABLES,
            vec![table_row("shop", "orders"), table_row("mysql", "user")],
        )
        .with_rows_when(
            sql::COLUMNS,
            "orders",
            vec![column_row("id", "int", false, true)],
        );
    let catalog = fixtures::sentinel_catalog(Dialect::Mysql);

    let schema = extract_schema(driver.handle().as_ref(), &catalog, Some("shop"))
        .await
        .expect("schema");

    assert_eq!(schema.tables.len(), 1);
    assert!(schema.tables[0].column("id").expect("id").is_primary_key);

    let scoped = driver
        .stats()
        .executed_statements
        .into_iter()
        .find(|s| s.sql.contains(sql::TABLES))
        .expect("tables executed");
    assert!(scoped.sql.contains("scope = ?"));
}

#[tokio::test]
async fn oracle_identifiers_are_upper_cased_and_cursors_closed() {
    let driver = FakeDriver::new(Dialect::Oracle)
        .with_shape(FakeShape::Cursor)
        .with_rows(
            sql::TABLES,
            vec![
                upper_case(table_row("HR", "EMPLOYEES")),
                upper_case(table_row("SYS", "DUAL")),
            ],
        )
        .with_rows_when(
            sql::COLUMNS,
            "EMPLOYEES",
            vec![upper_case(column_row("EMPLOYEE_ID", "NUMBER", false, true))],
        )
        .with_rows_when(
            sql::CONSTRAINTS,
            "EMPLOYEES",
            vec![upper_case(constraint_row("EMP_PK", "P", Some("EMPLOYEE_ID")))],
        );
    let catalog = fixtures::sentinel_catalog(Dialect::Oracle);

    let schema = extract_schema(driver.handle().as_ref(), &catalog, Some("hr"))
        .await
        .expect("schema");

    assert_eq!(schema.tables.len(), 1);
    let employees = &schema.tables[0];
    assert_eq!(employees.name, "EMPLOYEES");
    assert!(employees.column("EMPLOYEE_ID").expect("column").is_primary_key);
    assert_eq!(employees.constraints[0].kind, ConstraintKind::PrimaryKey);

    let stats = driver.stats();
    let scope = stats
        .executed_statements
        .iter()
        .find(|s| s.sql.contains(sql::TABLES))
        .map(|s| s.params.clone())
        .expect("tables executed");
    assert_eq!(
        scope,
        BoundParams::Named(vec![("database".to_string(), Value::text("HR"))])
    );

    assert_eq!(stats.cursor_closes, stats.executed_statements.len());
}

#[tokio::test]
async fn cursor_is_closed_when_a_fetch_fails() {
    let driver = FakeDriver::new(Dialect::Oracle)
        .with_shape(FakeShape::Cursor)
        .with_cursor_error_after(1)
        .with_rows(
            sql::TABLES,
            vec![
                upper_case(table_row("HR", "EMPLOYEES")),
                upper_case(table_row("HR", "DEPARTMENTS")),
            ],
        );
    let catalog = fixtures::sentinel_catalog(Dialect::Oracle);

    let err = extract_schema(driver.handle().as_ref(), &catalog, None)
        .await
        .expect_err("fetch failure surfaces");
    assert!(matches!(err, DbError::QueryFailed(_)));
    assert_eq!(driver.stats().cursor_closes, 1);
}

#[tokio::test]
async fn builtin_catalog_can_be_overridden_per_dialect() {
    let builtin = DialectCatalog::builtin(Dialect::Postgres).expect("embedded catalog");
    assert!(builtin.queries.tables.sql.contains("pg_catalog"));

    let sentinel = fixtures::sentinel_catalog(Dialect::Postgres);
    assert!(sentinel.queries.tables.sql.contains(sql::TABLES));

    let manager = dbatlas_core::ConnectionManager::default();
    manager.register_catalog(sentinel);
    let resolved = manager.catalog_for(Dialect::Postgres).expect("override");
    assert!(resolved.queries.tables.sql.contains(sql::TABLES));

    let mysql = manager.catalog_for(Dialect::Mysql).expect("builtin fallback");
    assert!(mysql.is_excluded("performance_schema"));
}
