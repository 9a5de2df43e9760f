use dbatlas_core::{
    ConnectionManager, DbDriver, DbError, Dialect, ManagerSettings, NamedParams, PoolSettings,
    Value,
};
use dbatlas_driver_mysql::MysqlDriver;
use dbatlas_test_support::containers;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[ignore = "requires Docker daemon"]
async fn mysql_live_connect_query_and_close() -> Result<(), DbError> {
    containers::with_mysql_params(|params| async move {
        let driver = MysqlDriver::new();
        let settings = PoolSettings::default();
        let handle = containers::retry_db_operation(Duration::from_secs(60), || {
            driver.connect(&params, &settings)
        })
        .await?;

        let rows = handle
            .query_named(
                "SELECT :name AS greeting, CAST(1 AS SIGNED) AS one, NULL AS nothing",
                &NamedParams::new().with("name", "hello"),
            )
            .await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("greeting").and_then(|v| v.as_text()).as_deref(), Some("hello"));
        assert_eq!(rows[0].get("one").and_then(|v| v.as_i64()), Some(1));
        assert_eq!(rows[0].get("nothing"), Some(&Value::Null));

        handle.close().await?;
        assert!(handle.ping().await.is_err());
        Ok(())
    })
    .await
}

#[tokio::test]
#[ignore = "requires Docker daemon"]
async fn mysql_live_schema_extraction() -> Result<(), DbError> {
    containers::with_mysql_params(|params| async move {
        let manager = ConnectionManager::new(ManagerSettings::default());
        manager.register_driver(Arc::new(MysqlDriver::new()));

        let (id, _) = containers::retry_db_operation(Duration::from_secs(60), || {
            manager.register(params.clone())
        })
        .await?;

        let entry = manager
            .resolve(Some(&id))
            .ok_or_else(|| DbError::UnknownConnection(id.to_string()))?;
        entry
            .handle()
            .query_named(
                "CREATE TABLE customers (id INT PRIMARY KEY, name VARCHAR(64) NOT NULL)",
                &NamedParams::new(),
            )
            .await?;
        entry
            .handle()
            .query_named(
                "CREATE TABLE orders (id INT PRIMARY KEY, customer_id INT, \
                 FOREIGN KEY (customer_id) REFERENCES customers(id))",
                &NamedParams::new(),
            )
            .await?;

        let schema = manager.extract_schema(Some(&id), Some("testdb")).await?;
        let orders = schema.table(None, "orders").expect("orders table extracted");
        assert!(orders.column("id").expect("id").is_primary_key);
        assert!(orders.column("customer_id").expect("fk").is_foreign_key);

        let cache = manager.get_or_init_cache(Some(&id)).await.expect("entry");
        assert!(cache.is_empty());
        assert_eq!(manager.list_connections()[0].dialect, Dialect::Mysql);

        manager.destroy_all().await;
        Ok(())
    })
    .await
}
