use dbatlas_core::{
    CacheState, ConnectionManager, DbError, Dialect, ManagerSettings, Value,
    provision_metadata_schema,
};
use dbatlas_test_support::FakeDriver;
use dbatlas_test_support::fixtures::{self, code_table_row, glossary_term_row, sql};
use std::sync::Arc;
use std::time::Duration;

fn metadata_driver() -> FakeDriver {
    FakeDriver::new(Dialect::Postgres)
        .with_rows(
            sql::METADATA_SCHEMA_CHECK,
            vec![fixtures::row(&[("present", Value::Int(1))])],
        )
        .with_rows(
            sql::metadata("glossary_terms"),
            vec![
                glossary_term_row("churn", "Customers who cancelled in the period"),
                glossary_term_row("arpu", "Average revenue per user"),
            ],
        )
        .with_rows(
            sql::metadata("glossary_aliases"),
            vec![fixtures::row(&[
                ("term", Value::text("churn")),
                ("alias", Value::text("attrition")),
            ])],
        )
        .with_rows(
            sql::metadata("code_tables"),
            vec![code_table_row("order_status", "code", "label")],
        )
        .with_rows(
            sql::metadata("column_code_mappings"),
            vec![fixtures::row(&[
                ("table_name", Value::text("orders")),
                ("column_name", Value::text("status")),
                ("code_table", Value::text("order_status")),
            ])],
        )
}

fn manager_with(driver: &FakeDriver) -> Arc<ConnectionManager> {
    let manager = ConnectionManager::new(ManagerSettings::default());
    manager.register_driver(driver.clone().as_driver_arc());
    manager.register_catalog(fixtures::sentinel_catalog(Dialect::Postgres));
    Arc::new(manager)
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_load() {
    let driver = metadata_driver().with_delay(Duration::from_millis(200));
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    let loads = (0..8).map(|_| manager.get_or_init_cache(Some(&id)));
    let caches: Vec<_> = futures::future::join_all(loads)
        .await
        .into_iter()
        .map(|cache| cache.expect("entry exists"))
        .collect();

    assert!(caches.iter().all(|cache| Arc::ptr_eq(cache, &caches[0])));

    let stats = driver.stats();
    assert_eq!(stats.executions_matching(sql::METADATA_SCHEMA_CHECK), 1);
    assert_eq!(stats.executions_matching(&sql::metadata("glossary_terms")), 1);

    let again = manager
        .get_or_init_cache(Some(&id))
        .await
        .expect("entry exists");
    assert!(Arc::ptr_eq(&again, &caches[0]));
    assert_eq!(driver.stats().executions_matching(sql::METADATA_SCHEMA_CHECK), 1);
}

#[tokio::test]
async fn collections_are_loaded_and_queryable() {
    let driver = metadata_driver();
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    let cache = manager
        .get_or_init_cache(Some(&id))
        .await
        .expect("entry exists");

    assert_eq!(cache.dialect, Dialect::Postgres);
    assert_eq!(cache.glossary_terms.len(), 2);
    assert!(!cache.is_empty());

    let churn = cache.glossary_term("Attrition").expect("alias resolves");
    assert_eq!(churn.term, "churn");

    let status = cache.code_table_for("ORDERS", "status").expect("mapped column");
    assert_eq!(status.label_column, "label");

    // every collection query runs against the quoted metadata schema
    let stats = driver.stats();
    for collection in dbatlas_core::DialectCatalog::metadata_query_names() {
        assert_eq!(stats.executions_matching(&sql::metadata(collection)), 1);
    }
    assert_eq!(stats.executions_matching("\"dbatlas_meta\".meta_"), 11);
}

#[tokio::test]
async fn missing_metadata_schema_yields_empty_cache() {
    let driver = FakeDriver::new(Dialect::Postgres);
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    let cache = manager
        .get_or_init_cache(Some(&id))
        .await
        .expect("entry exists");
    assert!(cache.is_empty());
    assert!(cache.collection_sizes().iter().all(|(_, len)| *len == 0));

    let stats = driver.stats();
    assert_eq!(stats.executions_matching(&sql::metadata("glossary_terms")), 0);

    // an empty cache is still a loaded cache
    manager.get_or_init_cache(Some(&id)).await.expect("entry exists");
    assert_eq!(driver.stats().executions_matching(sql::METADATA_SCHEMA_CHECK), 1);
}

#[tokio::test]
async fn schema_check_failure_yields_empty_cache() {
    let driver = FakeDriver::new(Dialect::Postgres)
        .with_error(sql::METADATA_SCHEMA_CHECK, "permission denied");
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    let cache = manager
        .get_or_init_cache(Some(&id))
        .await
        .expect("entry exists");
    assert!(cache.is_empty());
}

#[tokio::test]
async fn one_failing_collection_does_not_affect_the_others() {
    let driver = metadata_driver().with_error(sql::metadata("code_tables"), "permission denied");
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    let cache = manager
        .get_or_init_cache(Some(&id))
        .await
        .expect("entry exists");

    assert!(cache.code_tables.is_empty());
    assert_eq!(cache.glossary_terms.len(), 2);
    assert_eq!(cache.column_code_mappings.len(), 1);
}

#[tokio::test]
async fn timed_out_collection_degrades_to_empty() {
    let driver = metadata_driver().with_timeout(sql::metadata("glossary_aliases"));
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    let cache = manager
        .get_or_init_cache(Some(&id))
        .await
        .expect("entry exists");

    assert!(cache.glossary_aliases.is_empty());
    assert_eq!(cache.glossary_terms.len(), 2);
    assert_eq!(cache.code_tables.len(), 1);
}

#[tokio::test]
async fn every_collection_failing_still_yields_a_cache() {
    let driver = FakeDriver::new(Dialect::Postgres)
        .with_rows(
            sql::METADATA_SCHEMA_CHECK,
            vec![fixtures::row(&[("present", Value::Int(1))])],
        )
        .with_default_error("relation does not exist");
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    let cache = manager
        .get_or_init_cache(Some(&id))
        .await
        .expect("entry exists");

    assert!(cache.is_empty());
    assert_eq!(
        driver.stats().executions_matching("\"dbatlas_meta\".meta_"),
        11
    );
}

#[tokio::test]
async fn refresh_reloads_and_replaces_the_cache() {
    let driver = metadata_driver();
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    let first = manager.get_or_init_cache(Some(&id)).await.expect("entry exists");

    driver.set_outcome(
        sql::metadata("glossary_terms"),
        dbatlas_test_support::FakeQueryOutcome::Rows(vec![glossary_term_row("ltv", "Lifetime value")]),
    );

    let refreshed = manager.refresh_cache(Some(&id)).await.expect("entry exists");
    assert!(!Arc::ptr_eq(&first, &refreshed));
    assert_eq!(refreshed.glossary_terms.len(), 1);
    assert_eq!(driver.stats().executions_matching(sql::METADATA_SCHEMA_CHECK), 2);

    let current = manager.get_or_init_cache(Some(&id)).await.expect("entry exists");
    assert!(Arc::ptr_eq(&current, &refreshed));
}

#[tokio::test]
async fn invalidate_forces_the_next_access_to_reload() {
    let driver = metadata_driver();
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    manager.get_or_init_cache(Some(&id)).await.expect("entry exists");
    assert_eq!(manager.list_connections()[0].cache_state, CacheState::Ready);

    assert!(manager.invalidate_cache(Some(&id)));
    assert_eq!(manager.list_connections()[0].cache_state, CacheState::Unloaded);
    assert!(!manager.invalidate_cache(Some(&dbatlas_core::ConnectionId::from("missing"))));

    manager.get_or_init_cache(Some(&id)).await.expect("entry exists");
    assert_eq!(driver.stats().executions_matching(sql::METADATA_SCHEMA_CHECK), 2);
}

#[tokio::test(start_paused = true)]
async fn superseded_load_does_not_overwrite_a_refresh() {
    let driver = metadata_driver().with_delay(Duration::from_millis(100));
    let manager = manager_with(&driver);
    let (id, _) = manager
        .register(fixtures::params(Dialect::Postgres, "shop"))
        .await
        .expect("register");

    let slow = {
        let manager = Arc::clone(&manager);
        let id = id.clone();
        tokio::spawn(async move { manager.get_or_init_cache(Some(&id)).await })
    };
    tokio::task::yield_now().await;

    let entry = manager.resolve(Some(&id)).expect("entry exists");
    assert_eq!(entry.cache_state(), CacheState::Loading);

    let fresh = manager.refresh_cache(Some(&id)).await.expect("entry exists");
    let stale = slow
        .await
        .expect("load task does not panic")
        .expect("entry exists");
    assert!(!Arc::ptr_eq(&stale, &fresh));

    let current = manager.get_or_init_cache(Some(&id)).await.expect("entry exists");
    assert!(Arc::ptr_eq(&current, &fresh));
}

#[tokio::test]
async fn unknown_connection_has_no_cache() {
    let manager = manager_with(&metadata_driver());
    assert!(manager.get_or_init_cache(None).await.is_none());
    assert!(manager.refresh_cache(None).await.is_none());
}

#[tokio::test]
async fn provisioning_runs_every_ddl_statement() {
    let driver = FakeDriver::new(Dialect::Postgres);
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);

    let ran = provision_metadata_schema(driver.handle().as_ref(), &catalog)
        .await
        .expect("ddl runs");
    assert_eq!(ran, 2);

    let stats = driver.stats();
    assert_eq!(stats.executions_matching("CREATE"), 2);
    assert_eq!(stats.executions_matching("\"dbatlas_meta\""), 2);
}

#[tokio::test]
async fn provisioning_stops_at_first_failure() {
    let driver = FakeDriver::new(Dialect::Postgres).with_error("CREATE SCHEMA", "permission denied");
    let catalog = fixtures::sentinel_catalog(Dialect::Postgres);

    let err = provision_metadata_schema(driver.handle().as_ref(), &catalog)
        .await
        .expect_err("first statement fails");
    assert!(matches!(err, DbError::QueryFailed(_)));
    assert_eq!(driver.stats().executions_matching("CREATE"), 1);
}

#[tokio::test]
async fn provisioning_without_ddl_is_not_supported() {
    let driver = FakeDriver::new(Dialect::Postgres);
    let mut catalog = fixtures::sentinel_catalog(Dialect::Postgres);
    catalog.ddl = None;

    let err = provision_metadata_schema(driver.handle().as_ref(), &catalog)
        .await
        .expect_err("nothing to run");
    assert!(matches!(err, DbError::NotSupported(_)));
}
