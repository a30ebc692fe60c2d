mod common;

use std::sync::Arc;

use common::*;
use tidemark_migrate::{
    ErrorKind, MigrationConfig, MigrationError, MigrationRegistry, MigrationRollback,
    MigrationRunner, MigrationState, MigrationUnit, RunOutcome, SqlStep,
};

#[tokio::test]
async fn test_applies_pending_units_in_version_order() {
    let db = TestDb::new();
    let pool = db.pool().await;
    // Registered out of order on purpose
    let registry = MigrationRegistry::from_units(vec![price_unit(), widgets_unit()]).unwrap();
    let runner = runner(pool.clone(), registry);

    let report = runner.migrate_up(None).await.unwrap();

    assert_eq!(report.outcome(), RunOutcome::Complete);
    assert_eq!(report.applied, versions(&[WIDGETS, PRICE]));
    assert_eq!(report.batch, Some(1));
    assert_eq!(columns(pool.as_ref(), "widgets").await, vec!["id", "name", "price"]);
    assert_eq!(ledger_versions(pool.as_ref()).await, vec![WIDGETS, PRICE]);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let db = TestDb::new();
    let pool = db.pool().await;
    let runner = runner(pool.clone(), widgets_registry());

    runner.migrate_up(None).await.unwrap();
    let report = runner.migrate_up(None).await.unwrap();

    assert!(report.is_success());
    assert!(report.applied.is_empty());
    assert_eq!(report.skipped, versions(&[WIDGETS, PRICE]));
    assert_eq!(report.batch, None);
    assert_eq!(ledger_versions(pool.as_ref()).await.len(), 2);
}

#[tokio::test]
async fn test_empty_registry_creates_ledger_only() {
    let db = TestDb::new();
    let pool = db.pool().await;
    let runner = runner(pool.clone(), MigrationRegistry::default());

    let report = runner.migrate_up(None).await.unwrap();

    assert!(report.is_success());
    assert!(report.applied.is_empty());
    assert!(table_exists(pool.as_ref(), "tidemark_migrations").await);
    assert!(ledger_versions(pool.as_ref()).await.is_empty());
}

#[tokio::test]
async fn test_target_version_stops_early() {
    let db = TestDb::new();
    let pool = db.pool().await;
    let runner = runner(pool.clone(), widgets_registry());

    let report = runner.migrate_up(Some(&version(WIDGETS))).await.unwrap();
    assert_eq!(report.applied, versions(&[WIDGETS]));
    assert_eq!(columns(pool.as_ref(), "widgets").await, vec!["id", "name"]);

    let unknown = runner.migrate_up(Some(&version("20991231000000"))).await;
    assert!(matches!(unknown, Err(MigrationError::UnknownVersion(_))));

    let report = runner.migrate_up(None).await.unwrap();
    assert_eq!(report.applied, versions(&[PRICE]));
    assert_eq!(report.batch, Some(2));
}

#[tokio::test]
async fn test_failing_unit_halts_and_leaves_no_trace() {
    let db = TestDb::new();
    let pool = db.pool().await;
    let broken = MigrationUnit::sql(
        PRICE,
        "broken",
        "CREATE TABLE half_done (id INTEGER); CREATE TABL oops (id INTEGER);",
        "DROP TABLE half_done;",
    )
    .unwrap();
    let registry =
        MigrationRegistry::from_units(vec![widgets_unit(), broken, gadgets_unit()]).unwrap();
    let runner = runner(pool.clone(), registry);

    let report = runner.migrate_up(None).await.unwrap();

    assert_eq!(report.outcome(), RunOutcome::Halted);
    assert_eq!(report.applied, versions(&[WIDGETS]));
    assert_eq!(report.remaining, versions(&[GADGETS]));

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.version, version(PRICE));
    assert_eq!(failure.kind, ErrorKind::ApplyFailure);
    assert!(failure.message.contains("TABL"), "message: {}", failure.message);

    // The earlier unit stays committed, the failing one left nothing behind
    assert!(table_exists(pool.as_ref(), "widgets").await);
    assert!(!table_exists(pool.as_ref(), "half_done").await);
    assert!(!table_exists(pool.as_ref(), "gadgets").await);
    assert_eq!(ledger_versions(pool.as_ref()).await, vec![WIDGETS]);

    let status = runner.status().await.unwrap();
    assert_eq!(status.state_of(PRICE), Some(&MigrationState::Pending));
    assert_eq!(status.state_of(GADGETS), Some(&MigrationState::Pending));
}

#[tokio::test]
async fn test_failure_message_is_passed_through() {
    let db = TestDb::new();
    let pool = db.pool().await;
    let unit = MigrationUnit::new(
        version(WIDGETS),
        Some("always fails".to_string()),
        Arc::new(FailingStep("disk quota exceeded")),
        Arc::new(SqlStep::new(vec!["SELECT 1".to_string()])),
    );
    let runner = runner(pool.clone(), MigrationRegistry::from_units(vec![unit]).unwrap());

    let report = runner.migrate_up(None).await.unwrap();
    let failure = report.failure.clone().unwrap();
    assert_eq!(failure.message, "Migration 20240101000000 failed to apply: disk quota exceeded");

    match report.into_result() {
        Err(MigrationError::ApplyFailure { version, message }) => {
            assert_eq!(version, WIDGETS);
            assert_eq!(message, "disk quota exceeded");
        }
        other => panic!("expected apply failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_separate_ledger_transaction_when_ddl_is_not_transactional() {
    let db = TestDb::new();
    let pool = db.pool().await;
    let mut config = test_config();
    config.ddl_transactions = Some(false);
    let runner = MigrationRunner::new(pool.clone(), widgets_registry(), config).unwrap();

    let report = runner.migrate_up(None).await.unwrap();
    assert!(report.is_success());
    assert_eq!(ledger_versions(pool.as_ref()).await, vec![WIDGETS, PRICE]);

    let report = runner.migrate_down(1).await.unwrap();
    assert_eq!(report.reverted, versions(&[PRICE]));
    assert_eq!(ledger_versions(pool.as_ref()).await, vec![WIDGETS]);
}

#[tokio::test]
async fn test_plan_up_executes_nothing() {
    let db = TestDb::new();
    let pool = db.pool().await;
    let runner = runner(pool.clone(), widgets_registry());

    let plan = runner.plan_up(None).await.unwrap();
    let planned: Vec<&str> = plan.actionable().map(|s| s.version.as_str()).collect();
    assert_eq!(planned, vec![WIDGETS, PRICE]);
    assert!(!table_exists(pool.as_ref(), "widgets").await);
}

#[tokio::test]
async fn test_custom_ledger_table() {
    let db = TestDb::new();
    let pool = db.pool().await;
    let config = MigrationConfig::default().with_migrations_table("schema_history");
    let runner = MigrationRunner::new(pool.clone(), widgets_registry(), config).unwrap();

    runner.migrate_up(None).await.unwrap();
    assert!(table_exists(pool.as_ref(), "schema_history").await);
    assert!(!table_exists(pool.as_ref(), "tidemark_migrations").await);

    let bad = MigrationConfig::default().with_migrations_table("drop table;--");
    assert!(matches!(
        MigrationRunner::new(pool, widgets_registry(), bad),
        Err(MigrationError::Configuration(_))
    ));
}
