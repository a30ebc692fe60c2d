//! Shared fixtures for the SQLite-backed integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use tidemark_migrate::backends::{
    connect, DatabasePool, DatabasePoolConfig, DatabaseRow, DatabaseTransaction, DatabaseValue,
};
use tidemark_migrate::{
    MigrationConfig, MigrationError, MigrationRegistry, MigrationResult, MigrationRunner,
    MigrationStep, MigrationUnit, MigrationVersion, SqlStep,
};

pub const WIDGETS: &str = "20240101000000";
pub const PRICE: &str = "20240201000000";
pub const GADGETS: &str = "20240301000000";

/// A throwaway SQLite database file
pub struct TestDb {
    pub dir: TempDir,
    pub url: String,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        Self { dir, url }
    }

    pub async fn pool(&self) -> Arc<dyn DatabasePool> {
        self.pool_with(DatabasePoolConfig::default()).await
    }

    pub async fn pool_with(&self, config: DatabasePoolConfig) -> Arc<dyn DatabasePool> {
        connect(&self.url, config).await.unwrap()
    }
}

pub fn test_config() -> MigrationConfig {
    let mut config = MigrationConfig::default().with_lock_timeout(Duration::from_secs(10));
    config.lock_poll_interval = Duration::from_millis(10);
    config
}

pub fn runner(pool: Arc<dyn DatabasePool>, registry: MigrationRegistry) -> MigrationRunner {
    MigrationRunner::new(pool, registry, test_config()).unwrap()
}

pub fn widgets_unit() -> MigrationUnit {
    MigrationUnit::sql(
        WIDGETS,
        "create widgets",
        "CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        "DROP TABLE widgets;",
    )
    .unwrap()
}

pub fn price_unit() -> MigrationUnit {
    MigrationUnit::sql(
        PRICE,
        "add price",
        "ALTER TABLE widgets ADD COLUMN price INTEGER NOT NULL DEFAULT 0;",
        "ALTER TABLE widgets DROP COLUMN price;",
    )
    .unwrap()
}

pub fn gadgets_unit() -> MigrationUnit {
    MigrationUnit::sql(
        GADGETS,
        "create gadgets",
        "CREATE TABLE gadgets (id INTEGER PRIMARY KEY);",
        "DROP TABLE gadgets;",
    )
    .unwrap()
}

/// Creates widgets, then keeps its transaction open for `hold`
pub fn slow_widgets_unit(hold: Duration) -> MigrationUnit {
    MigrationUnit::new(
        version(WIDGETS),
        Some("create widgets slowly".to_string()),
        Arc::new(SlowStep {
            sql: "CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            hold,
        }),
        Arc::new(SqlStep::new(vec!["DROP TABLE widgets".to_string()])),
    )
}

pub fn registry_of(units: Vec<MigrationUnit>) -> MigrationRegistry {
    MigrationRegistry::from_units(units).unwrap()
}

pub fn widgets_registry() -> MigrationRegistry {
    MigrationRegistry::from_units(vec![widgets_unit(), price_unit()]).unwrap()
}

pub fn version(raw: &str) -> MigrationVersion {
    MigrationVersion::parse(raw).unwrap()
}

pub fn versions(raw: &[&str]) -> Vec<MigrationVersion> {
    raw.iter().map(|v| version(v)).collect()
}

/// Column names of a table, in declaration order
pub async fn columns(pool: &dyn DatabasePool, table: &str) -> Vec<String> {
    let rows = pool
        .fetch_all(
            "SELECT name FROM pragma_table_info(?) ORDER BY cid",
            &[DatabaseValue::from(table)],
        )
        .await
        .unwrap();
    rows.iter().map(|row| row.get_string("name").unwrap()).collect()
}

pub async fn table_exists(pool: &dyn DatabasePool, table: &str) -> bool {
    let rows = pool
        .fetch_all(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[DatabaseValue::from(table)],
        )
        .await
        .unwrap();
    !rows.is_empty()
}

/// Versions recorded in the default ledger table
pub async fn ledger_versions(pool: &dyn DatabasePool) -> Vec<String> {
    let rows = pool
        .fetch_all(
            "SELECT version FROM tidemark_migrations ORDER BY version",
            &[],
        )
        .await
        .unwrap();
    rows.iter()
        .map(|row| row.get_string("version").unwrap())
        .collect()
}

/// A step that always fails with a fixed message
#[derive(Debug)]
pub struct FailingStep(pub &'static str);

#[async_trait]
impl MigrationStep for FailingStep {
    async fn run(&self, _tx: &mut dyn DatabaseTransaction) -> MigrationResult<()> {
        Err(MigrationError::Database(self.0.to_string()))
    }
}

/// A step that runs one statement, then sits on the open transaction
#[derive(Debug)]
pub struct SlowStep {
    pub sql: &'static str,
    pub hold: Duration,
}

#[async_trait]
impl MigrationStep for SlowStep {
    async fn run(&self, tx: &mut dyn DatabaseTransaction) -> MigrationResult<()> {
        tx.execute(self.sql, &[]).await?;
        tokio::time::sleep(self.hold).await;
        Ok(())
    }
}
