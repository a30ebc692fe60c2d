//! Applied-State Ledger - Which versions are applied, stored in the target database
//!
//! Rows are inserted when a unit is applied and deleted when it is reverted;
//! they are never updated in place.

use chrono::Utc;
use std::collections::BTreeSet;

use super::definitions::LedgerEntry;
use crate::backends::{DatabasePool, DatabaseRow, DatabaseTransaction, DatabaseValue, SqlDialect};
use crate::error::{MigrationError, MigrationResult};

/// Access to the ledger table
#[derive(Debug, Clone)]
pub struct MigrationLedger {
    table: String,
    dialect: SqlDialect,
}

impl MigrationLedger {
    /// `table` must already be validated as a plain identifier
    pub fn new(table: impl Into<String>, dialect: SqlDialect) -> Self {
        Self {
            table: table.into(),
            dialect,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger table if it does not exist.
    ///
    /// Two processes may race to create it; the loser's error is ignored once
    /// the table is visible.
    pub async fn ensure_table(&self, pool: &dyn DatabasePool) -> MigrationResult<()> {
        match pool.execute(&self.create_table_sql(), &[]).await {
            Ok(_) => Ok(()),
            Err(err) => {
                if self.table_exists(pool).await {
                    tracing::warn!(
                        table = %self.table,
                        "ledger table creation raced with another process: {}",
                        err
                    );
                    Ok(())
                } else {
                    Err(MigrationError::Database(format!(
                        "Failed to create migrations table: {}",
                        err.detail()
                    )))
                }
            }
        }
    }

    async fn table_exists(&self, pool: &dyn DatabasePool) -> bool {
        let exists_check = format!("SELECT version FROM {} WHERE 1 = 0", self.table);
        pool.fetch_all(&exists_check, &[]).await.is_ok()
    }

    /// Every ledger row, freshly read, in ascending version order
    pub async fn list_applied(&self, pool: &dyn DatabasePool) -> MigrationResult<Vec<LedgerEntry>> {
        let rows = pool
            .fetch_all(&self.select_applied_sql(), &[])
            .await
            .map_err(|e| {
                MigrationError::Database(format!(
                    "Failed to query applied migrations: {}",
                    e.detail()
                ))
            })?;

        rows.iter().map(|row| row_to_entry(row.as_ref())).collect()
    }

    /// The set of applied versions
    pub async fn applied_versions(&self, pool: &dyn DatabasePool) -> MigrationResult<BTreeSet<String>> {
        Ok(self
            .list_applied(pool)
            .await?
            .into_iter()
            .map(|entry| entry.version)
            .collect())
    }

    /// Batch number for the next forward run
    pub async fn next_batch(&self, pool: &dyn DatabasePool) -> MigrationResult<i32> {
        let latest = self
            .list_applied(pool)
            .await?
            .iter()
            .map(|entry| entry.batch)
            .max()
            .unwrap_or(0);
        Ok(latest + 1)
    }

    /// Insert the ledger row for a freshly applied unit.
    ///
    /// Fails with `LedgerWrite` if the version is already recorded.
    pub async fn record_applied(
        &self,
        tx: &mut dyn DatabaseTransaction,
        version: &str,
        description: Option<&str>,
        batch: i32,
    ) -> MigrationResult<()> {
        let existing = tx
            .fetch_all(&self.check_sql(), &[DatabaseValue::from(version)])
            .await?;
        if !existing.is_empty() {
            return Err(MigrationError::ledger_write(
                version,
                "version is already recorded as applied",
            ));
        }

        let params = [
            DatabaseValue::from(version),
            DatabaseValue::from(description),
            DatabaseValue::Int32(batch),
            DatabaseValue::DateTime(Utc::now()),
        ];
        let inserted = tx.execute(&self.insert_sql(), &params).await?;
        if inserted != 1 {
            return Err(MigrationError::ledger_write(
                version,
                format!("expected to insert 1 row, inserted {}", inserted),
            ));
        }
        Ok(())
    }

    /// Delete the ledger row of a reverted unit.
    ///
    /// Fails with `LedgerWrite` if there is no such row.
    pub async fn record_reverted(
        &self,
        tx: &mut dyn DatabaseTransaction,
        version: &str,
    ) -> MigrationResult<()> {
        let deleted = tx
            .execute(&self.delete_sql(), &[DatabaseValue::from(version)])
            .await?;
        if deleted == 0 {
            return Err(MigrationError::ledger_write(
                version,
                "no ledger row exists for this version",
            ));
        }
        Ok(())
    }

    /// SQL to create the migrations tracking table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version VARCHAR(255) PRIMARY KEY,\n    \
                description TEXT,\n    \
                batch INTEGER NOT NULL,\n    \
                applied_at {} NOT NULL DEFAULT CURRENT_TIMESTAMP\n\
            )",
            self.table,
            self.dialect.timestamp_type()
        )
    }

    fn select_applied_sql(&self) -> String {
        format!(
            "SELECT version, description, batch, applied_at FROM {} ORDER BY version",
            self.table
        )
    }

    fn check_sql(&self) -> String {
        format!(
            "SELECT version FROM {} WHERE version = {}",
            self.table,
            self.dialect.parameter_placeholder(0)
        )
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, description, batch, applied_at) VALUES ({}, {}, {}, {})",
            self.table,
            self.dialect.parameter_placeholder(0),
            self.dialect.parameter_placeholder(1),
            self.dialect.parameter_placeholder(2),
            self.dialect.parameter_placeholder(3)
        )
    }

    fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE version = {}",
            self.table,
            self.dialect.parameter_placeholder(0)
        )
    }
}

fn row_to_entry(row: &dyn DatabaseRow) -> MigrationResult<LedgerEntry> {
    Ok(LedgerEntry {
        version: row.get_string("version")?,
        description: row.get_optional_string("description")?,
        batch: row.get_i32("batch")?,
        applied_at: row.get_datetime("applied_at")?,
    })
}
