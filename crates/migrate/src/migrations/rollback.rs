//! Migration Rollback - Reverting applied migrations
//!
//! Rollbacks run the reverse operation of each selected unit, most recently
//! applied first, each in its own transaction together with the deletion of
//! its ledger row.

use super::plan::MigrationPlan;
use super::report::MigrationReport;
use super::runner::MigrationRunner;
use crate::error::{MigrationError, MigrationResult};

/// Extension trait for MigrationRunner to add rollback functionality
pub trait MigrationRollback {
    /// Revert the `steps` most recently applied units
    async fn migrate_down(&self, steps: usize) -> MigrationResult<MigrationReport>;

    /// Revert every unit applied by the latest forward run
    async fn rollback_last_batch(&self) -> MigrationResult<MigrationReport>;

    /// Revert every applied unit
    async fn reset(&self) -> MigrationResult<MigrationReport>;
}

impl MigrationRollback for MigrationRunner {
    async fn migrate_down(&self, steps: usize) -> MigrationResult<MigrationReport> {
        if steps == 0 {
            return Err(MigrationError::InvalidArgument(
                "steps must be at least 1".to_string(),
            ));
        }

        tracing::info!(steps, "rolling back migrations");
        self.run_down_with(|registry, entries| MigrationPlan::rollback(registry, entries, steps))
            .await
    }

    async fn rollback_last_batch(&self) -> MigrationResult<MigrationReport> {
        tracing::info!("rolling back the latest batch");
        self.run_down_with(MigrationPlan::rollback_batch).await
    }

    async fn reset(&self) -> MigrationResult<MigrationReport> {
        tracing::info!("rolling back all migrations");
        self.run_down_with(MigrationPlan::rollback_all).await
    }
}
