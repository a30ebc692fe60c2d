//! Migration Runner - Executes migrations against the database
//!
//! Every mutating run follows the same shape: take the migration lock, make
//! sure the ledger exists, compute a plan from a fresh ledger read, execute
//! each planned unit in its own transaction, release the lock. A failing unit
//! is rolled back and halts the run; units committed before it stay committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::definitions::{
    LedgerEntry, MigrationDirection, MigrationStep, MigrationUnit, MigrationVersion,
};
use super::ledger::MigrationLedger;
use super::lock::{MigrationLock, MigrationLockGuard};
use super::plan::{MigrationAction, MigrationPlan, PlannedStep};
use super::registry::MigrationRegistry;
use super::report::{MigrationFailure, MigrationReport, MigrationState, StatusEntry, StatusReport};
use crate::backends::{DatabasePool, DatabaseTransaction};
use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};

/// Migration runner that executes migrations against a database
pub struct MigrationRunner {
    pool: Arc<dyn DatabasePool>,
    registry: MigrationRegistry,
    config: MigrationConfig,
    ledger: MigrationLedger,
    lock: MigrationLock,
}

impl MigrationRunner {
    /// Create a new migration runner
    pub fn new(
        pool: Arc<dyn DatabasePool>,
        registry: MigrationRegistry,
        config: MigrationConfig,
    ) -> MigrationResult<Self> {
        config.validate()?;

        let dialect = pool.dialect();
        let ledger = MigrationLedger::new(config.migrations_table.clone(), dialect);
        let lock = MigrationLock::from_config(&config, dialect);

        Ok(Self {
            pool,
            registry,
            config,
            ledger,
            lock,
        })
    }

    /// Get the database pool
    pub fn pool(&self) -> &dyn DatabasePool {
        self.pool.as_ref()
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    pub fn lock(&self) -> &MigrationLock {
        &self.lock
    }

    /// Apply every pending unit up to and including `target` (default: latest).
    ///
    /// Returns `Err` only when nothing could be attempted (lock contention,
    /// ledger unreadable, unknown target). A unit failure is reported in the
    /// returned report with the run marked as halted.
    pub async fn migrate_up(&self, target: Option<&MigrationVersion>) -> MigrationResult<MigrationReport> {
        let guard = self.lock.acquire(&self.pool).await?;
        let result = self.run_up(target).await;
        self.finish(guard, result).await
    }

    /// Compute what `migrate_up` would do without executing anything
    pub async fn plan_up(&self, target: Option<&MigrationVersion>) -> MigrationResult<MigrationPlan> {
        self.ledger.ensure_table(self.pool()).await?;
        let applied = self.ledger.applied_versions(self.pool()).await?;
        MigrationPlan::forward(&self.registry, &applied, target)
    }

    /// Applied, pending and orphaned versions
    pub async fn status(&self) -> MigrationResult<StatusReport> {
        self.ledger.ensure_table(self.pool()).await?;
        let entries = self.ledger.list_applied(self.pool()).await?;
        let recorded: HashMap<&str, _> = entries.iter().map(|e| (e.version.as_str(), e)).collect();

        let mut report = StatusReport::default();
        for unit in self.registry.units() {
            let state = match recorded.get(unit.version.as_str()) {
                Some(entry) => MigrationState::Applied {
                    applied_at: entry.applied_at,
                    batch: entry.batch,
                },
                None => MigrationState::Pending,
            };
            report.entries.push(StatusEntry {
                version: unit.version.to_string(),
                description: unit.description.clone(),
                state,
            });
        }

        for entry in entries.iter().filter(|e| !self.registry.contains(&e.version)) {
            tracing::warn!(version = %entry.version, "ledger entry has no matching migration unit");
            report.entries.push(StatusEntry {
                version: entry.version.clone(),
                description: entry.description.clone(),
                state: MigrationState::Orphaned {
                    applied_at: entry.applied_at,
                    batch: entry.batch,
                },
            });
        }

        report.entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(report)
    }

    async fn run_up(&self, target: Option<&MigrationVersion>) -> MigrationResult<MigrationReport> {
        let start_time = Instant::now();
        let plan = self.plan_up(target).await?;
        tracing::debug!(?plan, "computed forward plan");

        let mut report = MigrationReport::new(MigrationDirection::Up);
        report.skipped = plan.skipped();

        if plan.is_empty() {
            tracing::info!("database is up to date");
        } else {
            let batch = self.ledger.next_batch(self.pool()).await?;
            report.batch = Some(batch);
            self.execute_plan(&plan, batch, &mut report).await;
        }

        report.execution_time_ms = start_time.elapsed().as_millis();
        Ok(report)
    }

    /// Run a reverting plan built from a fresh ledger read, under the lock
    pub(crate) async fn run_down_with<F>(&self, build: F) -> MigrationResult<MigrationReport>
    where
        F: FnOnce(&MigrationRegistry, &[LedgerEntry]) -> MigrationResult<MigrationPlan>,
    {
        let guard = self.lock.acquire(&self.pool).await?;
        let result: MigrationResult<MigrationReport> = async {
            let start_time = Instant::now();
            self.ledger.ensure_table(self.pool()).await?;
            let entries = self.ledger.list_applied(self.pool()).await?;
            let plan = build(&self.registry, entries.as_slice())?;
            tracing::debug!(?plan, "computed rollback plan");

            let mut report = MigrationReport::new(MigrationDirection::Down);
            if plan.is_empty() {
                tracing::info!("nothing to roll back");
            } else {
                self.execute_plan(&plan, 0, &mut report).await;
            }
            report.execution_time_ms = start_time.elapsed().as_millis();
            Ok(report)
        }
        .await;
        self.finish(guard, result).await
    }

    /// Release the lock whatever the run's outcome.
    ///
    /// A run that changed the schema but could not release the lock still
    /// reports which versions it applied or reverted.
    async fn finish(
        &self,
        guard: MigrationLockGuard,
        result: MigrationResult<MigrationReport>,
    ) -> MigrationResult<MigrationReport> {
        let released = guard.release().await;
        match (result, released) {
            (Ok(report), Ok(())) => Ok(report),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                tracing::error!("failed to release migration lock: {}", release_err);
                Err(err)
            }
            (Ok(report), Err(release_err)) => {
                let changed: Vec<String> = report
                    .applied
                    .iter()
                    .chain(report.reverted.iter())
                    .map(|v| v.to_string())
                    .collect();
                tracing::error!(
                    applied = ?report.applied,
                    reverted = ?report.reverted,
                    halted = report.failure.is_some(),
                    "run finished but the migration lock could not be released: {}",
                    release_err
                );
                Err(MigrationError::LockRelease {
                    changed,
                    reason: release_err.detail(),
                })
            }
        }
    }

    /// Execute the actionable steps in order, halting at the first failure
    async fn execute_plan(&self, plan: &MigrationPlan, batch: i32, report: &mut MigrationReport) {
        let steps: Vec<&PlannedStep> = plan.actionable().collect();

        for (index, step) in steps.iter().enumerate() {
            let outcome = match self.registry.get(step.version.as_str()) {
                Some(unit) => self.execute_unit(unit, step.action, batch).await,
                None => Err(MigrationError::UnknownVersion(step.version.to_string())),
            };

            match outcome {
                Ok(()) => match step.action {
                    MigrationAction::Apply => report.applied.push(step.version.clone()),
                    MigrationAction::Revert => report.reverted.push(step.version.clone()),
                    MigrationAction::Skip => {}
                },
                Err(error) => {
                    tracing::warn!(
                        version = %step.version,
                        kind = %error.kind(),
                        "migration run halted: {}",
                        error
                    );
                    report.remaining = steps[index + 1..]
                        .iter()
                        .map(|s| s.version.clone())
                        .collect();
                    report.failure = Some(MigrationFailure::new(step.version.clone(), error));
                    return;
                }
            }
        }
    }

    /// Run one unit in its own transaction together with its ledger write
    async fn execute_unit(
        &self,
        unit: &MigrationUnit,
        action: MigrationAction,
        batch: i32,
    ) -> MigrationResult<()> {
        let version = unit.version.to_string();
        let (step, failure): (&Arc<dyn MigrationStep>, fn(String, String) -> MigrationError) =
            match action {
                MigrationAction::Apply => (&unit.apply, apply_failure),
                MigrationAction::Revert => (&unit.revert, revert_failure),
                MigrationAction::Skip => return Ok(()),
            };

        match action {
            MigrationAction::Apply => tracing::info!(version = %version, "Applying migration: {}", unit.label()),
            _ => tracing::info!(version = %version, "Rolling back migration: {}", unit.label()),
        }

        let mut tx = self.pool.begin_transaction().await.map_err(|e| {
            failure(version.clone(), format!("Failed to start transaction: {}", e.detail()))
        })?;

        if let Err(e) = step.run(tx.as_mut()).await {
            rollback_quietly(tx, &version).await;
            return Err(failure(version, e.detail()));
        }

        if self.ddl_is_transactional() {
            if let Err(e) = self.write_ledger(tx.as_mut(), unit, action, batch).await {
                rollback_quietly(tx, &version).await;
                return Err(e);
            }
            tx.commit()
                .await
                .map_err(|e| failure(version.clone(), format!("Failed to commit: {}", e.detail())))?;
        } else {
            tx.commit()
                .await
                .map_err(|e| failure(version.clone(), format!("Failed to commit: {}", e.detail())))?;

            // The schema change is durable from here on; if the ledger write
            // below fails the unit will be attempted again on the next run.
            let mut ledger_tx = self.pool.begin_transaction().await.map_err(|e| {
                MigrationError::ledger_write(version.as_str(), e.detail())
            })?;
            if let Err(e) = self.write_ledger(ledger_tx.as_mut(), unit, action, batch).await {
                tracing::error!(
                    version = %version,
                    "schema change committed but ledger write failed; the unit will run again"
                );
                rollback_quietly(ledger_tx, &version).await;
                return Err(e);
            }
            ledger_tx
                .commit()
                .await
                .map_err(|e| MigrationError::ledger_write(version.as_str(), e.detail()))?;
        }

        Ok(())
    }

    async fn write_ledger(
        &self,
        tx: &mut dyn DatabaseTransaction,
        unit: &MigrationUnit,
        action: MigrationAction,
        batch: i32,
    ) -> MigrationResult<()> {
        let version = unit.version.as_str();
        let result = match action {
            MigrationAction::Apply => {
                self.ledger
                    .record_applied(tx, version, unit.description.as_deref(), batch)
                    .await
            }
            MigrationAction::Revert => self.ledger.record_reverted(tx, version).await,
            MigrationAction::Skip => Ok(()),
        };

        result.map_err(|e| match e {
            MigrationError::LedgerWrite { .. } => e,
            other => MigrationError::ledger_write(version, other.detail()),
        })
    }

    fn ddl_is_transactional(&self) -> bool {
        self.config
            .ddl_transactions
            .unwrap_or_else(|| self.pool.dialect().supports_transactional_ddl())
    }
}

fn apply_failure(version: String, message: String) -> MigrationError {
    MigrationError::ApplyFailure { version, message }
}

fn revert_failure(version: String, message: String) -> MigrationError {
    MigrationError::RevertFailure { version, message }
}

async fn rollback_quietly(tx: Box<dyn DatabaseTransaction>, version: &str) {
    if let Err(e) = tx.rollback().await {
        // The connection drops the transaction anyway
        tracing::warn!(version = %version, "explicit rollback failed: {}", e);
    }
}
