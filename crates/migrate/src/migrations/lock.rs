//! Migration Lock - Cross-process mutual exclusion for a whole run
//!
//! The lock is a single row in a dedicated table whose primary key only admits
//! one holder. Inserting the row acquires the lock, deleting it releases it.
//! This works the same way on every supported dialect.
//!
//! While a guard is alive a background task refreshes the row's heartbeat. A
//! row whose heartbeat is older than `stale_after` belongs to a process that
//! died without cleaning up and is taken over by the next `acquire`. Dropping
//! a guard without releasing it (a panic or a cancelled run) removes the row
//! in the background.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backends::{DatabasePool, DatabaseValue, SqlDialect};
use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Lock table access and acquisition policy
#[derive(Debug, Clone)]
pub struct MigrationLock {
    table: String,
    dialect: SqlDialect,
    timeout: Duration,
    poll_interval: Duration,
    stale_after: Duration,
}

/// Proof of holding the lock; release it with [`MigrationLockGuard::release`]
#[must_use = "the migration lock stays held until released"]
pub struct MigrationLockGuard {
    lock: MigrationLock,
    pool: Arc<dyn DatabasePool>,
    holder: String,
    acquired_at: DateTime<Utc>,
    heartbeat: JoinHandle<()>,
    released: bool,
}

/// Current lock holder as read from the lock table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl MigrationLock {
    pub fn new(
        table: impl Into<String>,
        dialect: SqlDialect,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            table: table.into(),
            dialect,
            timeout,
            poll_interval,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Lock settings taken from the engine configuration
    pub fn from_config(config: &MigrationConfig, dialect: SqlDialect) -> Self {
        Self::new(
            config.lock_table(),
            dialect,
            config.lock_timeout,
            config.lock_poll_interval,
        )
        .with_stale_after(config.lock_stale_after)
    }

    /// Treat a holder as dead once its heartbeat is older than this
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Acquire the lock, polling until the timeout elapses.
    ///
    /// A busy database counts as the lock being held elsewhere. Fails with
    /// `LockContention` if another live holder keeps it for longer than the
    /// timeout.
    pub async fn acquire(&self, pool: &Arc<dyn DatabasePool>) -> MigrationResult<MigrationLockGuard> {
        self.ensure_table(pool.as_ref()).await?;

        let holder = format!("{}:{}", std::process::id(), Uuid::new_v4());
        let started = Instant::now();

        loop {
            match self.try_insert(pool.as_ref(), &holder).await {
                Ok(Some(acquired_at)) => {
                    tracing::debug!(holder = %holder, "acquired migration lock");
                    return Ok(MigrationLockGuard::start(
                        self.clone(),
                        pool.clone(),
                        holder,
                        acquired_at,
                    ));
                }
                Ok(None) => match self.take_over_if_stale(pool.as_ref()).await {
                    Ok(true) => continue,
                    Ok(false) => tracing::debug!("migration lock is held elsewhere, retrying"),
                    Err(e) if e.is_busy() => tracing::debug!("lock table is busy, retrying"),
                    Err(e) => return Err(e),
                },
                Err(e) if e.is_busy() => tracing::debug!("lock table is busy, retrying: {}", e),
                Err(e) => return Err(e),
            }

            if started.elapsed() >= self.timeout {
                let current = match self.current_holder(pool.as_ref()).await {
                    Ok(Some(h)) => format!("{} since {}", h.holder, h.acquired_at.to_rfc3339()),
                    Ok(None) => "unknown holder".to_string(),
                    Err(e) if e.is_busy() => "unknown holder".to_string(),
                    Err(e) => return Err(e),
                };
                return Err(MigrationError::LockContention {
                    holder: current,
                    waited_ms: started.elapsed().as_millis(),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Who holds the lock right now, if anyone
    pub async fn current_holder(&self, pool: &dyn DatabasePool) -> MigrationResult<Option<LockHolder>> {
        self.ensure_table(pool).await?;
        let rows = pool.fetch_all(&self.select_sql(), &[]).await?;
        rows.first()
            .map(|row| {
                Ok(LockHolder {
                    holder: row.get_string("holder")?,
                    acquired_at: row.get_datetime("acquired_at")?,
                    heartbeat_at: row.get_datetime("heartbeat_at")?,
                })
            })
            .transpose()
    }

    /// Remove the lock regardless of holder.
    ///
    /// For operators clearing a lock left behind by a killed process. Returns
    /// whether a lock row existed.
    pub async fn force_release(&self, pool: &dyn DatabasePool) -> MigrationResult<bool> {
        self.ensure_table(pool).await?;
        let deleted = pool
            .execute(&format!("DELETE FROM {} WHERE id = 1", self.table), &[])
            .await?;
        if deleted > 0 {
            tracing::warn!(table = %self.table, "migration lock forcibly released");
        }
        Ok(deleted > 0)
    }

    async fn try_insert(&self, pool: &dyn DatabasePool, holder: &str) -> MigrationResult<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let params = [
            DatabaseValue::from(holder),
            DatabaseValue::DateTime(now),
            DatabaseValue::DateTime(now),
        ];
        let inserted = pool.execute(&self.insert_sql(), &params).await?;
        Ok((inserted == 1).then_some(now))
    }

    /// Delete the current row if its holder stopped beating; true when the
    /// insert is worth retrying right away
    async fn take_over_if_stale(&self, pool: &dyn DatabasePool) -> MigrationResult<bool> {
        let Some(current) = self.current_holder(pool).await? else {
            // Released between our insert and this read
            return Ok(true);
        };

        let silent = Utc::now()
            .signed_duration_since(current.heartbeat_at)
            .to_std()
            .unwrap_or_default();
        if silent < self.stale_after {
            return Ok(false);
        }

        // Only matches if the holder did not beat since we read the row
        let params = [
            DatabaseValue::from(current.holder.as_str()),
            DatabaseValue::DateTime(current.heartbeat_at),
        ];
        let deleted = pool.execute(&self.delete_stale_sql(), &params).await?;
        if deleted > 0 {
            tracing::warn!(
                holder = %current.holder,
                silent_secs = silent.as_secs(),
                "took over stale migration lock"
            );
        }
        Ok(deleted > 0)
    }

    /// Refresh the heartbeat; false once the row is no longer ours
    async fn beat(&self, pool: &dyn DatabasePool, holder: &str) -> MigrationResult<bool> {
        let sql = format!(
            "UPDATE {} SET heartbeat_at = {} WHERE id = 1 AND holder = {}",
            self.table,
            self.dialect.parameter_placeholder(0),
            self.dialect.parameter_placeholder(1)
        );
        let params = [DatabaseValue::DateTime(Utc::now()), DatabaseValue::from(holder)];
        Ok(pool.execute(&sql, &params).await? > 0)
    }

    async fn delete_own(&self, pool: &dyn DatabasePool, holder: &str) -> MigrationResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE id = 1 AND holder = {}",
            self.table,
            self.dialect.parameter_placeholder(0)
        );
        pool.execute(&sql, &[DatabaseValue::from(holder)]).await
    }

    async fn ensure_table(&self, pool: &dyn DatabasePool) -> MigrationResult<()> {
        if let Err(err) = pool.execute(&self.create_table_sql(), &[]).await {
            // Lost a creation race; fine as long as the table is there now
            let exists_check = format!("SELECT id FROM {} WHERE 1 = 0", self.table);
            if pool.fetch_all(&exists_check, &[]).await.is_err() {
                return Err(MigrationError::Database(format!(
                    "Failed to create migration lock table: {}",
                    err.detail()
                )));
            }
        }
        Ok(())
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.stale_after / 3).max(MIN_HEARTBEAT_INTERVAL)
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id INTEGER PRIMARY KEY,\n    \
                holder VARCHAR(255) NOT NULL,\n    \
                acquired_at {ts} NOT NULL,\n    \
                heartbeat_at {ts} NOT NULL\n\
            )",
            self.table,
            ts = self.dialect.timestamp_type()
        )
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (id, holder, acquired_at, heartbeat_at) VALUES (1, {}, {}, {}) ON CONFLICT (id) DO NOTHING",
            self.table,
            self.dialect.parameter_placeholder(0),
            self.dialect.parameter_placeholder(1),
            self.dialect.parameter_placeholder(2)
        )
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT holder, acquired_at, heartbeat_at FROM {} WHERE id = 1",
            self.table
        )
    }

    fn delete_stale_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE id = 1 AND holder = {} AND heartbeat_at <= {}",
            self.table,
            self.dialect.parameter_placeholder(0),
            self.dialect.parameter_placeholder(1)
        )
    }
}

impl MigrationLockGuard {
    fn start(
        lock: MigrationLock,
        pool: Arc<dyn DatabasePool>,
        holder: String,
        acquired_at: DateTime<Utc>,
    ) -> Self {
        let heartbeat = tokio::spawn(heartbeat(lock.clone(), pool.clone(), holder.clone()));
        Self {
            lock,
            pool,
            holder,
            acquired_at,
            heartbeat,
            released: false,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Release the lock; only this holder's row is removed
    pub async fn release(mut self) -> MigrationResult<()> {
        self.heartbeat.abort();
        self.released = true;

        let deleted = self.lock.delete_own(self.pool.as_ref(), &self.holder).await?;
        if deleted == 0 {
            tracing::warn!(holder = %self.holder, "migration lock was already gone on release");
        } else {
            tracing::debug!(holder = %self.holder, "released migration lock");
        }
        Ok(())
    }
}

impl Drop for MigrationLockGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if self.released {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                holder = %self.holder,
                "migration lock dropped outside a runtime; it will be taken over once stale"
            );
            return;
        };

        tracing::warn!(holder = %self.holder, "migration lock dropped without release; removing it");
        let lock = self.lock.clone();
        let pool = self.pool.clone();
        let holder = std::mem::take(&mut self.holder);
        runtime.spawn(async move {
            match lock.delete_own(pool.as_ref(), &holder).await {
                Ok(_) => tracing::debug!(holder = %holder, "removed dropped migration lock"),
                Err(e) => tracing::warn!(
                    holder = %holder,
                    "could not remove dropped migration lock, it will be taken over once stale: {}",
                    e
                ),
            }
        });
    }
}

impl fmt::Debug for MigrationLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationLockGuard")
            .field("lock", &self.lock)
            .field("holder", &self.holder)
            .field("acquired_at", &self.acquired_at)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

async fn heartbeat(lock: MigrationLock, pool: Arc<dyn DatabasePool>, holder: String) {
    let every = lock.heartbeat_interval();
    loop {
        tokio::time::sleep(every).await;
        match lock.beat(pool.as_ref(), &holder).await {
            Ok(true) => tracing::trace!(holder = %holder, "migration lock heartbeat"),
            Ok(false) => {
                tracing::warn!(holder = %holder, "migration lock row is gone; stopping heartbeat");
                return;
            }
            Err(e) => tracing::debug!(holder = %holder, "migration lock heartbeat failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> MigrationLock {
        MigrationLock::new(
            "app_migrations_lock",
            SqlDialect::PostgreSQL,
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_lock_sql() {
        let lock = lock();
        assert_eq!(
            lock.insert_sql(),
            "INSERT INTO app_migrations_lock (id, holder, acquired_at, heartbeat_at) VALUES (1, $1, $2, $3) ON CONFLICT (id) DO NOTHING"
        );
        assert!(lock.create_table_sql().contains("acquired_at TIMESTAMPTZ NOT NULL"));
        assert!(lock.create_table_sql().contains("heartbeat_at TIMESTAMPTZ NOT NULL"));
        assert_eq!(
            lock.delete_stale_sql(),
            "DELETE FROM app_migrations_lock WHERE id = 1 AND holder = $1 AND heartbeat_at <= $2"
        );
    }

    #[test]
    fn test_heartbeat_runs_well_inside_the_stale_window() {
        assert_eq!(lock().stale_after(), Duration::from_secs(300));
        assert_eq!(lock().heartbeat_interval(), Duration::from_secs(100));

        let tight = lock().with_stale_after(Duration::from_millis(60));
        assert_eq!(tight.heartbeat_interval(), MIN_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_from_config_uses_lock_settings() {
        let config = MigrationConfig::default()
            .with_migrations_table("app_migrations")
            .with_lock_stale_after(Duration::from_secs(42));
        let lock = MigrationLock::from_config(&config, SqlDialect::SQLite);
        assert_eq!(lock.table, "app_migrations_lock");
        assert_eq!(lock.stale_after(), Duration::from_secs(42));
        assert_eq!(lock.timeout, config.lock_timeout);
    }
}
