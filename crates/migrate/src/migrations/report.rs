//! Run and status reports returned to callers

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::definitions::{MigrationDirection, MigrationVersion};
use crate::error::{ErrorKind, MigrationError, MigrationResult};

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every planned unit committed
    Complete,
    /// Stopped at the first failure; later units were not touched
    Halted,
}

/// The unit a run stopped at and why
#[derive(Debug, Clone, Serialize)]
pub struct MigrationFailure {
    pub version: MigrationVersion,
    pub kind: ErrorKind,
    /// Verbatim error text, including the database's own message
    pub message: String,
    #[serde(skip)]
    pub error: MigrationError,
}

impl MigrationFailure {
    pub fn new(version: MigrationVersion, error: MigrationError) -> Self {
        Self {
            version,
            kind: error.kind(),
            message: error.to_string(),
            error,
        }
    }
}

/// Result of running migrations up or down
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub direction: MigrationDirection,
    /// Versions applied by this run, in order
    pub applied: Vec<MigrationVersion>,
    /// Versions reverted by this run, in order
    pub reverted: Vec<MigrationVersion>,
    /// Versions in range that were already applied
    pub skipped: Vec<MigrationVersion>,
    /// Planned versions left untouched because the run halted
    pub remaining: Vec<MigrationVersion>,
    pub failure: Option<MigrationFailure>,
    /// Batch number recorded for units applied by this run
    pub batch: Option<i32>,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl MigrationReport {
    pub(crate) fn new(direction: MigrationDirection) -> Self {
        Self {
            direction,
            applied: Vec::new(),
            reverted: Vec::new(),
            skipped: Vec::new(),
            remaining: Vec::new(),
            failure: None,
            batch: None,
            execution_time_ms: 0,
        }
    }

    /// Version the run stopped at, if it halted
    pub fn failed_at(&self) -> Option<&MigrationVersion> {
        self.failure.as_ref().map(|failure| &failure.version)
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.failure.is_some() {
            RunOutcome::Halted
        } else {
            RunOutcome::Complete
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == RunOutcome::Complete
    }

    /// Units changed by this run, whichever the direction
    pub fn changed(&self) -> &[MigrationVersion] {
        match self.direction {
            MigrationDirection::Up => &self.applied,
            MigrationDirection::Down => &self.reverted,
        }
    }

    /// Turn a halted run into its error
    pub fn into_result(self) -> MigrationResult<Self> {
        match self.failure {
            Some(failure) => Err(failure.error),
            None => Ok(self),
        }
    }
}

/// State of one version in `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum MigrationState {
    Applied { applied_at: DateTime<Utc>, batch: i32 },
    Pending,
    /// In the ledger but unknown to the registry; reported, never corrected
    Orphaned { applied_at: DateTime<Utc>, batch: i32 },
}

/// One line of a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub version: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub state: MigrationState,
}

/// Applied, pending and orphaned versions, in version order
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
}

impl StatusReport {
    pub fn applied(&self) -> impl Iterator<Item = &StatusEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, MigrationState::Applied { .. }))
    }

    pub fn pending(&self) -> impl Iterator<Item = &StatusEntry> {
        self.entries
            .iter()
            .filter(|e| e.state == MigrationState::Pending)
    }

    pub fn orphaned(&self) -> impl Iterator<Item = &StatusEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, MigrationState::Orphaned { .. }))
    }

    /// Look up a version
    pub fn state_of(&self, version: &str) -> Option<&MigrationState> {
        self.entries
            .iter()
            .find(|e| e.version == version)
            .map(|e| &e.state)
    }

    /// Non-fatal findings for the operator
    pub fn warnings(&self) -> Vec<MigrationError> {
        self.orphaned()
            .map(|e| MigrationError::OrphanedLedgerEntry {
                version: e.version.clone(),
            })
            .collect()
    }
}
