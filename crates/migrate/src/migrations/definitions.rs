//! Migration Definitions - Core types and structures for migrations
//!
//! Defines migration units, their versions and operations, ledger entries and
//! the direction of a run.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::backends::DatabaseTransaction;
use crate::error::{MigrationError, MigrationResult};

/// Number of digits in a `YYYYMMDDHHMMSS` version
pub const VERSION_LEN: usize = 14;

const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// Version identifier of a migration unit.
///
/// Always fourteen ASCII digits forming a valid `YYYYMMDDHHMMSS` timestamp, so
/// string order and numeric order agree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MigrationVersion(String);

impl MigrationVersion {
    /// Parse and validate a version string
    pub fn parse(raw: &str) -> MigrationResult<Self> {
        if raw.len() != VERSION_LEN || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MigrationError::malformed(
                raw,
                format!("version must be {} digits (YYYYMMDDHHMMSS)", VERSION_LEN),
            ));
        }

        NaiveDateTime::parse_from_str(raw, VERSION_FORMAT).map_err(|e| {
            MigrationError::malformed(raw, format!("version is not a valid timestamp: {}", e))
        })?;

        Ok(Self(raw.to_string()))
    }

    /// Version for the given instant
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.format(VERSION_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The timestamp the version encodes
    pub fn timestamp(&self) -> DateTime<Utc> {
        // Validated in `parse`, so the fallback is unreachable
        NaiveDateTime::parse_from_str(&self.0, VERSION_FORMAT)
            .map(|naive| naive.and_utc())
            .unwrap_or_default()
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for MigrationVersion {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// One direction of a migration unit.
///
/// Implementations run inside the transaction the runner opened for the unit
/// and must not commit or roll it back themselves.
#[async_trait]
pub trait MigrationStep: Send + Sync + fmt::Debug {
    async fn run(&self, tx: &mut dyn DatabaseTransaction) -> MigrationResult<()>;
}

/// A step made of plain SQL statements, executed in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStep {
    statements: Vec<String>,
}

impl SqlStep {
    pub fn new(statements: Vec<String>) -> Self {
        Self { statements }
    }

    /// Split a SQL script into statements
    pub fn from_script(sql: &str) -> Self {
        Self::new(super::manager::split_sql_statements(sql))
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[async_trait]
impl MigrationStep for SqlStep {
    async fn run(&self, tx: &mut dyn DatabaseTransaction) -> MigrationResult<()> {
        for statement in &self.statements {
            tx.execute(statement, &[]).await?;
        }
        Ok(())
    }
}

/// A named, versioned, reversible schema change.
///
/// Authoring contract: `apply` should be safe to re-run against a schema it has
/// already (partially) changed, e.g. `CREATE TABLE IF NOT EXISTS`; the engine
/// does not rewrite SQL to make it so. `revert` undoes `apply` and may lose
/// data (dropping a column drops its values).
#[derive(Debug, Clone)]
pub struct MigrationUnit {
    /// Unique, immutable version; the only ordering key
    pub version: MigrationVersion,
    /// Human-readable label for operators
    pub description: Option<String>,
    /// Forward schema change
    pub apply: Arc<dyn MigrationStep>,
    /// Reverse schema change
    pub revert: Arc<dyn MigrationStep>,
    /// Where the unit was discovered (file path or "static")
    pub origin: String,
}

impl MigrationUnit {
    /// Build a unit from arbitrary steps
    pub fn new(
        version: MigrationVersion,
        description: Option<String>,
        apply: Arc<dyn MigrationStep>,
        revert: Arc<dyn MigrationStep>,
    ) -> Self {
        Self {
            version,
            description,
            apply,
            revert,
            origin: "static".to_string(),
        }
    }

    /// Build a unit from up and down SQL scripts.
    ///
    /// Both scripts must contain at least one statement.
    pub fn sql(
        version: &str,
        description: impl Into<String>,
        up_sql: &str,
        down_sql: &str,
    ) -> MigrationResult<Self> {
        let version = MigrationVersion::parse(version)?;
        let apply = SqlStep::from_script(up_sql);
        let revert = SqlStep::from_script(down_sql);

        if apply.is_empty() {
            return Err(MigrationError::malformed(
                version.as_str(),
                "up migration has no statements",
            ));
        }
        if revert.is_empty() {
            return Err(MigrationError::malformed(
                version.as_str(),
                "down migration has no statements",
            ));
        }

        let description = description.into();
        Ok(Self::new(
            version,
            (!description.is_empty()).then_some(description),
            Arc::new(apply),
            Arc::new(revert),
        ))
    }

    /// Record where this unit came from
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Label used in logs: `version - description`
    pub fn label(&self) -> String {
        match &self.description {
            Some(description) => format!("{} - {}", self.version, description),
            None => self.version.to_string(),
        }
    }
}

/// Migration status row in the ledger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    /// Applied version; a plain string because the ledger may hold versions
    /// the current registry no longer knows
    pub version: String,
    /// When the migration was applied
    pub applied_at: DateTime<Utc>,
    /// Description snapshot at application time
    pub description: Option<String>,
    /// Batch number (all units applied by one run share a batch)
    pub batch: i32,
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Apply migrations (run UP statements)
    Up,
    /// Revert migrations (run DOWN statements)
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_version_parsing() {
        let version = MigrationVersion::parse("20240101000000").unwrap();
        assert_eq!(version.as_str(), "20240101000000");
        assert_eq!(
            version.timestamp(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );

        for bad in ["2024010100000", "2024010100000a", "20241301000000", "20240101256000", ""] {
            let err = MigrationVersion::parse(bad).unwrap_err();
            assert!(
                matches!(err, MigrationError::MalformedUnit { .. }),
                "unexpected error for {:?}: {}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_version_order_is_chronological() {
        let mut versions: Vec<MigrationVersion> = ["20240201000000", "20231231235959", "20240101000000"]
            .iter()
            .map(|v| MigrationVersion::parse(v).unwrap())
            .collect();
        versions.sort();
        let ordered: Vec<&str> = versions.iter().map(|v| v.as_str()).collect();
        assert_eq!(ordered, vec!["20231231235959", "20240101000000", "20240201000000"]);
    }

    #[test]
    fn test_version_from_datetime_round_trips() {
        let at = Utc.with_ymd_and_hms(2025, 6, 30, 13, 45, 9).unwrap();
        let version = MigrationVersion::from_datetime(at);
        assert_eq!(version.as_str(), "20250630134509");
        assert_eq!(MigrationVersion::parse(version.as_str()).unwrap(), version);
    }

    #[test]
    fn test_sql_unit_requires_both_directions() {
        let unit = MigrationUnit::sql(
            "20240101000000",
            "create widgets",
            "CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
            "DROP TABLE widgets;",
        )
        .unwrap();
        assert_eq!(unit.label(), "20240101000000 - create widgets");

        let err = MigrationUnit::sql("20240101000000", "no down", "CREATE TABLE t (id INTEGER);", "")
            .unwrap_err();
        assert!(err.to_string().contains("down migration has no statements"));

        let err = MigrationUnit::sql("20240101000000", "no up", "  ", "DROP TABLE t;").unwrap_err();
        assert!(err.to_string().contains("up migration has no statements"));
    }
}
