//! Error types for the migration engine
//!
//! Every failure the engine can report carries a kind, a message and, where
//! one applies, the version of the unit it concerns. Database messages are
//! kept verbatim so operators see exactly what the driver said.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Error types for migration operations
#[derive(Debug, Clone, Error)]
pub enum MigrationError {
    /// A unit could not be parsed, or a required operation is missing
    #[error("Malformed migration unit '{source_name}': {reason}")]
    MalformedUnit { source_name: String, reason: String },

    /// Two units share the same version
    #[error("Duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: String,
        first: String,
        second: String,
    },

    /// The ledger row to insert or delete was not in the expected state
    #[error("Ledger write failed for {version}: {reason}")]
    LedgerWrite { version: String, reason: String },

    /// The unit's forward operation failed
    #[error("Migration {version} failed to apply: {message}")]
    ApplyFailure { version: String, message: String },

    /// The unit's reverse operation failed
    #[error("Migration {version} failed to revert: {message}")]
    RevertFailure { version: String, message: String },

    /// The migration lock could not be acquired in time
    #[error("Could not acquire migration lock within {waited_ms}ms (held by {holder})")]
    LockContention { holder: String, waited_ms: u128 },

    /// The ledger references a version the registry does not know
    #[error("Ledger entry {version} has no matching migration unit")]
    OrphanedLedgerEntry { version: String },

    /// A version was requested that the registry does not contain
    #[error("Unknown migration version: {0}")]
    UnknownVersion(String),

    /// A caller-supplied argument is out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Database connection or query error
    #[error("Database error: {0}")]
    Database(String),

    /// The database refused a statement because another session holds a
    /// conflicting lock (SQLite `SQLITE_BUSY`/`SQLITE_LOCKED`, PostgreSQL 55P03)
    #[error("Database busy: {0}")]
    DatabaseBusy(String),

    /// The run finished but its lock row could not be removed
    #[error("Migration lock could not be released: {reason} (this run changed: [{}])", .changed.join(", "))]
    LockRelease { changed: Vec<String>, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Filesystem error while reading or writing unit files
    #[error("IO error: {0}")]
    Io(String),
}

/// Machine-readable classification of a [`MigrationError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedUnit,
    DuplicateVersion,
    LedgerWriteError,
    ApplyFailure,
    RevertFailure,
    LockContention,
    LockRelease,
    OrphanedLedgerEntry,
    UnknownVersion,
    InvalidArgument,
    Database,
    Configuration,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MalformedUnit => "MalformedUnit",
            ErrorKind::DuplicateVersion => "DuplicateVersion",
            ErrorKind::LedgerWriteError => "LedgerWriteError",
            ErrorKind::ApplyFailure => "ApplyFailure",
            ErrorKind::RevertFailure => "RevertFailure",
            ErrorKind::LockContention => "LockContention",
            ErrorKind::LockRelease => "LockRelease",
            ErrorKind::OrphanedLedgerEntry => "OrphanedLedgerEntry",
            ErrorKind::UnknownVersion => "UnknownVersion",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::Database => "Database",
            ErrorKind::Configuration => "Configuration",
            ErrorKind::Io => "Io",
        };
        f.write_str(name)
    }
}

impl MigrationError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::MalformedUnit { .. } => ErrorKind::MalformedUnit,
            MigrationError::DuplicateVersion { .. } => ErrorKind::DuplicateVersion,
            MigrationError::LedgerWrite { .. } => ErrorKind::LedgerWriteError,
            MigrationError::ApplyFailure { .. } => ErrorKind::ApplyFailure,
            MigrationError::RevertFailure { .. } => ErrorKind::RevertFailure,
            MigrationError::LockContention { .. } => ErrorKind::LockContention,
            MigrationError::LockRelease { .. } => ErrorKind::LockRelease,
            MigrationError::OrphanedLedgerEntry { .. } => ErrorKind::OrphanedLedgerEntry,
            MigrationError::UnknownVersion(_) => ErrorKind::UnknownVersion,
            MigrationError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MigrationError::Database(_) | MigrationError::DatabaseBusy(_) => ErrorKind::Database,
            MigrationError::Configuration(_) => ErrorKind::Configuration,
            MigrationError::Io(_) => ErrorKind::Io,
        }
    }

    /// The unit version this error concerns, if any
    pub fn version(&self) -> Option<&str> {
        match self {
            MigrationError::DuplicateVersion { version, .. }
            | MigrationError::LedgerWrite { version, .. }
            | MigrationError::ApplyFailure { version, .. }
            | MigrationError::RevertFailure { version, .. }
            | MigrationError::OrphanedLedgerEntry { version } => Some(version),
            MigrationError::UnknownVersion(version) => Some(version),
            _ => None,
        }
    }

    /// Whether the database turned the statement away because of a
    /// conflicting lock held by another session
    pub fn is_busy(&self) -> bool {
        matches!(self, MigrationError::DatabaseBusy(_))
    }

    /// Create a malformed unit error
    pub fn malformed(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        MigrationError::MalformedUnit {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a ledger write error
    pub fn ledger_write(version: impl Into<String>, reason: impl Into<String>) -> Self {
        MigrationError::LedgerWrite {
            version: version.into(),
            reason: reason.into(),
        }
    }

    /// The raw message without the kind prefix added by `Display`
    pub fn detail(&self) -> String {
        match self {
            MigrationError::ApplyFailure { message, .. }
            | MigrationError::RevertFailure { message, .. } => message.clone(),
            MigrationError::Database(msg)
            | MigrationError::DatabaseBusy(msg)
            | MigrationError::Configuration(msg)
            | MigrationError::Io(msg)
            | MigrationError::InvalidArgument(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

// Convert from sqlx errors
impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            MigrationError::DatabaseBusy(err.to_string())
        } else {
            MigrationError::Database(err.to_string())
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    let Some(db_err) = err.as_database_error() else {
        return false;
    };
    let Some(code) = db_err.code() else {
        return false;
    };

    if db_err.try_downcast_ref::<sqlx::sqlite::SqliteError>().is_some() {
        // Extended result codes keep the primary code in the low byte
        code.parse::<i32>()
            .map_or(false, |code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
    } else {
        code == PG_LOCK_NOT_AVAILABLE
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        MigrationError::Io(err.to_string())
    }
}

impl From<crate::config::ConfigError> for MigrationError {
    fn from(err: crate::config::ConfigError) -> Self {
        MigrationError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_version_context() {
        let err = MigrationError::ApplyFailure {
            version: "20240101000000".to_string(),
            message: "no such table: widgets".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ApplyFailure);
        assert_eq!(err.version(), Some("20240101000000"));
        assert_eq!(err.detail(), "no such table: widgets");
        assert!(err.to_string().contains("no such table: widgets"));

        let err = MigrationError::LockContention {
            holder: "42:abc".to_string(),
            waited_ms: 100,
        };
        assert_eq!(err.kind(), ErrorKind::LockContention);
        assert_eq!(err.version(), None);
    }

    #[test]
    fn test_busy_is_a_database_error() {
        let err = MigrationError::DatabaseBusy("database is locked".to_string());
        assert!(err.is_busy());
        assert_eq!(err.kind(), ErrorKind::Database);
        assert_eq!(err.detail(), "database is locked");
        assert!(!MigrationError::Database("syntax error".to_string()).is_busy());
    }

    #[test]
    fn test_lock_release_lists_changed_versions() {
        let err = MigrationError::LockRelease {
            changed: vec!["20240101000000".to_string(), "20240201000000".to_string()],
            reason: "no such table: tidemark_migrations_lock".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::LockRelease);
        let message = err.to_string();
        assert!(message.contains("20240101000000, 20240201000000"), "{}", message);
        assert!(message.contains("no such table"), "{}", message);
    }

    #[test]
    fn test_error_kind_display_matches_taxonomy() {
        assert_eq!(ErrorKind::LedgerWriteError.to_string(), "LedgerWriteError");
        assert_eq!(
            MigrationError::ledger_write("20240101000000", "row exists").kind(),
            ErrorKind::LedgerWriteError
        );
    }
}
