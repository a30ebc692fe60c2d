//! Migration configuration
//!
//! Defaults, environment overrides and validation for the engine's settings.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    /// Create a missing required field error
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

/// Configuration for the migration system
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory where migration files are stored
    pub migrations_dir: PathBuf,
    /// Table name for tracking applied migrations
    pub migrations_table: String,
    /// How long to wait for the migration lock before giving up
    pub lock_timeout: Duration,
    /// Delay between lock acquisition attempts
    pub lock_poll_interval: Duration,
    /// A lock whose heartbeat is older than this is treated as abandoned and
    /// may be taken over
    pub lock_stale_after: Duration,
    /// Override whether DDL runs in the same transaction as the ledger write.
    /// `None` uses the dialect's capability.
    pub ddl_transactions: Option<bool>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            migrations_table: "tidemark_migrations".to_string(),
            lock_timeout: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(250),
            lock_stale_after: Duration::from_secs(300),
            ddl_transactions: None,
        }
    }
}

impl MigrationConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(dir) = env::var("TIDEMARK_MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }

        if let Ok(table) = env::var("TIDEMARK_MIGRATIONS_TABLE") {
            config.migrations_table = table;
        }

        if let Ok(secs) = env::var("TIDEMARK_LOCK_TIMEOUT_SECS") {
            let parsed: u64 = secs.parse().map_err(|_| {
                ConfigError::invalid_value("lock_timeout", secs.as_str(), "whole number of seconds")
            })?;
            config.lock_timeout = Duration::from_secs(parsed);
        }

        if let Ok(secs) = env::var("TIDEMARK_LOCK_STALE_SECS") {
            let parsed: u64 = secs.parse().map_err(|_| {
                ConfigError::invalid_value("lock_stale_after", secs.as_str(), "whole number of seconds")
            })?;
            config.lock_stale_after = Duration::from_secs(parsed);
        }

        config.validate()?;
        Ok(config)
    }

    /// Use a different migrations directory
    pub fn with_migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    /// Use a different ledger table name
    pub fn with_migrations_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    /// Set the lock wait
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set how long a silent lock holder is trusted before takeover
    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    /// Name of the table backing the migration lock
    pub fn lock_table(&self) -> String {
        format!("{}_lock", self.migrations_table)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migrations_table.is_empty() {
            return Err(ConfigError::missing_required(
                "migrations_table",
                "Set TIDEMARK_MIGRATIONS_TABLE or pass --table",
            ));
        }

        if !is_plain_identifier(&self.migrations_table) {
            return Err(ConfigError::invalid_value(
                "migrations_table",
                self.migrations_table.as_str(),
                "letters, digits and underscores, not starting with a digit",
            ));
        }

        if self.lock_poll_interval.is_zero() {
            return Err(ConfigError::validation_failed(
                "lock_poll_interval must be greater than zero",
            ));
        }

        if self.lock_stale_after < Duration::from_secs(1) {
            return Err(ConfigError::invalid_value(
                "lock_stale_after",
                format!("{:?}", self.lock_stale_after),
                "at least one second",
            ));
        }

        Ok(())
    }
}

/// Table names are interpolated into SQL, so only bare identifiers are allowed
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MigrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.migrations_table, "tidemark_migrations");
        assert_eq!(config.lock_table(), "tidemark_migrations_lock");
        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
    }

    #[test]
    fn test_rejects_table_names_that_are_not_identifiers() {
        for bad in ["", "1migrations", "schema.migrations", "m; DROP TABLE x", "my-table"] {
            let config = MigrationConfig::default().with_migrations_table(bad);
            assert!(config.validate().is_err(), "accepted {:?}", bad);
        }

        let config = MigrationConfig::default().with_migrations_table("_app_migrations2");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let config = MigrationConfig {
            lock_poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_rejects_sub_second_stale_after() {
        let config = MigrationConfig::default().with_lock_stale_after(Duration::from_millis(500));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(MigrationConfig::default()
            .with_lock_stale_after(Duration::from_secs(1))
            .validate()
            .is_ok());
    }
}
