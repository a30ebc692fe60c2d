//! Core Database Backend Traits
//!
//! The engine only needs something that can run a parameterized statement and
//! scope work in a transaction. These traits describe exactly that, so any
//! driver can sit underneath the runner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::error::MigrationResult;

/// Abstract database transaction trait
///
/// Dropping a transaction that was neither committed nor rolled back must roll
/// it back.
#[async_trait]
pub trait DatabaseTransaction: Send {
    /// Execute a statement within the transaction and return affected rows
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64>;

    /// Execute a query within the transaction and return the result rows
    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> MigrationResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> MigrationResult<()>;
}

/// Abstract database connection pool trait
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Begin a transaction on a pooled connection
    async fn begin_transaction(&self) -> MigrationResult<Box<dyn DatabaseTransaction>>;

    /// Execute a statement directly on the pool
    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64>;

    /// Execute a query directly on the pool and return the result rows
    async fn fetch_all(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>>;

    /// SQL dialect spoken by this pool
    fn dialect(&self) -> SqlDialect;

    /// Close the pool
    async fn close(&self);
}

/// Abstract database row trait
pub trait DatabaseRow: Send + Sync {
    /// Get a text column
    fn get_string(&self, column: &str) -> MigrationResult<String>;

    /// Get a nullable text column
    fn get_optional_string(&self, column: &str) -> MigrationResult<Option<String>>;

    /// Get a 32-bit integer column
    fn get_i32(&self, column: &str) -> MigrationResult<i32>;

    /// Get a timestamp column
    fn get_datetime(&self, column: &str) -> MigrationResult<DateTime<Utc>>;
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// SQL dialect enumeration for generating database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    PostgreSQL,
    SQLite,
}

impl SqlDialect {
    /// Get the parameter placeholder for a zero-based parameter index
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Column type used for ledger and lock timestamps
    pub fn timestamp_type(&self) -> &'static str {
        match self {
            SqlDialect::PostgreSQL => "TIMESTAMPTZ",
            SqlDialect::SQLite => "TEXT",
        }
    }

    /// Whether schema changes roll back together with the rest of a transaction
    pub fn supports_transactional_ddl(&self) -> bool {
        match self {
            SqlDialect::PostgreSQL | SqlDialect::SQLite => true,
        }
    }
}

/// Database backend trait that provides database-specific implementations
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Create a connection pool from a database URL
    async fn create_pool(
        &self,
        database_url: &str,
        config: DatabasePoolConfig,
    ) -> MigrationResult<Arc<dyn DatabasePool>>;

    /// Get the SQL dialect used by this backend
    fn sql_dialect(&self) -> SqlDialect;

    /// Validate a database URL for this backend
    fn validate_database_url(&self, url: &str) -> MigrationResult<()>;
}

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct DatabasePoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// How long SQLite waits on a locked database before a statement fails
    /// with `SQLITE_BUSY`
    pub busy_timeout: Duration,
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_per_dialect() {
        assert_eq!(SqlDialect::PostgreSQL.parameter_placeholder(0), "$1");
        assert_eq!(SqlDialect::PostgreSQL.parameter_placeholder(2), "$3");
        assert_eq!(SqlDialect::SQLite.parameter_placeholder(2), "?");
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<String> = None;
        assert!(DatabaseValue::from(none).is_null());
        assert_eq!(
            DatabaseValue::from(Some("x")),
            DatabaseValue::String("x".to_string())
        );
    }
}
