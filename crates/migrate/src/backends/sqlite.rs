//! SQLite Backend Implementation
//!
//! SQLite implementation of the backend traits using sqlx. SQLite runs DDL
//! inside transactions, so it gives the same rollback guarantees as
//! PostgreSQL for a single database file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row as SqlxRow, Sqlite, Transaction};
use std::str::FromStr;
use std::sync::Arc;

use super::core::*;
use crate::error::{MigrationError, MigrationResult};

/// SQLite database backend implementation
#[derive(Debug, Default)]
pub struct SqliteBackend;

impl SqliteBackend {
    /// Create a new SQLite backend instance
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn create_pool(
        &self,
        database_url: &str,
        config: DatabasePoolConfig,
    ) -> MigrationResult<Arc<dyn DatabasePool>> {
        self.validate_database_url(database_url)?;

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| MigrationError::Configuration(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);

        // Every connection to ":memory:" is its own database
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            config.max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to create SQLite pool: {}", e)))?;

        Ok(Arc::new(SqlitePool::new(pool)))
    }

    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }

    fn validate_database_url(&self, url: &str) -> MigrationResult<()> {
        if !url.starts_with("sqlite:") {
            return Err(MigrationError::Configuration(
                "Invalid SQLite URL scheme".to_string(),
            ));
        }
        Ok(())
    }
}

/// SQLite connection pool implementation
pub struct SqlitePool {
    pool: Pool<Sqlite>,
}

impl SqlitePool {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabasePool for SqlitePool {
    async fn begin_transaction(&self) -> MigrationResult<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { inner: tx }))
    }

    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        let result = build_query(sql, params).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>> {
        let rows = build_query(sql, params).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| Box::new(SqliteRowWrapper { row }) as Box<dyn DatabaseRow>)
            .collect())
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// SQLite transaction; sqlx rolls it back if dropped uncommitted
pub struct SqliteTransaction {
    inner: Transaction<'static, Sqlite>,
}

#[async_trait]
impl DatabaseTransaction for SqliteTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        let result = build_query(sql, params).execute(&mut *self.inner).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<Box<dyn DatabaseRow>>> {
        let rows = build_query(sql, params).fetch_all(&mut *self.inner).await?;
        Ok(rows
            .into_iter()
            .map(|row| Box::new(SqliteRowWrapper { row }) as Box<dyn DatabaseRow>)
            .collect())
    }

    async fn commit(self: Box<Self>) -> MigrationResult<()> {
        self.inner.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrationResult<()> {
        self.inner.rollback().await?;
        Ok(())
    }
}

struct SqliteRowWrapper {
    row: SqliteRow,
}

impl DatabaseRow for SqliteRowWrapper {
    fn get_string(&self, column: &str) -> MigrationResult<String> {
        self.row.try_get(column).map_err(|e| column_error(column, e))
    }

    fn get_optional_string(&self, column: &str) -> MigrationResult<Option<String>> {
        self.row.try_get(column).map_err(|e| column_error(column, e))
    }

    fn get_i32(&self, column: &str) -> MigrationResult<i32> {
        self.row.try_get(column).map_err(|e| column_error(column, e))
    }

    fn get_datetime(&self, column: &str) -> MigrationResult<DateTime<Utc>> {
        self.row.try_get(column).map_err(|e| column_error(column, e))
    }
}

fn column_error(column: &str, err: sqlx::Error) -> MigrationError {
    MigrationError::Database(format!("Failed to read column '{}': {}", column, err))
}

fn build_query<'q>(
    sql: &'q str,
    params: &[DatabaseValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_database_value(query, param))
}

fn bind_database_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &DatabaseValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        DatabaseValue::Null => query.bind(None::<String>),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
    }
}
