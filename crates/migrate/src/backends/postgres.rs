//! PostgreSQL Backend Implementation
//!
//! PostgreSQL implementation of the backend traits using sqlx as the
//! underlying driver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Pool, Postgres, Row as SqlxRow, Transaction};
use std::sync::Arc;

use super::core::*;
use crate::error::{MigrationError, MigrationResult};

/// PostgreSQL database backend implementation
#[derive(Debug, Default)]
pub struct PostgresBackend;

impl PostgresBackend {
    /// Create a new PostgreSQL backend instance
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn create_pool(
        &self,
        database_url: &str,
        config: DatabasePoolConfig,
    ) -> MigrationResult<Arc<dyn DatabasePool>> {
        self.validate_database_url(database_url)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| {
                MigrationError::Database(format!("Failed to create PostgreSQL pool: {}", e))
            })?;

        Ok(Arc::new(PostgresPool::new(pool)))
    }

    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }

    fn validate_database_url(&self, url: &str) -> MigrationResult<()> {
        if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
            return Err(MigrationError::Configuration(
                "Invalid PostgreSQL URL scheme".to_string(),
            ));
        }
        Ok(())
    }
}

/// PostgreSQL connection pool implementation
pub struct PostgresPool {
    pool: Pool<Postgres>,
}

impl PostgresPool {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn begin_transaction(&self) -> MigrationResult<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { inner: tx }))
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
            .map(|row| Box::new(PostgresRow::new(row)) as Box<dyn DatabaseRow>)
            .collect())
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// PostgreSQL transaction; sqlx rolls it back if dropped uncommitted
pub struct PostgresTransaction {
    inner: Transaction<'static, Postgres>,
}

#[async_trait]
impl DatabaseTransaction for PostgresTransaction {
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
            .map(|row| Box::new(PostgresRow::new(row)) as Box<dyn DatabaseRow>)
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

/// PostgreSQL row wrapper
pub struct PostgresRow {
    row: PgRow,
}

impl PostgresRow {
    pub fn new(row: PgRow) -> Self {
        Self { row }
    }
}

impl DatabaseRow for PostgresRow {
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

fn build_query<'q>(sql: &'q str, params: &[DatabaseValue]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_database_value(query, param))
}

/// Bind a DatabaseValue to a PostgreSQL query
fn bind_database_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(None::<String>),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
    }
}
