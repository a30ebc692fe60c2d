//! # tidemark-migrate: Versioned schema migrations
//!
//! Applies ordered, reversible schema changes to a relational database and
//! records which ones are applied in a ledger table inside that database.
//!
//! Units are discovered from a directory of `.sql` files or registered in
//! code, ordered by their `YYYYMMDDHHMMSS` version, and executed one
//! transaction at a time under a cross-process lock. PostgreSQL and SQLite are
//! supported through sqlx.

pub mod backends;
pub mod config;
pub mod error;
pub mod migrations;

pub use backends::{connect, DatabaseBackendType, DatabasePool, DatabasePoolConfig, SqlDialect};
pub use config::{ConfigError, MigrationConfig};
pub use error::{ErrorKind, MigrationError, MigrationResult};
pub use migrations::*;
