//! Migration System
//!
//! Discovery, ordering, planning and execution of schema migrations, plus the
//! ledger and lock tables the engine keeps in the target database.

pub mod definitions;
pub mod ledger;
pub mod lock;
pub mod manager;
pub mod plan;
pub mod registry;
pub mod report;
pub mod rollback;
pub mod runner;

pub use definitions::*;
pub use ledger::MigrationLedger;
pub use lock::{LockHolder, MigrationLock, MigrationLockGuard};
pub use manager::{split_sql_statements, DirectorySource, MigrationSource, StaticSource};
pub use plan::{MigrationAction, MigrationPlan, PlannedStep};
pub use registry::MigrationRegistry;
pub use report::*;
pub use rollback::MigrationRollback;
pub use runner::MigrationRunner;
