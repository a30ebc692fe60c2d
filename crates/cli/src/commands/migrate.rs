//! `up`, `down`, `reset`, `status`, `create` and `unlock`

use anyhow::{bail, Context};
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tidemark_migrate::backends::{connect, redact_url, DatabasePool, DatabasePoolConfig};
use tidemark_migrate::{
    DirectorySource, MigrationAction, MigrationConfig, MigrationLock, MigrationPlan,
    MigrationRegistry, MigrationReport, MigrationRollback, MigrationRunner, MigrationState,
    MigrationVersion, StatusReport,
};

use crate::GlobalArgs;

/// Engine configuration: environment first, then command-line flags
fn load_config(global: &GlobalArgs) -> anyhow::Result<MigrationConfig> {
    let mut config = MigrationConfig::from_env()?;

    if let Some(dir) = &global.migrations_dir {
        config = config.with_migrations_dir(dir);
    }
    if let Some(table) = &global.table {
        config = config.with_migrations_table(table);
    }
    if let Some(secs) = global.lock_timeout {
        config = config.with_lock_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = global.lock_stale_after {
        config = config.with_lock_stale_after(Duration::from_secs(secs));
    }

    config.validate()?;
    Ok(config)
}

/// A directory named by flag or environment must exist; the default may be absent
fn check_migrations_dir(global: &GlobalArgs, config: &MigrationConfig) -> anyhow::Result<()> {
    let explicit =
        global.migrations_dir.is_some() || std::env::var_os("TIDEMARK_MIGRATIONS_DIR").is_some();
    if explicit && !config.migrations_dir.is_dir() {
        bail!(
            "migrations directory {} does not exist",
            config.migrations_dir.display()
        );
    }
    Ok(())
}

async fn open_pool(
    global: &GlobalArgs,
    config: &MigrationConfig,
) -> anyhow::Result<Arc<dyn DatabasePool>> {
    let Some(url) = global.database_url.as_deref() else {
        bail!("no database configured; set DATABASE_URL or pass --database-url");
    };

    // Statements wait on a busy SQLite file for as long as we wait on the lock
    let pool_config = DatabasePoolConfig {
        busy_timeout: config.lock_timeout,
        ..DatabasePoolConfig::default()
    };

    tracing::debug!(url = %redact_url(url), "opening database");
    let pool = connect(url, pool_config)
        .await
        .with_context(|| format!("failed to connect to {}", redact_url(url)))?;
    Ok(pool)
}

async fn open_runner(global: &GlobalArgs) -> anyhow::Result<MigrationRunner> {
    let config = load_config(global)?;
    check_migrations_dir(global, &config)?;
    let source = DirectorySource::from_config(&config);
    let registry = MigrationRegistry::load_all(&source)?;
    tracing::debug!(count = registry.len(), "loaded migrations from {}", source.dir().display());

    let pool = open_pool(global, &config).await?;
    Ok(MigrationRunner::new(pool, registry, config)?)
}

pub async fn up(global: &GlobalArgs, to: Option<&str>, dry_run: bool) -> anyhow::Result<ExitCode> {
    let target = to.map(MigrationVersion::parse).transpose()?;
    let runner = open_runner(global).await?;

    let code = if dry_run {
        let plan = runner.plan_up(target.as_ref()).await?;
        print_plan(global, &plan)?;
        ExitCode::SUCCESS
    } else {
        let report = runner.migrate_up(target.as_ref()).await?;
        print_report(global, &report)?
    };

    runner.pool().close().await;
    Ok(code)
}

pub async fn down(global: &GlobalArgs, steps: usize, batch: bool) -> anyhow::Result<ExitCode> {
    let runner = open_runner(global).await?;
    let report = if batch {
        runner.rollback_last_batch().await?
    } else {
        runner.migrate_down(steps).await?
    };

    let code = print_report(global, &report)?;
    runner.pool().close().await;
    Ok(code)
}

pub async fn reset(global: &GlobalArgs) -> anyhow::Result<ExitCode> {
    let runner = open_runner(global).await?;
    let report = runner.reset().await?;

    let code = print_report(global, &report)?;
    runner.pool().close().await;
    Ok(code)
}

pub async fn status(global: &GlobalArgs) -> anyhow::Result<ExitCode> {
    let runner = open_runner(global).await?;
    let report = runner.status().await?;

    for warning in report.warnings() {
        eprintln!("warning: {}", warning);
    }
    print_status(global, &report)?;

    runner.pool().close().await;
    Ok(ExitCode::SUCCESS)
}

pub fn create(global: &GlobalArgs, name: &str) -> anyhow::Result<ExitCode> {
    let config = load_config(global)?;
    let path = DirectorySource::from_config(&config).create_migration(name)?;

    if global.json {
        println!("{}", json!({ "created": path.display().to_string() }));
    } else {
        println!("Created migration: {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn unlock(global: &GlobalArgs) -> anyhow::Result<ExitCode> {
    let config = load_config(global)?;
    let pool = open_pool(global, &config).await?;
    let lock = MigrationLock::from_config(&config, pool.dialect());

    let holder = lock.current_holder(pool.as_ref()).await?;
    let released = lock.force_release(pool.as_ref()).await?;

    if global.json {
        println!(
            "{}",
            json!({
                "released": released,
                "holder": holder.as_ref().map(|h| h.holder.clone()),
            })
        );
    } else {
        match holder {
            Some(holder) if released => println!(
                "Released migration lock held by {} since {}",
                holder.holder,
                holder.acquired_at.to_rfc3339()
            ),
            _ => println!("No migration lock was held"),
        }
    }

    pool.close().await;
    Ok(ExitCode::SUCCESS)
}

/// Print a run report; a halted run exits non-zero
fn print_report(global: &GlobalArgs, report: &MigrationReport) -> anyhow::Result<ExitCode> {
    if global.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        for version in &report.applied {
            println!("Applied   {}", version);
        }
        for version in &report.reverted {
            println!("Reverted  {}", version);
        }
        if report.changed().is_empty() && report.failure.is_none() {
            println!("Nothing to do");
        }
        println!(
            "{} migration(s) in {}ms",
            report.changed().len(),
            report.execution_time_ms
        );
    }

    match &report.failure {
        Some(failure) => {
            eprintln!("Migration halted at {}: {}", failure.version, failure.message);
            if !report.remaining.is_empty() {
                let remaining: Vec<String> =
                    report.remaining.iter().map(|v| v.to_string()).collect();
                eprintln!("Not attempted: {}", remaining.join(", "));
            }
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

fn print_plan(global: &GlobalArgs, plan: &MigrationPlan) -> anyhow::Result<()> {
    if global.json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }

    if plan.is_empty() {
        println!("Nothing to apply");
        return Ok(());
    }
    for step in plan.actionable() {
        let verb = match step.action {
            MigrationAction::Apply => "apply",
            MigrationAction::Revert => "revert",
            MigrationAction::Skip => continue,
        };
        println!(
            "Would {} {} {}",
            verb,
            step.version,
            step.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn print_status(global: &GlobalArgs, report: &StatusReport) -> anyhow::Result<()> {
    if global.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Migration Status:");
    println!("================");
    if report.entries.is_empty() {
        println!("No migrations found");
        return Ok(());
    }

    for entry in &report.entries {
        let description = entry.description.as_deref().unwrap_or("");
        match &entry.state {
            MigrationState::Applied { applied_at, batch } => println!(
                "  applied   {}  {}  (batch {}, {})",
                entry.version,
                description,
                batch,
                applied_at.to_rfc3339()
            ),
            MigrationState::Pending => println!("  pending   {}  {}", entry.version, description),
            MigrationState::Orphaned { applied_at, batch } => println!(
                "  orphaned  {}  {}  (batch {}, {})",
                entry.version,
                description,
                batch,
                applied_at.to_rfc3339()
            ),
        }
    }

    println!(
        "\n{} applied, {} pending, {} orphaned",
        report.applied().count(),
        report.pending().count(),
        report.orphaned().count()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;
    use std::path::PathBuf;

    fn global(migrations_dir: Option<PathBuf>) -> GlobalArgs {
        GlobalArgs {
            database_url: None,
            migrations_dir,
            table: None,
            lock_timeout: None,
            lock_stale_after: None,
            json: false,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }

    #[test]
    fn test_explicit_missing_migrations_dir_is_an_error() {
        let missing = std::env::temp_dir().join("tidemark-no-such-migrations-dir");
        let args = global(Some(missing.clone()));
        let config = MigrationConfig::default().with_migrations_dir(&missing);

        let err = check_migrations_dir(&args, &config).unwrap_err();
        assert!(err.to_string().contains("does not exist"), "{}", err);

        let present = MigrationConfig::default().with_migrations_dir(std::env::temp_dir());
        assert!(check_migrations_dir(&global(Some(std::env::temp_dir())), &present).is_ok());
    }
}
