mod commands;
mod logging;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use commands::migrate;
use logging::{LogFormat, LoggingConfig};

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "Versioned schema migrations for PostgreSQL and SQLite")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Database connection URL (postgres://... or sqlite:...)
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Directory holding the migration files
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Ledger table name
    #[arg(long, global = true)]
    pub table: Option<String>,

    /// Seconds to wait for the migration lock
    #[arg(long, global = true)]
    pub lock_timeout: Option<u64>,

    /// Seconds without a heartbeat after which a lock counts as abandoned
    #[arg(long, global = true)]
    pub lock_stale_after: Option<u64>,

    /// Print reports as JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    /// Log level for tidemark output
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Up {
        /// Stop after this version (YYYYMMDDHHMMSS)
        #[arg(long)]
        to: Option<String>,

        /// Show what would be applied without touching the schema
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back applied migrations, most recent first
    Down {
        /// Number of migrations to roll back
        #[arg(long, default_value_t = 1, conflicts_with = "batch")]
        steps: usize,

        /// Roll back everything applied by the latest `up`
        #[arg(long)]
        batch: bool,
    },

    /// Roll back every applied migration
    Reset,

    /// Show applied, pending and orphaned migrations
    Status,

    /// Create a new migration file
    Create {
        /// Migration name
        name: String,
    },

    /// Remove a migration lock left behind by a killed process
    Unlock,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LoggingConfig::new(cli.global.log_level.clone(), cli.global.log_format);
    if let Err(e) = logging::init_logging(&logging) {
        eprintln!("Error: invalid logging configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let global = &cli.global;

    match cli.command {
        Commands::Up { to, dry_run } => migrate::up(global, to.as_deref(), dry_run).await,
        Commands::Down { steps, batch } => migrate::down(global, steps, batch).await,
        Commands::Reset => migrate::reset(global).await,
        Commands::Status => migrate::status(global).await,
        Commands::Create { name } => migrate::create(global, &name),
        Commands::Unlock => migrate::unlock(global).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tidemark",
            "up",
            "--to",
            "20240101000000",
            "--database-url",
            "sqlite::memory:",
            "--json",
        ])
        .unwrap();

        assert!(cli.global.json);
        assert_eq!(cli.global.database_url.as_deref(), Some("sqlite::memory:"));
        match cli.command {
            Commands::Up { to, dry_run } => {
                assert_eq!(to.as_deref(), Some("20240101000000"));
                assert!(!dry_run);
            }
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn test_down_defaults_to_one_step() {
        let cli = Cli::try_parse_from(["tidemark", "down"]).unwrap();
        match cli.command {
            Commands::Down { steps, batch } => {
                assert_eq!(steps, 1);
                assert!(!batch);
            }
            _ => panic!("expected down"),
        }
    }

    #[test]
    fn test_usage_errors() {
        assert!(Cli::try_parse_from(["tidemark", "down", "--steps", "two"]).is_err());
        assert!(Cli::try_parse_from(["tidemark", "down", "--steps", "2", "--batch"]).is_err());
        assert!(Cli::try_parse_from(["tidemark", "sideways"]).is_err());
    }
}
