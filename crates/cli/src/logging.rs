//! Log output for the CLI
//!
//! Logs go to stderr so that stdout only carries command output (and stays
//! parseable with `--json`).

use clap::ValueEnum;
use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Plain single-line text
    Text,
    /// One JSON object per event
    Json,
    /// Multi-line human-friendly output
    Pretty,
}

/// Logging configuration for the CLI
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level for tidemark's own targets (e.g. "info", "debug")
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>, format: LogFormat) -> Self {
        Self {
            level: level.into(),
            format,
        }
    }

    /// Dependencies stay at `warn`; only tidemark's targets follow `level`
    fn filter_directive(&self) -> String {
        format!(
            "warn,tidemark={level},tidemark_migrate={level}",
            level = self.level
        )
    }
}

/// Initialize logging; `RUST_LOG` wins over the configured level
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directive()))?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(Layer::new().with_writer(io::stderr).json())
            .try_init()?,
        LogFormat::Pretty => registry
            .with(Layer::new().with_writer(io::stderr).pretty())
            .try_init()?,
        LogFormat::Text => registry
            .with(Layer::new().with_writer(io::stderr))
            .try_init()?,
    }

    tracing::debug!(
        target: "tidemark::logging",
        "logging initialized (level: {}, format: {:?})",
        config.level,
        config.format
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        let config = LoggingConfig::new("debug", LogFormat::Json);
        assert_eq!(
            config.filter_directive(),
            "warn,tidemark=debug,tidemark_migrate=debug"
        );
    }
}
