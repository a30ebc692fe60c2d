//! Migration Manager - Discovery of migration units
//!
//! Handles creating, loading, and parsing migration files from the
//! filesystem, plus a compiled-in source for units defined in code.

use chrono::Utc;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::fs;
use std::path::{Path, PathBuf};

use super::definitions::{MigrationUnit, MigrationVersion, SqlStep};
use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};

/// Somewhere migration units can be discovered from
pub trait MigrationSource: Send + Sync {
    /// Every unit this source defines, in no particular order
    fn discover(&self) -> MigrationResult<Vec<MigrationUnit>>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Units compiled into the binary
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    units: Vec<MigrationUnit>,
}

impl StaticSource {
    pub fn new(units: Vec<MigrationUnit>) -> Self {
        Self { units }
    }
}

impl MigrationSource for StaticSource {
    fn discover(&self) -> MigrationResult<Vec<MigrationUnit>> {
        Ok(self.units.clone())
    }

    fn describe(&self) -> String {
        format!("{} static unit(s)", self.units.len())
    }
}

/// `.sql` files in a directory, one unit per file.
///
/// File names are `<version>_<name>.sql` where the version is either
/// `YYYYMMDDHHMMSS` or `YYYYMMDD_HHMMSS`. Each file has an `-- Up migration`
/// section followed by a `-- Down migration` section.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Source for the configured migrations directory
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.migrations_dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new migration file from the template and return its path
    pub fn create_migration(&self, name: &str) -> MigrationResult<PathBuf> {
        let slug = name.trim().replace([' ', '-'], "_").to_lowercase();
        if slug.is_empty() || !slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(MigrationError::InvalidArgument(format!(
                "migration name '{}' may only contain letters, digits, spaces, '-' and '_'",
                name
            )));
        }

        fs::create_dir_all(&self.dir).map_err(|e| {
            MigrationError::Io(format!("Failed to create migrations directory: {}", e))
        })?;

        let now = Utc::now();
        let version = MigrationVersion::from_datetime(now);
        if let Some(existing) = self.find_file_for_version(&version)? {
            return Err(MigrationError::DuplicateVersion {
                version: version.to_string(),
                first: existing.display().to_string(),
                second: slug,
            });
        }

        let filename = format!("{}_{}.sql", now.format("%Y%m%d_%H%M%S"), slug);
        let path = self.dir.join(filename);
        fs::write(&path, migration_template(name, &version))
            .map_err(|e| MigrationError::Io(format!("Failed to write migration file: {}", e)))?;

        tracing::info!(path = %path.display(), version = %version, "created migration");
        Ok(path)
    }

    fn find_file_for_version(&self, version: &MigrationVersion) -> MigrationResult<Option<PathBuf>> {
        for path in self.sql_files()? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok((existing, _)) = parse_file_name(stem) {
                if &existing == version {
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }

    fn sql_files(&self) -> MigrationResult<Vec<PathBuf>> {
        if !self.dir.exists() {
            tracing::warn!(
                dir = %self.dir.display(),
                "migrations directory does not exist; no units loaded"
            );
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir)
            .map_err(|e| MigrationError::Io(format!("Failed to read migrations directory: {}", e)))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| MigrationError::Io(format!("Failed to read directory entry: {}", e)))?;
            let path = entry.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "sql") {
                files.push(path);
            } else {
                tracing::debug!(path = %path.display(), "skipping non-migration entry");
            }
        }
        Ok(files)
    }

    /// Parse a migration file into a unit
    fn parse_migration_file(&self, path: &Path) -> MigrationResult<MigrationUnit> {
        let origin = path.display().to_string();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| MigrationError::malformed(&origin, "file name is not valid UTF-8"))?;

        let (version, description) =
            parse_file_name(stem).map_err(|reason| MigrationError::malformed(&origin, reason))?;

        let content = fs::read_to_string(path)
            .map_err(|e| MigrationError::Io(format!("Failed to read {}: {}", origin, e)))?;
        let (up_sql, down_sql) =
            parse_migration_content(&content).map_err(|reason| MigrationError::malformed(&origin, reason))?;

        let apply = SqlStep::from_script(&up_sql);
        if apply.is_empty() {
            return Err(MigrationError::malformed(&origin, "up migration has no statements"));
        }
        let revert = SqlStep::from_script(&down_sql);
        if revert.is_empty() {
            return Err(MigrationError::malformed(&origin, "down migration has no statements"));
        }

        Ok(MigrationUnit::new(
            version,
            description,
            std::sync::Arc::new(apply),
            std::sync::Arc::new(revert),
        )
        .with_origin(origin))
    }
}

impl MigrationSource for DirectorySource {
    fn discover(&self) -> MigrationResult<Vec<MigrationUnit>> {
        let mut files = self.sql_files()?;
        // Stable error reporting; the registry does the real ordering
        files.sort();

        files
            .iter()
            .map(|path| self.parse_migration_file(path))
            .collect()
    }

    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }
}

/// Extract version and description from a file stem
fn parse_file_name(stem: &str) -> Result<(MigrationVersion, Option<String>), String> {
    let bytes = stem.as_bytes();
    let is_digits = |range: std::ops::Range<usize>| {
        bytes.len() >= range.end && bytes[range].iter().all(u8::is_ascii_digit)
    };

    let (raw_version, rest) = if is_digits(0..8) && bytes.get(8) == Some(&b'_') && is_digits(9..15) {
        (format!("{}{}", &stem[..8], &stem[9..15]), &stem[15..])
    } else if is_digits(0..14) {
        (stem[..14].to_string(), &stem[14..])
    } else {
        return Err("file name must start with YYYYMMDDHHMMSS or YYYYMMDD_HHMMSS".to_string());
    };

    if let Some(next) = rest.chars().next().filter(|c| *c != '_') {
        return Err(format!(
            "expected '_' after version in '{}', found '{}'",
            stem, next
        ));
    }

    let version = MigrationVersion::parse(&raw_version).map_err(|e| e.to_string())?;
    let name = rest.trim_start_matches('_').replace('_', " ");
    let name = name.trim();
    Ok((version, (!name.is_empty()).then(|| name.to_string())))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

/// Classify a line as a section marker
fn section_marker(line: &str) -> Option<Section> {
    let body = line.trim().strip_prefix("--")?.trim().to_lowercase();
    match body.as_str() {
        "up" | "up migration" | "+up" => Some(Section::Up),
        "down" | "down migration" | "+down" => Some(Section::Down),
        _ => None,
    }
}

/// Parse migration content to extract UP and DOWN SQL
fn parse_migration_content(content: &str) -> Result<(String, String), String> {
    let mut up_sql = Vec::new();
    let mut down_sql = Vec::new();
    let mut current = Section::Preamble;
    let mut seen_up = false;
    let mut seen_down = false;

    for line in content.lines() {
        if let Some(marker) = section_marker(line) {
            match marker {
                Section::Up if seen_up => return Err("duplicate up section".to_string()),
                Section::Up if seen_down => {
                    return Err("up section must come before down section".to_string())
                }
                Section::Up => seen_up = true,
                Section::Down if seen_down => return Err("duplicate down section".to_string()),
                Section::Down => seen_down = true,
                Section::Preamble => {}
            }
            current = marker;
            continue;
        }

        // Skip comment lines and empty lines
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }

        match current {
            Section::Up => up_sql.push(line),
            Section::Down => down_sql.push(line),
            Section::Preamble => {
                return Err("SQL found before the '-- Up migration' marker".to_string())
            }
        }
    }

    if !seen_up {
        return Err("missing '-- Up migration' section".to_string());
    }
    if !seen_down {
        return Err("missing '-- Down migration' section".to_string());
    }

    Ok((
        up_sql.join("\n").trim().to_string(),
        down_sql.join("\n").trim().to_string(),
    ))
}

/// Split SQL statements for execution using proper SQL parsing
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let dialect = GenericDialect {};

    match Parser::parse_sql(&dialect, sql) {
        Ok(parsed) => parsed.into_iter().map(|stmt| format!("{};", stmt)).collect(),
        Err(e) => {
            // Dialect-specific syntax the generic parser rejects still runs as written
            tracing::warn!("SQL parsing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| format!("{};", s))
                .collect()
        }
    }
}

/// Create migration template content
fn migration_template(name: &str, version: &MigrationVersion) -> String {
    format!(
        "-- Migration: {}\n\
         -- Version: {}\n\
         -- Created: {}\n\n\
         -- Up migration\n\n\n\
         -- Down migration\n\n",
        name,
        version,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}
