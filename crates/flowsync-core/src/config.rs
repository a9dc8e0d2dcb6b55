// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables and the sources file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{DataSourceId, EntityType, SourceKind};

/// Importer process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or file path of the document store
    pub database_url: String,
    /// JSON file listing the data sources
    pub sources_file: PathBuf,
    /// Import engine tuning
    pub import: ImportConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FLOWSYNC_DATABASE_URL`: SQLite URL or database file path
    /// - `FLOWSYNC_SOURCES_FILE`: JSON file with the data source list
    ///
    /// Optional tuning variables are documented on [`ImportConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FLOWSYNC_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FLOWSYNC_DATABASE_URL"))?;

        let sources_file = std::env::var("FLOWSYNC_SOURCES_FILE")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("FLOWSYNC_SOURCES_FILE"))?;

        Ok(Self {
            database_url,
            sources_file,
            import: ImportConfig::from_env()?,
        })
    }
}

/// Tuning shared by every scheduler of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    /// Maximum boolean clauses per store query.
    pub max_clause_count: usize,
    /// Default page size.
    pub page_size: usize,
    /// Lower bound of the adaptive page size.
    pub min_page_size: usize,
    /// Upper bound of the adaptive page size.
    pub max_page_size: usize,
    /// Most recent upstream time excluded from timestamp fetches.
    pub skew_window: Duration,
    /// Consecutive empty sequence rounds before one position scan.
    pub gap_scan_after_empty_rounds: u32,
    /// First backoff step.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Interval between checkpoint flushes.
    pub checkpoint_flush_interval: Duration,
    /// Timeout of one upstream fetch.
    pub fetch_timeout: Duration,
    /// Timeout of one store write.
    pub write_timeout: Duration,
    /// Sleep between scheduler cycles.
    pub tick_interval: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_clause_count: 1024,
            page_size: 1000,
            min_page_size: 10,
            max_page_size: 10_000,
            skew_window: Duration::from_millis(2000),
            gap_scan_after_empty_rounds: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            checkpoint_flush_interval: Duration::from_millis(5000),
            fetch_timeout: Duration::from_millis(30_000),
            write_timeout: Duration::from_millis(30_000),
            tick_interval: Duration::from_millis(500),
        }
    }
}

fn env_or<T: FromStr>(
    key: &'static str,
    default: T,
    hint: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, hint)),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_or(key, default_ms, "must be a number of milliseconds").map(Duration::from_millis)
}

impl ImportConfig {
    /// Load tuning from environment variables, falling back to defaults.
    ///
    /// - `FLOWSYNC_MAX_CLAUSE_COUNT` (default: 1024)
    /// - `FLOWSYNC_PAGE_SIZE` (default: 1000)
    /// - `FLOWSYNC_MIN_PAGE_SIZE` / `FLOWSYNC_MAX_PAGE_SIZE` (default: 10 / 10000)
    /// - `FLOWSYNC_SKEW_WINDOW_MS` (default: 2000)
    /// - `FLOWSYNC_GAP_SCAN_AFTER_EMPTY_ROUNDS` (default: 3)
    /// - `FLOWSYNC_BACKOFF_BASE_MS` / `FLOWSYNC_BACKOFF_MAX_MS` (default: 1000 / 30000)
    /// - `FLOWSYNC_CHECKPOINT_FLUSH_INTERVAL_MS` (default: 5000)
    /// - `FLOWSYNC_FETCH_TIMEOUT_MS` / `FLOWSYNC_WRITE_TIMEOUT_MS` (default: 30000)
    /// - `FLOWSYNC_TICK_INTERVAL_MS` (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            max_clause_count: env_or(
                "FLOWSYNC_MAX_CLAUSE_COUNT",
                defaults.max_clause_count,
                "must be a positive integer",
            )?,
            page_size: env_or(
                "FLOWSYNC_PAGE_SIZE",
                defaults.page_size,
                "must be a positive integer",
            )?,
            min_page_size: env_or(
                "FLOWSYNC_MIN_PAGE_SIZE",
                defaults.min_page_size,
                "must be a positive integer",
            )?,
            max_page_size: env_or(
                "FLOWSYNC_MAX_PAGE_SIZE",
                defaults.max_page_size,
                "must be a positive integer",
            )?,
            skew_window: env_millis("FLOWSYNC_SKEW_WINDOW_MS", defaults.skew_window)?,
            gap_scan_after_empty_rounds: env_or(
                "FLOWSYNC_GAP_SCAN_AFTER_EMPTY_ROUNDS",
                defaults.gap_scan_after_empty_rounds,
                "must be a non-negative integer",
            )?,
            backoff_base: env_millis("FLOWSYNC_BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_max: env_millis("FLOWSYNC_BACKOFF_MAX_MS", defaults.backoff_max)?,
            checkpoint_flush_interval: env_millis(
                "FLOWSYNC_CHECKPOINT_FLUSH_INTERVAL_MS",
                defaults.checkpoint_flush_interval,
            )?,
            fetch_timeout: env_millis("FLOWSYNC_FETCH_TIMEOUT_MS", defaults.fetch_timeout)?,
            write_timeout: env_millis("FLOWSYNC_WRITE_TIMEOUT_MS", defaults.write_timeout)?,
            tick_interval: env_millis("FLOWSYNC_TICK_INTERVAL_MS", defaults.tick_interval)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clause_count == 0 {
            return Err(ConfigError::Invalid(
                "FLOWSYNC_MAX_CLAUSE_COUNT",
                "must be greater than zero",
            ));
        }
        if self.min_page_size == 0 || self.min_page_size > self.max_page_size {
            return Err(ConfigError::Invalid(
                "FLOWSYNC_MIN_PAGE_SIZE",
                "must be between 1 and FLOWSYNC_MAX_PAGE_SIZE",
            ));
        }
        if self.page_size < self.min_page_size || self.page_size > self.max_page_size {
            return Err(ConfigError::Invalid(
                "FLOWSYNC_PAGE_SIZE",
                "must lie within the min/max page size bounds",
            ));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::Invalid(
                "FLOWSYNC_BACKOFF_BASE_MS",
                "must not exceed FLOWSYNC_BACKOFF_MAX_MS",
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn all_entities() -> Vec<EntityType> {
    EntityType::ALL.to_vec()
}

/// One entry of the sources file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Unique data source id (engine alias or log partition name).
    pub id: DataSourceId,
    /// Engine history or exported event log.
    pub kind: SourceKind,
    /// Directory holding one `<entity>.jsonl` file per entity type.
    pub path: PathBuf,
    /// Sources with import disabled register a scheduler that runs no rounds.
    #[serde(default = "default_true")]
    pub import_enabled: bool,
    /// Entity streams to import.
    #[serde(default = "all_entities")]
    pub entities: Vec<EntityType>,
    /// Tenants whose records are dropped.
    #[serde(default)]
    pub excluded_tenants: Vec<String>,
    /// Tenant assigned to records that carry none.
    #[serde(default)]
    pub default_tenant_id: Option<String>,
}

impl DataSourceConfig {
    /// A source importing every entity type with default settings.
    pub fn new(id: impl Into<DataSourceId>, kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kind,
            path: path.into(),
            import_enabled: true,
            entities: all_entities(),
            excluded_tenants: Vec::new(),
            default_tenant_id: None,
        }
    }
}

/// Read and validate the sources file.
pub fn load_sources(path: &Path) -> Result<Vec<DataSourceConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let sources: Vec<DataSourceConfig> = serde_json::from_str(&raw)?;
    validate_sources(&sources)?;
    Ok(sources)
}

/// Reject empty or duplicate ids and empty entity lists.
pub fn validate_sources(sources: &[DataSourceConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for source in sources {
        if source.id.as_str().trim().is_empty() {
            return Err(ConfigError::Source {
                id: source.id.to_string(),
                reason: "id must not be empty".to_string(),
            });
        }
        if !seen.insert(source.id.clone()) {
            return Err(ConfigError::Source {
                id: source.id.to_string(),
                reason: "duplicate data source id".to_string(),
            });
        }
        if source.entities.is_empty() {
            return Err(ConfigError::Source {
                id: source.id.to_string(),
                reason: "at least one entity type is required".to_string(),
            });
        }
    }
    Ok(())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),

    /// The sources file could not be read.
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The sources file is not valid JSON for the expected shape.
    #[error("invalid sources file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A data source entry is invalid.
    #[error("invalid data source '{id}': {reason}")]
    Source {
        /// Offending data source id.
        id: String,
        /// What is wrong with it.
        reason: String,
    },
}
