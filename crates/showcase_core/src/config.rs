//! Catalog process configuration.
//!
//! # Responsibility
//! - Describe where the catalog database, attachments and logs live.
//! - Load settings from a JSON file with environment overrides.
//!
//! # Invariants
//! - Missing keys fall back to defaults; unknown keys are rejected.
//! - Environment overrides win over file values.

use crate::attachment::DeletePolicy;
use crate::logging::default_log_level;
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DB_PATH: &str = "SHOWCASE_DB_PATH";
pub const ENV_ATTACHMENT_DIR: &str = "SHOWCASE_ATTACHMENT_DIR";
pub const ENV_LOG_LEVEL: &str = "SHOWCASE_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "SHOWCASE_LOG_DIR";

const DEFAULT_DB_FILE_NAME: &str = "showcase.sqlite3";
const DEFAULT_ATTACHMENT_DIR: &str = "uploads";
const DEFAULT_CLEANUP_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_CLEANUP_BACKOFF_MS: u64 = 25;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
        }
    }
}

/// Settings needed to construct the catalog service handles.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    pub db_path: PathBuf,
    pub attachment_dir: PathBuf,
    pub log_level: String,
    /// Absolute directory for rolling logs; logging stays off when unset.
    pub log_dir: Option<PathBuf>,
    pub cleanup_max_attempts: u32,
    pub cleanup_backoff_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_FILE_NAME),
            attachment_dir: PathBuf::from(DEFAULT_ATTACHMENT_DIR),
            log_level: default_log_level().to_string(),
            log_dir: None,
            cleanup_max_attempts: DEFAULT_CLEANUP_MAX_ATTEMPTS,
            cleanup_backoff_ms: DEFAULT_CLEANUP_BACKOFF_MS,
        }
    }
}

impl CatalogConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(source).map_err(ConfigError::Parse)
    }

    /// Reads a JSON config file, then applies process environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_json_str(&source)?.with_overrides(|key| std::env::var(key).ok()))
    }

    /// Applies overrides from `lookup` (normally the process environment).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_blank = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(value) = non_blank(ENV_DB_PATH) {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = non_blank(ENV_ATTACHMENT_DIR) {
            self.attachment_dir = PathBuf::from(value);
        }
        if let Some(value) = non_blank(ENV_LOG_LEVEL) {
            self.log_level = value;
        }
        if let Some(value) = non_blank(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(value));
        }
        self
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        DeletePolicy {
            max_attempts: self.cleanup_max_attempts.max(1),
            backoff: Duration::from_millis(self.cleanup_backoff_ms),
        }
    }
}
