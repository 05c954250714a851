use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use serde::Deserialize;

use crate::encoding::LegacyEncoding;
use crate::error::{Error, Result};
use crate::history::StatusPolicy;
use crate::models::Shift;

/// Hard limit of the document store on writes per atomic group.
pub const MAX_ATOMIC_OPS: usize = 500;
pub const DEFAULT_CHUNK_SIZE: usize = 400;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: Option<String>,
    pub chunk_size: usize,
    pub max_atomic_ops: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub current_year: i32,
    pub recent_year_window: i32,
    pub default_shift: Shift,
    pub encoding: LegacyEncoding,
    pub matrix_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_atomic_ops: MAX_ATOMIC_OPS,
            max_retries: 3,
            retry_backoff_ms: 250,
            current_year: Utc::now().year(),
            recent_year_window: 2,
            default_shift: Shift::Morning,
            encoding: LegacyEncoding::Auto,
            matrix_file: None,
        }
    }
}

/// Shape of the optional TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    database_url: Option<String>,
    chunk_size: Option<usize>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    current_year: Option<i32>,
    recent_year_window: Option<i32>,
    default_shift: Option<Shift>,
    encoding: Option<LegacyEncoding>,
    matrix_file: Option<PathBuf>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)?;
            config.merge_toml(&content)?;
        }
        config.merge_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn merge_toml(&mut self, content: &str) -> Result<()> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid config file: {e}")))?;
        if file.database_url.is_some() {
            self.database_url = file.database_url;
        }
        if let Some(v) = file.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = file.retry_backoff_ms {
            self.retry_backoff_ms = v;
        }
        if let Some(v) = file.current_year {
            self.current_year = v;
        }
        if let Some(v) = file.recent_year_window {
            self.recent_year_window = v;
        }
        if let Some(v) = file.default_shift {
            self.default_shift = v;
        }
        if let Some(v) = file.encoding {
            self.encoding = v;
        }
        if file.matrix_file.is_some() {
            self.matrix_file = file.matrix_file;
        }
        Ok(())
    }

    fn merge_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(v) = var("RECONCILE_CHUNK_SIZE") {
            self.chunk_size = v
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("RECONCILE_CHUNK_SIZE is not a number: {v}")))?;
        }
        if let Some(v) = var("RECONCILE_CURRENT_YEAR") {
            self.current_year = v
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("RECONCILE_CURRENT_YEAR is not a year: {v}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be at least 1".to_string()));
        }
        if self.chunk_size >= self.max_atomic_ops {
            return Err(Error::Config(format!(
                "chunk_size {} must stay below the store limit of {} operations",
                self.chunk_size, self.max_atomic_ops
            )));
        }
        if self.recent_year_window < 1 {
            return Err(Error::Config("recent_year_window must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn status_policy(&self) -> StatusPolicy {
        StatusPolicy {
            current_year: self.current_year,
            recent_window: self.recent_year_window,
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| Error::Config("DATABASE_URL must be set to the document store Postgres instance".to_string()))
    }
}
