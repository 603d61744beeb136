//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating store settings
//! from JSON files and environment variables.
//!
//! ## Environment Variables
//!
//! - `PAGECRYPT_KEY_PATH`: Override page key file path
//! - `PAGECRYPT_STORAGE_DIR`: Override storage directory path
//! - `PAGECRYPT_CONFIG`: Override config file path
//! - `PAGECRYPT_DISPATCH`: Override dispatch strategy (`serial` or `batched`)

use crate::dispatch::Dispatch;
use crate::segment::PageGeometry;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Environment variable names for configuration overrides
pub const ENV_KEY_PATH: &str = "PAGECRYPT_KEY_PATH";
pub const ENV_STORAGE_DIR: &str = "PAGECRYPT_STORAGE_DIR";
pub const ENV_CONFIG_PATH: &str = "PAGECRYPT_CONFIG";
pub const ENV_DISPATCH: &str = "PAGECRYPT_DISPATCH";

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_CACHE_PAGES: usize = 256;

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_cache_pages() -> usize {
    DEFAULT_CACHE_PAGES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub key_path: String,
    pub storage_dir: String,
    /// Page size for newly created files; existing files keep theirs.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Pages each open file may keep cached or locked at once.
    #[serde(default = "default_cache_pages")]
    pub cache_pages: usize,
    #[serde(default)]
    pub dispatch: Dispatch,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_path: "./pagecrypt.key".to_string(),
            storage_dir: "./storage".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: DEFAULT_CACHE_PAGES,
            dispatch: Dispatch::default(),
        }
    }
}

/// Per-file cache budget above which [`Config::validate`] warns.
const CACHE_WARN_BYTES: usize = 1 << 30;

impl Config {
    /// Load config from a JSON file, then apply environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file falls back to defaults.
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                Self::from_file(p)?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(key_path) = env::var(ENV_KEY_PATH) {
            debug!(key_path = %key_path, "overriding key_path from environment");
            self.key_path = key_path;
        }
        if let Ok(storage_dir) = env::var(ENV_STORAGE_DIR) {
            debug!(storage_dir = %storage_dir, "overriding storage_dir from environment");
            self.storage_dir = storage_dir;
        }
        if let Ok(dispatch) = env::var(ENV_DISPATCH) {
            debug!(dispatch = %dispatch, "overriding dispatch from environment");
            self.dispatch = dispatch
                .parse()
                .with_context(|| format!("parsing {}", ENV_DISPATCH))?;
        }
        Ok(())
    }

    /// Reject settings no file could be opened with; warn about risky ones.
    pub fn validate(&self) -> Result<()> {
        if self.key_path.trim().is_empty() {
            anyhow::bail!("key_path cannot be empty");
        }
        if self.storage_dir.trim().is_empty() {
            anyhow::bail!("storage_dir cannot be empty");
        }
        PageGeometry::new(self.page_size).context("invalid page_size")?;
        if self.cache_pages == 0 {
            anyhow::bail!("cache_pages must be at least 1");
        }

        // the key would show up as a stored file and be deletable through the CLI
        if Path::new(&self.key_path).parent() == Some(Path::new(&self.storage_dir)) {
            warn!(
                key_path = %self.key_path,
                storage_dir = %self.storage_dir,
                "key file lives inside the storage directory"
            );
        }

        let budget = self.cache_pages.saturating_mul(self.page_size);
        if budget > CACHE_WARN_BYTES {
            warn!(
                cache_pages = self.cache_pages,
                page_size = self.page_size,
                "page cache may hold over 1 GiB per open file"
            );
        }

        Ok(())
    }

    /// Create a new config with explicit paths and default geometry
    pub fn new(key_path: impl Into<String>, storage_dir: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"key_path": "k.bin", "storage_dir": "store"}"#).unwrap();
        assert_eq!(cfg.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(cfg.cache_pages, DEFAULT_CACHE_PAGES);
        assert_eq!(cfg.dispatch, Dispatch::Serial);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::new("k.bin", "store");
        cfg.page_size = 3000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::new("k.bin", "store");
        cfg.cache_pages = 0;
        assert!(cfg.validate().is_err());

        assert!(Config::new("  ", "store").validate().is_err());
    }

    #[test]
    fn test_dispatch_read_from_file() {
        let cfg: Config = serde_json::from_str(
            r#"{"key_path": "k.bin", "storage_dir": "s", "page_size": 8192, "dispatch": "batched"}"#,
        )
        .unwrap();
        assert_eq!(cfg.dispatch, Dispatch::Batched);
        assert_eq!(cfg.page_size, 8192);
    }
}
