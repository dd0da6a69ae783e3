use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::{jlog_debug, Error, Result};

/// Concurrency limit used when a caller does not pick one.
pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Root directory holding one task store directory per job.
    pub store_root: Option<String>,
    /// File the CLI keeps job records in.
    pub jobs_file: Option<String>,
    pub default_concurrency: Option<usize>,
}

impl Config {
    pub fn home_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".bgjobs"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("bgjobs.toml"))
    }

    pub fn store_root(&self) -> Result<PathBuf> {
        match &self.store_root {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::home_dir()?.join("background-jobs-dbs")),
        }
    }

    pub fn jobs_file(&self) -> Result<PathBuf> {
        match &self.jobs_file {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::home_dir()?.join("jobs.json")),
        }
    }

    pub fn effective_concurrency(&self) -> usize {
        self.default_concurrency
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        jlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            jlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        jlog_debug!(
            "Config loaded: store_root={:?}, jobs_file={:?}, default_concurrency={:?}",
            config.store_root,
            config.jobs_file,
            config.default_concurrency
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::home_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        jlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Create the store root (and the jobs file's parent) if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        let root = self.store_root()?;
        if !root.exists() {
            jlog_debug!("Creating store root: {}", root.display());
            fs::create_dir_all(&root)?;
        }
        if let Some(parent) = self.jobs_file()?.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
