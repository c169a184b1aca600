//! Filesystem configuration
//!
//! Stored at `repo/fs-config.json`; a missing file means defaults.

use crate::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "fs-config.json";

/// Tunables for the storage layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// How long the KV engine waits on a lock before reporting a retryable conflict
    pub busy_timeout_ms: u64,
    /// Retry bound for trails; the retryable error surfaces past this
    pub max_trail_retries: u32,
    /// Rewrite predecessor representations as deltas at commit
    pub deltify_on_commit: bool,
    /// Size of the text windows svndiff deltas are cut into
    pub delta_window_size: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            max_trail_retries: 100,
            deltify_on_commit: true,
            delta_window_size: 102400,
        }
    }
}

impl FsConfig {
    /// Load the config from a repository directory
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: FsConfig = serde_json::from_str(&data)
            .map_err(|e| FsError::Config(format!("{}: {}", config_path.display(), e)))?;
        if config.delta_window_size == 0 {
            return Err(FsError::Config("delta_window_size must be positive".into()));
        }
        Ok(config)
    }

    /// Save the config into a repository directory
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self).map_err(|e| FsError::Config(e.to_string()))?;
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(FsConfig::load(dir.path()).unwrap(), FsConfig::default());
    }

    #[test]
    fn test_save_load_and_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig {
            max_trail_retries: 3,
            deltify_on_commit: false,
            ..FsConfig::default()
        };
        config.save(dir.path()).unwrap();
        assert_eq!(FsConfig::load(dir.path()).unwrap(), config);

        fs::write(dir.path().join(CONFIG_FILE), r#"{"busy_timeout_ms": 10}"#).unwrap();
        let partial = FsConfig::load(dir.path()).unwrap();
        assert_eq!(partial.busy_timeout_ms, 10);
        assert_eq!(partial.max_trail_retries, 100);

        fs::write(dir.path().join(CONFIG_FILE), "not json").unwrap();
        assert!(matches!(FsConfig::load(dir.path()), Err(FsError::Config(_))));
    }
}
