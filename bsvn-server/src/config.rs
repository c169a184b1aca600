//! Server configuration
//!
//! Read from `<repo>/conf/svnserve.toml` or the file named by `--config`:
//!
//! ```toml
//! [general]
//! anon-access = "read"
//! auth-access = "write"
//! realm = "My Repository"
//!
//! [users]
//! harry = "harryssecret"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// What a class of users may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct General {
    pub anon_access: AccessLevel,
    pub auth_access: AccessLevel,
    pub realm: Option<String>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            anon_access: AccessLevel::Read,
            auth_access: AccessLevel::Write,
            realm: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub general: General,
    /// User name to password, for CRAM-MD5
    pub users: BTreeMap<String, String>,
}

impl ServeConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid server configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// The explicit config file if given, else `<root>/conf/svnserve.toml`
    /// if it exists, else defaults.
    pub fn locate(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default_path = root.join("conf").join("svnserve.toml");
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Whether authenticated users can sign in at all
    pub fn allows_auth(&self) -> bool {
        self.general.auth_access > AccessLevel::None && !self.users.is_empty()
    }

    pub fn realm(&self, uuid: &str) -> String {
        self.general.realm.clone().unwrap_or_else(|| uuid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServeConfig::from_toml("").unwrap();
        assert_eq!(config.general.anon_access, AccessLevel::Read);
        assert_eq!(config.general.auth_access, AccessLevel::Write);
        assert!(!config.allows_auth());
        assert_eq!(config.realm("some-uuid"), "some-uuid");
    }

    #[test]
    fn test_parse_full_file() {
        let config = ServeConfig::from_toml(
            r#"
            [general]
            anon-access = "none"
            auth-access = "write"
            realm = "Sandbox"

            [users]
            harry = "harryssecret"
            "#,
        )
        .unwrap();
        assert_eq!(config.general.anon_access, AccessLevel::None);
        assert_eq!(config.users["harry"], "harryssecret");
        assert!(config.allows_auth());
        assert_eq!(config.realm("x"), "Sandbox");
    }

    #[test]
    fn test_bad_access_level_rejected() {
        assert!(ServeConfig::from_toml("[general]\nanon-access = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_locate_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ServeConfig::locate(dir.path(), None).unwrap();
        assert!(config.users.is_empty());

        std::fs::create_dir(dir.path().join("conf")).unwrap();
        std::fs::write(dir.path().join("conf/svnserve.toml"), "[users]\nsally = \"pw\"\n").unwrap();
        let config = ServeConfig::locate(dir.path(), None).unwrap();
        assert_eq!(config.users["sally"], "pw");
    }
}
