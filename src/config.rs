use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{ChunkError, Result};
use crate::link_access::{LinkAccess, LinkAccessFields, Locking};
use crate::storage::access::FileAccess;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Default policy applied when following external links.
    #[serde(default)]
    pub link_access: LinkAccessFields,
}

/// Defaults for opening containers.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory that relative container paths on the command line resolve against.
    #[serde(default)]
    pub base_path: Option<PathBuf>,
    /// Advisory locking for containers opened directly.
    #[serde(default = "default_locking")]
    pub locking: Locking,
    /// Buffer size used when copying raw chunks between datasets.
    #[serde(default = "default_copy_buffer_kb")]
    pub copy_buffer_kb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            locking: default_locking(),
            copy_buffer_kb: default_copy_buffer_kb(),
        }
    }
}

fn default_locking() -> Locking { Locking::Required }
fn default_copy_buffer_kb() -> usize { 1024 }

impl StorageConfig {
    /// File-access configuration for containers opened directly.
    pub fn file_access(&self) -> FileAccess {
        let mut access = FileAccess::new();
        let (use_file_locking, ignore_when_disabled) = self.locking.file_locking();
        access.set_file_locking(use_file_locking, ignore_when_disabled);
        access
    }

    /// Resolve `path` against `base_path` when it is relative.
    pub fn resolve_path(&self, path: &std::path::Path) -> PathBuf {
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChunkError::Config(format!("Cannot read config file: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ChunkError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.storage.copy_buffer_kb == 0 {
            return Err(ChunkError::Config("copy_buffer_kb must be > 0".into()));
        }
        if self.link_access.nlinks == Some(0) {
            return Err(ChunkError::Config("link_access.nlinks must be > 0".into()));
        }
        Ok(())
    }

    /// The configured default link-access policy.
    pub fn link_access(&self) -> LinkAccess {
        self.link_access.clone().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::access::AccessMode;

    #[test]
    fn test_parse_link_access_section() {
        let cfg = Config::from_toml(
            r#"
            [storage]
            locking = "best-effort"

            [link_access]
            locking = false
            mode = "r"
            swmr_mode = true
            prefix = "/archive"
            nlinks = 4
            "#,
        )
        .unwrap();

        assert_eq!(cfg.storage.locking, Locking::BestEffort);
        assert_eq!(cfg.link_access.locking, Some(Locking::Disabled));
        assert_eq!(cfg.link_access.mode, Some(AccessMode::ReadOnly));
        assert_eq!(cfg.link_access.nlinks, Some(4));
        assert!(!cfg.link_access().is_no_policy());
    }

    #[test]
    fn test_empty_config_has_no_policy() {
        let cfg = Config::from_toml("").unwrap();
        assert!(cfg.link_access().is_no_policy());
        assert_eq!(cfg.storage.locking, Locking::Required);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_toml("[link_access]\nlocking = \"maybe\"").is_err());
        assert!(Config::from_toml("[link_access]\nmode = \"w\"").is_err());
        assert!(Config::from_toml("[link_access]\nnlinks = 0").is_err());
    }
}
