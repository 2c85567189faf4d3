//! Installation configuration
//!
//! Defines the configuration structure for a patch run.

use crate::downloader::DEFAULT_CONCURRENCY;
use crate::patchlist::{ManifestSource, PatchEndpoints};
use std::path::PathBuf;

/// Upper bound on simultaneous patch downloads
pub const MAX_CONCURRENT_DOWNLOADS: usize = 16;

/// Configuration for a patch run
#[derive(Debug, Clone)]
pub struct InstallConfig {
    /// Game root (the directory holding `boot/` and `game/`)
    pub game_path: PathBuf,

    /// Directory for downloaded patch files
    pub patch_store: PathBuf,

    /// Maximum concurrent downloads
    pub max_concurrent_downloads: usize,

    /// Patch server base URLs
    pub endpoints: PatchEndpoints,

    /// Where the patch list comes from
    pub source: ManifestSource,

    /// Keep patch files after they have been applied
    pub keep_patches: bool,
}

impl InstallConfig {
    pub fn new(game_path: impl Into<PathBuf>, patch_store: impl Into<PathBuf>, source: ManifestSource) -> Self {
        Self {
            game_path: game_path.into(),
            patch_store: patch_store.into(),
            max_concurrent_downloads: DEFAULT_CONCURRENCY,
            endpoints: PatchEndpoints::default(),
            source,
            keep_patches: true,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.game_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingGamePath);
        }

        if self.game_path.exists() && !self.game_path.is_dir() {
            return Err(ConfigError::GamePathNotDirectory(self.game_path.clone()));
        }

        if self.patch_store.as_os_str().is_empty() {
            return Err(ConfigError::MissingPatchStore);
        }

        if self.max_concurrent_downloads == 0 || self.max_concurrent_downloads > MAX_CONCURRENT_DOWNLOADS {
            return Err(ConfigError::InvalidConcurrency(self.max_concurrent_downloads));
        }

        for url in [&self.endpoints.boot_base, &self.endpoints.game_base] {
            if !is_http_url(url) {
                return Err(ConfigError::InvalidEndpoint(url.clone()));
            }
        }

        match &self.source {
            ManifestSource::Public { url } if !is_http_url(url) => {
                Err(ConfigError::InvalidEndpoint(url.clone()))
            }
            ManifestSource::Authenticated { session_id, .. } if session_id.trim().is_empty() => {
                Err(ConfigError::MissingSession)
            }
            _ => Ok(()),
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Game path is required")]
    MissingGamePath,

    #[error("Game path is not a directory: {0}")]
    GamePathNotDirectory(PathBuf),

    #[error("Patch store directory is required")]
    MissingPatchStore,

    #[error("Concurrent downloads must be between 1 and {max}, got {0}", max = MAX_CONCURRENT_DOWNLOADS)]
    InvalidConcurrency(usize),

    #[error("Not an http(s) URL: {0}")]
    InvalidEndpoint(String),

    #[error("Session id is empty")]
    MissingSession,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn public() -> ManifestSource {
        ManifestSource::Public {
            url: "http://127.0.0.1/patchlist.txt".to_string(),
        }
    }

    #[test]
    fn test_valid_config() {
        let temp = TempDir::new().unwrap();
        let config = InstallConfig::new(temp.path().join("ffxiv"), temp.path().join("patches"), public());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_game_path_must_be_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let config = InstallConfig::new(&file, temp.path(), public());
        assert!(matches!(config.validate(), Err(ConfigError::GamePathNotDirectory(_))));
    }

    #[test]
    fn test_concurrency_bounds() {
        let temp = TempDir::new().unwrap();
        let mut config = InstallConfig::new(temp.path(), temp.path(), public());
        config.max_concurrent_downloads = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConcurrency(0))));
        config.max_concurrent_downloads = MAX_CONCURRENT_DOWNLOADS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_source_checks() {
        let temp = TempDir::new().unwrap();
        let config = InstallConfig::new(
            temp.path(),
            temp.path(),
            ManifestSource::Authenticated {
                session_id: " ".to_string(),
                boot_report: None,
            },
        );
        assert!(matches!(config.validate(), Err(ConfigError::MissingSession)));

        let config = InstallConfig::new(
            temp.path(),
            temp.path(),
            ManifestSource::Public {
                url: "ftp://x/list".to_string(),
            },
        );
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEndpoint(_))));
    }
}
