//! Launcher settings
//!
//! Stores defaults for the command line in `settings.json` under the
//! platform config directory (see [`crate::paths::settings_dir`]).

use crate::patchlist::PatchEndpoints;
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Persisted launcher preferences
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LauncherSettings {
    /// Game root holding `boot/` and `game/`
    #[serde(default)]
    pub game_path: String,

    /// Where downloaded patches are kept
    #[serde(default)]
    pub patch_store: String,

    /// Simultaneous patch downloads (None = built-in default)
    #[serde(default)]
    pub max_concurrent_downloads: Option<usize>,

    /// Keep patch files once applied
    #[serde(default)]
    pub keep_patches: Option<bool>,

    #[serde(default)]
    pub endpoints: PatchEndpoints,
}

impl LauncherSettings {
    /// Get the settings file path
    pub fn settings_path() -> Result<PathBuf> {
        Ok(paths::settings_dir()
            .context("Could not determine config directory")?
            .join("settings.json"))
    }

    /// Load settings from the default location, or return defaults if unreadable
    pub fn load() -> Self {
        match Self::settings_path().and_then(|path| Self::load_from(&path)) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Could not load settings: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load settings from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;

        Ok(settings)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::settings_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;

        Ok(())
    }

    pub fn game_path(&self) -> Option<PathBuf> {
        non_empty(&self.game_path)
    }

    /// Configured patch store, falling back to the platform data directory
    pub fn patch_store(&self) -> Option<PathBuf> {
        non_empty(&self.patch_store).or_else(paths::default_patch_store)
    }
}

fn non_empty(value: &str) -> Option<PathBuf> {
    if value.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_default() {
        let settings = LauncherSettings::default();
        assert!(settings.game_path().is_none());
        assert!(settings.max_concurrent_downloads.is_none());
        assert_eq!(settings.endpoints, PatchEndpoints::default());
    }

    #[test]
    fn test_settings_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/settings.json");

        let settings = LauncherSettings {
            game_path: "/games/ffxiv".into(),
            patch_store: "/games/patches".into(),
            max_concurrent_downloads: Some(4),
            keep_patches: Some(false),
            endpoints: PatchEndpoints::default(),
        };
        settings.save_to(&path).unwrap();

        let loaded = LauncherSettings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.game_path(), Some(PathBuf::from("/games/ffxiv")));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{ "game_path": "/g", "endpoints": { "game_base": "http://local" } }"#).unwrap();

        let loaded = LauncherSettings::load_from(&path).unwrap();
        assert_eq!(loaded.game_path, "/g");
        assert_eq!(loaded.endpoints.game_base, "http://local");
        assert_eq!(loaded.endpoints.boot_base, PatchEndpoints::default().boot_base);
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp = TempDir::new().unwrap();
        let loaded = LauncherSettings::load_from(&temp.path().join("absent.json")).unwrap();
        assert_eq!(loaded, LauncherSettings::default());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(LauncherSettings::load_from(&path).is_err());
    }
}
