//! Install roots and patch-relative path handling
//!
//! Patch containers carry paths relative to a repository's install root,
//! sometimes with Windows separators. This module handles:
//! - Mapping a repository to its install root (`boot/` or `game/`)
//! - Converting `\` to `/` and rejecting paths that escape the root
//! - Platform default locations for settings and the patch store

use crate::repository::Repository;
use std::path::{Component, Path, PathBuf};

/// The one platform question the patch core asks: where does repository X live?
pub trait InstallRoots: Send + Sync {
    /// Top-level game directory (contains `boot/` and `game/`)
    fn game_root(&self) -> &Path;

    /// Directory that a repository's patch paths are relative to
    fn install_root(&self, repository: Repository) -> PathBuf;
}

/// Standard vendor layout: boot loader under `boot/`, base game and every
/// expansion sharing `game/`
#[derive(Debug, Clone)]
pub struct GameLayout {
    root: PathBuf,
}

impl GameLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl InstallRoots for GameLayout {
    fn game_root(&self) -> &Path {
        &self.root
    }

    fn install_root(&self, repository: Repository) -> PathBuf {
        if repository.is_boot() {
            self.root.join("boot")
        } else {
            self.root.join("game")
        }
    }
}

/// Convert Windows path separators and strip leading separators
/// `\sqpack\ex1\` -> `sqpack/ex1`
pub fn to_relative_unix(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

/// Join a patch-relative path onto a root, refusing anything that would
/// land outside it
///
/// Returns `None` for absolute paths, drive prefixes and `..` components.
pub fn resolve_under(root: &Path, relative: &str) -> Option<PathBuf> {
    let cleaned = to_relative_unix(relative);
    let mut resolved = root.to_path_buf();

    for component in Path::new(&cleaned).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(resolved)
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Directory holding `settings.json`
pub fn settings_dir() -> Option<PathBuf> {
    platform::settings_dir()
}

/// Default directory for downloaded patch files
pub fn default_patch_store() -> Option<PathBuf> {
    platform::data_dir().map(|dir| dir.join("patches"))
}

#[cfg(target_os = "windows")]
mod platform {
    use std::path::PathBuf;

    pub fn settings_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("xlpatch"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("xlpatch"))
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use std::path::PathBuf;

    // Both live under ~/Library/Application Support
    pub fn settings_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("xlpatch"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("xlpatch"))
    }
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
mod platform {
    use std::path::PathBuf;

    pub fn settings_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("xlpatch"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("xlpatch"))
    }
}
