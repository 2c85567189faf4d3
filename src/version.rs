//! Version store
//!
//! Each repository records its installed version in a small text file at a
//! fixed path under the game root. Versions are `YYYY.MM.DD.NNNN.NNNN`
//! strings and compare ordinally: a higher string is a newer version.

use crate::repository::Repository;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Version reported for a repository that has never been installed
pub const BASE_VERSION: &str = "2012.01.01.0000.0000";

/// Version store errors
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("Failed to read version marker {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write version marker {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid version string {0:?}")]
    Invalid(String),
}

/// The installed version of one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMarker {
    pub repository: Repository,
    pub version: String,
    pub path: PathBuf,
    /// Whether a non-empty marker file exists on disk
    pub present: bool,
}

impl VersionMarker {
    pub fn is_installed(&self) -> bool {
        self.version != BASE_VERSION
    }
}

/// Snapshot of every repository's installed version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalVersions {
    versions: BTreeMap<Repository, String>,
}

impl LocalVersions {
    /// Installed version, defaulting to the base sentinel
    pub fn get(&self, repository: Repository) -> &str {
        self.versions
            .get(&repository)
            .map(String::as_str)
            .unwrap_or(BASE_VERSION)
    }

    /// Version from an on-disk marker, `None` when the repository has no marker
    pub fn get_installed(&self, repository: Repository) -> Option<&str> {
        self.versions.get(&repository).map(String::as_str)
    }

    pub fn set(&mut self, repository: Repository, version: impl Into<String>) {
        self.versions.insert(repository, version.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (Repository, &str)> {
        Repository::ALL.into_iter().map(move |repo| (repo, self.get(repo)))
    }
}

/// Check that a string looks like a version marker value
///
/// Vendor versions are mostly `YYYY.MM.DD.NNNN.NNNN`, but patch lists also
/// carry prefixed forms (`D2017...`, `H2017...`), so only characters are
/// checked here.
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version.len() <= 64
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.')
}

/// Ordinal comparison: is `remote` strictly newer than `local`?
pub fn is_newer(remote: &str, local: &str) -> bool {
    remote > local
}

/// Reads and writes per-repository version markers under a game root
#[derive(Debug, Clone)]
pub struct VersionStore {
    game_root: PathBuf,
}

impl VersionStore {
    pub fn new(game_root: impl Into<PathBuf>) -> Self {
        Self {
            game_root: game_root.into(),
        }
    }

    pub fn game_root(&self) -> &Path {
        &self.game_root
    }

    pub fn marker_path(&self, repository: Repository) -> PathBuf {
        self.game_root.join(repository.version_file())
    }

    /// Read a repository's marker; an absent or empty marker reads as the base version
    pub fn read(&self, repository: Repository) -> Result<VersionMarker, VersionError> {
        let path = self.marker_path(repository);
        let stored = match std::fs::read_to_string(&path) {
            Ok(content) => Some(content.trim().to_string()).filter(|v| !v.is_empty()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(VersionError::Read { path, source }),
        };

        Ok(VersionMarker {
            repository,
            present: stored.is_some(),
            version: stored.unwrap_or_else(|| BASE_VERSION.to_string()),
            path,
        })
    }

    /// Snapshot of every repository; absent markers are left out
    pub fn read_all(&self) -> Result<LocalVersions, VersionError> {
        let mut versions = LocalVersions::default();
        for repo in Repository::ALL {
            let marker = self.read(repo)?;
            if marker.present {
                versions.set(repo, marker.version);
            }
        }
        Ok(versions)
    }

    /// Record a newly installed version, creating the marker if needed
    ///
    /// The `.bck` copy is written after the `.ver` file; a failure on the
    /// backup still fails the call.
    pub fn write(&self, repository: Repository, version: &str) -> Result<(), VersionError> {
        if !is_valid_version(version) {
            return Err(VersionError::Invalid(version.to_string()));
        }

        for relative in [repository.version_file(), repository.backup_file()] {
            let path = self.game_root.join(relative);
            write_marker(&path, version).map_err(|source| VersionError::Write {
                path: path.clone(),
                source,
            })?;
        }

        debug!("Version marker for {} set to {}", repository, version);
        Ok(())
    }
}

fn write_marker(path: &Path, version: &str) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    // Write next to the marker and rename so a crash never leaves a torn file
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    io::Write::write_all(&mut tmp, version.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
