//! Game data repositories
//!
//! The game is split into independently versioned partitions: the boot
//! loader, the base game, and one per expansion. Each has its own `.ver`
//! marker and its own stream of patches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// An independently versioned partition of the game data
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repository {
    Boot,
    Game,
    Ex1,
    Ex2,
    Ex3,
    Ex4,
    Ex5,
}

impl Repository {
    pub const ALL: [Repository; 7] = [
        Repository::Boot,
        Repository::Game,
        Repository::Ex1,
        Repository::Ex2,
        Repository::Ex3,
        Repository::Ex4,
        Repository::Ex5,
    ];

    pub const EXPANSIONS: [Repository; 5] = [
        Repository::Ex1,
        Repository::Ex2,
        Repository::Ex3,
        Repository::Ex4,
        Repository::Ex5,
    ];

    /// Expansion number (1-based) for expansion repositories
    pub fn expansion(self) -> Option<u8> {
        match self {
            Repository::Boot | Repository::Game => None,
            Repository::Ex1 => Some(1),
            Repository::Ex2 => Some(2),
            Repository::Ex3 => Some(3),
            Repository::Ex4 => Some(4),
            Repository::Ex5 => Some(5),
        }
    }

    pub fn from_expansion(number: u8) -> Option<Self> {
        match number {
            1 => Some(Repository::Ex1),
            2 => Some(Repository::Ex2),
            3 => Some(Repository::Ex3),
            4 => Some(Repository::Ex4),
            5 => Some(Repository::Ex5),
            _ => None,
        }
    }

    /// Short lowercase name, also used as the patch store subdirectory
    pub fn slug(self) -> &'static str {
        match self {
            Repository::Boot => "boot",
            Repository::Game => "game",
            Repository::Ex1 => "ex1",
            Repository::Ex2 => "ex2",
            Repository::Ex3 => "ex3",
            Repository::Ex4 => "ex4",
            Repository::Ex5 => "ex5",
        }
    }

    /// Parse a repository name as it appears in patch lists
    ///
    /// Accepts the short slugs plus the vendor's `ffxivboot` / `ffxivgame`
    /// spellings, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "boot" | "ffxivboot" => Some(Repository::Boot),
            "game" | "ffxivgame" | "ffxiv" => Some(Repository::Game),
            other => other
                .strip_prefix("ex")
                .and_then(|n| n.parse::<u8>().ok())
                .and_then(Repository::from_expansion),
        }
    }

    /// Infer the repository from a patch URL path segment
    ///
    /// `/boot/` maps to Boot, `/exN/` to the matching expansion, anything
    /// else is a base game patch.
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.contains("/boot/") {
            return Repository::Boot;
        }
        for repo in Repository::EXPANSIONS {
            if lower.contains(&format!("/{}/", repo.slug())) {
                return repo;
            }
        }
        Repository::Game
    }

    /// Version marker location relative to the game root
    pub fn version_file(self) -> PathBuf {
        self.marker_with_extension("ver")
    }

    /// Backup copy of the version marker, kept alongside the `.ver` file
    pub fn backup_file(self) -> PathBuf {
        self.marker_with_extension("bck")
    }

    fn marker_with_extension(self, ext: &str) -> PathBuf {
        match self {
            Repository::Boot => PathBuf::from("boot").join(format!("ffxivboot.{}", ext)),
            Repository::Game => PathBuf::from("game").join(format!("ffxivgame.{}", ext)),
            ex => PathBuf::from("game")
                .join("sqpack")
                .join(ex.slug())
                .join(format!("{}.{}", ex.slug(), ext)),
        }
    }

    pub fn is_boot(self) -> bool {
        self == Repository::Boot
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_from_name() {
        assert_eq!(Repository::from_name("ffxivgame"), Some(Repository::Game));
        assert_eq!(Repository::from_name("FFXIVBOOT"), Some(Repository::Boot));
        assert_eq!(Repository::from_name("ex3"), Some(Repository::Ex3));
        assert_eq!(Repository::from_name("ex9"), None);
        assert_eq!(Repository::from_name("nonsense"), None);
    }

    #[test]
    fn test_from_url() {
        assert_eq!(
            Repository::from_url("http://patch-dl.ffxiv.com/boot/2b5cbc63/D2017.07.11.0000.0001.patch"),
            Repository::Boot
        );
        assert_eq!(
            Repository::from_url("http://patch-dl.ffxiv.com/game/ex2/6cfeb4b8/H2019.01.01.0000.0000a.patch"),
            Repository::Ex2
        );
        assert_eq!(
            Repository::from_url("http://patch-dl.ffxiv.com/game/4e9a232b/D2017.05.10.0000.0001.patch"),
            Repository::Game
        );
    }

    #[test]
    fn test_version_file_paths() {
        assert_eq!(Repository::Boot.version_file(), Path::new("boot/ffxivboot.ver"));
        assert_eq!(Repository::Game.version_file(), Path::new("game/ffxivgame.ver"));
        assert_eq!(Repository::Ex4.version_file(), Path::new("game/sqpack/ex4/ex4.ver"));
        assert_eq!(Repository::Ex4.backup_file(), Path::new("game/sqpack/ex4/ex4.bck"));
    }

    #[test]
    fn test_ordering_puts_boot_first() {
        let mut repos = vec![Repository::Ex2, Repository::Game, Repository::Boot, Repository::Ex1];
        repos.sort();
        assert_eq!(
            repos,
            vec![Repository::Boot, Repository::Game, Repository::Ex1, Repository::Ex2]
        );
    }
}
