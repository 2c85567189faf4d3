//! xlpatch - game patch acquisition and installation
//!
//! Resolves which patches a game install is missing, downloads them
//! concurrently, and replays each ZiPatch container against the game tree
//! in version order.

pub mod cancel;
pub mod downloader;
pub mod installer;
pub mod paths;
pub mod patchlist;
pub mod repository;
pub mod settings;
pub mod verify;
pub mod version;
pub mod zipatch;
