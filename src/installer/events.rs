//! Install event stream
//!
//! One ordered stream per run: `Started`, any number of `Downloading` and
//! `Installing`, then exactly one of `Complete`, `Cancelled` or `Error`.
//! Events serialize as tagged JSON so a UI process can read them as lines.

use crate::downloader::{ActiveFile, DownloadProgress};
use serde::Serialize;

/// Stable failure category carried by `Error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Network,
    Conflict,
    Manifest,
    Download,
    HashMismatch,
    CorruptPatch,
    Filesystem,
    VersionStore,
    Config,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Network => "network",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Manifest => "manifest",
            ErrorCode::Download => "download",
            ErrorCode::HashMismatch => "hash_mismatch",
            ErrorCode::CorruptPatch => "corrupt_patch",
            ErrorCode::Filesystem => "filesystem",
            ErrorCode::VersionStore => "version_store",
            ErrorCode::Config => "config",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Progress and outcome of a patch run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstallEvent {
    Started,
    Downloading {
        downloaded: u64,
        total: u64,
        /// Bytes per second over the last sampling window
        speed: f64,
        /// Seconds remaining, unknown until a speed sample exists
        eta: Option<u64>,
        completed: usize,
        in_flight: usize,
        current_files: Vec<ActiveFile>,
    },
    Installing {
        /// 1-based position in install order
        index: usize,
        total: usize,
        file_name: String,
    },
    Complete {
        patches: usize,
        bytes_downloaded: u64,
    },
    Cancelled,
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl InstallEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallEvent::Complete { .. } | InstallEvent::Cancelled | InstallEvent::Error { .. }
        )
    }
}

impl From<DownloadProgress> for InstallEvent {
    fn from(progress: DownloadProgress) -> Self {
        InstallEvent::Downloading {
            downloaded: progress.downloaded_bytes,
            total: progress.total_bytes,
            speed: progress.speed_bytes_per_sec,
            eta: progress.eta_secs,
            completed: progress.completed,
            in_flight: progress.in_flight,
            current_files: progress.active_files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(InstallEvent::Installing {
            index: 1,
            total: 3,
            file_name: "D2017.05.10.0000.0001.patch".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "installing");
        assert_eq!(json["index"], 1);
        assert_eq!(json["file_name"], "D2017.05.10.0000.0001.patch");

        let json = serde_json::to_value(InstallEvent::Error {
            code: ErrorCode::HashMismatch,
            message: "bad".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], ErrorCode::HashMismatch.as_str());

        let json = serde_json::to_value(InstallEvent::Cancelled).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "cancelled" }));
    }

    #[test]
    fn test_terminal_events() {
        assert!(!InstallEvent::Started.is_terminal());
        assert!(InstallEvent::Cancelled.is_terminal());
        assert!(InstallEvent::Complete {
            patches: 0,
            bytes_downloaded: 0
        }
        .is_terminal());
    }
}
