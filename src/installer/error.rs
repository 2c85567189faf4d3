//! Install pipeline errors

use super::config::ConfigError;
use super::events::ErrorCode;
use crate::downloader::DownloadError;
use crate::patchlist::PatchListError;
use crate::verify::VerifyError;
use crate::version::VersionError;
use crate::zipatch::ZiPatchError;
use std::error::Error as _;
use std::io;
use std::path::PathBuf;

/// Everything that can end a patch run
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),

    #[error("Failed to resolve patch list")]
    PatchList(#[source] PatchListError),

    #[error("Failed to download patches")]
    Download(#[source] DownloadError),

    #[error("Patch failed verification")]
    Verify(#[from] VerifyError),

    #[error("Failed to apply {file}")]
    Patch {
        file: String,
        #[source]
        source: ZiPatchError,
    },

    #[error("Failed to update version marker")]
    Version(#[from] VersionError),

    #[error("Filesystem error at {path}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Install incomplete: {required} required, {downloaded} downloaded, {installed} installed")]
    Incomplete {
        required: usize,
        downloaded: usize,
        installed: usize,
    },

    #[error("Install task failed")]
    Task(#[source] tokio::task::JoinError),

    #[error("Install cancelled")]
    Cancelled,
}

impl From<PatchListError> for InstallError {
    fn from(err: PatchListError) -> Self {
        InstallError::PatchList(err)
    }
}

impl From<DownloadError> for InstallError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Cancelled => InstallError::Cancelled,
            other => InstallError::Download(other),
        }
    }
}

impl InstallError {
    /// Wrap an interpreter error for a named patch file
    pub fn patch(file: &str, err: ZiPatchError) -> Self {
        match err {
            ZiPatchError::Cancelled => InstallError::Cancelled,
            source => InstallError::Patch {
                file: file.to_string(),
                source,
            },
        }
    }

    /// Stable category for UI consumers
    pub fn code(&self) -> ErrorCode {
        match self {
            InstallError::Config(_) => ErrorCode::Config,
            InstallError::PatchList(e) => match e {
                PatchListError::Conflict => ErrorCode::Conflict,
                PatchListError::Request { .. } | PatchListError::Status { .. } => ErrorCode::Network,
                PatchListError::Version(_) => ErrorCode::VersionStore,
            },
            InstallError::Download(e) => match e {
                DownloadError::Request { .. } | DownloadError::Status { .. } => ErrorCode::Network,
                DownloadError::SizeMismatch { .. } => ErrorCode::Download,
                DownloadError::Io { .. } => ErrorCode::Filesystem,
                DownloadError::Client(_) | DownloadError::Cancelled => ErrorCode::Internal,
            },
            InstallError::Verify(e) => match e {
                VerifyError::HashMismatch { .. } | VerifyError::BlockCount { .. } => ErrorCode::HashMismatch,
                VerifyError::UnsupportedHashType(_) => ErrorCode::Manifest,
                VerifyError::Io { .. } => ErrorCode::Filesystem,
            },
            InstallError::Patch { source, .. } if source.is_corruption() => ErrorCode::CorruptPatch,
            InstallError::Patch { .. } | InstallError::Filesystem { .. } => ErrorCode::Filesystem,
            InstallError::Version(_) => ErrorCode::VersionStore,
            InstallError::Incomplete { .. } | InstallError::Task(_) | InstallError::Cancelled => {
                ErrorCode::Internal
            }
        }
    }

    /// Message plus every underlying cause, `a: b: c`
    pub fn diagnostic(&self) -> String {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}
