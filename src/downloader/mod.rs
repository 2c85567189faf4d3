//! Concurrent patch downloader
//!
//! Fetches every required patch into `{store}/{repository}/{file}` with a
//! bounded number of simultaneous transfers. Files already on disk with the
//! exact declared size are skipped. Workers feed a shared
//! [`ProgressAggregator`] and signal completions over a channel; the single
//! consumer loop turns that into a throttled progress stream.

mod http;
pub mod progress;

pub use http::{stream_to_file, HttpClient, PATCH_USER_AGENT, WRITE_BUFFER_SIZE};
pub use progress::{ActiveFile, DownloadProgress, ProgressAggregator, ProgressSnapshot, SpeedWindow};

use crate::cancel::CancelToken;
use crate::patchlist::PatchDescriptor;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default number of simultaneous transfers
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Upper bound on emitted progress intervals
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Download errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Failed to create HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("Request failed: {url}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} while downloading {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Size mismatch for {file}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("Download cancelled")]
    Cancelled,
}

/// Where and how fast to download
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub store_dir: PathBuf,
    pub concurrency: usize,
}

impl DownloadOptions {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// A patch present on disk after the download phase
#[derive(Debug, Clone)]
pub struct DownloadedPatch {
    /// Descriptor with `local_path` filled in
    pub patch: PatchDescriptor,
    /// True when the file was already on disk with the right size
    pub skipped: bool,
    pub bytes_transferred: u64,
}

/// Local file location for a patch
pub fn destination(store_dir: &Path, patch: &PatchDescriptor) -> PathBuf {
    store_dir
        .join(patch.repository.slug())
        .join(&patch.file_name)
}

/// Check if a downloaded file exists and has the expected size
pub fn verify_download(path: &Path, expected_size: u64) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() == expected_size,
        Err(_) => false,
    }
}

/// Download all patches, returning them in completion order
///
/// The first failure (or cancellation) aborts the whole batch; in-flight
/// transfers are dropped and their partial files are left in place.
pub async fn download_all<F>(
    client: &HttpClient,
    patches: &[PatchDescriptor],
    options: &DownloadOptions,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<Vec<DownloadedPatch>, DownloadError>
where
    F: FnMut(DownloadProgress),
{
    if patches.is_empty() {
        return Ok(Vec::new());
    }

    let aggregator = Arc::new(ProgressAggregator::new(patches));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<usize>();
    let concurrency = options.concurrency.max(1);

    info!(
        "Downloading {} patches ({} bytes) with {} workers",
        patches.len(),
        aggregator.snapshot().total_bytes,
        concurrency
    );

    let downloads = stream::iter(patches.iter().enumerate())
        .map(|(index, patch)| {
            let aggregator = Arc::clone(&aggregator);
            let done_tx = done_tx.clone();
            async move {
                let result =
                    fetch_one(client, patch, index, &options.store_dir, &aggregator, cancel).await;
                if result.is_ok() {
                    let _ = done_tx.send(index);
                }
                result
            }
        })
        .buffer_unordered(concurrency)
        .try_collect::<Vec<_>>();
    tokio::pin!(downloads);

    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut speed = SpeedWindow::new(Instant::now(), 0);

    let result = loop {
        tokio::select! {
            result = &mut downloads => break result,
            Some(_) = done_rx.recv() => report(&aggregator, &mut speed, &mut on_progress),
            _ = ticker.tick() => report(&aggregator, &mut speed, &mut on_progress),
        }
    };

    match result {
        Ok(done) => {
            report(&aggregator, &mut speed, &mut on_progress);
            info!(
                "Downloads finished: {} patches, {} bytes",
                done.len(),
                aggregator.downloaded_bytes()
            );
            Ok(done)
        }
        Err(e) => {
            if !matches!(e, DownloadError::Cancelled) {
                warn!("Download batch aborted: {}", e);
            }
            Err(e)
        }
    }
}

fn report<F: FnMut(DownloadProgress)>(
    aggregator: &ProgressAggregator,
    speed: &mut SpeedWindow,
    on_progress: &mut F,
) {
    let snapshot = aggregator.snapshot();
    let current = speed.update(Instant::now(), snapshot.downloaded_bytes);
    on_progress(DownloadProgress::from_snapshot(snapshot, current));
}

async fn fetch_one(
    client: &HttpClient,
    patch: &PatchDescriptor,
    index: usize,
    store_dir: &Path,
    aggregator: &ProgressAggregator,
    cancel: &CancelToken,
) -> Result<DownloadedPatch, DownloadError> {
    if cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    let dest = destination(store_dir, patch);
    if verify_download(&dest, patch.size_bytes) {
        info!("Already downloaded: {}", patch.file_name);
        aggregator.skip(index);
        return Ok(DownloadedPatch {
            patch: patch.clone().with_local_path(dest),
            skipped: true,
            bytes_transferred: 0,
        });
    }

    aggregator.begin(index);
    debug!("Fetching {} -> {}", patch.url, dest.display());

    let transfer = stream_to_file(client, &patch.url, &dest, |n| aggregator.add(index, n));
    let result = tokio::select! {
        r = transfer => r,
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
    };

    match result {
        Ok(written) if written == patch.size_bytes => {
            aggregator.complete(index);
            Ok(DownloadedPatch {
                patch: patch.clone().with_local_path(dest),
                skipped: false,
                bytes_transferred: written,
            })
        }
        Ok(written) => {
            aggregator.fail(index);
            Err(DownloadError::SizeMismatch {
                file: patch.file_name.clone(),
                expected: patch.size_bytes,
                actual: written,
            })
        }
        Err(e) => {
            aggregator.fail(index);
            Err(e)
        }
    }
}
