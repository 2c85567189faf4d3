//! Installation orchestrator
//!
//! Coordinates the phases of a patch run:
//! 1. Resolve: diff the remote patch list against local version markers
//! 2. Download: fetch every required patch into the patch store
//! 3. Install: verify and apply each patch in required order, then bump its marker
//!
//! Boot patches gate the game check on the authenticated endpoint, so a run
//! that only installed boot patches resolves again before finishing.

pub mod config;
pub mod error;
pub mod events;

pub use config::{ConfigError, InstallConfig, MAX_CONCURRENT_DOWNLOADS};
pub use error::InstallError;
pub use events::{ErrorCode, InstallEvent};

use crate::cancel::CancelToken;
use crate::downloader::{download_all, DownloadOptions, DownloadedPatch, HttpClient};
use crate::paths::{GameLayout, InstallRoots};
use crate::patchlist::{ManifestSource, PatchDescriptor, PatchListClient, Resolver};
use crate::verify::{verify_patch, VerifyError, VerifyOutcome};
use crate::version::{LocalVersions, VersionStore};
use crate::zipatch::{apply_patch_file, ApplyConfig, ApplySummary};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Resolve passes allowed in one run (boot, then game, plus slack)
const MAX_PASSES: usize = 4;

fn log_phase_metrics(phase: &str, started: Instant) {
    info!(
        "Phase done: phase='{}' elapsed_ms={}",
        phase,
        started.elapsed().as_millis()
    );
}

/// Installation statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallStats {
    pub required: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub installed: usize,
    pub bytes_downloaded: u64,
    pub passes: usize,
}

/// Main installer orchestrator
pub struct PatchInstaller {
    config: InstallConfig,
    roots: Arc<dyn InstallRoots>,
    client: PatchListClient,
    http: HttpClient,
    store: VersionStore,
}

impl PatchInstaller {
    /// Create a new installer with the given configuration
    pub fn new(config: InstallConfig) -> Result<Self, InstallError> {
        config.validate()?;

        let http = HttpClient::new()?;
        let client = PatchListClient::new(http.clone(), config.endpoints.clone());
        let roots: Arc<dyn InstallRoots> = Arc::new(GameLayout::new(&config.game_path));
        let store = VersionStore::new(&config.game_path);

        Ok(Self {
            config,
            roots,
            client,
            http,
            store,
        })
    }

    /// Use a different answer to "where does repository X install"
    pub fn with_roots(mut self, roots: Arc<dyn InstallRoots>) -> Self {
        self.store = VersionStore::new(roots.game_root());
        self.roots = roots;
        self
    }

    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    pub fn version_store(&self) -> &VersionStore {
        &self.store
    }

    pub fn local_versions(&self) -> Result<LocalVersions, InstallError> {
        Ok(self.store.read_all()?)
    }

    /// Resolve the required patches without downloading anything
    pub async fn check(&self) -> Result<Vec<PatchDescriptor>, InstallError> {
        let local = self.local_versions()?;
        Ok(Resolver::new(&self.client)
            .resolve(&self.config.source, &local)
            .await?)
    }

    /// Run the full pipeline, reporting on `events`
    ///
    /// Exactly one terminal event (`Complete`, `Cancelled` or `Error`) is
    /// sent, after which the same outcome is returned.
    pub async fn run(
        &self,
        events: &UnboundedSender<InstallEvent>,
        cancel: &CancelToken,
    ) -> Result<InstallStats, InstallError> {
        let _ = events.send(InstallEvent::Started);

        let result = self.install(events, cancel).await;
        let terminal = match &result {
            Ok(stats) => {
                info!(
                    "Install complete: {} patches, {} bytes downloaded",
                    stats.installed, stats.bytes_downloaded
                );
                InstallEvent::Complete {
                    patches: stats.installed,
                    bytes_downloaded: stats.bytes_downloaded,
                }
            }
            Err(InstallError::Cancelled) => {
                info!("Install cancelled");
                InstallEvent::Cancelled
            }
            Err(e) => {
                let message = e.diagnostic();
                error!("Install failed: {}", message);
                InstallEvent::Error {
                    code: e.code(),
                    message,
                }
            }
        };
        let _ = events.send(terminal);
        result
    }

    async fn install(
        &self,
        events: &UnboundedSender<InstallEvent>,
        cancel: &CancelToken,
    ) -> Result<InstallStats, InstallError> {
        let resolver = Resolver::new(&self.client);
        let mut options = DownloadOptions::new(&self.config.patch_store);
        options.concurrency = self.config.max_concurrent_downloads;

        let mut stats = InstallStats::default();
        let mut settled = false;

        while stats.passes < MAX_PASSES {
            if cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            stats.passes += 1;

            // === Resolve ===
            let started = Instant::now();
            let local = self.local_versions()?;
            let required = resolver.resolve(&self.config.source, &local).await?;
            log_phase_metrics("resolve", started);

            if required.is_empty() {
                settled = true;
                break;
            }
            stats.required += required.len();

            // === Download ===
            let started = Instant::now();
            let downloaded = download_all(&self.http, &required, &options, cancel, |progress| {
                let _ = events.send(InstallEvent::from(progress));
            })
            .await?;
            stats.downloaded += downloaded.len();
            stats.skipped += downloaded.iter().filter(|d| d.skipped).count();
            stats.bytes_downloaded += downloaded.iter().map(|d| d.bytes_transferred).sum::<u64>();
            log_phase_metrics("download", started);

            // === Install ===
            let started = Instant::now();
            let ordered = install_order(&required, downloaded)?;
            let total = ordered.len();
            let mut installed = 0;

            for (i, patch) in ordered.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(InstallError::Cancelled);
                }
                let _ = events.send(InstallEvent::Installing {
                    index: i + 1,
                    total,
                    file_name: patch.file_name.clone(),
                });

                self.install_one(patch, cancel).await?;
                installed += 1;
            }
            stats.installed += installed;
            log_phase_metrics("install", started);

            if installed != required.len() {
                return Err(InstallError::Incomplete {
                    required: required.len(),
                    downloaded: total,
                    installed,
                });
            }

            let boot_only = required.iter().all(|p| p.repository.is_boot());
            if !(boot_only && matches!(self.config.source, ManifestSource::Authenticated { .. })) {
                settled = true;
                break;
            }
            info!("Boot patches installed, checking game patches");
        }

        if !settled {
            warn!("Patches still pending after {} passes", stats.passes);
            return Err(InstallError::Incomplete {
                required: stats.required,
                downloaded: stats.downloaded,
                installed: stats.installed,
            });
        }

        Ok(stats)
    }

    /// Verify, apply and record one downloaded patch
    async fn install_one(&self, patch: &PatchDescriptor, cancel: &CancelToken) -> Result<ApplySummary, InstallError> {
        let path = patch.local_path.clone().ok_or(InstallError::Incomplete {
            required: 1,
            downloaded: 0,
            installed: 0,
        })?;
        let root = self.roots.install_root(patch.repository);
        info!(
            "Installing {} ({} -> {})",
            patch.file_name,
            patch.repository,
            patch.version
        );

        let task_patch = patch.clone();
        let task_cancel = cancel.clone();
        let task_path = path.clone();
        let summary = tokio::task::spawn_blocking(move || {
            apply_verified(&task_path, &task_patch, root, &task_cancel)
        })
        .await
        .map_err(InstallError::Task)??;

        self.store.write(patch.repository, &patch.version)?;
        debug!(
            "{}: {} chunks, {} bytes written",
            patch.file_name, summary.chunks, summary.bytes_written
        );

        if !self.config.keep_patches {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        Ok(summary)
    }
}

/// Blocking half of a patch install: hash check, then chunk replay
fn apply_verified(
    path: &std::path::Path,
    patch: &PatchDescriptor,
    root: PathBuf,
    cancel: &CancelToken,
) -> Result<ApplySummary, InstallError> {
    match verify_patch(path, patch) {
        Ok(VerifyOutcome::Verified { blocks }) => debug!("{}: {} blocks verified", patch.file_name, blocks),
        Ok(VerifyOutcome::Skipped) => {}
        Err(e @ (VerifyError::HashMismatch { .. } | VerifyError::BlockCount { .. })) => {
            // A corrupt download must not be picked up by the size check next run
            if let Err(rm) = fs::remove_file(path) {
                warn!("Failed to remove corrupt {}: {}", path.display(), rm);
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    }

    fs::create_dir_all(&root).map_err(|source| InstallError::Filesystem {
        path: root.clone(),
        source,
    })?;
    apply_patch_file(path, ApplyConfig::new(root), cancel)
        .map_err(|e| InstallError::patch(&patch.file_name, e))
}

/// Put downloaded patches back into required order
///
/// Downloads finish in any order; installs must follow `required`. Every
/// required patch must have been downloaded.
pub fn install_order(
    required: &[PatchDescriptor],
    downloaded: Vec<DownloadedPatch>,
) -> Result<Vec<PatchDescriptor>, InstallError> {
    let downloaded_count = downloaded.len();
    let mut by_key: HashMap<_, PatchDescriptor> = downloaded
        .into_iter()
        .map(|d| ((d.patch.repository, d.patch.file_name.clone()), d.patch))
        .collect();

    let mut ordered = Vec::with_capacity(required.len());
    for patch in required {
        match by_key.remove(&(patch.repository, patch.file_name.clone())) {
            Some(found) if found.local_path.is_some() => ordered.push(found),
            _ => {
                return Err(InstallError::Incomplete {
                    required: required.len(),
                    downloaded: downloaded_count,
                    installed: 0,
                })
            }
        }
    }
    Ok(ordered)
}
