//! Patch list resolution
//!
//! Turns a remote patch manifest into the ordered list of patches this
//! install still needs. Two wire formats are understood:
//! - the public list: one tab-separated patch per line
//! - the authenticated patch-check response: multi-part framing around
//!   tab-separated patch lines, optionally carrying SHA1 block hashes

mod client;

pub use client::{boot_check_time, version_report, PatchEndpoints, PatchListClient, HASH_CHECK_HEADER};

use crate::repository::Repository;
use crate::version::{is_newer, LocalVersions, VersionError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Lines of multi-part framing before the patch lines
pub const FRAMING_LEADING_LINES: usize = 5;

/// Lines of multi-part framing after the patch lines
pub const FRAMING_TRAILING_LINES: usize = 2;

/// Patch list errors
#[derive(Debug, thiserror::Error)]
pub enum PatchListError {
    #[error("Patch server request failed: {url}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Patch server returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Patch server reported a version conflict (boot files are out of date)")]
    Conflict,

    #[error(transparent)]
    Version(#[from] VersionError),
}

/// One downloadable patch file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDescriptor {
    pub file_name: String,
    pub url: String,
    pub size_bytes: u64,
    /// Version the repository is at once this patch is applied
    pub version: String,
    pub repository: Repository,
    /// Hash algorithm of `hashes` (`sha1` for patch-check responses)
    pub hash_type: Option<String>,
    /// Bytes covered by each entry of `hashes`
    pub hash_block_size: u64,
    pub hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl PatchDescriptor {
    pub fn new(
        file_name: impl Into<String>,
        url: impl Into<String>,
        size_bytes: u64,
        version: impl Into<String>,
        repository: Repository,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            url: url.into(),
            size_bytes,
            version: version.into(),
            repository,
            hash_type: None,
            hash_block_size: 0,
            hashes: Vec::new(),
            local_path: None,
        }
    }

    pub fn with_local_path(mut self, path: PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    /// Identity used for deduplication and install ordering
    pub fn key(&self) -> (Repository, &str) {
        (self.repository, self.file_name.as_str())
    }
}

/// Where the manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// Public tab-separated list at a fixed URL
    Public { url: String },
    /// Authenticated patch-check with a session id from the login collaborator
    Authenticated {
        session_id: String,
        /// Boot integrity line reported ahead of the expansion versions
        boot_report: Option<String>,
    },
}

/// Last path segment of a URL, without query or fragment
pub fn file_name_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query.rsplit('/').next()?.trim();
    if name.is_empty() || name.contains(':') {
        None
    } else {
        Some(name.to_string())
    }
}

fn looks_like_url(field: &str) -> bool {
    field.starts_with("http://") || field.starts_with("https://")
}

/// Parse the public tab-separated patch list
///
/// Each line is `size, total, count, parts, version, repoName, x, hash, url`.
/// Malformed lines are logged and skipped.
pub fn parse_public_list(body: &str) -> Vec<PatchDescriptor> {
    let mut patches = Vec::new();

    for (line_no, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        if fields.len() < 9 {
            warn!(
                "Skipping patch list line {}: expected 9 fields, got {}",
                line_no + 1,
                fields.len()
            );
            continue;
        }

        let url = fields[8];
        let Some(patch) = build_descriptor(line_no, fields[0], fields[4], url) else {
            continue;
        };

        let repository = Repository::from_name(fields[5]).unwrap_or_else(|| Repository::from_url(url));
        let hash = fields[7];

        patches.push(PatchDescriptor {
            repository,
            hashes: if hash.is_empty() { Vec::new() } else { vec![hash.to_string()] },
            ..patch
        });
    }

    debug!("Public patch list: {} entries", patches.len());
    patches
}

/// Parse an authenticated patch-check response body
///
/// The first five and last two lines are multi-part framing: the closing
/// boundary plus the empty line after its terminator. Patch lines
/// have either 6 fields (`size, total, count, parts, version, url`) or 9
/// (`size, total, count, parts, version, hashType, blockSize, hashes, url`).
/// A body without any download URL means the install is up to date.
pub fn parse_patch_response(body: &str) -> Vec<PatchDescriptor> {
    if !body.contains("http") {
        return Vec::new();
    }

    // Unlike `lines()`, splitting keeps the empty element after the final CRLF
    let mut lines: Vec<&str> = body.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    if lines.last().is_some_and(|l| !l.is_empty()) {
        lines.push("");
    }
    if lines.len() <= FRAMING_LEADING_LINES + FRAMING_TRAILING_LINES {
        warn!("Patch response too short to contain patch lines ({} lines)", lines.len());
        return Vec::new();
    }

    let mut patches = Vec::new();
    let body_lines = &lines[FRAMING_LEADING_LINES..lines.len() - FRAMING_TRAILING_LINES];

    for (offset, line) in body_lines.iter().enumerate() {
        let line_no = offset + FRAMING_LEADING_LINES;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let patch = match fields.len() {
            6 => build_descriptor(line_no, fields[0], fields[4], fields[5]),
            9 => build_descriptor(line_no, fields[0], fields[4], fields[8]).and_then(|patch| {
                let block_size = match fields[6].parse::<u64>() {
                    Ok(size) => size,
                    Err(_) => {
                        warn!("Skipping patch line {}: bad hash block size {:?}", line_no + 1, fields[6]);
                        return None;
                    }
                };
                Some(PatchDescriptor {
                    hash_type: Some(fields[5].to_ascii_lowercase()),
                    hash_block_size: block_size,
                    hashes: fields[7]
                        .split(',')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(str::to_string)
                        .collect(),
                    ..patch
                })
            }),
            n => {
                warn!("Skipping patch line {}: expected 6 or 9 fields, got {}", line_no + 1, n);
                None
            }
        };

        if let Some(patch) = patch {
            patches.push(patch);
        }
    }

    debug!("Patch response: {} entries", patches.len());
    patches
}

fn build_descriptor(line_no: usize, size: &str, version: &str, url: &str) -> Option<PatchDescriptor> {
    if !looks_like_url(url) {
        warn!("Skipping patch line {}: no download URL", line_no + 1);
        return None;
    }

    let Ok(size_bytes) = size.parse::<u64>() else {
        warn!("Skipping patch line {}: bad size {:?}", line_no + 1, size);
        return None;
    };

    if version.is_empty() {
        warn!("Skipping patch line {}: empty version", line_no + 1);
        return None;
    }

    let Some(file_name) = file_name_from_url(url) else {
        warn!("Skipping patch line {}: no file name in {}", line_no + 1, url);
        return None;
    };

    Some(PatchDescriptor::new(
        file_name,
        url,
        size_bytes,
        version,
        Repository::from_url(url),
    ))
}

/// Keep the first occurrence of each (repository, file name), then order
/// by repository and ascending version
///
/// Later patches assume earlier ones are applied, so this order is the
/// install order.
pub fn dedupe_and_sort(patches: Vec<PatchDescriptor>) -> Vec<PatchDescriptor> {
    let mut seen: HashSet<(Repository, String)> = HashSet::new();
    let mut unique: Vec<PatchDescriptor> = patches
        .into_iter()
        .filter(|p| seen.insert((p.repository, p.file_name.clone())))
        .collect();

    unique.sort_by(|a, b| {
        a.repository
            .cmp(&b.repository)
            .then_with(|| a.version.cmp(&b.version))
    });
    unique
}

/// Patches strictly newer than the local version of their repository, in install order
pub fn required_patches(remote: Vec<PatchDescriptor>, local: &LocalVersions) -> Vec<PatchDescriptor> {
    let needed = remote
        .into_iter()
        .filter(|p| is_newer(&p.version, local.get(p.repository)))
        .collect();
    dedupe_and_sort(needed)
}

/// Fetches the manifest for a source and diffs it against local versions
pub struct Resolver<'a> {
    client: &'a PatchListClient,
}

impl<'a> Resolver<'a> {
    pub fn new(client: &'a PatchListClient) -> Self {
        Self { client }
    }

    /// Produce the ordered list of required patches
    ///
    /// For the authenticated source the boot repository is checked first;
    /// while boot patches are outstanding the game check is deferred, since
    /// the server refuses it for an outdated boot loader.
    pub async fn resolve(
        &self,
        source: &ManifestSource,
        local: &LocalVersions,
    ) -> Result<Vec<PatchDescriptor>, PatchListError> {
        let remote = match source {
            ManifestSource::Public { url } => self.client.fetch_public(url).await?,
            ManifestSource::Authenticated {
                session_id,
                boot_report,
            } => {
                let boot = self.client.check_boot(local.get(Repository::Boot)).await?;
                let boot = required_patches(boot, local);
                if !boot.is_empty() {
                    info!("{} boot patches pending; game check deferred", boot.len());
                    return Ok(boot);
                }
                self.client
                    .check_game(local, session_id, boot_report.as_deref())
                    .await?
            }
        };

        let required = required_patches(remote, local);
        info!("{} patches required", required.len());
        Ok(required)
    }
}
