//! Patch server requests

use super::{parse_patch_response, parse_public_list, PatchDescriptor, PatchListError};
use crate::downloader::HttpClient;
use crate::repository::Repository;
use crate::version::LocalVersions;
use chrono::{DateTime, Timelike, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Asks the game endpoint to return block hashes with each patch
pub const HASH_CHECK_HEADER: (&str, &str) = ("X-Hash-Check", "enabled");

const DEFAULT_BOOT_BASE: &str = "http://patch-bootver.ffxiv.com";
const DEFAULT_GAME_BASE: &str = "https://patch-gamever.ffxiv.com";

/// Base URLs of the patch servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchEndpoints {
    pub boot_base: String,
    pub game_base: String,
    /// Public tab-separated patch list, used when no session is available
    pub public_list: Option<String>,
}

impl Default for PatchEndpoints {
    fn default() -> Self {
        Self {
            boot_base: DEFAULT_BOOT_BASE.to_string(),
            game_base: DEFAULT_GAME_BASE.to_string(),
            public_list: None,
        }
    }
}

impl PatchEndpoints {
    pub fn boot_check_url(&self, boot_version: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}/http/win32/ffxivneo_release_boot/{}/?time={}",
            self.boot_base.trim_end_matches('/'),
            boot_version,
            boot_check_time(now)
        )
    }

    pub fn game_check_url(&self, game_version: &str, session_id: &str) -> String {
        format!(
            "{}/http/win32/ffxivneo_release_game/{}/{}",
            self.game_base.trim_end_matches('/'),
            game_version,
            session_id
        )
    }
}

/// `yyyy-MM-dd-HH-m0`: the boot endpoint wants minutes floored to the ten
pub fn boot_check_time(now: DateTime<Utc>) -> String {
    format!("{}-{}0", now.format("%Y-%m-%d-%H"), now.minute() / 10)
}

/// Request body for the game check: optional boot report, then one
/// `exN<TAB>version` line per installed expansion
pub fn version_report(local: &LocalVersions, boot_report: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();
    if let Some(report) = boot_report.map(str::trim).filter(|r| !r.is_empty()) {
        lines.push(report.to_string());
    }
    for repo in Repository::EXPANSIONS {
        if let Some(version) = local.get_installed(repo) {
            lines.push(format!("{}\t{}", repo.slug(), version));
        }
    }
    lines.join("\n")
}

/// Client for the patch list endpoints
#[derive(Debug, Clone)]
pub struct PatchListClient {
    http: HttpClient,
    endpoints: PatchEndpoints,
}

impl PatchListClient {
    pub fn new(http: HttpClient, endpoints: PatchEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn endpoints(&self) -> &PatchEndpoints {
        &self.endpoints
    }

    /// Fetch and parse the public patch list
    pub async fn fetch_public(&self, url: &str) -> Result<Vec<PatchDescriptor>, PatchListError> {
        info!("Fetching patch list from {}", url);
        let request = self.http.inner().get(url);
        match self.send(url, request).await? {
            Some(body) => Ok(parse_public_list(&body)),
            None => Ok(Vec::new()),
        }
    }

    /// Ask the boot endpoint which boot patches are outstanding
    pub async fn check_boot(&self, boot_version: &str) -> Result<Vec<PatchDescriptor>, PatchListError> {
        let url = self.endpoints.boot_check_url(boot_version, Utc::now());
        info!("Checking boot version {}", boot_version);

        let request = self.http.inner().get(&url);
        let Some(body) = self.send(&url, request).await? else {
            return Ok(Vec::new());
        };

        // Everything served by the boot endpoint belongs to the boot repository
        Ok(parse_patch_response(&body)
            .into_iter()
            .map(|p| PatchDescriptor {
                repository: Repository::Boot,
                ..p
            })
            .collect())
    }

    /// Ask the game endpoint which game and expansion patches are outstanding
    pub async fn check_game(
        &self,
        local: &LocalVersions,
        session_id: &str,
        boot_report: Option<&str>,
    ) -> Result<Vec<PatchDescriptor>, PatchListError> {
        let game_version = local.get(Repository::Game);
        let url = self.endpoints.game_check_url(game_version, session_id);
        info!("Checking game version {}", game_version);

        let request = self
            .http
            .inner()
            .post(&url)
            .header(HASH_CHECK_HEADER.0, HASH_CHECK_HEADER.1)
            .body(version_report(local, boot_report));

        match self.send(&url, request).await? {
            Some(body) => Ok(parse_patch_response(&body)),
            None => Ok(Vec::new()),
        }
    }

    /// Send a request; `None` means the server answered 204 (nothing to patch)
    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<String>, PatchListError> {
        let request_err = |source| PatchListError::Request {
            url: strip_session(url),
            source,
        };

        let response = request.send().await.map_err(request_err)?;
        let status = response.status();
        debug!("{} -> {}", strip_session(url), status);

        match status {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::CONFLICT => Err(PatchListError::Conflict),
            s if s.is_success() => Ok(Some(response.text().await.map_err(request_err)?)),
            s => Err(PatchListError::Status {
                url: strip_session(url),
                status: s.as_u16(),
            }),
        }
    }
}

/// Drop the trailing session id from game check URLs before logging them
fn strip_session(url: &str) -> String {
    match url.find("/ffxivneo_release_game/") {
        Some(pos) => {
            let head = &url[..pos];
            let tail = &url[pos..];
            let mut parts: Vec<&str> = tail.split('/').collect();
            if parts.len() > 3 {
                parts.truncate(3);
                format!("{}{}/<session>", head, parts.join("/"))
            } else {
                url.to_string()
            }
        }
        None => url.to_string(),
    }
}
