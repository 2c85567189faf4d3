//! HTTP client and streaming file transfer

use super::DownloadError;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// User agent the patch servers expect
pub const PATCH_USER_AGENT: &str = "FFXIV PATCH CLIENT";

/// Disk writes happen in increments of this many bytes
pub const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Connection timeout: time to establish TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout: maximum time to wait for data between chunks
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared HTTP client for patch lists and patch files
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(PATCH_USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(DownloadError::Client)?;

        Ok(Self { client })
    }

    /// Get the underlying reqwest client
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Stream `url` into `output_path`, truncating any previous partial file
///
/// `on_write` is called with the byte count of every buffer flushed to
/// disk. Returns the total number of bytes written.
pub async fn stream_to_file<F>(
    client: &HttpClient,
    url: &str,
    output_path: &Path,
    mut on_write: F,
) -> Result<u64, DownloadError>
where
    F: FnMut(u64),
{
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| DownloadError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let response = client
        .inner()
        .get(url)
        .send()
        .await
        .map_err(|source| DownloadError::Request {
            url: truncate_url(url),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            url: truncate_url(url),
            status: status.as_u16(),
        });
    }

    let io_err = |source| DownloadError::Io {
        path: output_path.to_path_buf(),
        source,
    };

    let mut file = File::create(output_path).await.map_err(io_err)?;
    let mut buffer: Vec<u8> = Vec::with_capacity(WRITE_BUFFER_SIZE);
    let mut written = 0u64;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| DownloadError::Request {
            url: truncate_url(url),
            source,
        })?;

        let mut rest: &[u8] = &chunk;
        while !rest.is_empty() {
            let take = (WRITE_BUFFER_SIZE - buffer.len()).min(rest.len());
            buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if buffer.len() == WRITE_BUFFER_SIZE {
                file.write_all(&buffer).await.map_err(io_err)?;
                written += buffer.len() as u64;
                on_write(buffer.len() as u64);
                buffer.clear();
            }
        }
    }

    if !buffer.is_empty() {
        file.write_all(&buffer).await.map_err(io_err)?;
        written += buffer.len() as u64;
        on_write(buffer.len() as u64);
    }

    file.flush().await.map_err(io_err)?;
    debug!("Wrote {} bytes to {}", written, output_path.display());
    Ok(written)
}

/// Truncate URL for error messages
pub(crate) fn truncate_url(url: &str) -> String {
    if url.len() > 80 {
        let cut = (0..=77).rev().find(|&i| url.is_char_boundary(i)).unwrap_or(0);
        format!("{}...", &url[..cut])
    } else {
        url.to_string()
    }
}
