//! Block hash verification for downloaded patches.
//!
//! The authenticated patch list carries one SHA1 per `hash_block_size`
//! bytes of each patch file. Files are streamed block by block, so a 2 GiB
//! patch never sits in memory.

use crate::patchlist::PatchDescriptor;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read buffer for hashing
const READ_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Failed to read {path} for hashing")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Hash mismatch in {file} at block {block}")]
    HashMismatch { file: String, block: usize },

    #[error("{file} has {actual} hash blocks, manifest lists {expected}")]
    BlockCount {
        file: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported hash type {0:?}")]
    UnsupportedHashType(String),
}

/// What verification concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Every block matched
    Verified { blocks: usize },
    /// The manifest carried no block hashes for this patch
    Skipped,
}

/// Lowercase hex SHA1 of a byte slice
pub fn sha1_hex(data: &[u8]) -> String {
    to_hex(&Sha1::digest(data))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute the SHA1 of every `block_size` bytes of a file.
pub fn compute_block_hashes(path: &Path, block_size: u64) -> Result<Vec<String>, VerifyError> {
    let io_err = |source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_err)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut hashes = Vec::new();

    loop {
        let mut hasher = Sha1::new();
        let mut remaining = block_size;
        let mut block_len = 0u64;

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let read = reader.read(&mut buf[..want]).map_err(io_err)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            remaining -= read as u64;
            block_len += read as u64;
        }

        if block_len == 0 {
            break;
        }
        hashes.push(to_hex(&hasher.finalize()));
        if remaining > 0 {
            break;
        }
    }

    Ok(hashes)
}

/// Verify a downloaded patch against the block hashes in its descriptor.
pub fn verify_patch(path: &Path, patch: &PatchDescriptor) -> Result<VerifyOutcome, VerifyError> {
    let hash_type = match patch.hash_type.as_deref() {
        Some(t) if !patch.hashes.is_empty() => t,
        _ => {
            debug!("No block hashes for {}, skipping verification", patch.file_name);
            return Ok(VerifyOutcome::Skipped);
        }
    };

    if !hash_type.eq_ignore_ascii_case("sha1") {
        return Err(VerifyError::UnsupportedHashType(hash_type.to_string()));
    }

    if patch.hash_block_size == 0 {
        return Err(VerifyError::BlockCount {
            file: patch.file_name.clone(),
            expected: patch.hashes.len(),
            actual: 0,
        });
    }

    let actual = compute_block_hashes(path, patch.hash_block_size)?;
    if actual.len() != patch.hashes.len() {
        return Err(VerifyError::BlockCount {
            file: patch.file_name.clone(),
            expected: patch.hashes.len(),
            actual: actual.len(),
        });
    }

    if let Some(block) = actual
        .iter()
        .zip(&patch.hashes)
        .position(|(a, e)| !a.eq_ignore_ascii_case(e))
    {
        return Err(VerifyError::HashMismatch {
            file: patch.file_name.clone(),
            block,
        });
    }

    debug!("Verified {} ({} blocks)", patch.file_name, actual.len());
    Ok(VerifyOutcome::Verified {
        blocks: actual.len(),
    })
}
