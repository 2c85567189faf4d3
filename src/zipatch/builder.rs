//! Writes ZiPatch containers
//!
//! Used to produce small synthetic patches for tests and local tooling.
//! Only the subset of chunks the interpreter acts on is covered.

use super::sqpk::{Platform, SqpackTarget, UNCOMPRESSED_MARKER};
use super::{chunk_crc, MAGIC};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::Write;

/// Frame overhead of a chunk: size, tag, crc
const FRAME_OVERHEAD: usize = 12;

/// Assembles a container chunk by chunk
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    bytes: Vec<u8>,
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self {
            bytes: MAGIC.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() == MAGIC.len()
    }

    /// Append a chunk with an arbitrary tag; the CRC is computed
    pub fn raw_chunk(mut self, tag: [u8; 4], payload: &[u8]) -> Self {
        self.bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.bytes.extend_from_slice(&tag);
        self.bytes.extend_from_slice(payload);
        self.bytes.extend_from_slice(&chunk_crc(&tag, payload).to_be_bytes());
        self
    }

    pub fn file_header(self, version: u8, patch_type: [u8; 4], entry_files: u32) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&((version as u32) << 16).to_le_bytes());
        payload.extend_from_slice(&patch_type);
        payload.extend_from_slice(&entry_files.to_be_bytes());
        if version == 3 {
            payload.extend_from_slice(&[0u8; 48]);
        }
        self.raw_chunk(*b"FHDR", &payload)
    }

    /// `APLY` with kind 1 (ignore missing) or 2 (ignore old mismatch)
    pub fn apply_option(self, kind: u32, value: bool) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&kind.to_be_bytes());
        payload.extend_from_slice(&[0u8; 4]);
        payload.extend_from_slice(&(value as u32).to_be_bytes());
        self.raw_chunk(*b"APLY", &payload)
    }

    pub fn add_directory(self, name: &str) -> Self {
        self.add_directory_padded(name, 0)
    }

    /// `ADIR` followed by `extra` trailing bytes the parser does not consume
    pub fn add_directory_padded(self, name: &str, extra: usize) -> Self {
        let mut payload = name_payload(name);
        payload.resize(payload.len() + extra, 0);
        self.raw_chunk(*b"ADIR", &payload)
    }

    pub fn delete_directory(self, name: &str) -> Self {
        self.raw_chunk(*b"DELD", &name_payload(name))
    }

    pub fn placeholder(self) -> Self {
        self.raw_chunk(*b"XXXX", &[])
    }

    /// `SQPK` chunk from a command body (command byte onwards)
    pub fn sqpk(self, body: &[u8]) -> Self {
        self.raw_chunk(*b"SQPK", &sqpk_payload(body))
    }

    pub fn sqpk_file(self, spec: SqpkFileSpec) -> Self {
        self.raw_chunk(*b"SQPK", &spec.payload())
    }

    /// `SQPK A`: `data` is padded to whole 128-byte blocks
    pub fn sqpk_add_data(self, target: SqpackTarget, block_offset: u32, data: &[u8], delete_blocks: u32) -> Self {
        let blocks = data.len().div_ceil(128);
        let mut body = vec![b'A', 0, 0, 0];
        push_target(&mut body, target);
        body.extend_from_slice(&block_offset.to_be_bytes());
        body.extend_from_slice(&(blocks as u32).to_be_bytes());
        body.extend_from_slice(&delete_blocks.to_be_bytes());
        body.extend_from_slice(data);
        body.resize(body.len() + blocks * 128 - data.len(), 0);
        self.sqpk(&body)
    }

    /// `SQPK D` (`command = b'D'`) or `SQPK E` (`command = b'E'`)
    pub fn sqpk_empty_blocks(self, command: u8, target: SqpackTarget, block_offset: u32, block_count: u32) -> Self {
        let mut body = vec![command, 0, 0, 0];
        push_target(&mut body, target);
        body.extend_from_slice(&block_offset.to_be_bytes());
        body.extend_from_slice(&block_count.to_be_bytes());
        body.extend_from_slice(&[0u8; 4]);
        self.sqpk(&body)
    }

    /// `SQPK H`: `file_kind` is `b'D'` or `b'I'`, `header_kind` `b'V'`, `b'I'` or `b'D'`
    pub fn sqpk_header(self, file_kind: u8, header_kind: u8, target: SqpackTarget, header: &[u8; 1024]) -> Self {
        let mut body = vec![b'H', file_kind, header_kind, 0];
        push_target(&mut body, target);
        body.extend_from_slice(header);
        self.sqpk(&body)
    }

    pub fn sqpk_target_info(self, platform: Platform) -> Self {
        let id: u16 = match platform {
            Platform::Win32 => 0,
            Platform::Ps3 => 1,
            Platform::Ps4 => 2,
        };
        let mut body = vec![b'T', 0, 0, 0];
        body.extend_from_slice(&id.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&0u64.to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes());
        self.sqpk(&body)
    }

    /// Append a placeholder chunk so that, after the `EOF_` chunk, the
    /// container is exactly `total` bytes
    pub fn pad_to(self, total: usize) -> Self {
        let needed = total.saturating_sub(self.bytes.len() + FRAME_OVERHEAD * 2);
        self.raw_chunk(*b"XXXX", &vec![0u8; needed])
    }

    /// Append `EOF_` and return the container
    pub fn finish(self) -> Vec<u8> {
        self.raw_chunk(*b"EOF_", &[]).bytes
    }

    pub fn finish_without_terminator(self) -> Vec<u8> {
        self.bytes
    }
}

/// `SQPK F` command description
#[derive(Debug, Clone)]
pub struct SqpkFileSpec {
    operation: u8,
    file_offset: i64,
    expansion_id: u16,
    path: String,
    blocks: Vec<Vec<u8>>,
}

impl SqpkFileSpec {
    pub fn add(path: &str, file_offset: i64) -> Self {
        Self::new(b'A', path, file_offset, 0)
    }

    pub fn remove_all(expansion_id: u16) -> Self {
        Self::new(b'R', "", 0, expansion_id)
    }

    pub fn delete(path: &str) -> Self {
        Self::new(b'D', path, 0, 0)
    }

    pub fn make_dir_tree(path: &str) -> Self {
        Self::new(b'M', path, 0, 0)
    }

    fn new(operation: u8, path: &str, file_offset: i64, expansion_id: u16) -> Self {
        Self {
            operation,
            file_offset,
            expansion_id,
            path: path.to_string(),
            blocks: Vec::new(),
        }
    }

    /// Append an encoded block (see [`stored_block`] and [`compressed_block`])
    pub fn block(mut self, encoded: Vec<u8>) -> Self {
        self.blocks.push(encoded);
        self
    }

    /// Full SQPK payload including the leading size
    pub fn payload(&self) -> Vec<u8> {
        let mut path = self.path.as_bytes().to_vec();
        path.push(0);
        let file_size: u64 = 0;

        let mut body = vec![b'F', self.operation, 0, 0];
        body.extend_from_slice(&self.file_offset.to_be_bytes());
        body.extend_from_slice(&file_size.to_be_bytes());
        body.extend_from_slice(&(path.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.expansion_id.to_be_bytes());
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(&path);
        for block in &self.blocks {
            body.extend_from_slice(block);
        }
        sqpk_payload(&body)
    }
}

/// Encode an uncompressed file block
pub fn stored_block(data: &[u8]) -> Vec<u8> {
    encode_block(UNCOMPRESSED_MARKER, data.len() as i32, data)
}

/// Encode a raw-deflate file block
pub fn compressed_block(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    // Writes into a Vec cannot fail
    let _ = encoder.write_all(data);
    let packed = encoder.finish().unwrap_or_default();
    encode_block(packed.len() as i32, data.len() as i32, &packed)
}

fn encode_block(compressed_size: i32, decompressed_size: i32, data: &[u8]) -> Vec<u8> {
    let block_len = (data.len() + 143) & !0x7F;
    let mut block = Vec::with_capacity(block_len);
    block.extend_from_slice(&16i32.to_le_bytes());
    block.extend_from_slice(&0u32.to_le_bytes());
    block.extend_from_slice(&compressed_size.to_le_bytes());
    block.extend_from_slice(&decompressed_size.to_le_bytes());
    block.extend_from_slice(data);
    block.resize(block_len, 0);
    block
}

fn sqpk_payload(body: &[u8]) -> Vec<u8> {
    let mut payload = ((body.len() + 4) as i32).to_be_bytes().to_vec();
    payload.extend_from_slice(body);
    payload
}

fn name_payload(name: &str) -> Vec<u8> {
    let mut payload = (name.len() as u32).to_be_bytes().to_vec();
    payload.extend_from_slice(name.as_bytes());
    payload
}

fn push_target(body: &mut Vec<u8>, target: SqpackTarget) {
    body.extend_from_slice(&target.main_id.to_be_bytes());
    body.extend_from_slice(&target.sub_id.to_be_bytes());
    body.extend_from_slice(&target.file_id.to_be_bytes());
}
