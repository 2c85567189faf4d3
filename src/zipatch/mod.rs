//! ZiPatch container reader
//!
//! A patch file is a 12-byte magic followed by framed chunks:
//!
//! ```text
//! size: u32 BE | tag: [u8; 4] | payload: [u8; size] | crc32: u32 BE
//! ```
//!
//! The CRC covers tag and payload. Every chunk must end exactly where its
//! frame says; the reader seeks to the declared end itself, so a handler
//! that consumes less than the whole payload can never desync the stream.
//! The stream ends with an `EOF_` chunk.

pub mod apply;
pub mod builder;
pub mod chunk;
pub mod sqpk;

pub use apply::{apply_patch, apply_patch_file, ApplyConfig, ApplySummary};
pub use builder::ContainerBuilder;
pub use chunk::{ApplyOption, Chunk, FileHeader};
pub use sqpk::{FileBlock, FileOperation, Platform, SqpackTarget, SqpkCommand};

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

/// File signature
pub const MAGIC: [u8; 12] = [
    0x91, 0x5A, 0x49, 0x50, 0x41, 0x54, 0x43, 0x48, 0x0D, 0x0A, 0x1A, 0x0A,
];

/// Size + tag ahead of the payload
pub const FRAME_HEADER_SIZE: u64 = 8;

/// CRC after the payload
pub const FRAME_TRAILER_SIZE: u64 = 4;

/// Chunk type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkTag {
    FileHeader,
    ApplyOption,
    ApplyFreeSpace,
    AddDirectory,
    DeleteDirectory,
    Sqpk,
    EndOfFile,
    Placeholder,
}

impl ChunkTag {
    pub fn from_bytes(tag: [u8; 4]) -> Option<Self> {
        match &tag {
            b"FHDR" => Some(ChunkTag::FileHeader),
            b"APLY" => Some(ChunkTag::ApplyOption),
            b"APFS" => Some(ChunkTag::ApplyFreeSpace),
            b"ADIR" => Some(ChunkTag::AddDirectory),
            b"DELD" => Some(ChunkTag::DeleteDirectory),
            b"SQPK" => Some(ChunkTag::Sqpk),
            b"EOF_" => Some(ChunkTag::EndOfFile),
            b"XXXX" => Some(ChunkTag::Placeholder),
            _ => None,
        }
    }

    pub fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            ChunkTag::FileHeader => b"FHDR",
            ChunkTag::ApplyOption => b"APLY",
            ChunkTag::ApplyFreeSpace => b"APFS",
            ChunkTag::AddDirectory => b"ADIR",
            ChunkTag::DeleteDirectory => b"DELD",
            ChunkTag::Sqpk => b"SQPK",
            ChunkTag::EndOfFile => b"EOF_",
            ChunkTag::Placeholder => b"XXXX",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkTag::FileHeader => "FHDR",
            ChunkTag::ApplyOption => "APLY",
            ChunkTag::ApplyFreeSpace => "APFS",
            ChunkTag::AddDirectory => "ADIR",
            ChunkTag::DeleteDirectory => "DELD",
            ChunkTag::Sqpk => "SQPK",
            ChunkTag::EndOfFile => "EOF_",
            ChunkTag::Placeholder => "XXXX",
        }
    }
}

impl fmt::Display for ChunkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of one chunk within the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFrame {
    pub tag: ChunkTag,
    /// Offset of the size field
    pub offset: u64,
    pub payload_size: u32,
}

impl ChunkFrame {
    pub fn payload_offset(&self) -> u64 {
        self.offset + FRAME_HEADER_SIZE
    }

    /// Offset where the next chunk must start
    pub fn declared_end(&self) -> u64 {
        self.offset + FRAME_HEADER_SIZE + self.payload_size as u64 + FRAME_TRAILER_SIZE
    }

    pub(crate) fn malformed(&self, reason: impl fmt::Display) -> ZiPatchError {
        ZiPatchError::Malformed {
            tag: self.tag,
            offset: self.offset,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io_error(&self, op: &'static str, path: PathBuf, source: io::Error) -> ZiPatchError {
        ZiPatchError::Io {
            op,
            path,
            tag: self.tag,
            offset: self.offset,
            source,
        }
    }
}

/// Patch container errors
#[derive(Debug, thiserror::Error)]
pub enum ZiPatchError {
    #[error("Not a ZiPatch file (bad magic)")]
    BadMagic,

    #[error("Container truncated inside chunk at offset {offset}")]
    Truncated { offset: u64 },

    #[error("Unknown chunk tag {tag:?} at offset {offset}")]
    UnknownChunk { tag: String, offset: u64 },

    #[error("CRC mismatch in {tag} chunk at offset {offset}: stored {expected:#010x}, computed {actual:#010x}")]
    Checksum {
        tag: ChunkTag,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Cursor at {actual} after {tag} chunk at offset {offset}, declared end is {expected}")]
    CursorMismatch {
        tag: ChunkTag,
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Malformed {tag} chunk at offset {offset}: {reason}")]
    Malformed {
        tag: ChunkTag,
        offset: u64,
        reason: String,
    },

    #[error("Container ended at offset {offset} without an EOF_ chunk")]
    MissingTerminator { offset: u64 },

    #[error("Failed to {op} {path} ({tag} chunk at offset {offset})")]
    Io {
        op: &'static str,
        path: PathBuf,
        tag: ChunkTag,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open patch file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read patch container")]
    Read(#[source] io::Error),

    #[error("Path {path:?} in {tag} chunk at offset {offset} escapes the install root")]
    UnsafePath {
        path: String,
        tag: ChunkTag,
        offset: u64,
    },

    #[error("Patch application cancelled")]
    Cancelled,
}

impl ZiPatchError {
    /// True for errors that mean the container itself is bad rather than the target tree
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ZiPatchError::BadMagic
                | ZiPatchError::Truncated { .. }
                | ZiPatchError::UnknownChunk { .. }
                | ZiPatchError::Checksum { .. }
                | ZiPatchError::CursorMismatch { .. }
                | ZiPatchError::Malformed { .. }
                | ZiPatchError::MissingTerminator { .. }
                | ZiPatchError::UnsafePath { .. }
        )
    }
}

/// Sequential chunk reader over a seekable stream
pub struct ZiPatchReader<R> {
    inner: R,
    position: u64,
    finished: bool,
}

impl<R: Read + Seek> ZiPatchReader<R> {
    /// Check the magic and position the reader on the first chunk
    pub fn new(mut inner: R) -> Result<Self, ZiPatchError> {
        let mut magic = [0u8; 12];
        match inner.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ZiPatchError::BadMagic),
            Err(e) => return Err(ZiPatchError::Read(e)),
        }
        if magic != MAGIC {
            return Err(ZiPatchError::BadMagic);
        }

        Ok(Self {
            inner,
            position: MAGIC.len() as u64,
            finished: false,
        })
    }

    /// Offset of the next chunk
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read, checksum and parse the next chunk
    ///
    /// Returns `None` once `EOF_` has been read. A stream that ends before
    /// `EOF_` is an error.
    pub fn next_chunk(&mut self) -> Result<Option<(ChunkFrame, Chunk)>, ZiPatchError> {
        if self.finished {
            return Ok(None);
        }

        let offset = self.position;
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        match read_full(&mut self.inner, &mut header).map_err(ZiPatchError::Read)? {
            0 => return Err(ZiPatchError::MissingTerminator { offset }),
            n if n < header.len() => return Err(ZiPatchError::Truncated { offset }),
            _ => {}
        }

        let payload_size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let raw_tag = [header[4], header[5], header[6], header[7]];
        let tag = ChunkTag::from_bytes(raw_tag).ok_or_else(|| ZiPatchError::UnknownChunk {
            tag: String::from_utf8_lossy(&raw_tag).into_owned(),
            offset,
        })?;
        let frame = ChunkFrame {
            tag,
            offset,
            payload_size,
        };

        let mut payload = Vec::new();
        (&mut self.inner)
            .take(payload_size as u64)
            .read_to_end(&mut payload)
            .map_err(ZiPatchError::Read)?;
        if payload.len() != payload_size as usize {
            return Err(ZiPatchError::Truncated { offset });
        }

        let chunk = Chunk::parse(&frame, &payload)?;

        // Land on the declared end of the payload no matter what the parser
        // consumed; seeking a BufReader drops its buffer, so only seek when off
        let payload_end = frame.payload_offset() + payload_size as u64;
        let stream_pos = frame.payload_offset() + payload.len() as u64;
        if stream_pos != payload_end {
            let actual = self
                .inner
                .seek(SeekFrom::Start(payload_end))
                .map_err(ZiPatchError::Read)?;
            if actual != payload_end {
                return Err(ZiPatchError::CursorMismatch {
                    tag,
                    offset,
                    expected: payload_end,
                    actual,
                });
            }
        }

        let mut crc = [0u8; FRAME_TRAILER_SIZE as usize];
        if read_full(&mut self.inner, &mut crc).map_err(ZiPatchError::Read)? < crc.len() {
            return Err(ZiPatchError::Truncated { offset });
        }
        let expected = u32::from_be_bytes(crc);
        let computed = chunk_crc(&raw_tag, &payload);
        if expected != computed {
            return Err(ZiPatchError::Checksum {
                tag,
                offset,
                expected,
                actual: computed,
            });
        }

        self.position = frame.declared_end();
        if tag == ChunkTag::EndOfFile {
            self.finished = true;
        }
        Ok(Some((frame, chunk)))
    }
}

/// CRC32 over tag and payload
pub fn chunk_crc(tag: &[u8; 4], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(tag);
    hasher.update(payload);
    hasher.finalize()
}

/// Like `read_exact`, but reports how much was read instead of failing on EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
