//! Typed chunk payloads

use super::sqpk::SqpkCommand;
use super::{ChunkFrame, ChunkTag};
use crate::zipatch::ZiPatchError;
use binrw::prelude::*;
use std::io::{Cursor, Read};

/// A parsed chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    FileHeader(FileHeader),
    ApplyOption(ApplyOption),
    ApplyFreeSpace { unknown_a: u64, unknown_b: u64 },
    AddDirectory { name: String },
    DeleteDirectory { name: String },
    Sqpk(SqpkCommand),
    EndOfFile,
    Placeholder,
}

impl Chunk {
    /// Parse a chunk payload; the payload slice is exactly the declared size
    pub fn parse(frame: &ChunkFrame, payload: &[u8]) -> Result<Self, ZiPatchError> {
        let mut cursor = Cursor::new(payload);
        let chunk = match frame.tag {
            ChunkTag::FileHeader => {
                Chunk::FileHeader(FileHeader::read(&mut cursor).map_err(|e| frame.malformed(e))?)
            }
            ChunkTag::ApplyOption => {
                let raw = RawApplyOption::read(&mut cursor).map_err(|e| frame.malformed(e))?;
                Chunk::ApplyOption(ApplyOption::from_raw(raw.kind, raw.value != 0))
            }
            ChunkTag::ApplyFreeSpace => {
                let raw = RawApplyFreeSpace::read(&mut cursor).map_err(|e| frame.malformed(e))?;
                Chunk::ApplyFreeSpace {
                    unknown_a: raw.unknown_a,
                    unknown_b: raw.unknown_b,
                }
            }
            ChunkTag::AddDirectory => Chunk::AddDirectory {
                name: read_name(frame, &mut cursor)?,
            },
            ChunkTag::DeleteDirectory => Chunk::DeleteDirectory {
                name: read_name(frame, &mut cursor)?,
            },
            ChunkTag::Sqpk => Chunk::Sqpk(SqpkCommand::parse(frame, payload)?),
            ChunkTag::EndOfFile => Chunk::EndOfFile,
            ChunkTag::Placeholder => Chunk::Placeholder,
        };
        Ok(chunk)
    }

    /// Short description for logs and `inspect`
    pub fn describe(&self) -> String {
        match self {
            Chunk::FileHeader(h) => format!(
                "version {} type {} entries {}",
                h.version,
                String::from_utf8_lossy(&h.patch_type),
                h.entry_files
            ),
            Chunk::ApplyOption(o) => format!("{:?}", o),
            Chunk::ApplyFreeSpace { unknown_a, unknown_b } => format!("{} {}", unknown_a, unknown_b),
            Chunk::AddDirectory { name } | Chunk::DeleteDirectory { name } => name.clone(),
            Chunk::Sqpk(cmd) => cmd.describe(),
            Chunk::EndOfFile | Chunk::Placeholder => String::new(),
        }
    }
}

/// `FHDR`: patch file statistics
#[derive(Debug, Clone, PartialEq, Eq, BinRead)]
#[br(big)]
pub struct FileHeader {
    /// Format version, stored in the third byte of a little-endian word
    #[br(little, map = |v: u32| (v >> 16) as u8)]
    pub version: u8,
    /// `DIFF` or `HIST`
    pub patch_type: [u8; 4],
    pub entry_files: u32,
    #[br(if(version == 3))]
    pub v3: Option<FileHeaderV3>,
}

/// Extra `FHDR` counters present in version 3 headers
#[derive(Debug, Clone, PartialEq, Eq, BinRead)]
#[br(big)]
pub struct FileHeaderV3 {
    pub add_directories: u32,
    pub delete_directories: u32,
    delete_data_low: u32,
    delete_data_high: u32,
    pub minor_version: u32,
    pub repository_name: u32,
    pub commands: u32,
    pub sqpk_add_commands: u32,
    pub sqpk_delete_commands: u32,
    pub sqpk_expand_commands: u32,
    pub sqpk_header_commands: u32,
    pub sqpk_file_commands: u32,
}

impl FileHeaderV3 {
    pub fn delete_data_size(&self) -> u64 {
        self.delete_data_low as u64 | ((self.delete_data_high as u64) << 32)
    }
}

/// `APLY`: flags that relax later commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOption {
    IgnoreMissing(bool),
    IgnoreOldMismatch(bool),
    Unknown { kind: u32, value: bool },
}

impl ApplyOption {
    fn from_raw(kind: u32, value: bool) -> Self {
        match kind {
            1 => ApplyOption::IgnoreMissing(value),
            2 => ApplyOption::IgnoreOldMismatch(value),
            kind => ApplyOption::Unknown { kind, value },
        }
    }
}

#[derive(BinRead)]
#[br(big)]
struct RawApplyOption {
    kind: u32,
    #[br(pad_before = 4)]
    value: u32,
}

#[derive(BinRead)]
#[br(big)]
struct RawApplyFreeSpace {
    unknown_a: u64,
    unknown_b: u64,
}

/// Length-prefixed name with trailing NULs removed
fn read_name(frame: &ChunkFrame, cursor: &mut Cursor<&[u8]>) -> Result<String, ZiPatchError> {
    let name_len: u32 = cursor.read_be().map_err(|e| frame.malformed(e))?;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if name_len as u64 > remaining {
        return Err(frame.malformed("name longer than payload"));
    }

    let mut name = vec![0u8; name_len as usize];
    cursor
        .read_exact(&mut name)
        .map_err(|e| frame.malformed(e))?;
    Ok(trim_nul(&name))
}

pub(crate) fn trim_nul(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: ChunkTag, payload: &[u8]) -> ChunkFrame {
        ChunkFrame {
            tag,
            offset: 12,
            payload_size: payload.len() as u32,
        }
    }

    #[test]
    fn test_file_header_v3() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(3u32 << 16).to_le_bytes());
        payload.extend_from_slice(b"DIFF");
        payload.extend_from_slice(&7u32.to_be_bytes());
        for i in 0..12u32 {
            payload.extend_from_slice(&i.to_be_bytes());
        }

        let chunk = Chunk::parse(&frame(ChunkTag::FileHeader, &payload), &payload).unwrap();
        let Chunk::FileHeader(header) = chunk else {
            panic!("expected FHDR");
        };
        assert_eq!(header.version, 3);
        assert_eq!(&header.patch_type, b"DIFF");
        assert_eq!(header.entry_files, 7);
        let v3 = header.v3.unwrap();
        assert_eq!(v3.add_directories, 0);
        assert_eq!(v3.delete_data_size(), 2 | (3u64 << 32));
        assert_eq!(v3.sqpk_file_commands, 11);
    }

    #[test]
    fn test_file_header_v2_has_no_counters() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(2u32 << 16).to_le_bytes());
        payload.extend_from_slice(b"HIST");
        payload.extend_from_slice(&1u32.to_be_bytes());

        let chunk = Chunk::parse(&frame(ChunkTag::FileHeader, &payload), &payload).unwrap();
        assert!(matches!(chunk, Chunk::FileHeader(FileHeader { version: 2, v3: None, .. })));
    }

    #[test]
    fn test_apply_option() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&[0; 4]);
        payload.extend_from_slice(&1u32.to_be_bytes());

        let chunk = Chunk::parse(&frame(ChunkTag::ApplyOption, &payload), &payload).unwrap();
        assert_eq!(chunk, Chunk::ApplyOption(ApplyOption::IgnoreMissing(true)));
    }

    #[test]
    fn test_name_strips_nuls() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&9u32.to_be_bytes());
        payload.extend_from_slice(b"sqpack\0\0\0");

        let chunk = Chunk::parse(&frame(ChunkTag::DeleteDirectory, &payload), &payload).unwrap();
        assert_eq!(chunk, Chunk::DeleteDirectory { name: "sqpack".to_string() });
    }

    #[test]
    fn test_name_longer_than_payload_is_malformed() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u32.to_be_bytes());
        payload.extend_from_slice(b"abc");

        assert!(matches!(
            Chunk::parse(&frame(ChunkTag::AddDirectory, &payload), &payload),
            Err(ZiPatchError::Malformed { .. })
        ));
    }
}
