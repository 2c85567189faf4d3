//! `SQPK` commands
//!
//! Every SQPK payload starts with its own big-endian size (which must match
//! the frame) and a one-byte command. Block offsets and lengths in the data
//! commands are stored in 128-byte units.

use super::chunk::trim_nul;
use super::{ChunkFrame, ZiPatchError};
use binrw::prelude::*;
use flate2::read::DeflateDecoder;
use std::fmt;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

/// Sqpack data is addressed in 128-byte blocks
pub const BLOCK_SHIFT: u32 = 7;

/// Size of a `.dat` / `.index` header written by `SQPK H`
pub const HEADER_SIZE: usize = 1024;

/// `compressed_size` value marking a stored (uncompressed) block
pub const UNCOMPRESSED_MARKER: i32 = 0x7d00;

const BLOCK_HEADER_SIZE: u64 = 16;

/// Platform suffix used in sqpack file names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Win32,
    Ps3,
    Ps4,
}

impl Platform {
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(Platform::Win32),
            1 => Some(Platform::Ps3),
            2 => Some(Platform::Ps4),
            _ => None,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Platform::Win32 => "win32",
            Platform::Ps3 => "ps3",
            Platform::Ps4 => "ps4",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// `ffxiv` for the base game, `exN` otherwise
pub fn expansion_folder(expansion: u16) -> String {
    if expansion == 0 {
        "ffxiv".to_string()
    } else {
        format!("ex{}", expansion)
    }
}

/// Identifies one sqpack `.dat` / `.index` file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinRead)]
#[br(big)]
pub struct SqpackTarget {
    pub main_id: u16,
    pub sub_id: u16,
    pub file_id: u32,
}

impl SqpackTarget {
    pub fn expansion(&self) -> u16 {
        self.sub_id >> 8
    }

    fn stem(&self, platform: Platform) -> PathBuf {
        PathBuf::from("sqpack")
            .join(expansion_folder(self.expansion()))
            .join(format!("{:02x}{:04x}.{}", self.main_id, self.sub_id, platform))
    }

    /// `sqpack/<exp>/<main><sub>.<platform>.dat<file>`, relative to the install root
    pub fn dat_path(&self, platform: Platform) -> PathBuf {
        let mut path = self.stem(platform).into_os_string();
        path.push(format!(".dat{}", self.file_id));
        path.into()
    }

    /// `.index` for file 0, `.index<N>` otherwise
    pub fn index_path(&self, platform: Platform) -> PathBuf {
        let mut path = self.stem(platform).into_os_string();
        if self.file_id == 0 {
            path.push(".index");
        } else {
            path.push(format!(".index{}", self.file_id));
        }
        path.into()
    }
}

/// Which file an `SQPK H` header goes into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFile {
    Dat,
    Index,
}

/// Which header slot an `SQPK H` command overwrites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Version,
    Index,
    Data,
}

impl HeaderKind {
    /// The version header lives at 0, the index/data header right after it
    pub fn offset(self) -> u64 {
        match self {
            HeaderKind::Version => 0,
            HeaderKind::Index | HeaderKind::Data => HEADER_SIZE as u64,
        }
    }
}

/// `SQPK F` sub-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    AddFile,
    RemoveAll,
    DeleteFile,
    MakeDirTree,
}

/// One block of an `SQPK F` add-file payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub compressed: bool,
    pub decompressed_size: u32,
    pub data: Vec<u8>,
}

impl FileBlock {
    /// Block contents, inflating raw deflate data when compressed
    pub fn decompress(&self) -> io::Result<Vec<u8>> {
        if !self.compressed {
            return Ok(self.data.clone());
        }

        let mut out = Vec::with_capacity(self.decompressed_size as usize);
        DeflateDecoder::new(self.data.as_slice()).read_to_end(&mut out)?;
        if out.len() != self.decompressed_size as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "block inflated to {} bytes, header says {}",
                    out.len(),
                    self.decompressed_size
                ),
            ));
        }
        Ok(out)
    }
}

/// `SQPK F` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqpkFile {
    pub operation: FileOperation,
    pub file_offset: u64,
    pub file_size: u64,
    pub expansion_id: u16,
    pub path: String,
    pub blocks: Vec<FileBlock>,
}

/// `SQPK T` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub platform: Platform,
    pub region: i16,
    pub is_debug: bool,
    pub version: u16,
    pub deleted_data_size: u64,
    pub seek_count: u64,
}

/// A parsed SQPK command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqpkCommand {
    AddData {
        target: SqpackTarget,
        block_offset: u64,
        data: Vec<u8>,
        delete_len: u64,
    },
    DeleteData {
        target: SqpackTarget,
        block_offset: u64,
        block_count: u32,
    },
    ExpandData {
        target: SqpackTarget,
        block_offset: u64,
        block_count: u32,
    },
    Header {
        file: HeaderFile,
        kind: HeaderKind,
        target: SqpackTarget,
        data: Vec<u8>,
    },
    File(SqpkFile),
    Index {
        command: u8,
        is_synonym: bool,
        target: SqpackTarget,
        file_hash: u64,
        block_offset: u32,
        block_number: u32,
    },
    PatchInfo {
        status: u8,
        version: u8,
        install_size: u64,
    },
    TargetInfo(TargetInfo),
}

#[derive(BinRead)]
#[br(big)]
struct RawAddData {
    #[br(pad_before = 3)]
    target: SqpackTarget,
    block_offset: u32,
    data_blocks: u32,
    delete_blocks: u32,
}

#[derive(BinRead)]
#[br(big)]
struct RawBlockRange {
    #[br(pad_before = 3)]
    target: SqpackTarget,
    block_offset: u32,
    block_count: u32,
}

#[derive(BinRead)]
#[br(big)]
struct RawHeader {
    file_kind: u8,
    #[br(pad_after = 1)]
    header_kind: u8,
    target: SqpackTarget,
}

#[derive(BinRead)]
#[br(big)]
struct RawFile {
    #[br(pad_after = 2)]
    operation: u8,
    file_offset: i64,
    file_size: u64,
    path_len: u32,
    #[br(pad_after = 2)]
    expansion_id: u16,
}

#[derive(BinRead)]
#[br(little)]
struct RawBlockHeader {
    header_size: i32,
    #[br(pad_before = 4)]
    compressed_size: i32,
    decompressed_size: i32,
}

#[derive(BinRead)]
#[br(big)]
struct RawIndex {
    command: u8,
    #[br(pad_after = 1)]
    is_synonym: u8,
    target: SqpackTarget,
    file_hash: u64,
    block_offset: u32,
    block_number: u32,
}

#[derive(BinRead)]
#[br(big)]
struct RawPatchInfo {
    status: u8,
    #[br(pad_after = 1)]
    version: u8,
    install_size: u64,
}

#[derive(BinRead)]
#[br(big)]
struct RawTargetInfo {
    #[br(pad_before = 3)]
    platform: u16,
    region: i16,
    is_debug: i16,
    version: u16,
    #[br(little)]
    deleted_data_size: u64,
    #[br(little)]
    seek_count: u64,
}

impl SqpkCommand {
    /// Parse a full SQPK payload (size prefix included)
    pub fn parse(frame: &ChunkFrame, payload: &[u8]) -> Result<Self, ZiPatchError> {
        let mut cursor = Cursor::new(payload);
        let inner_size: i32 = cursor.read_be().map_err(|e| frame.malformed(e))?;
        if inner_size < 0 || inner_size as u32 != frame.payload_size {
            return Err(frame.malformed(format!(
                "inner size {} does not match chunk size {}",
                inner_size, frame.payload_size
            )));
        }

        let command: u8 = cursor.read_be().map_err(|e| frame.malformed(e))?;
        let cmd = match command {
            b'A' => {
                let raw = RawAddData::read(&mut cursor).map_err(|e| frame.malformed(e))?;
                let data_len = (raw.data_blocks as u64) << BLOCK_SHIFT;
                SqpkCommand::AddData {
                    target: raw.target,
                    block_offset: (raw.block_offset as u64) << BLOCK_SHIFT,
                    data: take_bytes(frame, &mut cursor, data_len)?,
                    delete_len: (raw.delete_blocks as u64) << BLOCK_SHIFT,
                }
            }
            b'D' | b'E' => {
                let raw = RawBlockRange::read(&mut cursor).map_err(|e| frame.malformed(e))?;
                let target = raw.target;
                let block_offset = (raw.block_offset as u64) << BLOCK_SHIFT;
                let block_count = raw.block_count;
                if command == b'D' {
                    SqpkCommand::DeleteData {
                        target,
                        block_offset,
                        block_count,
                    }
                } else {
                    SqpkCommand::ExpandData {
                        target,
                        block_offset,
                        block_count,
                    }
                }
            }
            b'H' => {
                let raw = RawHeader::read(&mut cursor).map_err(|e| frame.malformed(e))?;
                let file = match raw.file_kind {
                    b'D' => HeaderFile::Dat,
                    b'I' => HeaderFile::Index,
                    other => return Err(frame.malformed(format!("unknown header file kind {:#04x}", other))),
                };
                let kind = match raw.header_kind {
                    b'V' => HeaderKind::Version,
                    b'I' => HeaderKind::Index,
                    b'D' => HeaderKind::Data,
                    other => return Err(frame.malformed(format!("unknown header kind {:#04x}", other))),
                };
                SqpkCommand::Header {
                    file,
                    kind,
                    target: raw.target,
                    data: take_bytes(frame, &mut cursor, HEADER_SIZE as u64)?,
                }
            }
            b'F' => SqpkCommand::File(parse_file(frame, &mut cursor)?),
            b'I' => {
                let raw = RawIndex::read(&mut cursor).map_err(|e| frame.malformed(e))?;
                SqpkCommand::Index {
                    command: raw.command,
                    is_synonym: raw.is_synonym != 0,
                    target: raw.target,
                    file_hash: raw.file_hash,
                    block_offset: raw.block_offset,
                    block_number: raw.block_number,
                }
            }
            b'X' => {
                let raw = RawPatchInfo::read(&mut cursor).map_err(|e| frame.malformed(e))?;
                SqpkCommand::PatchInfo {
                    status: raw.status,
                    version: raw.version,
                    install_size: raw.install_size,
                }
            }
            b'T' => {
                let raw = RawTargetInfo::read(&mut cursor).map_err(|e| frame.malformed(e))?;
                let platform = Platform::from_id(raw.platform)
                    .ok_or_else(|| frame.malformed(format!("unknown platform id {}", raw.platform)))?;
                SqpkCommand::TargetInfo(TargetInfo {
                    platform,
                    region: raw.region,
                    is_debug: raw.is_debug != 0,
                    version: raw.version,
                    deleted_data_size: raw.deleted_data_size,
                    seek_count: raw.seek_count,
                })
            }
            other => {
                return Err(frame.malformed(format!("unknown SQPK command {:?}", other as char)));
            }
        };
        Ok(cmd)
    }

    /// Command letter plus its target, for logs
    pub fn describe(&self) -> String {
        match self {
            SqpkCommand::AddData {
                target,
                block_offset,
                data,
                delete_len,
            } => format!(
                "A {} @{} +{} -{}",
                target.dat_path(Platform::Win32).display(),
                block_offset,
                data.len(),
                delete_len
            ),
            SqpkCommand::DeleteData {
                target,
                block_offset,
                block_count,
            } => format!("D {} @{} x{}", target.dat_path(Platform::Win32).display(), block_offset, block_count),
            SqpkCommand::ExpandData {
                target,
                block_offset,
                block_count,
            } => format!("E {} @{} x{}", target.dat_path(Platform::Win32).display(), block_offset, block_count),
            SqpkCommand::Header { file, kind, target, .. } => {
                format!("H {:?}/{:?} {:?}", file, kind, target)
            }
            SqpkCommand::File(f) => format!("F {:?} {} @{}", f.operation, f.path, f.file_offset),
            SqpkCommand::Index { command, target, .. } => format!("I {} {:?}", *command as char, target),
            SqpkCommand::PatchInfo { install_size, .. } => format!("X install size {}", install_size),
            SqpkCommand::TargetInfo(t) => format!("T {} region {}", t.platform, t.region),
        }
    }
}

fn parse_file(frame: &ChunkFrame, cursor: &mut Cursor<&[u8]>) -> Result<SqpkFile, ZiPatchError> {
    let raw = RawFile::read(cursor).map_err(|e| frame.malformed(e))?;

    let operation = match raw.operation {
        b'A' => FileOperation::AddFile,
        b'R' => FileOperation::RemoveAll,
        b'D' => FileOperation::DeleteFile,
        b'M' => FileOperation::MakeDirTree,
        other => return Err(frame.malformed(format!("unknown file operation {:?}", other as char))),
    };
    let file_offset = u64::try_from(raw.file_offset)
        .map_err(|_| frame.malformed(format!("negative file offset {}", raw.file_offset)))?;
    let path = trim_nul(&take_bytes(frame, cursor, raw.path_len as u64)?);

    let mut blocks = Vec::new();
    if operation == FileOperation::AddFile {
        let end = cursor.get_ref().len() as u64;
        while end - cursor.position() >= BLOCK_HEADER_SIZE {
            blocks.push(parse_block(frame, cursor)?);
        }
    }

    Ok(SqpkFile {
        operation,
        file_offset,
        file_size: raw.file_size,
        expansion_id: raw.expansion_id,
        path,
        blocks,
    })
}

fn parse_block(frame: &ChunkFrame, cursor: &mut Cursor<&[u8]>) -> Result<FileBlock, ZiPatchError> {
    let start = cursor.position();
    let end = cursor.get_ref().len() as u64;
    let raw = RawBlockHeader::read(cursor).map_err(|e| frame.malformed(e))?;

    if raw.header_size < 0 || raw.compressed_size < 0 || raw.decompressed_size < 0 {
        return Err(frame.malformed(format!("negative block header field at payload offset {}", start)));
    }

    let compressed = raw.compressed_size != UNCOMPRESSED_MARKER;
    let data_len = (if compressed {
        raw.compressed_size
    } else {
        raw.decompressed_size
    }) as u64;

    cursor.set_position(start + raw.header_size as u64);
    let data = take_bytes(frame, cursor, data_len)?;

    // Blocks are padded to 128 bytes including the header
    let block_len = (data_len + 143) & !0x7F;
    cursor.set_position((start + block_len).min(end));

    Ok(FileBlock {
        compressed,
        decompressed_size: raw.decompressed_size as u32,
        data,
    })
}

/// Read `len` bytes, refusing lengths that run past the payload
fn take_bytes(frame: &ChunkFrame, cursor: &mut Cursor<&[u8]>, len: u64) -> Result<Vec<u8>, ZiPatchError> {
    let available = (cursor.get_ref().len() as u64).saturating_sub(cursor.position());
    if len > available {
        return Err(frame.malformed(format!(
            "{} bytes requested, {} left in payload",
            len, available
        )));
    }

    let mut data = vec![0u8; len as usize];
    cursor.read_exact(&mut data).map_err(|e| frame.malformed(e))?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zipatch::builder::{compressed_block, stored_block, SqpkFileSpec};
    use crate::zipatch::ChunkTag;
    use std::path::Path;

    fn parse(payload: &[u8]) -> Result<SqpkCommand, ZiPatchError> {
        let frame = ChunkFrame {
            tag: ChunkTag::Sqpk,
            offset: 12,
            payload_size: payload.len() as u32,
        };
        SqpkCommand::parse(&frame, payload)
    }

    fn with_size(body: Vec<u8>) -> Vec<u8> {
        let mut payload = ((body.len() + 4) as i32).to_be_bytes().to_vec();
        payload.extend(body);
        payload
    }

    #[test]
    fn test_target_paths() {
        let target = SqpackTarget {
            main_id: 0x04,
            sub_id: 0x0100,
            file_id: 2,
        };
        assert_eq!(
            target.dat_path(Platform::Win32),
            Path::new("sqpack/ex1/040100.win32.dat2")
        );
        assert_eq!(
            target.index_path(Platform::Ps4),
            Path::new("sqpack/ex1/040100.ps4.index2")
        );

        let base = SqpackTarget {
            main_id: 0x0a,
            sub_id: 0x0000,
            file_id: 0,
        };
        assert_eq!(
            base.index_path(Platform::Win32),
            Path::new("sqpack/ffxiv/0a0000.win32.index")
        );
    }

    #[test]
    fn test_add_data_units() {
        let mut body = vec![b'A', 0, 0, 0];
        body.extend_from_slice(&0x04u16.to_be_bytes());
        body.extend_from_slice(&0x0000u16.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&3u32.to_be_bytes()); // offset, blocks
        body.extend_from_slice(&1u32.to_be_bytes()); // data, blocks
        body.extend_from_slice(&2u32.to_be_bytes()); // delete, blocks
        body.extend(vec![0xAB; 128]);

        let cmd = parse(&with_size(body)).unwrap();
        let SqpkCommand::AddData {
            block_offset,
            data,
            delete_len,
            ..
        } = cmd
        else {
            panic!("expected add data");
        };
        assert_eq!(block_offset, 384);
        assert_eq!(data.len(), 128);
        assert_eq!(delete_len, 256);
    }

    #[test]
    fn test_inner_size_must_match() {
        let mut payload = 999i32.to_be_bytes().to_vec();
        payload.push(b'X');
        payload.extend_from_slice(&[0; 11]);
        assert!(matches!(parse(&payload), Err(ZiPatchError::Malformed { .. })));
    }

    #[test]
    fn test_target_info_platform() {
        let mut body = vec![b'T', 0, 0, 0];
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&5u64.to_le_bytes());
        body.extend_from_slice(&6u64.to_le_bytes());

        let cmd = parse(&with_size(body.clone())).unwrap();
        assert_eq!(
            cmd,
            SqpkCommand::TargetInfo(TargetInfo {
                platform: Platform::Ps4,
                region: -1,
                is_debug: false,
                version: 0,
                deleted_data_size: 5,
                seek_count: 6,
            })
        );

        body[4..6].copy_from_slice(&9u16.to_be_bytes());
        assert!(matches!(parse(&with_size(body)), Err(ZiPatchError::Malformed { .. })));
    }

    #[test]
    fn test_add_file_blocks() {
        let plain = b"hello, sqpack".to_vec();
        let packed = vec![7u8; 4000];
        let spec = SqpkFileSpec::add("sqpack/ffxiv/000000.win32.dat0", 0)
            .block(stored_block(&plain))
            .block(compressed_block(&packed));

        let cmd = parse(&spec.payload()).unwrap();
        let SqpkCommand::File(file) = cmd else {
            panic!("expected file command");
        };
        assert_eq!(file.operation, FileOperation::AddFile);
        assert_eq!(file.path, "sqpack/ffxiv/000000.win32.dat0");
        assert_eq!(file.blocks.len(), 2);
        assert!(!file.blocks[0].compressed);
        assert_eq!(file.blocks[0].decompress().unwrap(), plain);
        assert!(file.blocks[1].compressed);
        assert_eq!(file.blocks[1].decompress().unwrap(), packed);
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            parse(&with_size(vec![b'Q', 0, 0, 0])),
            Err(ZiPatchError::Malformed { .. })
        ));
    }
}
