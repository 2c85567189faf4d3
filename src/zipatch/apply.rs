//! Chunk application
//!
//! Replays a container against an install root. Chunks are applied strictly
//! in file order; the first error stops the run and is returned as is.
//! Cancellation is only observed between chunks, so a chunk is never left
//! half written because of it.

use super::chunk::{ApplyOption, Chunk};
use super::sqpk::{expansion_folder, FileOperation, HeaderFile, Platform, SqpkCommand, SqpkFile, BLOCK_SHIFT};
use super::{ChunkFrame, ZiPatchError, ZiPatchReader};
use crate::cancel::CancelToken;
use crate::paths::{ensure_parent_dirs, resolve_under};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Zero-fill writes happen in slices of this size
const ZERO_CHUNK: usize = 64 * 1024;

/// Movie files `RemoveAll` must leave in place
const KEPT_MOVIES: [&str; 4] = ["00000.bk2", "00001.bk2", "00002.bk2", "00003.bk2"];

/// Target tree and flags for one container
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Install root of the repository the patch belongs to
    pub root: PathBuf,
    pub platform: Platform,
    pub ignore_missing: bool,
    pub ignore_old_mismatch: bool,
}

impl ApplyConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            platform: Platform::Win32,
            ignore_missing: false,
            ignore_old_mismatch: false,
        }
    }
}

/// What one container did to the tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub chunks: usize,
    pub directories_created: usize,
    pub directories_deleted: usize,
    pub files_written: usize,
    pub files_deleted: usize,
    pub bytes_written: u64,
}

/// Open and apply a patch file
pub fn apply_patch_file(
    path: &Path,
    config: ApplyConfig,
    cancel: &CancelToken,
) -> Result<ApplySummary, ZiPatchError> {
    let file = File::open(path).map_err(|source| ZiPatchError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Applying {} to {}", path.display(), config.root.display());
    let summary = apply_patch(BufReader::new(file), config, cancel)?;
    info!(
        "Applied {}: {} chunks, {} files written, {} deleted",
        path.display(),
        summary.chunks,
        summary.files_written,
        summary.files_deleted
    );
    Ok(summary)
}

/// Apply every chunk of a container read from `reader`
pub fn apply_patch<R: Read + Seek>(
    reader: R,
    config: ApplyConfig,
    cancel: &CancelToken,
) -> Result<ApplySummary, ZiPatchError> {
    let mut reader = ZiPatchReader::new(reader)?;
    let mut applier = Applier::new(config);

    loop {
        if cancel.is_cancelled() {
            return Err(ZiPatchError::Cancelled);
        }
        match reader.next_chunk()? {
            Some((frame, chunk)) => applier.apply(&frame, chunk)?,
            None => break,
        }
    }

    applier.finish()
}

/// Applies chunks and caches open target files for the container's lifetime
struct Applier {
    config: ApplyConfig,
    handles: HashMap<PathBuf, File>,
    summary: ApplySummary,
}

impl Applier {
    fn new(config: ApplyConfig) -> Self {
        Self {
            config,
            handles: HashMap::new(),
            summary: ApplySummary::default(),
        }
    }

    fn apply(&mut self, frame: &ChunkFrame, chunk: Chunk) -> Result<(), ZiPatchError> {
        debug!("{} @{}: {}", frame.tag, frame.offset, chunk.describe());

        match chunk {
            Chunk::ApplyOption(option) => match option {
                ApplyOption::IgnoreMissing(value) => self.config.ignore_missing = value,
                ApplyOption::IgnoreOldMismatch(value) => self.config.ignore_old_mismatch = value,
                ApplyOption::Unknown { kind, .. } => warn!("Ignoring unknown apply option {}", kind),
            },
            Chunk::AddDirectory { name } => {
                let path = self.resolve(frame, &name)?;
                fs::create_dir_all(&path).map_err(|e| frame.io_error("create directory", path, e))?;
                self.summary.directories_created += 1;
            }
            Chunk::DeleteDirectory { name } => self.delete_directory(frame, &name)?,
            Chunk::Sqpk(command) => self.apply_sqpk(frame, command)?,
            Chunk::FileHeader(_) | Chunk::ApplyFreeSpace { .. } | Chunk::Placeholder | Chunk::EndOfFile => {}
        }

        self.summary.chunks += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<ApplySummary, ZiPatchError> {
        for (path, mut file) in self.handles.drain() {
            file.flush().map_err(|source| ZiPatchError::Io {
                op: "flush",
                path,
                tag: super::ChunkTag::EndOfFile,
                offset: 0,
                source,
            })?;
        }
        Ok(self.summary)
    }

    fn resolve(&self, frame: &ChunkFrame, relative: &str) -> Result<PathBuf, ZiPatchError> {
        resolve_under(&self.config.root, relative).ok_or_else(|| ZiPatchError::UnsafePath {
            path: relative.to_string(),
            tag: frame.tag,
            offset: frame.offset,
        })
    }

    /// Open (or reuse) a target file for read/write, creating it and its parents
    fn handle(&mut self, frame: &ChunkFrame, path: PathBuf) -> Result<&mut File, ZiPatchError> {
        match self.handles.entry(path) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = entry.key().clone();
                ensure_parent_dirs(&path)
                    .map_err(|e| frame.io_error("create parent directories for", path.clone(), e))?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(|e| frame.io_error("open", path, e))?;
                Ok(entry.insert(file))
            }
        }
    }

    fn forget_under(&mut self, dir: &Path) {
        self.handles.retain(|path, _| !path.starts_with(dir));
    }

    fn delete_directory(&mut self, frame: &ChunkFrame, name: &str) -> Result<(), ZiPatchError> {
        let path = self.resolve(frame, name)?;
        self.forget_under(&path);

        match fs::remove_dir(&path) {
            Ok(()) => {
                self.summary.directories_deleted += 1;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.config.ignore_missing => {
                warn!("Directory {} already gone", path.display());
                Ok(())
            }
            Err(e) => {
                error!("Failed to delete directory {}: {}", path.display(), e);
                Err(frame.io_error("delete directory", path, e))
            }
        }
    }

    fn apply_sqpk(&mut self, frame: &ChunkFrame, command: SqpkCommand) -> Result<(), ZiPatchError> {
        let platform = self.config.platform;
        match command {
            SqpkCommand::AddData {
                target,
                block_offset,
                data,
                delete_len,
            } => {
                let path = self.config.root.join(target.dat_path(platform));
                let file = self.handle(frame, path.clone())?;
                file.seek(SeekFrom::Start(block_offset))
                    .and_then(|_| file.write_all(&data))
                    .and_then(|_| write_zeros(file, delete_len))
                    .map_err(|e| frame.io_error("write", path, e))?;
                self.summary.bytes_written += data.len() as u64;
            }
            SqpkCommand::DeleteData {
                target,
                block_offset,
                block_count,
            }
            | SqpkCommand::ExpandData {
                target,
                block_offset,
                block_count,
            } => {
                let path = self.config.root.join(target.dat_path(platform));
                let file = self.handle(frame, path.clone())?;
                write_empty_file_block_at(file, block_offset, block_count)
                    .map_err(|e| frame.io_error("write empty blocks into", path, e))?;
            }
            SqpkCommand::Header {
                file,
                kind,
                target,
                data,
            } => {
                let relative = match file {
                    HeaderFile::Dat => target.dat_path(platform),
                    HeaderFile::Index => target.index_path(platform),
                };
                let path = self.config.root.join(relative);
                let handle = self.handle(frame, path.clone())?;
                handle
                    .seek(SeekFrom::Start(kind.offset()))
                    .and_then(|_| handle.write_all(&data))
                    .map_err(|e| frame.io_error("write header into", path, e))?;
                self.summary.bytes_written += data.len() as u64;
            }
            SqpkCommand::File(file) => self.apply_file(frame, file)?,
            SqpkCommand::TargetInfo(info) => {
                debug!("Target platform {}", info.platform);
                self.config.platform = info.platform;
            }
            SqpkCommand::Index { .. } | SqpkCommand::PatchInfo { .. } => {}
        }
        Ok(())
    }

    fn apply_file(&mut self, frame: &ChunkFrame, file: SqpkFile) -> Result<(), ZiPatchError> {
        match file.operation {
            FileOperation::AddFile => {
                let path = self.resolve(frame, &file.path)?;
                let handle = self.handle(frame, path.clone())?;

                if file.file_offset == 0 {
                    handle
                        .set_len(0)
                        .map_err(|e| frame.io_error("truncate", path.clone(), e))?;
                }
                handle
                    .seek(SeekFrom::Start(file.file_offset))
                    .map_err(|e| frame.io_error("seek", path.clone(), e))?;

                let mut written = 0u64;
                for block in &file.blocks {
                    let data = block
                        .decompress()
                        .map_err(|e| frame.malformed(format!("block in {}: {}", file.path, e)))?;
                    handle
                        .write_all(&data)
                        .map_err(|e| frame.io_error("write", path.clone(), e))?;
                    written += data.len() as u64;
                }

                self.summary.files_written += 1;
                self.summary.bytes_written += written;
            }
            FileOperation::RemoveAll => {
                let folder = expansion_folder(file.expansion_id);
                // Cached handles may point into the folders being cleared
                self.handles.clear();
                for dir in ["sqpack", "movie"] {
                    let dir = self.config.root.join(dir).join(&folder);
                    self.summary.files_deleted += remove_all_files(frame, &dir)?;
                }
            }
            FileOperation::DeleteFile => {
                let path = self.resolve(frame, &file.path)?;
                self.handles.remove(&path);
                match fs::remove_file(&path) {
                    Ok(()) => self.summary.files_deleted += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!("{} already deleted", path.display());
                    }
                    Err(e) => return Err(frame.io_error("delete", path, e)),
                }
            }
            FileOperation::MakeDirTree => {
                let path = self.resolve(frame, &file.path)?;
                fs::create_dir_all(&path).map_err(|e| frame.io_error("create directory", path, e))?;
                self.summary.directories_created += 1;
            }
        }
        Ok(())
    }
}

/// Delete the files directly inside `dir`, keeping `.var` files and the opening movies
fn remove_all_files(frame: &ChunkFrame, dir: &Path) -> Result<usize, ZiPatchError> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut deleted = 0;
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            frame.io_error("list", path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if name.ends_with(".var") || KEPT_MOVIES.iter().any(|m| name.ends_with(m)) {
            continue;
        }

        fs::remove_file(entry.path()).map_err(|e| frame.io_error("delete", entry.path().to_path_buf(), e))?;
        deleted += 1;
    }

    debug!("Removed {} files from {}", deleted, dir.display());
    Ok(deleted)
}

fn write_zeros(file: &mut File, mut len: u64) -> io::Result<()> {
    let zeros = [0u8; ZERO_CHUNK];
    while len > 0 {
        let n = len.min(ZERO_CHUNK as u64) as usize;
        file.write_all(&zeros[..n])?;
        len -= n as u64;
    }
    Ok(())
}

/// Zero `block_count` blocks at `offset` and stamp an empty-block header over the first
fn write_empty_file_block_at(file: &mut File, offset: u64, block_count: u32) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    write_zeros(file, (block_count as u64) << BLOCK_SHIFT)?;

    file.seek(SeekFrom::Start(offset))?;
    let header: [u32; 5] = [1 << BLOCK_SHIFT, 0, 0, block_count.wrapping_sub(1), 0];
    for word in header {
        file.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zipatch::builder::{compressed_block, stored_block, ContainerBuilder, SqpkFileSpec};
    use crate::zipatch::SqpackTarget;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn run(root: &Path, bytes: Vec<u8>) -> Result<ApplySummary, ZiPatchError> {
        apply_patch(Cursor::new(bytes), ApplyConfig::new(root), &CancelToken::new())
    }

    fn target() -> SqpackTarget {
        SqpackTarget {
            main_id: 0x04,
            sub_id: 0x0000,
            file_id: 0,
        }
    }

    #[test]
    fn test_add_directory_and_delete_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("old.dat"), b"stale").unwrap();

        let bytes = ContainerBuilder::new()
            .file_header(3, *b"DIFF", 2)
            .add_directory("testdir")
            .sqpk_file(SqpkFileSpec::delete("old.dat"))
            .finish();
        let summary = run(temp.path(), bytes).unwrap();

        assert!(temp.path().join("testdir").is_dir());
        assert!(!temp.path().join("old.dat").exists());
        assert_eq!(summary.directories_created, 1);
        assert_eq!(summary.files_deleted, 1);
        assert_eq!(summary.chunks, 4);
    }

    #[test]
    fn test_delete_missing_file_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let bytes = ContainerBuilder::new()
            .sqpk_file(SqpkFileSpec::delete("missing.dat"))
            .finish();
        let summary = run(temp.path(), bytes).unwrap();
        assert_eq!(summary.files_deleted, 0);
    }

    #[test]
    fn test_delete_directory_failure_is_fatal() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("full")).unwrap();
        std::fs::write(temp.path().join("full/file"), b"x").unwrap();

        let bytes = ContainerBuilder::new().delete_directory("full").finish();
        let err = run(temp.path(), bytes).unwrap_err();
        assert!(matches!(err, ZiPatchError::Io { op: "delete directory", .. }));
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_delete_missing_directory_respects_ignore_missing() {
        let temp = TempDir::new().unwrap();

        let strict = ContainerBuilder::new().delete_directory("nope").finish();
        assert!(run(temp.path(), strict).is_err());

        let relaxed = ContainerBuilder::new()
            .apply_option(1, true)
            .delete_directory("nope")
            .finish();
        assert!(run(temp.path(), relaxed).is_ok());
    }

    #[test]
    fn test_add_data_splices_and_zeroes() {
        let temp = TempDir::new().unwrap();
        let dat = temp.path().join("sqpack/ffxiv/040000.win32.dat0");
        std::fs::create_dir_all(dat.parent().unwrap()).unwrap();
        std::fs::write(&dat, vec![0xFF; 1024]).unwrap();

        let bytes = ContainerBuilder::new()
            .sqpk_add_data(target(), 2, &[0xAA; 128], 1)
            .finish();
        run(temp.path(), bytes).unwrap();

        let content = std::fs::read(&dat).unwrap();
        assert_eq!(content.len(), 1024);
        assert!(content[..256].iter().all(|&b| b == 0xFF));
        assert!(content[256..384].iter().all(|&b| b == 0xAA));
        assert!(content[384..512].iter().all(|&b| b == 0));
        assert!(content[512..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_delete_data_writes_empty_block_header() {
        let temp = TempDir::new().unwrap();
        let dat = temp.path().join("sqpack/ffxiv/040000.win32.dat0");
        std::fs::create_dir_all(dat.parent().unwrap()).unwrap();
        std::fs::write(&dat, vec![0xFF; 512]).unwrap();

        let bytes = ContainerBuilder::new()
            .sqpk_empty_blocks(b'D', target(), 1, 2)
            .finish();
        run(temp.path(), bytes).unwrap();

        let content = std::fs::read(&dat).unwrap();
        assert!(content[..128].iter().all(|&b| b == 0xFF));
        let words: Vec<u32> = content[128..148]
            .chunks(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        assert_eq!(words, vec![128, 0, 0, 1, 0]);
        assert!(content[148..384].iter().all(|&b| b == 0));
        assert!(content[384..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_expand_data_extends_missing_file() {
        let temp = TempDir::new().unwrap();
        let bytes = ContainerBuilder::new()
            .sqpk_empty_blocks(b'E', target(), 0, 4)
            .finish();
        run(temp.path(), bytes).unwrap();

        let dat = temp.path().join("sqpack/ffxiv/040000.win32.dat0");
        assert_eq!(std::fs::metadata(dat).unwrap().len(), 512);
    }

    #[test]
    fn test_header_offsets() {
        let temp = TempDir::new().unwrap();
        let bytes = ContainerBuilder::new()
            .sqpk_header(b'I', b'V', target(), &[1; 1024])
            .sqpk_header(b'I', b'I', target(), &[2; 1024])
            .finish();
        run(temp.path(), bytes).unwrap();

        let index = std::fs::read(temp.path().join("sqpack/ffxiv/040000.win32.index")).unwrap();
        assert_eq!(index.len(), 2048);
        assert!(index[..1024].iter().all(|&b| b == 1));
        assert!(index[1024..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_target_info_switches_platform() {
        let temp = TempDir::new().unwrap();
        let bytes = ContainerBuilder::new()
            .sqpk_target_info(Platform::Ps4)
            .sqpk_header(b'D', b'V', target(), &[1; 1024])
            .finish();
        run(temp.path(), bytes).unwrap();

        assert!(temp.path().join("sqpack/ffxiv/040000.ps4.dat0").exists());
        assert!(!temp.path().join("sqpack/ffxiv/040000.win32.dat0").exists());
    }

    #[test]
    fn test_add_file_truncates_at_offset_zero() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("movie/ffxiv/intro.bin");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![9u8; 10_000]).unwrap();

        let bytes = ContainerBuilder::new()
            .sqpk_file(
                SqpkFileSpec::add("movie/ffxiv/intro.bin", 0)
                    .block(stored_block(b"abc"))
                    .block(compressed_block(&[5u8; 3000])),
            )
            .sqpk_file(SqpkFileSpec::add("movie/ffxiv/intro.bin", 3003).block(stored_block(b"xyz")))
            .finish();
        let summary = run(temp.path(), bytes).unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 3006);
        assert_eq!(&content[..3], b"abc");
        assert!(content[3..3003].iter().all(|&b| b == 5));
        assert_eq!(&content[3003..], b"xyz");
        assert_eq!(summary.files_written, 2);
        assert_eq!(summary.bytes_written, 3006);
    }

    #[test]
    fn test_remove_all_keeps_protected_files() {
        let temp = TempDir::new().unwrap();
        let sqpack = temp.path().join("sqpack/ex1");
        let movie = temp.path().join("movie/ex1");
        std::fs::create_dir_all(&sqpack).unwrap();
        std::fs::create_dir_all(&movie).unwrap();
        for name in ["020100.win32.dat0", "020100.win32.index", "ex1.ver", "keep.var"] {
            std::fs::write(sqpack.join(name), b"x").unwrap();
        }
        for name in ["00000.bk2", "00003.bk2", "00004.bk2"] {
            std::fs::write(movie.join(name), b"x").unwrap();
        }

        let bytes = ContainerBuilder::new()
            .sqpk_file(SqpkFileSpec::remove_all(1))
            .finish();
        let summary = run(temp.path(), bytes).unwrap();

        assert_eq!(summary.files_deleted, 4);
        assert!(sqpack.join("keep.var").exists());
        assert!(!sqpack.join("ex1.ver").exists());
        assert!(movie.join("00000.bk2").exists());
        assert!(movie.join("00003.bk2").exists());
        assert!(!movie.join("00004.bk2").exists());
    }

    #[test]
    fn test_path_escape_is_rejected() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("game");
        std::fs::create_dir_all(&root).unwrap();

        let bytes = ContainerBuilder::new().add_directory("../outside").finish();
        let err = run(&root, bytes).unwrap_err();
        assert!(matches!(err, ZiPatchError::UnsafePath { .. }));
        assert!(!temp.path().join("outside").exists());
    }

    #[test]
    fn test_cancel_between_chunks() {
        let temp = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let bytes = ContainerBuilder::new().add_directory("testdir").finish();
        let result = apply_patch(Cursor::new(bytes), ApplyConfig::new(temp.path()), &cancel);
        assert!(matches!(result, Err(ZiPatchError::Cancelled)));
        assert!(!temp.path().join("testdir").exists());
    }

    #[test]
    fn test_corruption_stops_before_later_chunks() {
        let temp = TempDir::new().unwrap();
        let bytes = ContainerBuilder::new()
            .add_directory("first")
            .raw_chunk(*b"ZZZZ", &[])
            .add_directory("second")
            .finish();
        let err = run(temp.path(), bytes).unwrap_err();

        assert!(err.is_corruption());
        assert!(temp.path().join("first").is_dir());
        assert!(!temp.path().join("second").exists());
    }
}
