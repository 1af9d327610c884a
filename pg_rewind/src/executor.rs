//! File map executor (§4.G): applies a finalized file map against the
//! target directory, reading bytes through a `FileSource`.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::symlink;

use camino::Utf8Path;
use tracing::{debug, info};

use postgres_ffi::BLCKSZ;

use crate::error::RewindError;
use crate::filemap::{FileAction, FileEntry, FileType, FinalizedFileMap};
use crate::source::{FileSource, RangeRequest};

pub struct Executor<'a> {
    target_root: &'a Utf8Path,
    dry_run: bool,
}

impl<'a> Executor<'a> {
    pub fn new(target_root: &'a Utf8Path, dry_run: bool) -> Executor<'a> {
        Executor { target_root, dry_run }
    }

    pub fn run(&self, map: &FinalizedFileMap, source: &mut dyn FileSource) -> Result<(), RewindError> {
        for entry in map.entries() {
            self.drain_pagemap(entry, source)?;
            self.apply_action(entry, source)?;
        }
        if !self.dry_run {
            self.fsync_mutated(map)?;
        }
        Ok(())
    }

    /// Durability pass: every entry whose action touched the filesystem gets
    /// its file (or, for `create`/`remove`, its containing directory)
    /// fsynced, then the target root directory itself.
    fn fsync_mutated(&self, map: &FinalizedFileMap) -> Result<(), RewindError> {
        for entry in map.entries() {
            match entry.action {
                FileAction::None => continue,
                FileAction::CopyWhole | FileAction::CopyTail | FileAction::Truncate => {
                    if entry.kind == FileType::Regular {
                        self.fsync_path(&self.abs(&entry.path))?;
                    }
                }
                FileAction::Create | FileAction::Remove => {
                    let parent = Utf8Path::new(&entry.path)
                        .parent()
                        .map(|p| self.target_root.join(p))
                        .unwrap_or_else(|| self.target_root.to_path_buf());
                    self.fsync_path(parent.as_std_path())?;
                }
            }
        }
        self.fsync_path(self.target_root.as_std_path())
    }

    fn fsync_path(&self, path: &std::path::Path) -> Result<(), RewindError> {
        let f = fs::File::open(path).map_err(|e| RewindError::IoTarget(e, path_to_utf8(path)))?;
        f.sync_all()
            .map_err(|e| RewindError::IoTarget(e, path_to_utf8(path)))
    }

    fn abs(&self, path: &str) -> std::path::PathBuf {
        self.target_root.join(path).into_std_path_buf()
    }

    /// Per-block range fetches for entries whose page map carries bits, even
    /// when the file-level action is `none`/`truncate`/`copy-tail` (§4.G).
    fn drain_pagemap(&self, entry: &FileEntry, source: &mut dyn FileSource) -> Result<(), RewindError> {
        if entry.pagemap.empty() {
            return Ok(());
        }

        let requests: Vec<RangeRequest> = entry
            .pagemap
            .iter()
            .map(|blkno| RangeRequest {
                path: entry.path.clone(),
                offset: blkno as u64 * BLCKSZ as u64,
                len: BLCKSZ as u64,
            })
            .collect();
        let blocks: Vec<u32> = entry.pagemap.iter().collect();

        let results = source.execute_plan(&requests)?;

        if self.dry_run {
            debug!("{}: would refresh {} block(s)", entry.path, requests.len());
            return Ok(());
        }

        let abs = self.abs(&entry.path);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&abs)
            .map_err(|e| RewindError::IoTarget(e, entry_path(self.target_root, &entry.path)))?;

        for (blkno, result) in blocks.into_iter().zip(results) {
            match result {
                Some(bytes) => {
                    file.seek(SeekFrom::Start(blkno as u64 * BLCKSZ as u64))
                        .map_err(|e| RewindError::IoTarget(e, entry_path(self.target_root, &entry.path)))?;
                    file.write_all(&bytes)
                        .map_err(|e| RewindError::IoTarget(e, entry_path(self.target_root, &entry.path)))?;
                }
                None => {
                    // File vanished on the source mid-run; the file-level
                    // action below will remove it from the target.
                }
            }
        }
        Ok(())
    }

    fn apply_action(&self, entry: &FileEntry, source: &mut dyn FileSource) -> Result<(), RewindError> {
        let abs_path = entry_path(self.target_root, &entry.path);
        match entry.action {
            FileAction::None => Ok(()),

            FileAction::CopyWhole => {
                info!("{}: copying whole file ({} bytes)", entry.path, entry.newsize);
                if self.dry_run {
                    return Ok(());
                }
                let results = source.execute_plan(&[RangeRequest {
                    path: entry.path.clone(),
                    offset: 0,
                    len: entry.newsize,
                }])?;
                match results.into_iter().next().flatten() {
                    Some(bytes) => {
                        fs::write(self.abs(&entry.path), &bytes)
                            .map_err(|e| RewindError::IoTarget(e, abs_path))
                    }
                    None => {
                        let _ = fs::remove_file(self.abs(&entry.path));
                        Ok(())
                    }
                }
            }

            FileAction::CopyTail => {
                info!(
                    "{}: extending from {} to {} bytes",
                    entry.path, entry.oldsize, entry.newsize
                );
                if self.dry_run {
                    return Ok(());
                }
                let results = source.execute_plan(&[RangeRequest {
                    path: entry.path.clone(),
                    offset: entry.oldsize,
                    len: entry.newsize - entry.oldsize,
                }])?;
                match results.into_iter().next().flatten() {
                    Some(bytes) => {
                        let mut file = OpenOptions::new()
                            .write(true)
                            .open(self.abs(&entry.path))
                            .map_err(|e| RewindError::IoTarget(e, abs_path.clone()))?;
                        file.seek(SeekFrom::Start(entry.oldsize))
                            .map_err(|e| RewindError::IoTarget(e, abs_path.clone()))?;
                        file.write_all(&bytes)
                            .map_err(|e| RewindError::IoTarget(e, abs_path))
                    }
                    None => {
                        let _ = fs::remove_file(self.abs(&entry.path));
                        Ok(())
                    }
                }
            }

            FileAction::Truncate => {
                info!("{}: truncating to {} bytes", entry.path, entry.newsize);
                if self.dry_run {
                    return Ok(());
                }
                let file = OpenOptions::new()
                    .write(true)
                    .open(self.abs(&entry.path))
                    .map_err(|e| RewindError::IoTarget(e, abs_path.clone()))?;
                file.set_len(entry.newsize)
                    .map_err(|e| RewindError::IoTarget(e, abs_path))
            }

            FileAction::Create => {
                if self.dry_run {
                    return Ok(());
                }
                match entry.kind {
                    FileType::Directory => fs::create_dir(self.abs(&entry.path))
                        .map_err(|e| RewindError::IoTarget(e, abs_path)),
                    FileType::Symlink => {
                        let target = entry
                            .link_target
                            .as_deref()
                            .expect("create entry for a symlink always carries a target");
                        symlink(target, self.abs(&entry.path))
                            .map_err(|e| RewindError::IoTarget(e, abs_path))
                    }
                    FileType::Regular => unreachable!("create is only valid for dir/symlink"),
                }
            }

            FileAction::Remove => {
                if self.dry_run {
                    return Ok(());
                }
                match entry.kind {
                    FileType::Regular | FileType::Symlink => {
                        match fs::remove_file(self.abs(&entry.path)) {
                            Ok(()) => Ok(()),
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                            Err(e) => Err(RewindError::IoTarget(e, abs_path)),
                        }
                    }
                    FileType::Directory => match fs::remove_dir(self.abs(&entry.path)) {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(RewindError::IoTarget(e, abs_path)),
                    },
                }
            }
        }
    }
}

fn entry_path(root: &Utf8Path, rel: &str) -> camino::Utf8PathBuf {
    root.join(rel)
}

fn path_to_utf8(path: &std::path::Path) -> camino::Utf8PathBuf {
    camino::Utf8PathBuf::from_path_buf(path.to_path_buf())
        .unwrap_or_else(|p| camino::Utf8PathBuf::from(p.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filemap::FileMap;
    use crate::source::local::LocalSource;
    use camino_tempfile::tempdir;

    #[test]
    fn copies_whole_file_from_source() {
        let target = tempdir().unwrap();
        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("base/1").as_std_path()).unwrap();
        fs::write(src.path().join("base/1/16384").as_std_path(), b"abcdef").unwrap();

        let mut map = FileMap::new();
        map.process_remote(target.path(), "base/1/16384", FileType::Regular, 6, None)
            .unwrap();
        map.finish_remote();
        let finalized = map.finalize();

        let mut source = LocalSource::new(src.path().to_path_buf());
        let executor = Executor::new(target.path(), false);
        executor.run(&finalized, &mut source).unwrap();

        let written = fs::read(target.path().join("base/1/16384").as_std_path()).unwrap();
        assert_eq!(written, b"abcdef");
    }

    #[test]
    fn dry_run_mutates_nothing() {
        let target = tempdir().unwrap();
        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("base/1").as_std_path()).unwrap();
        fs::write(src.path().join("base/1/16384").as_std_path(), b"abcdef").unwrap();

        let mut map = FileMap::new();
        map.process_remote(target.path(), "base/1/16384", FileType::Regular, 6, None)
            .unwrap();
        map.finish_remote();
        let finalized = map.finalize();

        let mut source = LocalSource::new(src.path().to_path_buf());
        let executor = Executor::new(target.path(), true);
        executor.run(&finalized, &mut source).unwrap();

        assert!(!target.path().join("base/1/16384").exists());
    }

    #[test]
    fn truncates_to_new_size() {
        let target = tempdir().unwrap();
        fs::create_dir_all(target.path().join("base/1").as_std_path()).unwrap();
        fs::write(target.path().join("base/1/16384").as_std_path(), vec![1u8; 5 * BLCKSZ as usize]).unwrap();
        let src = tempdir().unwrap();

        let mut map = FileMap::new();
        map.process_remote(target.path(), "base/1/16384", FileType::Regular, 3 * BLCKSZ as u64, None)
            .unwrap();
        map.finish_remote();
        let finalized = map.finalize();

        let mut source = LocalSource::new(src.path().to_path_buf());
        let executor = Executor::new(target.path(), false);
        executor.run(&finalized, &mut source).unwrap();

        let meta = fs::metadata(target.path().join("base/1/16384").as_std_path()).unwrap();
        assert_eq!(meta.len(), 3 * BLCKSZ as u64);
    }
}
