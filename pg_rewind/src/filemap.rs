//! The reconciliation core (§3 FileMap/FileEntry/FileAction, §4.F): merges
//! a source inventory, a target inventory, and page-map updates into a
//! minimal, deterministically ordered sequence of filesystem actions.

use std::collections::HashMap;
use std::fs;
use std::io;

use camino::Utf8Path;

use postgres_ffi::relfile::{block_to_segment, is_relation_data_file, relation_file_path};
use postgres_ffi::{BlockNumber, ForkName, RelFileNode, BLCKSZ};

use crate::error::RewindError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Create,
    CopyWhole,
    CopyTail,
    None,
    Truncate,
    Remove,
}

impl FileAction {
    /// Processing-order rank used as the primary sort key (§3 FileMap).
    fn rank(self) -> u8 {
        match self {
            FileAction::Create => 0,
            FileAction::CopyWhole => 1,
            FileAction::CopyTail => 2,
            FileAction::None => 3,
            FileAction::Truncate => 4,
            FileAction::Remove => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: String,
    pub kind: FileType,
    pub action: FileAction,
    pub oldsize: u64,
    pub newsize: u64,
    pub link_target: Option<String>,
    pub pagemap: postgres_ffi::DataPageMap,
}

impl FileEntry {
    fn new(path: String, kind: FileType, action: FileAction, oldsize: u64, newsize: u64, link_target: Option<String>) -> FileEntry {
        FileEntry {
            path,
            kind,
            action,
            oldsize,
            newsize,
            link_target,
            pagemap: postgres_ffi::DataPageMap::new(),
        }
    }
}

struct LocalStat {
    kind: FileType,
    size: u64,
    link_target: Option<String>,
}

/// `lstat` of `target_root/rel_path`; `Ok(None)` on a vanished entry.
fn lstat_local(target_root: &Utf8Path, rel_path: &str) -> io::Result<Option<LocalStat>> {
    let abs = target_root.join(rel_path);
    let meta = match fs::symlink_metadata(abs.as_std_path()) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let ft = meta.file_type();
    if ft.is_symlink() {
        let target = fs::read_link(abs.as_std_path())?;
        Ok(Some(LocalStat {
            kind: FileType::Symlink,
            size: 0,
            link_target: Some(target.to_string_lossy().into_owned()),
        }))
    } else if ft.is_dir() {
        Ok(Some(LocalStat {
            kind: FileType::Directory,
            size: 0,
            link_target: None,
        }))
    } else {
        Ok(Some(LocalStat {
            kind: FileType::Regular,
            size: meta.len(),
            link_target: None,
        }))
    }
}

/// Accumulation phase entries, finalized into a `FinalizedFileMap`.
pub struct FileMap {
    entries: Vec<FileEntry>,
    remote_index: Option<HashMap<String, usize>>,
}

impl FileMap {
    pub fn new() -> FileMap {
        FileMap {
            entries: Vec::new(),
            remote_index: None,
        }
    }

    /// Called once per source inventory entry (§4.F accumulation, entry point 1).
    pub fn process_remote(
        &mut self,
        target_root: &Utf8Path,
        path: &str,
        kind: FileType,
        newsize: u64,
        link_target: Option<String>,
    ) -> Result<(), RewindError> {
        debug_assert!(
            self.remote_index.is_none(),
            "process_remote called after finish_remote"
        );

        let local = lstat_local(target_root, path)
            .map_err(|e| RewindError::IoTarget(e, target_root.join(path)))?;

        let entry = match kind {
            FileType::Directory | FileType::Symlink => match &local {
                None => FileEntry::new(path.to_string(), kind, FileAction::Create, 0, 0, link_target),
                Some(l) if l.kind == kind => {
                    FileEntry::new(path.to_string(), kind, FileAction::None, 0, 0, link_target)
                }
                Some(_) => {
                    return Err(RewindError::Sanity(format!(
                        "{path}: type mismatch between source and target"
                    )))
                }
            },
            FileType::Regular => {
                let always_whole = local.is_none() || !is_relation_data_file(path);
                if always_whole {
                    if let Some(l) = &local {
                        if l.kind != FileType::Regular {
                            return Err(RewindError::Sanity(format!(
                                "{path}: type mismatch between source and target"
                            )));
                        }
                    }
                    FileEntry::new(path.to_string(), kind, FileAction::CopyWhole, 0, newsize, None)
                } else {
                    let l = local.unwrap();
                    if l.kind != FileType::Regular {
                        return Err(RewindError::Sanity(format!(
                            "{path}: type mismatch between source and target"
                        )));
                    }
                    let action = if l.size < newsize {
                        FileAction::CopyTail
                    } else if l.size > newsize {
                        FileAction::Truncate
                    } else {
                        FileAction::None
                    };
                    FileEntry::new(path.to_string(), kind, action, l.size, newsize, None)
                }
            }
        };

        self.entries.push(entry);
        Ok(())
    }

    /// Builds the path index used by `process_local` and `process_block`.
    /// Must be called exactly once, after the last `process_remote` call.
    pub fn finish_remote(&mut self) {
        let index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path.clone(), i))
            .collect();
        self.remote_index = Some(index);
    }

    /// Called once per target inventory entry (§4.F accumulation, entry point 2).
    pub fn process_local(&mut self, path: &str, kind: FileType, oldsize: u64) {
        let index = self
            .remote_index
            .as_ref()
            .expect("process_local called before finish_remote");
        if !index.contains_key(path) {
            self.entries.push(FileEntry::new(
                path.to_string(),
                kind,
                FileAction::Remove,
                oldsize,
                0,
                None,
            ));
        }
    }

    /// Called for each block the WAL reader driver (§4.D) reports as
    /// modified on the target-only branch.
    pub fn process_block(
        &mut self,
        fork: ForkName,
        relnode: RelFileNode,
        blkno: BlockNumber,
    ) -> Result<(), RewindError> {
        let index = self
            .remote_index
            .as_ref()
            .expect("process_block called before finish_remote");

        let (segno, in_seg_blk) = block_to_segment(blkno);
        let path = relation_file_path(relnode, fork, segno);

        let Some(&idx) = index.get(&path) else {
            return Ok(()); // not on source and not locally present either
        };

        let entry = &mut self.entries[idx];
        match entry.action {
            FileAction::None | FileAction::CopyTail | FileAction::Truncate => {
                if ((in_seg_blk as u64) + 1) * (BLCKSZ as u64) <= entry.newsize {
                    entry.pagemap.add(in_seg_blk);
                }
                // else: block will be truncated away, drop it.
            }
            FileAction::CopyWhole | FileAction::Remove => {
                // Redundant: the whole file (or nothing) is already the plan.
            }
            FileAction::Create => {
                return Err(RewindError::Sanity(format!(
                    "{path}: WAL references a block on a directory or symlink"
                )))
            }
        }
        Ok(())
    }

    /// Moves accumulated entries into the sorted, immutable array (§3 FileMap
    /// finalized phase). Primary key: action-class rank. Secondary key: path
    /// ascending, except `remove` entries which sort path-descending so
    /// children precede parents.
    pub fn finalize(mut self) -> FinalizedFileMap {
        self.entries.sort_by(|a, b| {
            a.action.rank().cmp(&b.action.rank()).then_with(|| {
                if a.action == FileAction::Remove {
                    b.path.cmp(&a.path)
                } else {
                    a.path.cmp(&b.path)
                }
            })
        });
        FinalizedFileMap {
            entries: self.entries,
        }
    }
}

impl Default for FileMap {
    fn default() -> FileMap {
        FileMap::new()
    }
}

/// The immutable, ordered execution plan (§3 FileMap finalized phase).
pub struct FinalizedFileMap {
    entries: Vec<FileEntry>,
}

impl FinalizedFileMap {
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    fn mkdir(root: &Utf8Path, rel: &str) {
        fs::create_dir_all(root.join(rel).as_std_path()).unwrap();
    }

    fn mkfile(root: &Utf8Path, rel: &str, len: u64) {
        if let Some(parent) = root.join(rel).parent() {
            fs::create_dir_all(parent.as_std_path()).unwrap();
        }
        fs::write(root.join(rel).as_std_path(), vec![0u8; len as usize]).unwrap();
    }

    #[test]
    fn copy_tail_for_grown_relation_file() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        mkfile(root, "base/1/16384", 3 * BLCKSZ as u64);

        let mut map = FileMap::new();
        map.process_remote(root, "base/1/16384", FileType::Regular, 9 * BLCKSZ as u64, None)
            .unwrap();
        map.finish_remote();
        let finalized = map.finalize();

        let entry = &finalized.entries()[0];
        assert_eq!(entry.action, FileAction::CopyTail);
        assert_eq!(entry.oldsize, 3 * BLCKSZ as u64);
        assert_eq!(entry.newsize, 9 * BLCKSZ as u64);
    }

    #[test]
    fn truncate_for_shrunk_relation_file() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        mkfile(root, "base/1/16384", 5 * BLCKSZ as u64);

        let mut map = FileMap::new();
        map.process_remote(root, "base/1/16384", FileType::Regular, 3 * BLCKSZ as u64, None)
            .unwrap();
        map.finish_remote();
        let finalized = map.finalize();
        assert_eq!(finalized.entries()[0].action, FileAction::Truncate);
    }

    #[test]
    fn truncate_away_drops_out_of_range_block() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        mkfile(root, "base/1/16384", 5 * BLCKSZ as u64);

        let mut map = FileMap::new();
        map.process_remote(root, "base/1/16384", FileType::Regular, 3 * BLCKSZ as u64, None)
            .unwrap();
        map.finish_remote();
        let rnode = RelFileNode { spcnode: 0, dbnode: 1, relnode: 16384 };
        map.process_block(ForkName::Main, rnode, 4).unwrap();
        let finalized = map.finalize();
        assert!(finalized.entries()[0].pagemap.empty());
    }

    #[test]
    fn non_relation_file_is_always_copied_whole() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        mkfile(root, "base/1/pg_filenode.map", 512);

        let mut map = FileMap::new();
        map.process_remote(root, "base/1/pg_filenode.map", FileType::Regular, 512, None)
            .unwrap();
        map.finish_remote();
        let finalized = map.finalize();
        assert_eq!(finalized.entries()[0].action, FileAction::CopyWhole);
    }

    #[test]
    fn missing_local_file_removed_after_local_pass() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        mkfile(root, "base/1/99999", 1 * BLCKSZ as u64);

        let mut map = FileMap::new();
        // Source omits base/1/99999 entirely.
        map.finish_remote();
        map.process_local("base/1/99999", FileType::Regular, BLCKSZ as u64);
        let finalized = map.finalize();
        assert_eq!(finalized.entries().len(), 1);
        assert_eq!(finalized.entries()[0].action, FileAction::Remove);
    }

    #[test]
    fn sort_order_creates_before_removes_children_before_parents() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        mkdir(root, "pg_tblspc");

        let mut map = FileMap::new();
        map.process_remote(root, "pg_tblspc/16400", FileType::Directory, 0, None)
            .unwrap();
        map.finish_remote();
        map.process_local("old_dir", FileType::Directory, 0);
        map.process_local("old_dir/child", FileType::Regular, 10);
        let finalized = map.finalize();

        let actions: Vec<_> = finalized.entries().iter().map(|e| (e.path.clone(), e.action)).collect();
        // create comes first
        assert_eq!(actions[0].1, FileAction::Create);
        // removes sorted path-descending: child before parent
        let remove_paths: Vec<&str> = finalized
            .entries()
            .iter()
            .filter(|e| e.action == FileAction::Remove)
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(remove_paths, vec!["old_dir/child", "old_dir"]);
    }

    #[test]
    fn symlink_target_preserved_on_mismatch() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        let mut map = FileMap::new();
        map.process_remote(
            root,
            "pg_tblspc/16400",
            FileType::Symlink,
            0,
            Some("/srv/tb1".to_string()),
        )
        .unwrap();
        map.finish_remote();
        let finalized = map.finalize();
        assert_eq!(finalized.entries()[0].action, FileAction::Create);
        assert_eq!(finalized.entries()[0].link_target.as_deref(), Some("/srv/tb1"));
    }
}
