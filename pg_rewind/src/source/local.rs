//! Local back-end of the file inventory source (§4.E).

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::error::RewindError;
use crate::filemap::FileType;

use super::{is_ignored, FileSource, InventoryEntry, RangeRequest, RangeResult};

pub struct LocalSource {
    root: Utf8PathBuf,
}

impl LocalSource {
    pub fn new(root: Utf8PathBuf) -> LocalSource {
        LocalSource { root }
    }

    /// The walk follows a symlink only when it is `pg_xlog` itself or a
    /// direct child of `pg_tblspc/`; every other symlink is reported but
    /// not descended into.
    fn should_follow(rel_path: &str) -> bool {
        if rel_path == "pg_xlog" {
            return true;
        }
        if let Some(rest) = rel_path.strip_prefix("pg_tblspc/") {
            return !rest.contains('/');
        }
        false
    }

    fn walk(&self, rel_dir: &str, out: &mut Vec<InventoryEntry>) -> io::Result<()> {
        let abs_dir = if rel_dir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel_dir)
        };

        let read_dir = match fs::read_dir(abs_dir.as_std_path()) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut children: Vec<Utf8PathBuf> = Vec::new();
        for dirent in read_dir {
            let dirent = match dirent {
                Ok(d) => d,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            children.push(Utf8PathBuf::from_path_buf(dirent.path()).expect("non-utf8 path"));
        }
        children.sort();

        for child_abs in children {
            let rel = child_abs
                .strip_prefix(&self.root)
                .expect("child is under root")
                .to_string();
            if is_ignored(&rel) {
                continue;
            }

            let meta = match fs::symlink_metadata(child_abs.as_std_path()) {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("{rel}: vanished during traversal, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let ft = meta.file_type();

            if ft.is_symlink() {
                let target = fs::read_link(child_abs.as_std_path())?;
                out.push(InventoryEntry {
                    path: rel.clone(),
                    kind: FileType::Symlink,
                    size: 0,
                    link_target: Some(target.to_string_lossy().into_owned()),
                });
                if Self::should_follow(&rel) {
                    self.walk(&rel, out)?;
                }
            } else if ft.is_dir() {
                out.push(InventoryEntry {
                    path: rel.clone(),
                    kind: FileType::Directory,
                    size: 0,
                    link_target: None,
                });
                self.walk(&rel, out)?;
            } else if ft.is_file() {
                out.push(InventoryEntry {
                    path: rel,
                    kind: FileType::Regular,
                    size: meta.len(),
                    link_target: None,
                });
            }
            // Special files (sockets, fifos, devices) are neither dir, file
            // nor symlink here and are silently skipped.
        }
        Ok(())
    }

    fn abs(&self, path: &str) -> Utf8PathBuf {
        self.root.join(path)
    }
}

impl FileSource for LocalSource {
    fn list(&mut self) -> Result<Vec<InventoryEntry>, RewindError> {
        let mut out = Vec::new();
        self.walk("", &mut out)
            .map_err(|e| RewindError::IoSource(e, self.root.clone()))?;
        Ok(out)
    }

    fn fetch_file(&mut self, path: &str) -> Result<Vec<u8>, RewindError> {
        let abs = self.abs(path);
        fs::read(abs.as_std_path()).map_err(|e| RewindError::IoSource(e, abs))
    }

    fn execute_plan(&mut self, requests: &[RangeRequest]) -> Result<Vec<RangeResult>, RewindError> {
        use std::io::{Read, Seek, SeekFrom};

        let mut results = Vec::with_capacity(requests.len());
        for req in requests {
            let abs = self.abs(&req.path);
            let mut file = match fs::File::open(abs.as_std_path()) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    results.push(None);
                    continue;
                }
                Err(e) => return Err(RewindError::IoSource(e, abs)),
            };
            file.seek(SeekFrom::Start(req.offset))
                .map_err(|e| RewindError::IoSource(e, abs.clone()))?;
            let mut buf = vec![0u8; req.len as usize];
            file.read_exact(&mut buf)
                .map_err(|e| RewindError::IoSource(e, abs.clone()))?;
            results.push(Some(buf));
        }
        Ok(results)
    }
}
