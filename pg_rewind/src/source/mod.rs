//! File inventory source (§4.E): two back-ends behind one capability set —
//! list the cluster tree, fetch a whole file, and execute a batch of ranged
//! reads.

pub mod local;
pub mod remote;

use crate::error::RewindError;
use crate::filemap::FileType;

#[derive(Debug, Clone)]
pub struct InventoryEntry {
    pub path: String,
    pub kind: FileType,
    pub size: u64,
    pub link_target: Option<String>,
}

/// One `(path, offset, length)` request queued by the executor (§4.G).
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub path: String,
    pub offset: u64,
    pub len: u64,
}

/// `None` means the file vanished on the source between listing and
/// reading — the executor tolerates this by scheduling a remove (§4.G, §7).
pub type RangeResult = Option<Vec<u8>>;

pub trait FileSource {
    /// Pre-order directory walk: directories precede their own contents.
    fn list(&mut self) -> Result<Vec<InventoryEntry>, RewindError>;

    fn fetch_file(&mut self, path: &str) -> Result<Vec<u8>, RewindError>;

    /// Executes every request and returns results in the same order.
    fn execute_plan(&mut self, requests: &[RangeRequest]) -> Result<Vec<RangeResult>, RewindError>;

    /// Releases any scoped resources (connections, helper schema). Called on
    /// every exit path, success or failure.
    fn close(&mut self) -> Result<(), RewindError> {
        Ok(())
    }
}

/// Paths ignored at inventory or map-build time regardless of back-end
/// (§4.E "Ignored").
pub fn is_ignored(path: &str) -> bool {
    if path == "postmaster.pid" || path == "postmaster.opts" || path == "PG_VERSION" {
        return true;
    }
    path.split('/').any(|component| component.starts_with("pgsql_tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_spec_listed_paths() {
        assert!(is_ignored("postmaster.pid"));
        assert!(is_ignored("postmaster.opts"));
        assert!(is_ignored("PG_VERSION"));
        assert!(is_ignored("base/pgsql_tmp/foo"));
        assert!(is_ignored("base/pgsql_tmp.12345/foo"));
        assert!(!is_ignored("base/1/16384"));
    }
}
