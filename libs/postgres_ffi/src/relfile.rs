//! `RelFileNode` path mapping (§3 RelFileNode) and the relation-data-file
//! test used by the file map (§4.F "Relation-data-file test").

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::pg_constants::{FSM_FORKNUM, INIT_FORKNUM, MAIN_FORKNUM, RELSEG_SIZE, VISIBILITYMAP_FORKNUM};

pub type Oid = u32;
pub type BlockNumber = u32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelFileNode {
    pub spcnode: Oid, // tablespace; 0 == the database's default tablespace
    pub dbnode: Oid,  // 0 for shared relations, stored under global/
    pub relnode: Oid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkName {
    Main,
    FreeSpaceMap,
    VisibilityMap,
    Init,
}

impl ForkName {
    pub fn from_forknum(forknum: u8) -> ForkName {
        match forknum {
            FSM_FORKNUM => ForkName::FreeSpaceMap,
            VISIBILITYMAP_FORKNUM => ForkName::VisibilityMap,
            INIT_FORKNUM => ForkName::Init,
            MAIN_FORKNUM | _ => ForkName::Main,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ForkName::Main => "",
            ForkName::FreeSpaceMap => "_fsm",
            ForkName::VisibilityMap => "_vm",
            ForkName::Init => "_init",
        }
    }
}

impl fmt::Display for ForkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// `tablespace oid -> on-disk version-specific directory name`, e.g. `PG_16_202307071`.
/// pg_rewind's target and source always run the same major version (a
/// cross-version rewind is a sanity-check failure), so one constant per
/// supported version is enough; this is the one `initdb` writes for PG16.
pub const TABLESPACE_VERSION_DIRECTORY: &str = "PG_16_202307071";

/// Build the POSIX-relative data-file path for `(node, fork, segment)`
/// exactly as described in §3: `global/<relNode>[.<seg>]`,
/// `base/<db>/<relNode>[.<seg>]`, or
/// `pg_tblspc/<tblspc>/<vercode>/<db>/<relNode>[.<seg>]`, with fork suffix
/// inserted before the segment number.
pub fn relation_file_path(node: RelFileNode, fork: ForkName, segno: u32) -> String {
    let seg_suffix = if segno == 0 {
        String::new()
    } else {
        format!(".{segno}")
    };
    let file = format!("{}{}{}", node.relnode, fork, seg_suffix);

    if node.spcnode == 0 {
        // Default tablespace.
        if node.dbnode == 0 {
            format!("global/{file}")
        } else {
            format!("base/{}/{file}", node.dbnode)
        }
    } else {
        format!(
            "pg_tblspc/{}/{}/{}/{file}",
            node.spcnode, TABLESPACE_VERSION_DIRECTORY, node.dbnode
        )
    }
}

/// `(segment number, in-segment block number)` for an absolute block number.
pub fn block_to_segment(blkno: BlockNumber) -> (u32, u32) {
    (blkno / RELSEG_SIZE, blkno % RELSEG_SIZE)
}

static RELATION_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(global|base/[0-9]+|pg_tblspc/[0-9]+/[^/]+/[0-9]+)/[0-9]+(_fsm|_vm|_init)?(\.[0-9]+)?$",
    )
    .expect("static regex is valid")
});

/// §4.F "Relation-data-file test": does `path` look like a relation data
/// file, as opposed to an arbitrary source file that must always be copied
/// whole?
pub fn is_relation_data_file(path: &str) -> bool {
    RELATION_FILE_RE.is_match(path)
}
