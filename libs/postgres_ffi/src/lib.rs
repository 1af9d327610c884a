//! Decoders for the on-disk and wire formats this system reads: the cluster
//! control file, timeline history files, WAL records, and relation file
//! paths. Nothing in this crate mutates anything; it is a pure parsing
//! library the same way the teacher's `postgres_ffi` crate is, just scoped
//! to what a resynchronization tool needs rather than a full storage engine.

pub mod checkpoint;
pub mod controlfile;
pub mod pagemap;
pub mod pg_constants;
pub mod relfile;
pub mod waldecoder;
pub mod xlog_utils;

pub use checkpoint::CheckPoint;
pub use controlfile::{ClusterState, ControlFileData, ControlFileError};
pub use pagemap::DataPageMap;
pub use pg_constants::{BLCKSZ, RELSEG_SIZE, WAL_SEGMENT_SIZE};
pub use relfile::{BlockNumber, ForkName, Oid, RelFileNode};
pub use waldecoder::{
    decode_wal_record, BlockReference, DecodedWalRecord, WalDecodeError, WalStreamDecoder,
    XLogRecordHeader,
};
pub use xlog_utils::{
    history_file_name, parse_timeline_history, synthetic_initial_history, BadHistoryLine,
    TimelineHistoryEntry, XLogFileName, XLogFromFileName, XLogSegNo,
};
