//! WAL reader driver (§4.D): drives `postgres_ffi::waldecoder` over on-disk
//! segments under `<datadir>/pg_xlog`, reporting every block a record
//! touches, and the handful of single-record / backward-walk operations the
//! orchestrator needs to locate the last common checkpoint (§4.H steps 6–7).

use std::fs;
use std::io::Read;

use bytes::Bytes;
use camino::Utf8Path;
use tracing::debug;

use postgres_ffi::pg_constants::{RM_XLOG_ID, WAL_SEGMENT_SIZE, XLOG_BLCKSZ};
use postgres_ffi::{decode_wal_record, BlockReference, DecodedWalRecord, WalStreamDecoder, XLogFileName};
use utils::id::TimeLineID;
use utils::lsn::Lsn;

use crate::error::RewindError;

const XLOG_CHECKPOINT_SHUTDOWN: u8 = 0x00;
const XLOG_CHECKPOINT_ONLINE: u8 = 0x10;
const XLR_INFO_MASK: u8 = 0x0F;

fn segment_path(datadir: &Utf8Path, tli: TimeLineID, segno: u64) -> camino::Utf8PathBuf {
    datadir
        .join("pg_xlog")
        .join(XLogFileName(tli, segno, WAL_SEGMENT_SIZE))
}

/// Feeds `decoder` from consecutive segment files until it yields one
/// record, or returns `Ok(None)` once `pg_xlog/<segment>` for the required
/// segment doesn't exist (end of available WAL).
///
/// `read_lsn` is the reader's own cursor into the physical WAL stream: it
/// tracks how much has been *fed* to `decoder`, which can run ahead of
/// `decoder.available()` (how much has been *consumed* into records) while a
/// record is still being assembled across reads.
fn decode_next(
    datadir: &Utf8Path,
    tli: TimeLineID,
    decoder: &mut WalStreamDecoder,
    read_lsn: &mut Lsn,
) -> Result<Option<(Lsn, Bytes)>, RewindError> {
    loop {
        if let Some(result) = decoder.poll_decode()? {
            return Ok(Some(result));
        }

        let segno = read_lsn.segment_number(WAL_SEGMENT_SIZE as u64);
        let path = segment_path(datadir, tli, segno);
        let mut file = match fs::File::open(path.as_std_path()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RewindError::IoSource(e, path)),
        };

        let offset_in_segment = read_lsn.0 % WAL_SEGMENT_SIZE as u64;
        use std::io::{Seek, SeekFrom};
        file.seek(SeekFrom::Start(offset_in_segment))
            .map_err(|e| RewindError::IoSource(e, path.clone()))?;

        let want = (WAL_SEGMENT_SIZE as u64 - offset_in_segment).min(XLOG_BLCKSZ as u64) as usize;
        let mut buf = vec![0u8; want];
        let n = file
            .read(&mut buf)
            .map_err(|e| RewindError::IoSource(e, path.clone()))?;
        if n == 0 {
            return Ok(None);
        }
        decoder.feed_bytes(&buf[..n]);
        *read_lsn = Lsn(read_lsn.0 + n as u64);
    }
}

fn is_checkpoint(decoded: &DecodedWalRecord) -> bool {
    decoded.header.xl_rmid == RM_XLOG_ID
        && matches!(
            decoded.header.xl_info & !XLR_INFO_MASK,
            XLOG_CHECKPOINT_SHUTDOWN | XLOG_CHECKPOINT_ONLINE
        )
}

/// Reads and decodes exactly one record starting at `lsn` on `tli`.
pub fn read_one_record(
    datadir: &Utf8Path,
    tli: TimeLineID,
    lsn: Lsn,
) -> Result<(Lsn, DecodedWalRecord), RewindError> {
    let mut decoder = WalStreamDecoder::new(lsn);
    let mut read_lsn = lsn;
    match decode_next(datadir, tli, &mut decoder, &mut read_lsn)? {
        Some((record_lsn, bytes)) => Ok((record_lsn, decode_wal_record(bytes))),
        None => Err(RewindError::Decode(format!(
            "no WAL record found at {lsn} on timeline {}",
            tli.0
        ))),
    }
}

/// Drives record iteration from `start_lsn` to `end_lsn` on `tli`, invoking
/// `on_block` for every block reference a record carries (§4.D).
///
/// Stops after a record whose start LSN is >= `end_lsn`, or on EOF.
pub fn scan_blocks(
    datadir: &Utf8Path,
    start_lsn: Lsn,
    tli: TimeLineID,
    end_lsn: Lsn,
    mut on_block: impl FnMut(BlockReference) -> Result<(), RewindError>,
) -> Result<(), RewindError> {
    let mut decoder = WalStreamDecoder::new(start_lsn);
    let mut read_lsn = start_lsn;
    loop {
        let (record_lsn, bytes) = match decode_next(datadir, tli, &mut decoder, &mut read_lsn)? {
            Some(r) => r,
            None => return Ok(()),
        };
        if record_lsn >= end_lsn {
            return Ok(());
        }

        let decoded = decode_wal_record(bytes);
        debug!(%record_lsn, rmid = decoded.header.xl_rmid, "decoded WAL record");
        for block in decoded.referenced_blocks() {
            on_block(block)?;
        }
    }
}

/// Walks backward from `start_lsn` via each record's `xl_prev` pointer until
/// a checkpoint record at or before `at_or_before` is found (§4.H step 7).
/// Returns `(record_lsn, checkpoint_timeline, redo_lsn)`.
pub fn find_last_checkpoint(
    datadir: &Utf8Path,
    tli: TimeLineID,
    start_lsn: Lsn,
    at_or_before: Lsn,
) -> Result<(Lsn, TimeLineID, Lsn), RewindError> {
    let mut lsn = start_lsn;
    loop {
        let (record_lsn, decoded) = read_one_record(datadir, tli, lsn)?;
        if record_lsn <= at_or_before && is_checkpoint(&decoded) {
            let cp = postgres_ffi::CheckPoint::decode(&decoded.main_data)
                .map_err(|e| RewindError::Decode(e.to_string()))?;
            return Ok((record_lsn, cp.this_timeline_id, cp.redo));
        }
        if decoded.header.xl_prev == Lsn(0) || decoded.header.xl_prev >= lsn {
            return Err(RewindError::Decode(format!(
                "no checkpoint record found at or before {at_or_before} on timeline {}",
                tli.0
            )));
        }
        lsn = decoded.header.xl_prev;
    }
}
