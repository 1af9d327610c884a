//! WAL segment file naming and timeline-history parsing (§3, §4.B, §6).
//!
//! Many of these functions mirror PostgreSQL's own `xlog_internal.h` macros
//! and have been kept close to their C names, the way the teacher's
//! `postgres_ffi::xlog_utils` does.

use std::fmt::Write as _;

use utils::id::TimeLineID;
use utils::lsn::Lsn;

use crate::pg_constants::{WAL_SEGMENT_SIZE, XLOG_FNAME_LEN};

pub type XLogSegNo = u64;

#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    (0x1_0000_0000u64 / wal_segsz_bytes as u64) as XLogSegNo
}

#[allow(non_snake_case)]
pub fn XLogSegNoOffsetToRecPtr(segno: XLogSegNo, offset: u32, wal_segsz_bytes: usize) -> Lsn {
    Lsn(segno * (wal_segsz_bytes as u64) + offset as u64)
}

#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, segno: XLogSegNo, wal_segsz_bytes: usize) -> String {
    let segs_per_id = XLogSegmentsPerXLogId(wal_segsz_bytes);
    format!(
        "{:08X}{:08X}{:08X}",
        tli.0,
        segno / segs_per_id,
        segno % segs_per_id
    )
}

#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_segsz_bytes: usize) -> anyhow::Result<(XLogSegNo, TimeLineID)> {
    anyhow::ensure!(fname.len() >= 24, "WAL file name too short: {fname:?}");
    let tli = u32::from_str_radix(&fname[0..8], 16)?;
    let log = u32::from_str_radix(&fname[8..16], 16)? as XLogSegNo;
    let seg = u32::from_str_radix(&fname[16..24], 16)? as XLogSegNo;
    Ok((log * XLogSegmentsPerXLogId(wal_segsz_bytes) + seg, TimeLineID(tli)))
}

#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

#[allow(non_snake_case)]
pub fn IsPartialXLogFileName(fname: &str) -> bool {
    fname
        .strip_suffix(".partial")
        .map(IsXLogFileName)
        .unwrap_or(false)
}

pub fn history_file_name(tli: TimeLineID) -> String {
    format!("{:08X}.history", tli.0)
}

/// One entry of a timeline's ancestry (§3 Timeline-history entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineID,
    pub begin: Lsn,
    pub end: Lsn,
}

#[derive(Debug, thiserror::Error)]
#[error("bad timeline history line {line_no}: {text:?}")]
pub struct BadHistoryLine {
    pub line_no: usize,
    pub text: String,
}

/// Parse a `.history` file (§4.B) into an ordered list of ancestry entries,
/// ending with `(target_tli, last_switch, 0)`.
pub fn parse_timeline_history(
    contents: &str,
    target_tli: TimeLineID,
) -> Result<Vec<TimelineHistoryEntry>, BadHistoryLine> {
    let mut entries = Vec::new();
    let mut prev_end = Lsn(0);

    for (line_no, raw_line) in contents.lines().enumerate() {
        let line = match raw_line.find('#') {
            Some(idx) => &raw_line[..idx],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let tli_str = fields.next();
        let lsn_str = fields.next();
        let (tli_str, lsn_str) = match (tli_str, lsn_str) {
            (Some(t), Some(l)) if !t.is_empty() && !l.is_empty() => (t, l),
            _ => {
                return Err(BadHistoryLine {
                    line_no,
                    text: raw_line.to_string(),
                })
            }
        };
        let tli: u32 = tli_str.parse().map_err(|_| BadHistoryLine {
            line_no,
            text: raw_line.to_string(),
        })?;
        let switch_lsn: Lsn = lsn_str.parse().map_err(|_| BadHistoryLine {
            line_no,
            text: raw_line.to_string(),
        })?;

        entries.push(TimelineHistoryEntry {
            tli: TimeLineID(tli),
            begin: prev_end,
            end: switch_lsn,
        });
        prev_end = switch_lsn;
    }

    // The final entry is always the target timeline itself, still current.
    entries.push(TimelineHistoryEntry {
        tli: target_tli,
        begin: prev_end,
        end: Lsn(0),
    });

    Ok(entries)
}

/// Synthetic single-entry history for a source on timeline 1, which has no
/// `.history` file (§4.B).
pub fn synthetic_initial_history() -> Vec<TimelineHistoryEntry> {
    vec![TimelineHistoryEntry {
        tli: TimeLineID(1),
        begin: Lsn(0),
        end: Lsn(0),
    }]
}

pub fn format_wal_file_range(tli: TimeLineID, start: XLogSegNo, end: XLogSegNo) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "{}..{}",
        XLogFileName(tli, start, WAL_SEGMENT_SIZE),
        XLogFileName(tli, end, WAL_SEGMENT_SIZE)
    );
    out
}
