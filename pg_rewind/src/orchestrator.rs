//! The eleven-step run (§4.H): validates the two clusters, decides whether a
//! rewind is even needed, locates the last common checkpoint, builds the
//! file map, executes it, and leaves a `backup_label` behind.

use std::fs;

use camino::Utf8Path;
use chrono::Local;
use tracing::info;

use postgres_ffi::{parse_timeline_history, synthetic_initial_history, ControlFileData};
use utils::id::TimeLineID;
use utils::lsn::Lsn;

use crate::config::{Config, SourceSpec};
use crate::error::RewindError;
use crate::executor::Executor;
use crate::filemap::FileMap;
use crate::source::local::LocalSource;
use crate::source::remote::RemoteSource;
use crate::source::{is_ignored, FileSource};
use crate::walreader;

const MAXALIGN: u64 = 8;

fn record_end_lsn(record_lsn: Lsn, xl_tot_len: u32) -> Lsn {
    let end = record_lsn.0 + xl_tot_len as u64;
    Lsn((end + MAXALIGN - 1) & !(MAXALIGN - 1))
}

fn read_control_file(bytes: &[u8]) -> Result<ControlFileData, RewindError> {
    Ok(ControlFileData::decode(bytes)?)
}

fn check_sanity(target: &ControlFileData, source: &ControlFileData) -> Result<(), RewindError> {
    if target.system_identifier != source.system_identifier {
        return Err(RewindError::Sanity(
            "target and source belong to different systems (system_identifier mismatch)"
                .to_string(),
        ));
    }
    if target.pg_control_version != source.pg_control_version
        || target.catalog_version_no != source.catalog_version_no
    {
        return Err(RewindError::Sanity(
            "target and source have incompatible control/catalog versions".to_string(),
        ));
    }
    if target.data_checksum_version == 0 && !target.wal_log_hintbits {
        return Err(RewindError::Sanity(
            "target has neither data checksums nor wal_log_hintbits enabled".to_string(),
        ));
    }
    if !target.state.is_shut_down() {
        return Err(RewindError::Sanity(
            "target instance was not cleanly shut down".to_string(),
        ));
    }
    if target.current_timeline() == source.current_timeline() {
        return Err(RewindError::Sanity(
            "target and source are on the same timeline; nothing to rewind".to_string(),
        ));
    }
    Ok(())
}

/// Fetches and parses the source's timeline history (§4.B), synthesizing
/// the single-entry history for timeline 1, which has no `.history` file.
fn fetch_source_history(
    source: &mut dyn FileSource,
    source_tli: TimeLineID,
) -> Result<Vec<postgres_ffi::TimelineHistoryEntry>, RewindError> {
    if source_tli == TimeLineID::INITIAL {
        return Ok(synthetic_initial_history());
    }
    let path = format!("pg_xlog/{}", postgres_ffi::history_file_name(source_tli));
    let bytes = source.fetch_file(&path)?;
    let text = String::from_utf8(bytes)
        .map_err(|e| RewindError::Decode(format!("{path}: not valid UTF-8: {e}")))?;
    Ok(parse_timeline_history(&text, source_tli)?)
}

/// Walks source history newest to oldest for the entry whose timeline is
/// the target's current one; that entry's `end` is the divergence LSN.
fn find_divergence_lsn(
    history: &[postgres_ffi::TimelineHistoryEntry],
    target_tli: TimeLineID,
) -> Result<Lsn, RewindError> {
    history
        .iter()
        .rev()
        .find(|e| e.tli == target_tli)
        .map(|e| e.end)
        .ok_or_else(|| {
            RewindError::Sanity(
                "target and source share no common ancestor timeline".to_string(),
            )
        })
}

fn write_backup_label(
    target_pgdata: &Utf8Path,
    chkptrec: Lsn,
    chkpttli: TimeLineID,
    chkptredo: Lsn,
) -> Result<(), RewindError> {
    let segno = chkptredo.segment_number(postgres_ffi::WAL_SEGMENT_SIZE as u64);
    let wal_file = postgres_ffi::XLogFileName(chkpttli, segno, postgres_ffi::WAL_SEGMENT_SIZE);
    let now = Local::now().format("%Y-%m-%d %H:%M:%S %Z");

    let contents = format!(
        "START WAL LOCATION: {chkptredo} (file {wal_file})\n\
         CHECKPOINT LOCATION: {chkptrec}\n\
         BACKUP METHOD: rewound with pg_rewind\n\
         BACKUP FROM: master\n\
         START TIME: {now}\n"
    );

    let path = target_pgdata.join("backup_label");
    fs::write(path.as_std_path(), contents).map_err(|e| RewindError::IoTarget(e, path))
}

pub fn run(config: &Config) -> Result<(), RewindError> {
    let mut source: Box<dyn FileSource> = match &config.source {
        SourceSpec::Local { pgdata } => {
            info!("using local source data directory {pgdata}");
            Box::new(LocalSource::new(pgdata.clone()))
        }
        SourceSpec::Remote { connstr } => {
            info!("connecting to source server");
            Box::new(RemoteSource::connect(connstr)?)
        }
    };

    let result = run_with_source(config, source.as_mut());
    let _ = source.close();
    result
}

fn run_with_source(config: &Config, source: &mut dyn FileSource) -> Result<(), RewindError> {
    let target_pgdata = &config.target_pgdata;

    info!("reading target control file");
    let target_control_path = target_pgdata.join("global/pg_control");
    let target_bytes = fs::read(target_control_path.as_std_path())
        .map_err(|e| RewindError::IoTarget(e, target_control_path))?;
    let target_control = read_control_file(&target_bytes)?;

    info!("reading source control file");
    let source_bytes = source.fetch_file("global/pg_control")?;
    let source_control = read_control_file(&source_bytes)?;

    check_sanity(&target_control, &source_control)?;

    let target_tli = target_control.current_timeline();
    let source_tli = source_control.current_timeline();
    info!("target is on timeline {target_tli}, source is on timeline {source_tli}");

    let history = fetch_source_history(source, source_tli)?;
    let divergence = find_divergence_lsn(&history, target_tli)?;
    info!("clusters diverged at {divergence}");

    let target_checkpoint_lsn = target_control.checkpoint;
    let rewind_needed = if target_checkpoint_lsn >= divergence {
        true
    } else {
        let (record_lsn, decoded) =
            walreader::read_one_record(target_pgdata, target_tli, target_checkpoint_lsn)?;
        let end = record_end_lsn(record_lsn, decoded.header.xl_tot_len);
        end != divergence
    };

    if !rewind_needed {
        info!("target is already ahead of the divergence point; no rewind required");
        return Ok(());
    }

    info!("locating the last checkpoint at or before the divergence point");
    let (chkptrec, chkpttli, chkptredo) = walreader::find_last_checkpoint(
        target_pgdata,
        target_tli,
        target_checkpoint_lsn,
        divergence,
    )?;
    info!("using checkpoint at {chkptrec} (redo {chkptredo}) on timeline {chkpttli}");

    info!("building file map");
    let mut map = FileMap::new();
    for entry in source.list()? {
        if is_ignored(&entry.path) {
            continue;
        }
        map.process_remote(
            target_pgdata,
            &entry.path,
            entry.kind,
            entry.size,
            entry.link_target,
        )?;
    }
    map.finish_remote();

    let mut local = LocalSource::new(target_pgdata.clone());
    for entry in local.list()? {
        if is_ignored(&entry.path) {
            continue;
        }
        map.process_local(&entry.path, entry.kind, entry.size);
    }

    walreader::scan_blocks(target_pgdata, chkptrec, chkpttli, divergence, |block| {
        map.process_block(block.fork, block.rnode, block.blkno)
    })?;

    let finalized = map.finalize();

    if config.dry_run {
        for entry in finalized.entries() {
            if entry.action != crate::filemap::FileAction::None {
                info!("{}: would {:?}", entry.path, entry.action);
            }
        }
    }

    info!("executing file map");
    let executor = Executor::new(target_pgdata, config.dry_run);
    executor.run(&finalized, source)?;

    if !config.dry_run {
        info!("writing backup_label");
        write_backup_label(target_pgdata, chkptrec, chkpttli, chkptredo)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use postgres_ffi::pg_constants::{
        RM_HEAP_ID, RM_XLOG_ID, XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_RECORD,
        XLR_BLOCK_ID_DATA_SHORT,
    };
    use postgres_ffi::relfile::is_relation_data_file;
    use postgres_ffi::{CheckPoint, ClusterState, XLogFileName, BLCKSZ};

    fn base_control(tli: u32) -> ControlFileData {
        ControlFileData {
            system_identifier: 0xAABB_CCDD,
            pg_control_version: 1300,
            catalog_version_no: 202307071,
            state: ClusterState::ShutDowned,
            checkpoint: Lsn(0),
            checkpoint_copy: CheckPoint {
                redo: Lsn(0),
                this_timeline_id: TimeLineID(tli),
                next_xid_epoch: 0,
                next_xid: 1,
            },
            data_checksum_version: 1,
            wal_log_hintbits: false,
        }
    }

    fn write_control_file(root: &Utf8Path, cf: &ControlFileData) {
        let dir = root.join("global");
        fs::create_dir_all(dir.as_std_path()).unwrap();
        fs::write(dir.join("pg_control").as_std_path(), cf.encode()).unwrap();
    }

    fn local_config(target: &Utf8Path, source: &Utf8Path) -> Config {
        Config {
            target_pgdata: target.to_path_buf(),
            source: SourceSpec::Local {
                pgdata: source.to_path_buf(),
            },
            dry_run: false,
            verbose: false,
        }
    }

    /// S2: both clusters report the same current timeline.
    #[test]
    fn same_timeline_is_a_sanity_error() {
        let target = tempdir().unwrap();
        let source = tempdir().unwrap();
        write_control_file(target.path(), &base_control(5));
        write_control_file(source.path(), &base_control(5));

        let err = run(&local_config(target.path(), source.path())).unwrap_err();
        assert!(matches!(err, RewindError::Sanity(_)));
    }

    /// A record with no block refs and no main data: header + a zero-length
    /// short data header, padded to 8 bytes. Enough for `record_end_lsn` to
    /// be exercised without dragging in the block-header walk.
    fn minimal_record(xl_prev: Lsn) -> Vec<u8> {
        let body = vec![XLR_BLOCK_ID_DATA_SHORT, 0u8];
        let tot_len = (XLOG_SIZE_OF_XLOG_RECORD + body.len()) as u32;
        let mut rec = Vec::new();
        rec.extend_from_slice(&tot_len.to_le_bytes());
        rec.extend_from_slice(&0u32.to_le_bytes()); // xl_xid
        rec.extend_from_slice(&xl_prev.0.to_le_bytes());
        rec.push(0u8); // xl_info
        rec.push(RM_HEAP_ID);
        rec.extend_from_slice(&[0u8, 0u8]);
        rec.extend_from_slice(&0u32.to_le_bytes()); // xl_crc
        rec.extend_from_slice(&body);
        while rec.len() % 8 != 0 {
            rec.push(0);
        }
        rec
    }

    /// S1 (read as: the checkpoint record is the last thing the target wrote
    /// before it diverged). Target's checkpoint LSN sits before the
    /// divergence point, but the record stored there ends exactly at it, so
    /// step 6 of §4.H concludes no rewind is needed.
    #[test]
    fn no_rewind_needed_when_checkpoint_record_ends_at_divergence() {
        let target = tempdir().unwrap();
        let source = tempdir().unwrap();

        let header = vec![0u8; XLOG_SIZE_OF_XLOG_LONG_PHD];
        let l0 = Lsn(header.len() as u64);
        let record = minimal_record(Lsn(0));
        let divergence = record_end_lsn(l0, (XLOG_SIZE_OF_XLOG_RECORD + 2) as u32);

        let mut stream = header;
        stream.extend_from_slice(&record);
        let wal_dir = target.path().join("pg_xlog");
        fs::create_dir_all(wal_dir.as_std_path()).unwrap();
        let segment_name = XLogFileName(TimeLineID(1), 0, postgres_ffi::WAL_SEGMENT_SIZE);
        fs::write(wal_dir.join(segment_name).as_std_path(), &stream).unwrap();

        let mut target_control = base_control(1);
        target_control.checkpoint = l0;
        write_control_file(target.path(), &target_control);
        write_control_file(source.path(), &base_control(2));

        let history_dir = source.path().join("pg_xlog");
        fs::create_dir_all(history_dir.as_std_path()).unwrap();
        fs::write(
            history_dir.join("00000002.history").as_std_path(),
            format!("1\t{divergence}\tno recovery target specified\n"),
        )
        .unwrap();

        run(&local_config(target.path(), source.path())).unwrap();

        assert!(!target.path().join("backup_label").exists());
    }

    const XLOG_CHECKPOINT_SHUTDOWN: u8 = 0x00;

    fn finish_record(rmid: u8, info: u8, xl_prev: Lsn, body: Vec<u8>) -> Vec<u8> {
        let tot_len = (XLOG_SIZE_OF_XLOG_RECORD + body.len()) as u32;
        let mut rec = Vec::new();
        rec.extend_from_slice(&tot_len.to_le_bytes());
        rec.extend_from_slice(&0u32.to_le_bytes()); // xl_xid
        rec.extend_from_slice(&xl_prev.0.to_le_bytes());
        rec.push(info);
        rec.push(rmid);
        rec.extend_from_slice(&[0u8, 0u8]); // padding
        rec.extend_from_slice(&0u32.to_le_bytes()); // xl_crc
        rec.extend_from_slice(&body);
        while rec.len() % 8 != 0 {
            rec.push(0);
        }
        rec
    }

    fn build_checkpoint_record(xl_prev: Lsn, cp: CheckPoint) -> Vec<u8> {
        let payload = cp.encode();
        let mut body = Vec::new();
        body.push(XLR_BLOCK_ID_DATA_SHORT);
        body.push(payload.len() as u8);
        body.extend_from_slice(&payload);
        finish_record(RM_XLOG_ID, XLOG_CHECKPOINT_SHUTDOWN, xl_prev, body)
    }

    /// §8's round-trip property: re-running against an already-rewound
    /// target must leave the relation data untouched. The target's
    /// checkpoint record sits exactly at the divergence LSN, so a single
    /// `run()` both needs a rewind (step 6's `>=` branch) and finds that
    /// checkpoint immediately (step 7), without any block-level WAL scan
    /// in between.
    ///
    /// A literal second `run()` call isn't used to observe the idempotent
    /// state: `global/pg_control` is not a relation data file, so §4.F
    /// always plans a whole-file copy for it regardless of content, and
    /// executing that copy makes the target's control file report the
    /// source's own timeline — which step 4's sanity check then rejects as
    /// "same timeline", for good reason. Real `pg_rewind` avoids this
    /// because the target is restarted and replays onto a fresh timeline of
    /// its own before anyone runs it again; this test instead rebuilds the
    /// file map directly from the post-rewind directories, the same way
    /// `run_with_source` does it (`FileMap` + both `LocalSource` listings),
    /// to inspect the plan a second pass would produce.
    #[test]
    fn second_pass_over_an_already_rewound_target_touches_no_relation_data() {
        let target = tempdir().unwrap();
        let source = tempdir().unwrap();

        let header = vec![0u8; XLOG_SIZE_OF_XLOG_LONG_PHD];
        let l0 = Lsn(header.len() as u64);
        let divergence = l0;

        let checkpoint = CheckPoint {
            redo: l0,
            this_timeline_id: TimeLineID(1),
            next_xid_epoch: 0,
            next_xid: 1,
        };
        let mut stream = header;
        stream.extend_from_slice(&build_checkpoint_record(Lsn(0), checkpoint));
        let wal_dir = target.path().join("pg_xlog");
        fs::create_dir_all(wal_dir.as_std_path()).unwrap();
        let segment_name = XLogFileName(TimeLineID(1), 0, postgres_ffi::WAL_SEGMENT_SIZE);
        fs::write(wal_dir.join(segment_name).as_std_path(), &stream).unwrap();

        let mut target_control = base_control(1);
        target_control.checkpoint = l0;
        write_control_file(target.path(), &target_control);
        write_control_file(source.path(), &base_control(2));

        let history_dir = source.path().join("pg_xlog");
        fs::create_dir_all(history_dir.as_std_path()).unwrap();
        fs::write(
            history_dir.join("00000002.history").as_std_path(),
            format!("1\t{divergence}\tno recovery target specified\n"),
        )
        .unwrap();

        let first_block = vec![0x11u8; BLCKSZ as usize];
        let second_block = vec![0x22u8; BLCKSZ as usize];
        let mut source_rel = first_block.clone();
        source_rel.extend_from_slice(&second_block);

        fs::create_dir_all(source.path().join("base/1").as_std_path()).unwrap();
        fs::write(source.path().join("base/1/16384").as_std_path(), &source_rel).unwrap();
        fs::create_dir_all(target.path().join("base/1").as_std_path()).unwrap();
        fs::write(target.path().join("base/1/16384").as_std_path(), &first_block).unwrap();

        run(&local_config(target.path(), source.path())).unwrap();

        let rewound = fs::read(target.path().join("base/1/16384").as_std_path()).unwrap();
        assert_eq!(rewound, source_rel);

        let mut map = FileMap::new();
        let mut src = LocalSource::new(source.path().to_path_buf());
        for entry in src.list().unwrap() {
            if is_ignored(&entry.path) {
                continue;
            }
            map.process_remote(target.path(), &entry.path, entry.kind, entry.size, entry.link_target)
                .unwrap();
        }
        map.finish_remote();

        let mut tgt = LocalSource::new(target.path().to_path_buf());
        for entry in tgt.list().unwrap() {
            if is_ignored(&entry.path) {
                continue;
            }
            map.process_local(&entry.path, entry.kind, entry.size);
        }

        let finalized = map.finalize();
        for entry in finalized.entries() {
            if is_relation_data_file(&entry.path) {
                assert_eq!(
                    entry.action,
                    crate::filemap::FileAction::None,
                    "{} should already match the source after the first pass",
                    entry.path
                );
            }
        }
    }
}
