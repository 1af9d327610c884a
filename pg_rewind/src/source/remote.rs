//! Remote back-end of the file inventory source (§4.E, §6 wire protocol).
//!
//! Connects with the synchronous `postgres` client (this tool runs
//! single-threaded and blocking per §5), checks the source-server
//! preconditions, and installs thin SQL wrappers around PostgreSQL's
//! built-in `pg_ls_dir` / `pg_stat_file` / `pg_read_binary_file` functions
//! into a schema scoped to this run, dropped again on close.

use std::io::Write as _;

use postgres::{Client, NoTls};

use crate::error::RewindError;
use crate::filemap::FileType;

use super::{FileSource, InventoryEntry, RangeRequest, RangeResult};

pub struct RemoteSource {
    client: Client,
    schema: String,
}

impl RemoteSource {
    pub fn connect(connstr: &str) -> Result<RemoteSource, RewindError> {
        let mut client = Client::connect(connstr, NoTls)?;
        check_preconditions(&mut client)?;

        let schema = format!("pg_rewind_tmp_{}", std::process::id());
        install_helpers(&mut client, &schema)?;

        Ok(RemoteSource { client, schema })
    }
}

fn check_preconditions(client: &mut Client) -> Result<(), RewindError> {
    let in_recovery: bool = client.query_one("SELECT pg_is_in_recovery()", &[])?.get(0);
    if in_recovery {
        return Err(RewindError::Sanity(
            "source server is in recovery".to_string(),
        ));
    }

    let fpw: String = client.query_one("SHOW full_page_writes", &[])?.get(0);
    if fpw != "on" {
        return Err(RewindError::Sanity(
            "source server has full_page_writes disabled".to_string(),
        ));
    }

    client.batch_execute("SET synchronous_commit = off")?;
    Ok(())
}

fn install_helpers(client: &mut Client, schema: &str) -> Result<(), RewindError> {
    client.batch_execute(&format!(
        r#"
        CREATE SCHEMA {schema};

        CREATE FUNCTION {schema}.stat_file(path text)
        RETURNS TABLE(is_dir boolean, size bigint)
        LANGUAGE sql AS $$
            SELECT (pg_catalog.pg_stat_file(path, true)).isdir,
                   (pg_catalog.pg_stat_file(path, true)).size
        $$;

        CREATE FUNCTION {schema}.read_binary_file(path text, off_ int8, len int8, missing_ok boolean)
        RETURNS bytea
        LANGUAGE sql AS $$
            SELECT pg_catalog.pg_read_binary_file(path, off_, len, missing_ok)
        $$;

        CREATE RECURSIVE VIEW {schema}.ls_dir(path, is_dir, size, link_target) AS (
            SELECT entry,
                   (pg_catalog.pg_stat_file('.' || '/' || entry, true)).isdir,
                   (pg_catalog.pg_stat_file('.' || '/' || entry, true)).size,
                   NULL::text
            FROM pg_catalog.pg_ls_dir('.', true, true) AS entry
            UNION ALL
            SELECT d.path || '/' || child,
                   (pg_catalog.pg_stat_file(d.path || '/' || child, true)).isdir,
                   (pg_catalog.pg_stat_file(d.path || '/' || child, true)).size,
                   pg_catalog.pg_tablespace_location(t.oid)
            FROM {schema}.ls_dir d
            CROSS JOIN LATERAL pg_catalog.pg_ls_dir(d.path, true, true) AS child
            LEFT JOIN pg_catalog.pg_tablespace t
                   ON d.path = 'pg_tblspc' AND t.oid::text = child
            WHERE d.is_dir
        );
        "#
    ))?;
    Ok(())
}

impl FileSource for RemoteSource {
    fn list(&mut self) -> Result<Vec<InventoryEntry>, RewindError> {
        let rows = self.client.query(
            &format!("SELECT path, is_dir, size, link_target FROM {}.ls_dir ORDER BY path", self.schema),
            &[],
        )?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let path: String = row.get(0);
            let is_dir: bool = row.get(1);
            let size: Option<i64> = row.get(2);
            let link_target: Option<String> = row.get(3);

            let kind = if link_target.is_some() {
                FileType::Symlink
            } else if is_dir {
                FileType::Directory
            } else {
                FileType::Regular
            };
            out.push(InventoryEntry {
                path,
                kind,
                size: size.unwrap_or(0).max(0) as u64,
                link_target,
            });
        }
        Ok(out)
    }

    fn fetch_file(&mut self, path: &str) -> Result<Vec<u8>, RewindError> {
        let row = self.client.query_one(
            &format!("SELECT {}.read_binary_file($1, 0, -1, false)", self.schema),
            &[&path],
        )?;
        let bytes: Vec<u8> = row.get(0);
        Ok(bytes)
    }

    /// Loads the batch of `(path, offset, length)` requests into a temp
    /// table via COPY-IN, then drains a single ranged-read query (§4.G).
    fn execute_plan(&mut self, requests: &[RangeRequest]) -> Result<Vec<RangeResult>, RewindError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        // Temp tables live in the session's own pg_temp_N schema and cannot
        // be created with an explicit schema qualifier.
        self.client.batch_execute(
            "CREATE TEMPORARY TABLE pg_rewind_fetch_plan (seq int4, path text, begin_off int8, len int8)",
        )?;

        {
            let mut writer = self
                .client
                .copy_in("COPY pg_rewind_fetch_plan FROM STDIN")?;
            for (seq, req) in requests.iter().enumerate() {
                writeln!(writer, "{}\t{}\t{}\t{}", seq, req.path, req.offset, req.len)
                    .map_err(|e| RewindError::Protocol(e.to_string()))?;
            }
            writer.finish()?;
        }

        let rows = self.client.query(
            &format!(
                "SELECT seq, {schema}.read_binary_file(path, begin_off, len, true)
                 FROM pg_rewind_fetch_plan ORDER BY seq",
                schema = self.schema
            ),
            &[],
        )?;

        let mut results: Vec<RangeResult> = vec![None; requests.len()];
        for row in rows {
            let seq: i32 = row.get(0);
            let bytes: Option<Vec<u8>> = row.get(1);
            results[seq as usize] = bytes;
        }

        self.client
            .batch_execute("DROP TABLE IF EXISTS pg_rewind_fetch_plan")?;
        Ok(results)
    }

    fn close(&mut self) -> Result<(), RewindError> {
        self.client
            .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema))?;
        Ok(())
    }
}
