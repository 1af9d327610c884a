//! Immutable global configuration (§5, §9): parsed once from `cli::Args`,
//! then threaded read-only through the orchestrator and every component it
//! builds. There is no process-wide singleton once parsing finishes.

use camino::Utf8PathBuf;

use crate::cli::Args;
use crate::error::RewindError;

#[derive(Debug, Clone)]
pub enum SourceSpec {
    Local { pgdata: Utf8PathBuf },
    Remote { connstr: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub target_pgdata: Utf8PathBuf,
    pub source: SourceSpec,
    pub dry_run: bool,
    pub verbose: bool,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Config, RewindError> {
        let source = match (args.source_pgdata, args.source_server) {
            (Some(pgdata), None) => SourceSpec::Local { pgdata },
            (None, Some(connstr)) => SourceSpec::Remote { connstr },
            (None, None) => {
                return Err(RewindError::Usage(
                    "one of --source-pgdata or --source-server is required".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(RewindError::Usage(
                    "--source-pgdata and --source-server are mutually exclusive".to_string(),
                ))
            }
        };

        Ok(Config {
            target_pgdata: args.target_pgdata,
            source,
            dry_run: args.dry_run,
            verbose: args.verbose,
        })
    }
}
