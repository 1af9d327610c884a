//! CLI surface (§6): flags, mutual exclusion of the two source kinds, and
//! the `-?` help alias pg_rewind itself carries.

use camino::Utf8PathBuf;
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "pg_rewind",
    version,
    about = "Resynchronize a PostgreSQL data directory with a diverged source",
    disable_help_flag = true
)]
pub struct Args {
    /// Target data directory to rewind in place.
    #[arg(short = 'D', long = "target-pgdata", value_name = "DIR")]
    pub target_pgdata: Utf8PathBuf,

    /// Local data directory of the source cluster.
    #[arg(long = "source-pgdata", value_name = "DIR", conflicts_with = "source_server")]
    pub source_pgdata: Option<Utf8PathBuf>,

    /// Connection string of a live source cluster.
    #[arg(long = "source-server", value_name = "CONNSTR")]
    pub source_server: Option<String>,

    /// Compute the file map and log what would change, but mutate nothing.
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Emit debug-level log output.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    #[arg(short = '?', long = "help", action = clap::ArgAction::Help)]
    pub help: Option<bool>,
}
