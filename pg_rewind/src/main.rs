//! Entry point: parse arguments, initialize logging, run the orchestrator,
//! and map any error to the process exit code from §6.

mod cli;
mod config;
mod error;
mod executor;
mod filemap;
mod orchestrator;
mod source;
mod walreader;

use clap::Parser;
use tracing::error;

use cli::Args;
use config::Config;

fn main() {
    let args = Args::parse();
    let verbose = args.verbose;

    if let Err(e) = utils::logging::init(verbose) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let config = match Config::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };

    match orchestrator::run(&config) {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}
