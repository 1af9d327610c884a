//! Process-wide tracing initialization, the way `utils::logging::init` is
//! called exactly once near the top of `main` in the teacher's binaries.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `verbose` raises the default filter from `info` to `debug` when the
/// caller didn't already set `RUST_LOG`; an explicit `RUST_LOG` always wins.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let default_directive = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(atty_is_tty());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

fn atty_is_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stderr().is_terminal()
}
