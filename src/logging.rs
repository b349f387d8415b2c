//! Log initialization
//!
//! Logs go to stderr so stdout stays reserved for command output and the
//! SUMMARY line. `RUST_LOG` directives are honored on top of the verbosity
//! level chosen on the command line.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Level for a `-v` count: info, debug, then trace.
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::from_default_env().add_directive(level_for(verbosity).into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
