//! Logging initialization.
//!
//! Logs go to stderr so stdout only ever carries command output.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "toolgate=debug,toolgate_mcp=debug"
    } else {
        "toolgate=info,toolgate_mcp=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
