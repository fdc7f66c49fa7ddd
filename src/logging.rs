//! Logging setup.
//!
//! Events go to stderr, filtered by `RUST_LOG` (default `info`). Every FUSE
//! operation is traced at `trace` level with its path and outcome.

use tracing_subscriber::EnvFilter;

pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
