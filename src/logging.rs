//! Logging setup using tracing
//!
//! Records go to stderr; under systemd the journal picks them up. `RUST_LOG` overrides
//! the default `info` level, e.g. `RUST_LOG=sms2mail=debug`.

use crate::error::{Error, Result};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. Fails if one is already installed.
pub fn init() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| Error::Logging(format!("failed to initialize tracing: {}", e)))
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}
