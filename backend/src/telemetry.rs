//! Tracing subscriber bootstrap for the worker binary.

use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the JSON subscriber filtered by `RUST_LOG`.
///
/// A second initialisation, or one racing another subscriber, is logged and
/// otherwise ignored.
pub fn init() {
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init()
    {
        warn!(error = %e, "tracing init failed");
    }
}
