//! Optional logging setup built on `tracing-subscriber`.
//!
//! The log level is taken from `RUST_LOG`, defaulting to `info`. Log lines are
//! written through the progress bar layer so they don't tear the bars drawn
//! for running evaluations.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging() -> Result<(), TryInitError> {
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init()
}
