//! Structured logging setup using the tracing crate.
//!
//! The engine itself only emits through `tracing`; installing a subscriber
//! is the embedder's choice. These helpers cover the common cases.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Maps a `-v` count to a default filter directive.
fn filter_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs a global compact-format subscriber.
///
/// `RUST_LOG` wins over `verbosity` when set. Errors if a global subscriber
/// is already installed.
pub fn init_logging(verbosity: u8) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbosity)));
    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(verbosity >= 2);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()
        .map_err(|e| Error::Config(e.to_string()))
}
