//! Error types for Playmill.
//!
//! The split here mirrors the propagation policy of the engine: configuration
//! problems are fatal and abort a run before any dispatch, while per-host
//! failures are absorbed into iterator/failure-set state and never surface as
//! `Err` values. Only run-level conditions (bad configuration, a crashed
//! worker, a closed result channel) escape to the caller.

use thiserror::Error;

/// Result type alias for Playmill operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Playmill.
#[derive(Error, Debug)]
pub enum Error {
    /// An execution strategy name that no known strategy answers to.
    ///
    /// Raised before any task is dispatched.
    #[error("Invalid play strategy specified: {0}")]
    UnknownStrategy(String),

    /// A `serial` specification that cannot be resolved into batch sizes.
    #[error("Invalid serial batch specification: {0}")]
    InvalidSerial(String),

    /// Generic configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Play failed structural validation before iteration began.
    #[error("Play validation failed: {0}")]
    PlayValidation(String),

    /// Invalid host pattern handed to the inventory.
    #[error("Invalid host pattern: '{0}'")]
    InvalidHostPattern(String),

    /// A worker execution unit died without reporting a result.
    ///
    /// Fatal at run level: result attribution for in-flight work is
    /// impossible once a worker is gone.
    #[error("Worker process crashed: {0}")]
    WorkerCrash(String),

    /// The shared result channel closed while units were still outstanding.
    #[error("Result channel closed with {outstanding} unit(s) in flight")]
    ResultChannelClosed {
        /// Number of dispatched units that had not yet reported.
        outstanding: usize,
    },

    /// IO error (lockfile creation, mostly).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error when loading a play definition.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if this error indicates a problem with the run definition rather
    /// than the run itself, i.e. it was raised before any dispatch happened.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnknownStrategy(_)
                | Error::InvalidSerial(_)
                | Error::Config(_)
                | Error::PlayValidation(_)
                | Error::InvalidHostPattern(_)
        )
    }
}
