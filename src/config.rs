//! Runner configuration.
//!
//! Only knobs the orchestration core itself consumes live here; transport
//! and module options belong to the collaborators that implement them.

use std::time::Duration;

use serde::Deserialize;

fn default_forks() -> usize {
    5
}

fn default_strategy() -> String {
    "linear".to_string()
}

fn default_callback_timeout_ms() -> u64 {
    5_000
}

/// Configuration for a [`TaskQueueManager`](crate::executor::TaskQueueManager).
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of concurrently executing units of work.
    ///
    /// The effective pool size is the minimum of this, the largest serial
    /// batch, and the number of eligible hosts.
    #[serde(default = "default_forks")]
    pub forks: usize,

    /// Strategy used when a play does not name one.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Dry-run mode, forwarded to the execution collaborator untouched.
    #[serde(default)]
    pub check_mode: bool,

    /// Upper bound on how long a single callback listener may hold up the
    /// dispatch loop. Listeners exceeding it are abandoned, not awaited.
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            forks: default_forks(),
            strategy: default_strategy(),
            check_mode: false,
            callback_timeout_ms: default_callback_timeout_ms(),
        }
    }
}

impl RunnerConfig {
    /// Callback timeout as a [`Duration`].
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}
