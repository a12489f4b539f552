//! # Playmill - Play Orchestration Engine
//!
//! Playmill is the orchestration core of an automation runner: it takes
//! parsed plays, an inventory, a variable source and an execution
//! collaborator, and coordinates parallel execution of every (host, task)
//! unit of work. It deliberately does *not* parse inventories, template
//! variables, open connections or implement modules; those concerns plug in
//! through traits.
//!
//! ## Core Concepts
//!
//! - **Plays**: Ordered blocks of tasks targeted at a host pattern, with
//!   structured `rescue`/`always` error handling
//! - **Task queue manager**: The run coordinator owning forks, callbacks,
//!   stats and the failure sets carried across plays
//! - **Strategies**: Pluggable scheduling policies (`linear` lock-step,
//!   `free` unsynchronized)
//! - **Play iterator**: A per-host state machine walking the block tree
//! - **Handlers**: Tasks run at flush points when notified, by name or
//!   through `listen` topics
//! - **Workers**: A semaphore-bounded pool feeding one result channel
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use playmill::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let inventory = StaticInventory::from_names(["web1", "web2"]);
//!     let play = Play::from_yaml(yaml)?;
//!
//!     let mut tqm = TaskQueueManager::new(
//!         RunnerConfig::default(),
//!         Arc::new(inventory),
//!         Arc::new(StaticVars::new()),
//!         Arc::new(MyRunner),
//!     )?;
//!     tqm.register_callback(Arc::new(TracingCallback));
//!
//!     let code = tqm.run(&play).await?;
//!     assert!(code.is_ok());
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod callback;
pub mod config;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod inventory;
pub mod playbook;
pub mod runner;
pub mod stats;
pub mod strategy;
pub mod telemetry;
pub mod vars;

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of the types most embedders need.

    pub use crate::callback::{CallbackBus, ExecutionCallback, NullCallback, TracingCallback};
    pub use crate::config::RunnerConfig;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{PlayIterator, RunCode, RunState, TaskQueueManager};
    pub use crate::handlers::HandlerRegistry;
    pub use crate::inventory::{Host, Inventory, StaticInventory};
    pub use crate::playbook::{Block, Play, Serial, TagFilter, Task};
    pub use crate::runner::{ActionRunner, ExecutionContext, UnitResult, UnitStatus};
    pub use crate::stats::AggregateStats;
    pub use crate::strategy::{FreeStrategy, LinearStrategy, Strategy};
    pub use crate::vars::{StaticVars, VarProvider, Variables};
}

pub use error::{Error, Result};
pub use executor::{RunCode, TaskQueueManager};
pub use playbook::Play;
