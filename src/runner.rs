//! Execution collaborator seam.
//!
//! The engine never runs anything itself: every (host, task) unit of work is
//! handed to an [`ActionRunner`], which owns transports, module packaging and
//! privilege escalation. The engine only inspects the returned status; the
//! payload is opaque and forwarded to callbacks unexamined.

use std::fs::File;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::inventory::Host;
use crate::playbook::Task;
use crate::vars::Variables;

/// Outcome class of one executed unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    /// The task ran to completion.
    Ok,
    /// Task logic failed on the host.
    Failed,
    /// The transport never reached the host. Distinct from [`Failed`]:
    /// both stop further dispatch to the host, but they are reported
    /// separately.
    ///
    /// [`Failed`]: UnitStatus::Failed
    Unreachable,
    /// The collaborator skipped the task (condition, check mode).
    Skipped,
}

/// Result of one executed unit of work.
#[derive(Debug, Clone)]
pub struct UnitResult {
    /// Outcome class; the only field the engine inspects.
    pub status: UnitStatus,
    /// Whether the task changed anything, for stats only.
    pub changed: bool,
    /// Human-readable message.
    pub msg: Option<String>,
    /// Opaque module output, forwarded to callbacks.
    pub payload: Option<serde_json::Value>,
    /// Optional diff of applied changes.
    pub diff: Option<String>,
}

impl UnitResult {
    /// A successful result.
    pub fn ok(changed: bool) -> Self {
        Self {
            status: UnitStatus::Ok,
            changed,
            msg: None,
            payload: None,
            diff: None,
        }
    }

    /// A task-logic failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            status: UnitStatus::Failed,
            changed: false,
            msg: Some(msg.into()),
            payload: None,
            diff: None,
        }
    }

    /// A transport-level failure.
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self {
            status: UnitStatus::Unreachable,
            changed: false,
            msg: Some(msg.into()),
            payload: None,
            diff: None,
        }
    }

    /// A skipped task.
    pub fn skipped() -> Self {
        Self {
            status: UnitStatus::Skipped,
            changed: false,
            msg: None,
            payload: None,
            diff: None,
        }
    }
}

/// Per-unit execution context handed to the collaborator.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Variable snapshot for the host, opaque to the engine.
    pub vars: Arc<Variables>,
    /// Dry-run flag.
    pub check_mode: bool,
    /// Advisory inter-process lock file, created once per coordinator.
    /// Connection plugins use it to serialize access to shared local
    /// resources; the engine itself never locks on it.
    pub lockfile: Arc<File>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("check_mode", &self.check_mode)
            .field("vars", &self.vars.len())
            .finish()
    }
}

/// Executes one (host, task) unit of work.
///
/// Implementations must be safe to call concurrently up to the worker pool
/// bound. An `Err` return is treated as a task failure on the host, never as
/// a run-level error.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Runs `task` against `host` and reports the outcome.
    async fn execute(&self, host: &Host, task: &Task, ctx: &ExecutionContext) -> Result<UnitResult>;
}
