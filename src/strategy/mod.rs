//! Scheduling strategies.
//!
//! A strategy decides which (host, task) pairs run next and when a batch is
//! complete. It consumes the play iterator and worker pool through a
//! [`StrategyContext`] and runs single-threaded: the only suspension points
//! are waits on the shared result channel, and the iterator, registry and
//! stats are mutated exclusively from that consuming loop.

pub mod free;
pub mod linear;

use std::collections::HashSet;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::callback::CallbackBus;
use crate::error::{Error, Result};
use crate::executor::play_iterator::{PlayIterator, RunState};
use crate::executor::worker::{CompletedUnit, WorkerPool};
use crate::executor::RunCode;
use crate::handlers::HandlerRegistry;
use crate::inventory::Host;
use crate::playbook::{Play, Task};
use crate::runner::{ActionRunner, ExecutionContext, UnitStatus};
use crate::stats::AggregateStats;
use crate::vars::VarProvider;

pub use free::FreeStrategy;
pub use linear::LinearStrategy;

/// A pluggable scheduling policy.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// The name plays select this strategy by.
    fn name(&self) -> &'static str;

    /// Runs one batch of hosts to completion, including its handler flush.
    async fn run(
        &self,
        iterator: &mut PlayIterator,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<RunCode>;
}

/// Looks up a strategy by name.
///
/// An unknown name is a fatal configuration error, raised before any
/// dispatch happens.
pub fn load(name: &str) -> Result<Arc<dyn Strategy>> {
    match name {
        "linear" => Ok(Arc::new(LinearStrategy)),
        "free" => Ok(Arc::new(FreeStrategy)),
        other => Err(Error::UnknownStrategy(other.to_string())),
    }
}

/// Outcome of interpreting a `meta` pseudo-task.
pub(crate) enum MetaAction {
    /// Keep scheduling.
    Continue,
    /// Run notified handlers before continuing.
    Flush,
    /// Stop the batch as if every host had finished.
    EndPlay,
}

/// A processed unit result, as seen by the strategy loop.
#[derive(Debug)]
pub struct ProcessedUnit {
    /// Host the unit ran against.
    pub host: Host,
    /// Executed task.
    pub task: Arc<Task>,
    /// Reported status.
    pub status: UnitStatus,
    /// The failure was not absorbed by any rescue section; the host is
    /// terminally failed.
    pub hard_failed: bool,
    /// The failure jumped the host into a rescue section.
    pub rescued: bool,
}

/// Everything a strategy needs to run one batch: the play working copy,
/// batch hosts, worker pool, handler registry, collaborators and run flags.
pub struct StrategyContext<'a> {
    /// Compiled play working copy.
    pub play: &'a Play,
    /// Hosts of the current batch, in rollout order.
    pub hosts: Vec<Host>,
    /// Worker pool sized to the effective fork count.
    pub pool: &'a mut WorkerPool,
    /// Handler registry for the play.
    pub registry: &'a mut HandlerRegistry,
    /// Lifecycle event bus.
    pub callbacks: &'a CallbackBus,
    /// Execution collaborator.
    pub runner: Arc<dyn ActionRunner>,
    /// Variable collaborator.
    pub vars: Arc<dyn VarProvider>,
    /// Run-wide per-host counters.
    pub stats: &'a mut AggregateStats,
    /// Dry-run flag forwarded to execution contexts.
    pub check_mode: bool,
    /// Advisory lockfile shared with connection plugins.
    pub lockfile: Arc<File>,
    /// Coordinator terminate flag, checked at every dispatch iteration.
    pub terminated: Arc<AtomicBool>,
}

impl StrategyContext<'_> {
    /// Whether the coordinator asked the run to stop.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Builds the per-unit execution context for a host.
    pub fn execution_context(&self, host: &Host) -> ExecutionContext {
        ExecutionContext {
            vars: Arc::new(self.vars.host_vars(self.play, host)),
            check_mode: self.check_mode,
            lockfile: Arc::clone(&self.lockfile),
        }
    }

    /// Hands one unit of work to the pool, blocking while it is full.
    pub async fn dispatch(&mut self, host: &Host, task: Arc<Task>) -> Result<()> {
        let ctx = self.execution_context(host);
        self.pool
            .dispatch(host.clone(), task, Arc::clone(&self.runner), ctx)
            .await
    }

    /// Maps one completed unit back onto the iterator, registry and stats.
    ///
    /// This is the single place results mutate engine state; strategies call
    /// it from their consuming loop only.
    pub async fn process_result(
        &mut self,
        iterator: &mut PlayIterator,
        unit: CompletedUnit,
    ) -> ProcessedUnit {
        let CompletedUnit { host, task, result } = unit;
        self.stats.record(&host, &result);
        self.callbacks.unit_result(&host, &task, &result).await;

        let mut hard_failed = false;
        let mut rescued = false;
        match result.status {
            UnitStatus::Ok => {
                for target in &task.notify {
                    if self.registry.notify_target(target, &host) > 0 {
                        self.callbacks.handler_notified(target, &host).await;
                    }
                }
            }
            UnitStatus::Failed => {
                if task.ignore_errors {
                    debug!(host = %host, task = task.display_name(), "failure ignored");
                } else {
                    match iterator.mark_task_failed(&host) {
                        RunState::InRescue => {
                            rescued = true;
                            self.stats.record_rescued(&host);
                        }
                        RunState::Failed => hard_failed = true,
                        _ => {}
                    }
                }
            }
            UnitStatus::Unreachable => iterator.mark_host_unreachable(&host),
            UnitStatus::Skipped => {}
        }

        ProcessedUnit {
            host,
            task,
            status: result.status,
            hard_failed,
            rescued,
        }
    }

    /// Classifies a `meta` pseudo-task; meta never reaches the pool.
    ///
    /// `flush_handlers` is handed back to the strategy instead of flushed
    /// here: the strategy must wait out its own in-flight units first.
    pub(crate) fn meta_action(&self, task: &Task) -> MetaAction {
        match task.meta_directive() {
            Some("noop") | None => MetaAction::Continue,
            Some("flush_handlers") => MetaAction::Flush,
            Some("end_play") => MetaAction::EndPlay,
            Some(other) => {
                warn!(directive = other, "unknown meta directive ignored");
                MetaAction::Continue
            }
        }
    }

    /// Runs all notified handlers for the batch and drains the registry.
    ///
    /// Handlers run in declared order, exactly once per notifying host per
    /// batch. A handler result may notify further handlers; the executed-set
    /// keeps chains from looping. Failed and unreachable hosts are skipped
    /// (failed ones run anyway under `force_handlers`).
    ///
    /// Results are consumed by count from the shared channel, so the caller
    /// must have no task units of its own in flight.
    pub async fn flush_handlers(&mut self, iterator: &mut PlayIterator) -> Result<()> {
        let mut executed: HashSet<(String, Host)> = HashSet::new();
        loop {
            let drained = self.registry.drain_notified();
            if drained.is_empty() {
                return Ok(());
            }
            for (key, hosts) in drained {
                let Some(handler) = self.registry.handler_task(&key) else {
                    continue;
                };
                let hosts: Vec<Host> = hosts
                    .into_iter()
                    .filter(|h| {
                        let state = iterator.host_state(h);
                        state != RunState::Unreachable
                            && (self.play.force_handlers || state != RunState::Failed)
                            && executed.insert((key.as_str().to_string(), h.clone()))
                    })
                    .collect();
                if hosts.is_empty() {
                    continue;
                }

                self.callbacks.handler_start(&handler, &hosts).await;
                for host in &hosts {
                    self.dispatch(host, Arc::clone(&handler)).await?;
                }
                let mut outstanding = hosts.len();
                while outstanding > 0 {
                    let unit = self.pool.recv().await?;
                    outstanding -= 1;
                    // a handler failure is a task failure for the host
                    self.process_result(iterator, unit).await;
                }
            }
        }
    }
}

/// Aggregate return code for a finished batch, counting only hosts that
/// failed or went unreachable during this run (not ones replayed from
/// previous plays).
pub(crate) fn completion_code(
    iterator: &PlayIterator,
    pre_failed: &HashSet<Host>,
    pre_unreachable: &HashSet<Host>,
    aborted: bool,
) -> RunCode {
    let mut code = RunCode::OK;
    if iterator
        .get_failed_hosts()
        .iter()
        .any(|h| !pre_failed.contains(h))
    {
        code |= RunCode::FAILED_HOSTS;
    }
    if iterator
        .get_unreachable_hosts()
        .iter()
        .any(|h| !pre_unreachable.contains(h))
    {
        code |= RunCode::UNREACHABLE_HOSTS;
    }
    if aborted {
        code |= RunCode::ABORTED;
    }
    code
}
