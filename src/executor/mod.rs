//! Run coordination.
//!
//! [`TaskQueueManager`] owns everything with run lifetime: configuration,
//! collaborator handles, the callback bus, aggregate statistics and the
//! carried failure sets. Per-play state (iterator, worker pool, handler
//! registry contents) is created fresh for every play and every serial
//! batch, so no state can leak between plays except what is carried on
//! purpose.

pub mod play_iterator;
pub mod worker;

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::callback::{CallbackBus, SharedCallback};
use crate::config::RunnerConfig;
use crate::error::Result;
use crate::handlers::HandlerRegistry;
use crate::inventory::{Host, Inventory};
use crate::playbook::{Play, TagFilter};
use crate::runner::ActionRunner;
use crate::stats::AggregateStats;
use crate::strategy::{self, StrategyContext};
use crate::vars::VarProvider;

pub use play_iterator::{PlayIterator, RunState};
pub use worker::{CompletedUnit, WorkerPool};

/// Aggregate outcome of a play, a bit-set so one run can report several
/// conditions at once.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunCode(u32);

impl RunCode {
    /// Every targeted host completed.
    pub const OK: RunCode = RunCode(0);
    /// At least one host failed during this play.
    pub const FAILED_HOSTS: RunCode = RunCode(1 << 1);
    /// At least one host went unreachable during this play.
    pub const UNREACHABLE_HOSTS: RunCode = RunCode(1 << 2);
    /// The play was cut short (`any_errors_fatal` or an external terminate).
    pub const ABORTED: RunCode = RunCode(1 << 3);

    /// True when no condition bits are set.
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: RunCode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit value, stable across releases for exit-code mapping.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for RunCode {
    type Output = RunCode;

    fn bitor(self, rhs: RunCode) -> RunCode {
        RunCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for RunCode {
    fn bitor_assign(&mut self, rhs: RunCode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for RunCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("OK");
        }
        let mut parts = Vec::new();
        if self.contains(RunCode::FAILED_HOSTS) {
            parts.push("FAILED_HOSTS");
        }
        if self.contains(RunCode::UNREACHABLE_HOSTS) {
            parts.push("UNREACHABLE_HOSTS");
        }
        if self.contains(RunCode::ABORTED) {
            parts.push("ABORTED");
        }
        f.write_str(&parts.join("|"))
    }
}

/// The worker pool bound for a play: the configured fork count capped by the
/// largest serial batch and the number of targeted hosts. Zero contenders
/// (no serial spec, empty host list) do not participate.
pub(crate) fn effective_forks(forks: usize, max_serial: usize, num_hosts: usize) -> usize {
    [forks, max_serial, num_hosts]
        .into_iter()
        .filter(|&n| n > 0)
        .min()
        .unwrap_or(1)
        .max(1)
}

/// Coordinates the run of plays against an inventory.
///
/// Holds the state that outlives a single play: the carried failure sets,
/// aggregate statistics, the callback bus and the shared lockfile. A single
/// manager runs plays sequentially; per-host parallelism happens inside the
/// strategy via the worker pool.
pub struct TaskQueueManager {
    config: RunnerConfig,
    inventory: Arc<dyn Inventory>,
    vars: Arc<dyn VarProvider>,
    runner: Arc<dyn ActionRunner>,
    callbacks: CallbackBus,
    stats: AggregateStats,
    /// Hosts failed in earlier plays; replayed into the next play's iterator
    /// and rebuilt from its outcome.
    failed_hosts: HashSet<Host>,
    /// Hosts that went unreachable at any point of the run. Never cleared:
    /// a dead transport does not heal between plays.
    unreachable_hosts: HashSet<Host>,
    terminated: Arc<AtomicBool>,
    lockfile: Arc<File>,
    /// Pool of the batch currently running, kept here so `cleanup` can
    /// force-stop it from outside the run loop.
    pool: Option<WorkerPool>,
}

impl TaskQueueManager {
    /// Creates a manager bound to its collaborators.
    ///
    /// The advisory lockfile is created here, once per manager, and shared
    /// with every execution context of the run.
    pub fn new(
        config: RunnerConfig,
        inventory: Arc<dyn Inventory>,
        vars: Arc<dyn VarProvider>,
        runner: Arc<dyn ActionRunner>,
    ) -> Result<Self> {
        let callbacks = CallbackBus::new(config.callback_timeout());
        let lockfile = Arc::new(tempfile::tempfile()?);
        Ok(Self {
            config,
            inventory,
            vars,
            runner,
            callbacks,
            stats: AggregateStats::new(),
            failed_hosts: HashSet::new(),
            unreachable_hosts: HashSet::new(),
            terminated: Arc::new(AtomicBool::new(false)),
            lockfile,
            pool: None,
        })
    }

    /// Registers a callback listener for all subsequent plays.
    pub fn register_callback(&mut self, callback: SharedCallback) {
        self.callbacks.register(callback);
    }

    /// Aggregate statistics across every play run so far.
    pub fn stats(&self) -> &AggregateStats {
        &self.stats
    }

    /// Hosts currently carried as failed.
    pub fn failed_hosts(&self) -> &HashSet<Host> {
        &self.failed_hosts
    }

    /// Hosts carried as unreachable.
    pub fn unreachable_hosts(&self) -> &HashSet<Host> {
        &self.unreachable_hosts
    }

    /// Drops the carried failed set so the next play targets those hosts
    /// again. The unreachable set is left alone.
    pub fn clear_failed_hosts(&mut self) {
        self.failed_hosts.clear();
    }

    /// Asks the run to stop. Safe to call from any thread (a signal handler,
    /// another task); strategies observe the flag between dispatches and let
    /// in-flight units finish.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Whether a terminate was requested.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Force-stops any worker still alive and drains the result channel.
    ///
    /// Runs automatically after every serial batch; calling it again (after
    /// a `terminate`, or on drop paths) is harmless.
    pub async fn cleanup(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.shutdown().await;
        }
        self.pool = None;
    }

    /// Runs one play to completion with no tag filtering.
    pub async fn run(&mut self, play: &Play) -> Result<RunCode> {
        self.run_with_tags(play, &TagFilter::all()).await
    }

    /// Runs one play to completion.
    ///
    /// The play is validated and compiled into a working copy, its strategy
    /// resolved before anything is dispatched, and its host list split into
    /// serial batches each run by a fresh iterator and worker pool.
    #[instrument(skip_all, fields(play = %play.name))]
    pub async fn run_with_tags(&mut self, play: &Play, filter: &TagFilter) -> Result<RunCode> {
        play.validate()?;
        let compiled = play.compile(filter);

        // resolved up front so a bad name aborts before any dispatch
        let strategy_name = compiled
            .strategy_name()
            .unwrap_or(self.config.strategy.as_str());
        let strategy = strategy::load(strategy_name)?;

        let all_hosts = self.inventory.get_hosts(&compiled.hosts)?;
        if all_hosts.is_empty() {
            warn!(pattern = %compiled.hosts, "no hosts matched, skipping play");
            return Ok(RunCode::OK);
        }

        let batch_sizes = compiled.resolve_batch_sizes(all_hosts.len())?;
        let forks = effective_forks(
            self.config.forks,
            compiled.max_serial(all_hosts.len())?,
            all_hosts.len(),
        );
        info!(
            strategy = strategy.name(),
            hosts = all_hosts.len(),
            batches = batch_sizes.len(),
            forks,
            "running play"
        );

        // carried failures targeted by this play are replayed into its
        // iterators and rebuilt from the outcome; ones this play does not
        // target stay carried untouched
        let replay_failed = std::mem::take(&mut self.failed_hosts);
        self.failed_hosts = replay_failed
            .iter()
            .filter(|h| !all_hosts.contains(*h))
            .cloned()
            .collect();

        self.callbacks.play_start(&compiled, &all_hosts).await;

        let mut registry = HandlerRegistry::new();
        let mut code = RunCode::OK;
        let mut offset = 0;
        for size in batch_sizes {
            let batch = all_hosts[offset..offset + size].to_vec();
            offset += size;
            debug!(batch = batch.len(), offset, "starting serial batch");

            let mut iterator = PlayIterator::new(&compiled, batch.clone());
            for host in &batch {
                if replay_failed.contains(host) {
                    iterator.mark_host_failed(host);
                }
                if self.unreachable_hosts.contains(host) {
                    iterator.mark_host_unreachable(host);
                }
            }
            registry.reset(&compiled);

            let pool = self.pool.insert(WorkerPool::new(forks));
            let mut ctx = StrategyContext {
                play: &compiled,
                hosts: batch,
                pool,
                registry: &mut registry,
                callbacks: &self.callbacks,
                runner: Arc::clone(&self.runner),
                vars: Arc::clone(&self.vars),
                stats: &mut self.stats,
                check_mode: self.config.check_mode,
                lockfile: Arc::clone(&self.lockfile),
                terminated: Arc::clone(&self.terminated),
            };
            let batch_code = strategy.run(&mut iterator, &mut ctx).await;
            self.cleanup().await;
            let batch_code = batch_code?;
            code |= batch_code;

            self.failed_hosts.extend(iterator.get_failed_hosts());
            self.unreachable_hosts.extend(iterator.get_unreachable_hosts());

            if batch_code.contains(RunCode::ABORTED) {
                warn!("play aborted, remaining batches skipped");
                // carried failures sitting in batches that never ran stay
                // carried; their hosts were replayed out of the set above
                self.failed_hosts.extend(
                    all_hosts[offset..]
                        .iter()
                        .filter(|h| replay_failed.contains(*h))
                        .cloned(),
                );
                break;
            }
        }

        self.callbacks.play_end(&compiled, code).await;
        Ok(code)
    }
}
