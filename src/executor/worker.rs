//! Bounded worker pool.
//!
//! All cross-host parallelism lives here: units of work fan out to spawned
//! workers gated by a semaphore sized to the effective fork count, and every
//! result comes back over one mpsc channel consumed by the strategy loop.
//! The channel is the single synchronization point of the engine; nothing
//! else is shared between workers.
//!
//! A worker that dies without reporting (a panic inside the execution
//! collaborator) is a fatal run-level condition: attribution of in-flight
//! work becomes impossible, so [`WorkerPool::recv`] surfaces it as
//! [`Error::WorkerCrash`] instead of guessing.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::inventory::Host;
use crate::playbook::Task;
use crate::runner::{ActionRunner, ExecutionContext, UnitResult};

/// One completed unit of work, as delivered on the result channel.
#[derive(Debug)]
pub struct CompletedUnit {
    /// Host the unit ran against.
    pub host: Host,
    /// Task that was executed.
    pub task: Arc<Task>,
    /// Outcome reported by the execution collaborator.
    pub result: UnitResult,
}

/// Fixed-size pool of worker execution units.
pub struct WorkerPool {
    forks: usize,
    permits: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<CompletedUnit>,
    rx: mpsc::UnboundedReceiver<CompletedUnit>,
    workers: JoinSet<()>,
    in_flight: usize,
}

impl WorkerPool {
    /// Creates a pool admitting at most `forks` concurrent units.
    pub fn new(forks: usize) -> Self {
        let forks = forks.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(forks, "worker pool initialized");
        Self {
            forks,
            permits: Arc::new(Semaphore::new(forks)),
            tx,
            rx,
            workers: JoinSet::new(),
            in_flight: 0,
        }
    }

    /// The pool's admission bound.
    pub fn forks(&self) -> usize {
        self.forks
    }

    /// Units dispatched but not yet received.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Dispatches one unit of work, waiting for a free worker slot.
    ///
    /// Pool capacity is the sole admission-control mechanism: this blocks
    /// when all slots are taken, which is the engine's only backpressure.
    pub async fn dispatch(
        &mut self,
        host: Host,
        task: Arc<Task>,
        runner: Arc<dyn ActionRunner>,
        ctx: ExecutionContext,
    ) -> Result<()> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("worker pool semaphore closed".into()))?;
        let tx = self.tx.clone();
        self.in_flight += 1;
        self.workers.spawn(async move {
            let result = match runner.execute(&host, &task, &ctx).await {
                Ok(result) => result,
                // collaborator errors are task failures, never run-level
                Err(e) => UnitResult::failed(e.to_string()),
            };
            drop(permit);
            // receiver dropped means the pool is shutting down
            let _ = tx.send(CompletedUnit { host, task, result });
        });
        Ok(())
    }

    /// Receives the next completed unit.
    ///
    /// Errors if a worker died without reporting or the channel closed with
    /// units outstanding.
    pub async fn recv(&mut self) -> Result<CompletedUnit> {
        let Self {
            rx,
            workers,
            in_flight,
            ..
        } = self;
        loop {
            tokio::select! {
                unit = rx.recv() => {
                    let unit = unit.ok_or(Error::ResultChannelClosed {
                        outstanding: *in_flight,
                    })?;
                    *in_flight = in_flight.saturating_sub(1);
                    return Ok(unit);
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok(()) => continue,
                        Err(e) if e.is_panic() => {
                            return Err(Error::WorkerCrash(e.to_string()));
                        }
                        Err(_) => continue, // cancelled during shutdown
                    }
                }
            }
        }
    }

    /// Force-stops any worker still alive and closes the result channel.
    pub async fn shutdown(&mut self) {
        if self.in_flight > 0 {
            warn!(in_flight = self.in_flight, "shutting down pool with units in flight");
        }
        self.workers.abort_all();
        while self.workers.join_next().await.is_some() {}
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        self.in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            vars: Arc::new(Default::default()),
            check_mode: false,
            lockfile: Arc::new(tempfile::tempfile().unwrap()),
        }
    }

    struct CountingRunner {
        concurrent: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ActionRunner for CountingRunner {
        async fn execute(
            &self,
            _host: &Host,
            _task: &Task,
            _ctx: &ExecutionContext,
        ) -> Result<UnitResult> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(UnitResult::ok(false))
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl ActionRunner for PanickingRunner {
        async fn execute(
            &self,
            _host: &Host,
            _task: &Task,
            _ctx: &ExecutionContext,
        ) -> Result<UnitResult> {
            panic!("worker blew up");
        }
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_forks() {
        let runner = Arc::new(CountingRunner {
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut pool = WorkerPool::new(2);
        let task = Arc::new(Task::new("t", "ping"));
        for i in 0..6 {
            pool.dispatch(
                Host::new(format!("h{i}")),
                Arc::clone(&task),
                runner.clone(),
                ctx(),
            )
            .await
            .unwrap();
        }
        for _ in 0..6 {
            pool.recv().await.unwrap();
        }
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_worker_is_a_fatal_crash() {
        let mut pool = WorkerPool::new(1);
        pool.dispatch(
            Host::new("h1"),
            Arc::new(Task::new("t", "ping")),
            Arc::new(PanickingRunner),
            ctx(),
        )
        .await
        .unwrap();
        let err = pool.recv().await.unwrap_err();
        assert!(matches!(err, Error::WorkerCrash(_)));
    }

    #[tokio::test]
    async fn runner_error_becomes_task_failure() {
        struct ErrRunner;
        #[async_trait]
        impl ActionRunner for ErrRunner {
            async fn execute(
                &self,
                _host: &Host,
                _task: &Task,
                _ctx: &ExecutionContext,
            ) -> Result<UnitResult> {
                Err(Error::Internal("connection setup".into()))
            }
        }
        let mut pool = WorkerPool::new(1);
        pool.dispatch(
            Host::new("h1"),
            Arc::new(Task::new("t", "ping")),
            Arc::new(ErrRunner),
            ctx(),
        )
        .await
        .unwrap();
        let unit = pool.recv().await.unwrap();
        assert_eq!(unit.result.status, crate::runner::UnitStatus::Failed);
    }
}
