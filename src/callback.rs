//! Callback bus for execution lifecycle events.
//!
//! Zero or more listeners observe named events emitted by the dispatch loop.
//! Delivery is cooperative and best-effort: a listener that exceeds the
//! configured bound is abandoned (fire-and-continue) so it can never stall
//! dispatch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::executor::RunCode;
use crate::inventory::Host;
use crate::playbook::{Play, Task};
use crate::runner::{UnitResult, UnitStatus};

/// Receiver of execution lifecycle events. All methods default to no-ops so
/// listeners implement only what they care about.
#[async_trait]
pub trait ExecutionCallback: Send + Sync {
    /// A play (or serial batch of one) is about to run.
    async fn on_play_start(&self, play: &Play, hosts: &[Host]) {
        let _ = (play, hosts);
    }

    /// A play finished with the given aggregate code.
    async fn on_play_end(&self, play: &Play, code: RunCode) {
        let _ = (play, code);
    }

    /// A task is being dispatched to one or more hosts.
    async fn on_task_start(&self, task: &Task) {
        let _ = task;
    }

    /// One unit of work returned a result.
    async fn on_unit_result(&self, host: &Host, task: &Task, result: &UnitResult) {
        let _ = (host, task, result);
    }

    /// A handler was notified by a host.
    async fn on_handler_notified(&self, handler: &str, host: &Host) {
        let _ = (handler, host);
    }

    /// A handler is about to execute on its notifying hosts.
    async fn on_handler_start(&self, handler: &Task, hosts: &[Host]) {
        let _ = (handler, hosts);
    }
}

/// A shared callback listener.
pub type SharedCallback = Arc<dyn ExecutionCallback>;

/// Fan-out of lifecycle events to registered listeners, each bounded by a
/// per-event timeout.
pub struct CallbackBus {
    listeners: Vec<SharedCallback>,
    timeout: Duration,
}

impl CallbackBus {
    /// Creates a bus with the given per-listener event timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            listeners: Vec::new(),
            timeout,
        }
    }

    /// Registers a listener.
    pub fn register(&mut self, callback: SharedCallback) {
        self.listeners.push(callback);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// True when no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    async fn each<'a, F, Fut>(&'a self, mut event: F)
    where
        F: FnMut(&'a SharedCallback) -> Fut,
        Fut: std::future::Future<Output = ()> + 'a,
    {
        for listener in &self.listeners {
            if tokio::time::timeout(self.timeout, event(listener))
                .await
                .is_err()
            {
                warn!("callback listener exceeded {:?}, abandoned", self.timeout);
            }
        }
    }

    /// Emits `play_start`.
    pub async fn play_start(&self, play: &Play, hosts: &[Host]) {
        self.each(|l| l.on_play_start(play, hosts)).await;
    }

    /// Emits `play_end`.
    pub async fn play_end(&self, play: &Play, code: RunCode) {
        self.each(|l| l.on_play_end(play, code)).await;
    }

    /// Emits `task_start`.
    pub async fn task_start(&self, task: &Task) {
        self.each(|l| l.on_task_start(task)).await;
    }

    /// Emits a per-unit result.
    pub async fn unit_result(&self, host: &Host, task: &Task, result: &UnitResult) {
        self.each(|l| l.on_unit_result(host, task, result)).await;
    }

    /// Emits `handler_notified`.
    pub async fn handler_notified(&self, handler: &str, host: &Host) {
        self.each(|l| l.on_handler_notified(handler, host)).await;
    }

    /// Emits `handler_start`.
    pub async fn handler_start(&self, handler: &Task, hosts: &[Host]) {
        self.each(|l| l.on_handler_start(handler, hosts)).await;
    }
}

/// Listener that discards every event. Useful in tests.
#[derive(Debug, Default)]
pub struct NullCallback;

#[async_trait]
impl ExecutionCallback for NullCallback {}

/// Listener that logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingCallback;

#[async_trait]
impl ExecutionCallback for TracingCallback {
    async fn on_play_start(&self, play: &Play, hosts: &[Host]) {
        info!(play = %play.name, hosts = hosts.len(), "play started");
    }

    async fn on_play_end(&self, play: &Play, code: RunCode) {
        info!(play = %play.name, ?code, "play finished");
    }

    async fn on_task_start(&self, task: &Task) {
        debug!(task = task.display_name(), "task dispatched");
    }

    async fn on_unit_result(&self, host: &Host, task: &Task, result: &UnitResult) {
        match result.status {
            UnitStatus::Ok => {
                debug!(host = %host, task = task.display_name(), changed = result.changed, "ok")
            }
            UnitStatus::Failed => {
                warn!(host = %host, task = task.display_name(), msg = ?result.msg, "failed")
            }
            UnitStatus::Unreachable => {
                warn!(host = %host, task = task.display_name(), msg = ?result.msg, "unreachable")
            }
            UnitStatus::Skipped => {
                debug!(host = %host, task = task.display_name(), "skipped")
            }
        }
    }

    async fn on_handler_start(&self, handler: &Task, hosts: &[Host]) {
        info!(handler = handler.display_name(), hosts = hosts.len(), "running handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Slow(AtomicUsize);

    #[async_trait]
    impl ExecutionCallback for Slow {
        async fn on_task_start(&self, _task: &Task) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_listener_is_abandoned_not_awaited() {
        let mut bus = CallbackBus::new(Duration::from_millis(10));
        bus.register(Arc::new(Slow(AtomicUsize::new(0))));
        // finishes despite the listener sleeping for an hour
        bus.task_start(&Task::new("t", "ping")).await;
    }
}
