//! Shared test fixtures: a scripted execution collaborator and a counting
//! callback listener.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use playmill::prelude::*;

/// Execution collaborator scripted per (host, task name).
///
/// Every execution is appended to an in-order log, which tests assert
/// scheduling behavior against. Unscripted units report changed-ok.
#[derive(Default)]
pub struct ScriptedRunner {
    outcomes: HashMap<(String, String), UnitStatus>,
    delays: HashMap<(String, String), Duration>,
    log: Mutex<Vec<(String, String)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(mut self, host: &str, task: &str) -> Self {
        self.outcomes
            .insert((host.into(), task.into()), UnitStatus::Failed);
        self
    }

    pub fn unreachable_on(mut self, host: &str, task: &str) -> Self {
        self.outcomes
            .insert((host.into(), task.into()), UnitStatus::Unreachable);
        self
    }

    pub fn skip_on(mut self, host: &str, task: &str) -> Self {
        self.outcomes
            .insert((host.into(), task.into()), UnitStatus::Skipped);
        self
    }

    pub fn delay_on(mut self, host: &str, task: &str, delay: Duration) -> Self {
        self.delays.insert((host.into(), task.into()), delay);
        self
    }

    /// The executions recorded so far, in completion order.
    pub fn log(&self) -> Vec<(String, String)> {
        self.log.lock().clone()
    }

    /// Position of the first `(host, task)` execution in the log.
    pub fn position_of(&self, host: &str, task: &str) -> Option<usize> {
        self.log
            .lock()
            .iter()
            .position(|(h, t)| h == host && t == task)
    }

    /// Whether `(host, task)` ever executed.
    pub fn ran(&self, host: &str, task: &str) -> bool {
        self.position_of(host, task).is_some()
    }

    /// Number of times a task executed across all hosts.
    pub fn count_of(&self, task: &str) -> usize {
        self.log.lock().iter().filter(|(_, t)| t == task).count()
    }
}

#[async_trait]
impl ActionRunner for ScriptedRunner {
    async fn execute(
        &self,
        host: &Host,
        task: &Task,
        _ctx: &ExecutionContext,
    ) -> Result<UnitResult> {
        let key = (host.name().to_string(), task.display_name().to_string());
        if let Some(delay) = self.delays.get(&key) {
            tokio::time::sleep(*delay).await;
        }
        self.log.lock().push(key.clone());
        Ok(match self.outcomes.get(&key).copied() {
            None | Some(UnitStatus::Ok) => UnitResult::ok(true),
            Some(UnitStatus::Failed) => UnitResult::failed("scripted failure"),
            Some(UnitStatus::Unreachable) => UnitResult::unreachable("scripted outage"),
            Some(UnitStatus::Skipped) => UnitResult::skipped(),
        })
    }
}

/// Callback listener counting lifecycle events.
#[derive(Default)]
pub struct CountingCallback {
    pub play_starts: AtomicUsize,
    pub play_ends: AtomicUsize,
    pub task_starts: AtomicUsize,
    pub unit_results: AtomicUsize,
    pub handler_notifications: AtomicUsize,
    pub handler_starts: AtomicUsize,
    pub last_code: Mutex<Option<RunCode>>,
}

#[async_trait]
impl ExecutionCallback for CountingCallback {
    async fn on_play_start(&self, _play: &Play, _hosts: &[Host]) {
        self.play_starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_play_end(&self, _play: &Play, code: RunCode) {
        self.play_ends.fetch_add(1, Ordering::SeqCst);
        *self.last_code.lock() = Some(code);
    }

    async fn on_task_start(&self, _task: &Task) {
        self.task_starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_unit_result(&self, _host: &Host, _task: &Task, _result: &UnitResult) {
        self.unit_results.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_handler_notified(&self, _handler: &str, _host: &Host) {
        self.handler_notifications.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_handler_start(&self, _handler: &Task, _hosts: &[Host]) {
        self.handler_starts.fetch_add(1, Ordering::SeqCst);
    }
}

/// A manager over a flat inventory with default configuration.
pub fn manager(hosts: &[&str], runner: Arc<ScriptedRunner>) -> TaskQueueManager {
    manager_with_config(hosts, runner, RunnerConfig::default())
}

pub fn manager_with_config(
    hosts: &[&str],
    runner: Arc<ScriptedRunner>,
    config: RunnerConfig,
) -> TaskQueueManager {
    TaskQueueManager::new(
        config,
        Arc::new(StaticInventory::from_names(hosts.iter().copied())),
        Arc::new(StaticVars::new()),
        runner,
    )
    .expect("manager construction")
}
