//! Per-host aggregate statistics.

use std::collections::HashMap;

use crate::inventory::Host;
use crate::runner::{UnitResult, UnitStatus};

/// Counters for one host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Tasks that completed without change.
    pub ok: u64,
    /// Tasks that completed and changed something.
    pub changed: u64,
    /// Task-logic failures (including ignored ones).
    pub failed: u64,
    /// Transport failures.
    pub unreachable: u64,
    /// Skipped tasks.
    pub skipped: u64,
    /// Failures absorbed by a rescue section.
    pub rescued: u64,
}

/// Aggregated counters across all hosts of a run. Survives play boundaries;
/// one recap covers the whole run.
#[derive(Debug, Clone, Default)]
pub struct AggregateStats {
    per_host: HashMap<Host, HostStats>,
}

impl AggregateStats {
    /// Creates empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, host: &Host) -> &mut HostStats {
        self.per_host.entry(host.clone()).or_default()
    }

    /// Records one unit result for a host.
    pub fn record(&mut self, host: &Host, result: &UnitResult) {
        let stats = self.entry(host);
        match result.status {
            UnitStatus::Ok => {
                if result.changed {
                    stats.changed += 1;
                } else {
                    stats.ok += 1;
                }
            }
            UnitStatus::Failed => stats.failed += 1,
            UnitStatus::Unreachable => stats.unreachable += 1,
            UnitStatus::Skipped => stats.skipped += 1,
        }
    }

    /// Records a failure absorbed by a rescue section.
    pub fn record_rescued(&mut self, host: &Host) {
        self.entry(host).rescued += 1;
    }

    /// Counters for one host.
    pub fn summarize(&self, host: &Host) -> HostStats {
        self.per_host.get(host).copied().unwrap_or_default()
    }

    /// All hosts with recorded activity, sorted by name.
    pub fn hosts(&self) -> Vec<&Host> {
        let mut hosts: Vec<&Host> = self.per_host.keys().collect();
        hosts.sort();
        hosts
    }
}
