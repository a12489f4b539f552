//! Handler notification registry.
//!
//! Tracks which handlers have been notified and by which hosts, and keeps the
//! reverse `listen`-topic index used for named-listener dispatch. Both maps
//! are rebuilt fresh at the start of every play and mutated only by the
//! single result-consuming loop, so no synchronization is needed.
//!
//! Notification is idempotent: notifying the same handler from the same host
//! any number of times within a batch yields exactly one execution for that
//! host in that batch.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::inventory::Host;
use crate::playbook::{Play, Task};

/// Key a handler is tracked under: its name when it has one, otherwise its
/// generated identity. Two anonymous listeners on the same topic therefore
/// stay distinct and are never merged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey(String);

impl HandlerKey {
    fn for_task(task: &Task) -> Self {
        if task.name.is_empty() {
            Self(task.uuid.to_string())
        } else {
            Self(task.name.clone())
        }
    }

    /// The key as displayed in logs and callbacks.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Per-play registry of handlers, their notifying hosts, and listen topics.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    /// Handlers in declared order with the hosts that notified them.
    notified: IndexMap<HandlerKey, IndexSet<Host>>,
    /// Reverse index: listen topic -> handler keys, in declared order.
    listening: IndexMap<String, Vec<HandlerKey>>,
    /// Handler definitions by key.
    tasks: IndexMap<HandlerKey, Arc<Task>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the registry from a play's flattened handler list.
    ///
    /// Role-contributed handlers come first (the play concatenates them
    /// ahead of its own), so a same-named play handler registered later
    /// replaces the role one while keeping the earlier position.
    pub fn reset(&mut self, play: &Play) {
        self.notified.clear();
        self.listening.clear();
        self.tasks.clear();

        for handler in play.compiled_handlers() {
            let key = HandlerKey::for_task(handler);
            self.notified.entry(key.clone()).or_default();
            self.tasks.insert(key.clone(), Arc::new(handler.clone()));
            for topic in &handler.listen {
                self.listening
                    .entry(topic.clone())
                    .or_default()
                    .push(key.clone());
            }
        }
    }

    /// Handler keys registered under a listen topic, in declared order.
    pub fn listening_handlers_for(&self, topic: &str) -> &[HandlerKey] {
        self.listening.get(topic).map_or(&[], Vec::as_slice)
    }

    /// Records that `host` notified the handler tracked under `key`.
    ///
    /// Unknown keys are ignored; a task may notify a name that simply is not
    /// a handler in this play.
    pub fn notify(&mut self, key: &HandlerKey, host: &Host) -> bool {
        match self.notified.get_mut(key) {
            Some(hosts) => {
                if hosts.insert(host.clone()) {
                    debug!(handler = key.as_str(), host = %host, "handler notified");
                }
                true
            }
            None => false,
        }
    }

    /// Resolves a notification target (handler name or listen topic) to
    /// handler keys and notifies each for `host`. Returns how many handlers
    /// were notified.
    pub fn notify_target(&mut self, target: &str, host: &Host) -> usize {
        let mut keys: Vec<HandlerKey> = Vec::new();
        let direct = HandlerKey(target.to_string());
        if self.notified.contains_key(&direct) {
            keys.push(direct);
        }
        keys.extend(self.listening_handlers_for(target).to_vec());

        let mut count = 0;
        for key in keys {
            if self.notify(&key, host) {
                count += 1;
            }
        }
        count
    }

    /// The handler definition tracked under `key`.
    pub fn handler_task(&self, key: &HandlerKey) -> Option<Arc<Task>> {
        self.tasks.get(key).cloned()
    }

    /// True when at least one handler has a pending notification.
    pub fn has_notifications(&self) -> bool {
        self.notified.values().any(|hosts| !hosts.is_empty())
    }

    /// Drains all pending notifications, in declared handler order.
    pub fn drain_notified(&mut self) -> Vec<(HandlerKey, Vec<Host>)> {
        let mut drained = Vec::new();
        for (key, hosts) in &mut self.notified {
            if !hosts.is_empty() {
                drained.push((key.clone(), hosts.drain(..).collect()));
            }
        }
        drained
    }
}
