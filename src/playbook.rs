//! Play, block and task definitions.
//!
//! Plays are produced by an external parser and are read-only to the engine:
//! a working copy is compiled once at run start (tag pruning plus task
//! sequence numbering) and never mutated afterwards, so concurrent plays can
//! never alias mutable state.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// An atomic unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task name. Empty for anonymous tasks and anonymous listeners.
    #[serde(default)]
    pub name: String,

    /// Action (module) to invoke.
    pub action: String,

    /// Arguments passed to the action, opaque to the engine.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, serde_json::Value>,

    /// Handler names or listen topics to notify when this task succeeds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,

    /// Topics this task answers to when used as a handler.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,

    /// Tags for filtering.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Record a failure but keep the host going.
    #[serde(default)]
    pub ignore_errors: bool,

    /// Unique identity, generated at parse time.
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,

    /// Position in the compiled depth-first task order. Assigned by
    /// [`Play::compile`]; used by the linear strategy to keep hosts in
    /// lock-step.
    #[serde(skip)]
    pub seq: usize,
}

impl Task {
    /// Creates a task with the given name and action.
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            args: IndexMap::new(),
            notify: Vec::new(),
            listen: Vec::new(),
            tags: Vec::new(),
            ignore_errors: false,
            uuid: Uuid::new_v4(),
            seq: 0,
        }
    }

    /// Creates a `meta` control-flow pseudo-task (`noop`, `flush_handlers`,
    /// `end_play`).
    pub fn meta(directive: impl Into<String>) -> Self {
        let directive = directive.into();
        let mut task = Self::new("", "meta");
        task.args
            .insert("free_form".to_string(), serde_json::Value::String(directive));
        task
    }

    /// Adds an argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Adds a notification target.
    pub fn notify(mut self, name: impl Into<String>) -> Self {
        self.notify.push(name.into());
        self
    }

    /// Adds a listen topic (handler use).
    pub fn listen(mut self, topic: impl Into<String>) -> Self {
        self.listen.push(topic.into());
        self
    }

    /// Adds a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Marks failures of this task as non-terminal for the host.
    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// True for `meta` control-flow pseudo-tasks, which are interpreted by
    /// the strategy and never dispatched or listed.
    pub fn is_meta(&self) -> bool {
        self.action == "meta"
    }

    /// The directive of a `meta` task, if this is one.
    pub fn meta_directive(&self) -> Option<&str> {
        if !self.is_meta() {
            return None;
        }
        self.args.get("free_form").and_then(|v| v.as_str())
    }

    /// Display name: the task name, falling back to the action.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.action
        } else {
            &self.name
        }
    }
}

/// A task or a nested block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockEntry {
    /// A leaf task. Tried first: every field of a block is optional, so a
    /// block variant would swallow task mappings otherwise.
    Task(Task),
    /// A nested block.
    Block(Block),
}

/// A grouping of tasks with structured error handling.
///
/// `block` runs first; on failure the cursor jumps into `rescue`; `always`
/// runs regardless of the outcome of either.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Block {
    /// Optional block name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Main entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block: Vec<BlockEntry>,

    /// Entries run when a main entry fails.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rescue: Vec<BlockEntry>,

    /// Entries run regardless of prior failure within this block.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub always: Vec<BlockEntry>,

    /// Tags applied to every entry in the block.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Block {
    /// Creates an empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a block holding the given main tasks.
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            block: tasks.into_iter().map(BlockEntry::Task).collect(),
            ..Self::default()
        }
    }

    /// Appends a main task.
    pub fn task(mut self, task: Task) -> Self {
        self.block.push(BlockEntry::Task(task));
        self
    }

    /// Appends a nested main block.
    pub fn nested(mut self, block: Block) -> Self {
        self.block.push(BlockEntry::Block(block));
        self
    }

    /// Appends a rescue task.
    pub fn rescue_task(mut self, task: Task) -> Self {
        self.rescue.push(BlockEntry::Task(task));
        self
    }

    /// Appends an always task.
    pub fn always_task(mut self, task: Task) -> Self {
        self.always.push(BlockEntry::Task(task));
        self
    }

    /// Depth-first task leaves of every section, `meta` tasks excluded.
    ///
    /// This is the flattening used to build the handler registry.
    pub fn flatten_tasks(&self) -> Vec<&Task> {
        fn walk<'a>(entries: &'a [BlockEntry], out: &mut Vec<&'a Task>) {
            for entry in entries {
                match entry {
                    BlockEntry::Task(t) => {
                        if !t.is_meta() {
                            out.push(t);
                        }
                    }
                    BlockEntry::Block(b) => {
                        walk(&b.block, out);
                        walk(&b.rescue, out);
                        walk(&b.always, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.block, &mut out);
        walk(&self.rescue, &mut out);
        walk(&self.always, &mut out);
        out
    }

    fn prune(&self, filter: &TagFilter, inherited: &[String]) -> Option<Block> {
        let mut effective = inherited.to_vec();
        effective.extend(self.tags.iter().cloned());

        let prune_entries = |entries: &[BlockEntry]| -> Vec<BlockEntry> {
            entries
                .iter()
                .filter_map(|entry| match entry {
                    BlockEntry::Task(t) => {
                        let mut tags = effective.clone();
                        tags.extend(t.tags.iter().cloned());
                        filter.matches(&tags).then(|| BlockEntry::Task(t.clone()))
                    }
                    BlockEntry::Block(b) => b.prune(filter, &effective).map(BlockEntry::Block),
                })
                .collect()
        };

        let pruned = Block {
            name: self.name.clone(),
            block: prune_entries(&self.block),
            rescue: prune_entries(&self.rescue),
            always: prune_entries(&self.always),
            tags: self.tags.clone(),
        };

        if pruned.block.is_empty() && pruned.rescue.is_empty() && pruned.always.is_empty() {
            None
        } else {
            Some(pruned)
        }
    }

    pub(crate) fn number_tasks(&mut self, next: &mut usize) {
        fn walk(entries: &mut [BlockEntry], next: &mut usize) {
            for entry in entries {
                match entry {
                    BlockEntry::Task(t) => {
                        t.seq = *next;
                        *next += 1;
                    }
                    BlockEntry::Block(b) => b.number_tasks(next),
                }
            }
        }
        walk(&mut self.block, next);
        walk(&mut self.rescue, next);
        walk(&mut self.always, next);
    }
}

/// Tag filter applied as a pre-pass before iteration.
///
/// `always`-tagged tasks run unless explicitly skipped; `never`-tagged tasks
/// only run when explicitly requested.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    /// Tags to run; empty means everything.
    pub tags: Vec<String>,
    /// Tags to skip, applied after `tags`.
    pub skip_tags: Vec<String>,
}

impl TagFilter {
    /// A filter that keeps every task.
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether a task carrying `task_tags` survives the filter.
    pub fn matches(&self, task_tags: &[String]) -> bool {
        let has = |t: &str| task_tags.iter().any(|x| x == t);

        if self.skip_tags.iter().any(|t| has(t)) {
            return false;
        }
        if has("always") {
            return true;
        }
        if has("never") {
            return self.tags.iter().any(|t| has(t));
        }
        if self.tags.is_empty() {
            return true;
        }
        self.tags.iter().any(|t| has(t))
    }
}

/// Serial batch specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Serial {
    /// Fixed batch size.
    Fixed(usize),
    /// Percentage of the total host count, e.g. `"30%"`.
    Percentage(String),
    /// Progressive batch sizes; the last entry repeats for the remainder.
    Progressive(Vec<Serial>),
}

/// Resolves one serial element against the total host count.
///
/// Percentages round to the nearest whole host (ties to even), never
/// below one.
pub fn pct_to_int(item: &Serial, num_hosts: usize) -> Result<usize> {
    match item {
        Serial::Fixed(n) => {
            if *n == 0 {
                return Err(Error::InvalidSerial("batch size must be positive".into()));
            }
            Ok(*n)
        }
        Serial::Percentage(s) => {
            let raw = s.trim().trim_end_matches('%');
            let pct: f64 = raw
                .parse()
                .map_err(|_| Error::InvalidSerial(format!("not a percentage: '{s}'")))?;
            if pct <= 0.0 {
                return Err(Error::InvalidSerial(format!(
                    "percentage must be positive: '{s}'"
                )));
            }
            let exact = num_hosts as f64 * pct / 100.0;
            // banker's rounding: half-host ties go to the even size
            let size = if (exact.fract() - 0.5).abs() < f64::EPSILON {
                let floor = exact.floor() as usize;
                if floor % 2 == 0 {
                    floor
                } else {
                    floor + 1
                }
            } else {
                exact.round() as usize
            };
            Ok(size.max(1))
        }
        Serial::Progressive(_) => Err(Error::InvalidSerial(
            "nested serial lists are not supported".into(),
        )),
    }
}

/// A named set of blocks and handlers targeted at a host pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Play {
    /// Play name.
    #[serde(default)]
    pub name: String,

    /// Host pattern resolved by the inventory collaborator.
    pub hosts: String,

    /// Ordered task blocks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,

    /// Play-level handler blocks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<Block>,

    /// Role-contributed handler blocks, concatenated before the play's own
    /// handlers so same-named play handlers win by declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_handlers: Vec<Block>,

    /// Serial rollout specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<Serial>,

    /// Scheduling policy name; the runner default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Abort the whole play on the first unabsorbed host failure.
    #[serde(default)]
    pub any_errors_fatal: bool,

    /// Flush notified handlers even for a batch with failed hosts.
    #[serde(default)]
    pub force_handlers: bool,
}

impl Play {
    /// Creates a play with the given name and host pattern.
    pub fn new(name: impl Into<String>, hosts: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: hosts.into(),
            blocks: Vec::new(),
            handlers: Vec::new(),
            role_handlers: Vec::new(),
            serial: None,
            strategy: None,
            any_errors_fatal: false,
            force_handlers: false,
        }
    }

    /// Parses a play from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let play: Play = serde_yaml::from_str(yaml)?;
        play.validate()?;
        Ok(play)
    }

    /// Appends a block.
    pub fn block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    /// Appends a single-task block. Convenience for flat plays.
    pub fn task(mut self, task: Task) -> Self {
        self.blocks.push(Block::with_tasks(vec![task]));
        self
    }

    /// Appends a play-level handler.
    pub fn handler(mut self, task: Task) -> Self {
        self.handlers.push(Block::with_tasks(vec![task]));
        self
    }

    /// Validates the play structure.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::PlayValidation("play must specify hosts".into()));
        }
        for block in self.role_handlers.iter().chain(&self.handlers) {
            for handler in block.flatten_tasks() {
                if handler.name.is_empty() && handler.listen.is_empty() {
                    return Err(Error::PlayValidation(
                        "handler must have a name or a listen topic".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Produces the working copy iterated at run start: tag-pruned and with
    /// sequence numbers assigned in depth-first order.
    pub fn compile(&self, filter: &TagFilter) -> Play {
        let mut compiled = self.clone();
        compiled.blocks = self
            .blocks
            .iter()
            .filter_map(|b| b.prune(filter, &[]))
            .collect();
        let mut next = 0usize;
        for block in &mut compiled.blocks {
            block.number_tasks(&mut next);
        }
        compiled
    }

    /// Handler tasks in declared order: role handlers first, then the
    /// play's own, each block flattened depth-first.
    pub fn compiled_handlers(&self) -> Vec<&Task> {
        self.role_handlers
            .iter()
            .chain(&self.handlers)
            .flat_map(|b| b.flatten_tasks())
            .collect()
    }

    /// Resolves the serial spec into concrete batch sizes for `num_hosts`.
    ///
    /// With no serial spec the whole host set is a single batch. A list spec
    /// is consumed in order and its last element repeats until every host is
    /// covered; the final batch is truncated to the remainder.
    pub fn resolve_batch_sizes(&self, num_hosts: usize) -> Result<Vec<usize>> {
        if num_hosts == 0 {
            return Ok(Vec::new());
        }
        let items: Vec<Serial> = match &self.serial {
            None => return Ok(vec![num_hosts]),
            Some(Serial::Progressive(items)) => {
                if items.is_empty() {
                    return Ok(vec![num_hosts]);
                }
                items.clone()
            }
            Some(single) => vec![single.clone()],
        };

        let mut sizes = Vec::new();
        let mut remaining = num_hosts;
        let mut idx = 0;
        while remaining > 0 {
            // past the end of the list, the last element repeats
            let item = &items[idx.min(items.len() - 1)];
            let size = pct_to_int(item, num_hosts)?.min(remaining);
            sizes.push(size);
            remaining -= size;
            idx += 1;
        }
        Ok(sizes)
    }

    /// The largest single batch the serial spec can produce, used when
    /// sizing the worker pool. Zero when no serial spec is set.
    pub fn max_serial(&self, num_hosts: usize) -> Result<usize> {
        Ok(self
            .resolve_batch_sizes(num_hosts)?
            .into_iter()
            .max()
            .unwrap_or(0)
            * usize::from(self.serial.is_some()))
    }

    /// The strategy this play asks for, if any.
    pub fn strategy_name(&self) -> Option<&str> {
        self.strategy.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serial_mixed_integer_and_percentage() {
        let mut play = Play::new("rollout", "all");
        play.serial = Some(Serial::Progressive(vec![
            Serial::Fixed(2),
            Serial::Percentage("50%".into()),
        ]));
        // 10 hosts: 2, then 50% = 5, then the repeated 50% capped at 3
        assert_eq!(play.resolve_batch_sizes(10).unwrap(), vec![2, 5, 3]);
    }

    #[test]
    fn serial_percentage_rounds_to_nearest_with_floor_of_one() {
        assert_eq!(pct_to_int(&Serial::Percentage("26%".into()), 10).unwrap(), 3);
        assert_eq!(pct_to_int(&Serial::Percentage("1%".into()), 10).unwrap(), 1);
    }

    #[test]
    fn serial_percentage_ties_round_to_even() {
        // 2.5 hosts rounds down to 2, 3.5 rounds up to 4
        assert_eq!(pct_to_int(&Serial::Percentage("25%".into()), 10).unwrap(), 2);
        assert_eq!(pct_to_int(&Serial::Percentage("35%".into()), 10).unwrap(), 4);
    }

    #[test]
    fn serial_zero_is_rejected() {
        assert!(pct_to_int(&Serial::Fixed(0), 10).is_err());
    }

    #[test]
    fn no_serial_is_one_batch() {
        let play = Play::new("plain", "all");
        assert_eq!(play.resolve_batch_sizes(7).unwrap(), vec![7]);
        assert_eq!(play.max_serial(7).unwrap(), 0);
    }

    #[test]
    fn compile_assigns_depth_first_sequence_numbers() {
        let play = Play::new("seq", "all").block(
            Block::new()
                .task(Task::new("t0", "ping"))
                .nested(Block::new().task(Task::new("t1", "ping")))
                .rescue_task(Task::new("r0", "ping"))
                .always_task(Task::new("a0", "ping")),
        );
        let compiled = play.compile(&TagFilter::all());
        let block = &compiled.blocks[0];
        let seq_of = |entry: &BlockEntry| match entry {
            BlockEntry::Task(t) => t.seq,
            BlockEntry::Block(b) => match &b.block[0] {
                BlockEntry::Task(t) => t.seq,
                _ => unreachable!(),
            },
        };
        assert_eq!(seq_of(&block.block[0]), 0);
        assert_eq!(seq_of(&block.block[1]), 1);
        assert_eq!(seq_of(&block.rescue[0]), 2);
        assert_eq!(seq_of(&block.always[0]), 3);
    }

    #[test]
    fn tag_filter_prunes_tasks_and_empty_blocks() {
        let play = Play::new("tagged", "all")
            .block(Block::with_tasks(vec![
                Task::new("keep", "ping").tag("web"),
                Task::new("drop", "ping").tag("db"),
            ]))
            .block(Block::with_tasks(vec![Task::new("gone", "ping").tag("db")]));
        let filter = TagFilter {
            tags: vec!["web".into()],
            skip_tags: vec![],
        };
        let compiled = play.compile(&filter);
        assert_eq!(compiled.blocks.len(), 1);
        assert_eq!(compiled.blocks[0].flatten_tasks().len(), 1);
    }

    #[test]
    fn always_tag_survives_any_selection() {
        let filter = TagFilter {
            tags: vec!["other".into()],
            skip_tags: vec![],
        };
        assert!(filter.matches(&["always".to_string()]));
        assert!(!filter.matches(&["never".to_string()]));
    }

    #[test]
    fn meta_tasks_are_excluded_from_flattening() {
        let block = Block::new()
            .task(Task::meta("flush_handlers"))
            .task(Task::new("real", "ping"));
        assert_eq!(block.flatten_tasks().len(), 1);
    }

    #[test]
    fn anonymous_handler_without_listen_is_invalid() {
        let play = Play::new("bad", "all").handler(Task::new("", "service"));
        assert!(play.validate().is_err());
    }

    #[test]
    fn parses_play_from_yaml() {
        let yaml = r#"
name: web rollout
hosts: web
serial: 2
blocks:
  - block:
      - name: install
        action: package
        notify: [restart web]
handlers:
  - block:
      - name: restart web
        action: service
"#;
        let play = Play::from_yaml(yaml).unwrap();
        assert_eq!(play.name, "web rollout");
        assert!(matches!(play.serial, Some(Serial::Fixed(2))));
        assert_eq!(play.compiled_handlers().len(), 1);
    }
}
