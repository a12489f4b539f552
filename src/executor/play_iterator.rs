//! Per-host iteration state machine.
//!
//! Each host owns a cursor into the play's block tree: a stack of frames,
//! one per nested block, each tracking the section (`main`/`rescue`/`always`)
//! and position the host is at. The cursor only ever moves forward, except
//! when a task failure jumps it into the enclosing block's rescue section.
//! Failure that no enclosing block absorbs marks the host failed, after
//! which the iterator returns no further tasks for it.
//!
//! Rescue/always control flow is modeled as explicit section transitions on
//! the frame stack rather than unwinding, so the walk is resumable at any
//! point and a single loop drives it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::inventory::Host;
use crate::playbook::{Block, BlockEntry, Play, Task};

/// Where a host currently is in its play run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No task handed out yet.
    NotStarted,
    /// Executing a block's main section.
    InMain,
    /// Executing a rescue section after a main failure.
    InRescue,
    /// Executing an always section.
    InAlways,
    /// Terminal: an unabsorbed task failure.
    Failed,
    /// Terminal: transport never reached the host.
    Unreachable,
    /// Terminal: every block completed.
    Done,
}

impl RunState {
    /// Terminal states stop all further dispatch to the host.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Failed | RunState::Unreachable | RunState::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Main,
    Rescue,
    Always,
}

#[derive(Debug)]
struct Frame {
    block: Block,
    section: Section,
    idx: usize,
    /// A failure this frame could not absorb; carried through `always` and
    /// propagated to the parent when the frame pops.
    pending_failure: bool,
}

impl Frame {
    fn new(block: Block) -> Self {
        Self {
            block,
            section: Section::Main,
            idx: 0,
            pending_failure: false,
        }
    }

    fn entries(&self) -> &[BlockEntry] {
        match self.section {
            Section::Main => &self.block.block,
            Section::Rescue => &self.block.rescue,
            Section::Always => &self.block.always,
        }
    }
}

#[derive(Debug)]
struct HostCursor {
    root_idx: usize,
    frames: Vec<Frame>,
    state: RunState,
}

impl HostCursor {
    fn new() -> Self {
        Self {
            root_idx: 0,
            frames: Vec::new(),
            state: RunState::NotStarted,
        }
    }
}

/// Walks a compiled play's block tree independently for every host.
pub struct PlayIterator {
    blocks: Arc<Vec<Block>>,
    hosts: Vec<Host>,
    cursors: HashMap<Host, HostCursor>,
    next_seq: usize,
}

impl PlayIterator {
    /// Creates an iterator over `play` for the given batch of hosts.
    ///
    /// `play` must be the compiled working copy (sequence numbers assigned).
    pub fn new(play: &Play, hosts: Vec<Host>) -> Self {
        fn max_seq(entries: &[BlockEntry], acc: &mut usize) {
            for entry in entries {
                match entry {
                    BlockEntry::Task(t) => *acc = (*acc).max(t.seq + 1),
                    BlockEntry::Block(b) => {
                        max_seq(&b.block, acc);
                        max_seq(&b.rescue, acc);
                        max_seq(&b.always, acc);
                    }
                }
            }
        }
        let mut next_seq = 0;
        for block in &play.blocks {
            max_seq(&block.block, &mut next_seq);
            max_seq(&block.rescue, &mut next_seq);
            max_seq(&block.always, &mut next_seq);
        }
        let cursors = hosts.iter().map(|h| (h.clone(), HostCursor::new())).collect();
        Self {
            blocks: Arc::new(play.blocks.clone()),
            hosts,
            cursors,
            next_seq,
        }
    }

    /// Hosts this iterator covers, in batch order.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Current state of a host.
    pub fn host_state(&self, host: &Host) -> RunState {
        self.cursors
            .get(host)
            .map_or(RunState::Done, |c| c.state)
    }

    /// Advances the host's cursor and returns its next task, or `None` when
    /// the host is done or in a terminal state.
    pub fn next_task_for_host(&mut self, host: &Host) -> Option<Arc<Task>> {
        let blocks = Arc::clone(&self.blocks);
        let cursor = self.cursors.get_mut(host)?;
        if cursor.state.is_terminal() {
            return None;
        }

        loop {
            let Some(frame) = cursor.frames.last_mut() else {
                // between top-level blocks
                if cursor.root_idx < blocks.len() {
                    let block = blocks[cursor.root_idx].clone();
                    cursor.root_idx += 1;
                    cursor.frames.push(Frame::new(block));
                    continue;
                }
                cursor.state = RunState::Done;
                trace!(host = %host, "host done");
                return None;
            };

            if frame.idx < frame.entries().len() {
                let entry = frame.entries()[frame.idx].clone();
                let section = frame.section;
                frame.idx += 1;
                match entry {
                    BlockEntry::Task(task) => {
                        cursor.state = match section {
                            Section::Main => RunState::InMain,
                            Section::Rescue => RunState::InRescue,
                            Section::Always => RunState::InAlways,
                        };
                        trace!(host = %host, task = task.display_name(), seq = task.seq, "next task");
                        return Some(Arc::new(task));
                    }
                    BlockEntry::Block(nested) => {
                        cursor.frames.push(Frame::new(nested));
                    }
                }
                continue;
            }

            // section exhausted
            match frame.section {
                // no failure seen, rescue is skipped
                Section::Main => {
                    frame.section = Section::Always;
                    frame.idx = 0;
                }
                // rescue ran to completion and absorbed the failure
                Section::Rescue => {
                    frame.pending_failure = false;
                    frame.section = Section::Always;
                    frame.idx = 0;
                }
                Section::Always => {
                    let failed = frame.pending_failure;
                    cursor.frames.pop();
                    if failed {
                        Self::fail_cursor(host, cursor);
                        if cursor.state == RunState::Failed {
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Records a task failure for the host at its current position.
    ///
    /// The cursor jumps into the enclosing block's rescue section if one
    /// exists; otherwise `always` runs and the failure propagates upward.
    /// Returns the host's state after the transition: [`RunState::InRescue`]
    /// means the failure was (tentatively) absorbed, [`RunState::Failed`]
    /// means no block absorbed it.
    pub fn mark_task_failed(&mut self, host: &Host) -> RunState {
        let Some(cursor) = self.cursors.get_mut(host) else {
            return RunState::Done;
        };
        // a Done host can still fail (a handler running after its walk
        // finished); an already failed or unreachable one cannot
        if matches!(cursor.state, RunState::Failed | RunState::Unreachable) {
            return cursor.state;
        }
        Self::fail_cursor(host, cursor);
        cursor.state
    }

    fn fail_cursor(host: &Host, cursor: &mut HostCursor) {
        loop {
            let Some(frame) = cursor.frames.last_mut() else {
                cursor.state = RunState::Failed;
                debug!(host = %host, "host failed, no enclosing rescue");
                return;
            };
            match frame.section {
                Section::Main if !frame.block.rescue.is_empty() => {
                    frame.section = Section::Rescue;
                    frame.idx = 0;
                    cursor.state = RunState::InRescue;
                    debug!(host = %host, "entering rescue");
                    return;
                }
                Section::Main | Section::Rescue => {
                    // with no always section there is nothing left to run in
                    // this block; propagate to the parent right away so the
                    // caller sees the final state
                    if frame.block.always.is_empty() {
                        cursor.frames.pop();
                        continue;
                    }
                    frame.pending_failure = true;
                    frame.section = Section::Always;
                    frame.idx = 0;
                    cursor.state = RunState::InAlways;
                    return;
                }
                // a failure inside always cannot be absorbed here;
                // hand it to the parent frame
                Section::Always => {
                    cursor.frames.pop();
                }
            }
        }
    }

    /// Marks a host terminally failed, bypassing rescue handling. Used to
    /// replay failures carried over from previous plays.
    pub fn mark_host_failed(&mut self, host: &Host) {
        if let Some(cursor) = self.cursors.get_mut(host) {
            cursor.state = RunState::Failed;
            cursor.frames.clear();
        }
    }

    /// Marks a host unreachable at the transport level.
    pub fn mark_host_unreachable(&mut self, host: &Host) {
        if let Some(cursor) = self.cursors.get_mut(host) {
            cursor.state = RunState::Unreachable;
            cursor.frames.clear();
        }
    }

    /// Whether the host is terminally failed.
    pub fn is_failed(&self, host: &Host) -> bool {
        self.host_state(host) == RunState::Failed
    }

    /// Whether further dispatch to the host is allowed.
    pub fn is_active(&self, host: &Host) -> bool {
        !self.host_state(host).is_terminal()
    }

    /// Hosts terminally failed, in batch order.
    pub fn get_failed_hosts(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .filter(|h| self.host_state(h) == RunState::Failed)
            .cloned()
            .collect()
    }

    /// Hosts marked unreachable, in batch order.
    pub fn get_unreachable_hosts(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .filter(|h| self.host_state(h) == RunState::Unreachable)
            .cloned()
            .collect()
    }

    /// Inserts a dynamically included block to run next for one host,
    /// before its current block resumes. Tasks receive fresh sequence
    /// numbers past the static order.
    pub fn add_tasks(&mut self, host: &Host, mut block: Block) {
        block.number_tasks(&mut self.next_seq);
        if let Some(cursor) = self.cursors.get_mut(host) {
            if !cursor.state.is_terminal() {
                cursor.frames.push(Frame::new(block));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::TagFilter;

    fn compiled(play: Play) -> Play {
        play.compile(&TagFilter::all())
    }

    fn names(iterator: &mut PlayIterator, host: &Host) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(task) = iterator.next_task_for_host(host) {
            out.push(task.name.clone());
        }
        out
    }

    #[test]
    fn walks_tasks_in_order_and_finishes_done() {
        let play = compiled(
            Play::new("p", "all")
                .task(Task::new("t1", "ping"))
                .task(Task::new("t2", "ping")),
        );
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);
        assert_eq!(names(&mut it, &host), vec!["t1", "t2"]);
        assert_eq!(it.host_state(&host), RunState::Done);
    }

    #[test]
    fn rescue_runs_after_main_failure_then_always() {
        let play = compiled(Play::new("p", "all").block(
            Block::new()
                .task(Task::new("t1", "ping"))
                .rescue_task(Task::new("r1", "ping"))
                .always_task(Task::new("a1", "ping")),
        ));
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);

        assert_eq!(it.next_task_for_host(&host).unwrap().name, "t1");
        assert_eq!(it.mark_task_failed(&host), RunState::InRescue);
        assert_eq!(it.next_task_for_host(&host).unwrap().name, "r1");
        assert_eq!(it.next_task_for_host(&host).unwrap().name, "a1");
        assert!(it.next_task_for_host(&host).is_none());
        assert_eq!(it.host_state(&host), RunState::Done);
    }

    #[test]
    fn failed_rescue_still_runs_always_then_propagates() {
        let play = compiled(Play::new("p", "all").block(
            Block::new()
                .task(Task::new("t1", "ping"))
                .rescue_task(Task::new("r1", "ping"))
                .always_task(Task::new("a1", "ping")),
        ));
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);

        it.next_task_for_host(&host);
        it.mark_task_failed(&host); // t1 fails -> rescue
        assert_eq!(it.next_task_for_host(&host).unwrap().name, "r1");
        it.mark_task_failed(&host); // rescue fails too
        assert_eq!(it.next_task_for_host(&host).unwrap().name, "a1");
        assert!(it.next_task_for_host(&host).is_none());
        assert_eq!(it.host_state(&host), RunState::Failed);
    }

    #[test]
    fn always_runs_without_failure() {
        let play = compiled(Play::new("p", "all").block(
            Block::new()
                .task(Task::new("t1", "ping"))
                .rescue_task(Task::new("r1", "ping"))
                .always_task(Task::new("a1", "ping")),
        ));
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);
        assert_eq!(names(&mut it, &host), vec!["t1", "a1"]);
    }

    #[test]
    fn failure_without_rescue_or_always_is_terminal() {
        let play = compiled(
            Play::new("p", "all")
                .task(Task::new("t1", "ping"))
                .task(Task::new("t2", "ping")),
        );
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);
        it.next_task_for_host(&host);
        assert_eq!(it.mark_task_failed(&host), RunState::Failed);
        assert!(it.next_task_for_host(&host).is_none());
        assert!(it.is_failed(&host));
        assert_eq!(it.get_failed_hosts(), vec![host]);
    }

    #[test]
    fn inner_failure_escalates_to_outer_rescue() {
        let inner = Block::new().task(Task::new("inner", "ping"));
        let play = compiled(Play::new("p", "all").block(
            Block::new()
                .nested(inner)
                .rescue_task(Task::new("outer-rescue", "ping")),
        ));
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);

        assert_eq!(it.next_task_for_host(&host).unwrap().name, "inner");
        // inner block has no rescue/always; failure propagates straight to
        // the enclosing block, which does
        assert_eq!(it.mark_task_failed(&host), RunState::InRescue);
        assert_eq!(it.next_task_for_host(&host).unwrap().name, "outer-rescue");
        assert!(it.next_task_for_host(&host).is_none());
        assert_eq!(it.host_state(&host), RunState::Done);
    }

    #[test]
    fn rescue_failure_without_always_fails_immediately() {
        let play = compiled(Play::new("p", "all").block(
            Block::new()
                .task(Task::new("t1", "ping"))
                .rescue_task(Task::new("r1", "ping")),
        ));
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);

        it.next_task_for_host(&host);
        it.mark_task_failed(&host); // t1 fails -> rescue
        assert_eq!(it.next_task_for_host(&host).unwrap().name, "r1");
        // no always section to detour through: the failure must surface in
        // this very call, not on a later walk
        assert_eq!(it.mark_task_failed(&host), RunState::Failed);
        assert!(it.next_task_for_host(&host).is_none());
        assert_eq!(it.get_failed_hosts(), vec![host]);
    }

    #[test]
    fn hosts_progress_independently() {
        let play = compiled(
            Play::new("p", "all")
                .task(Task::new("t1", "ping"))
                .task(Task::new("t2", "ping")),
        );
        let (a, b) = (Host::new("a"), Host::new("b"));
        let mut it = PlayIterator::new(&play, vec![a.clone(), b.clone()]);

        it.next_task_for_host(&a);
        it.mark_task_failed(&a);
        assert!(it.next_task_for_host(&a).is_none());
        assert_eq!(names(&mut it, &b), vec!["t1", "t2"]);
    }

    #[test]
    fn unreachable_is_distinct_from_failed() {
        let play = compiled(Play::new("p", "all").task(Task::new("t1", "ping")));
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);
        it.mark_host_unreachable(&host);

        assert!(it.next_task_for_host(&host).is_none());
        assert!(!it.is_failed(&host));
        assert_eq!(it.get_unreachable_hosts(), vec![host]);
        assert!(it.get_failed_hosts().is_empty());
    }

    #[test]
    fn added_block_runs_before_current_resumes() {
        let play = compiled(
            Play::new("p", "all")
                .task(Task::new("t1", "ping"))
                .task(Task::new("t2", "ping")),
        );
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);

        assert_eq!(it.next_task_for_host(&host).unwrap().name, "t1");
        it.add_tasks(&host, Block::with_tasks(vec![Task::new("included", "ping")]));
        assert_eq!(it.next_task_for_host(&host).unwrap().name, "included");
        assert_eq!(it.next_task_for_host(&host).unwrap().name, "t2");
    }

    #[test]
    fn dynamic_tasks_get_sequence_numbers_past_static_order() {
        let play = compiled(Play::new("p", "all").task(Task::new("t1", "ping")));
        let host = Host::new("h1");
        let mut it = PlayIterator::new(&play, vec![host.clone()]);
        it.next_task_for_host(&host);
        it.add_tasks(&host, Block::with_tasks(vec![Task::new("included", "ping")]));
        let included = it.next_task_for_host(&host).unwrap();
        assert_eq!(included.seq, 1);
    }
}
