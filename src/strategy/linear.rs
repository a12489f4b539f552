//! Lock-step scheduling.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::executor::play_iterator::PlayIterator;
use crate::executor::RunCode;
use crate::inventory::Host;
use crate::playbook::Task;

use super::{completion_code, MetaAction, Strategy, StrategyContext};

/// Runs one task across all active hosts before moving to the next.
///
/// Hosts whose cursors diverge (a rescue jump, a dynamic include) are held
/// back until the rest of the batch catches up to their position in the
/// compiled task order, so no host is ever more than one task ahead.
pub struct LinearStrategy;

#[async_trait]
impl Strategy for LinearStrategy {
    fn name(&self) -> &'static str {
        "linear"
    }

    #[instrument(skip_all, fields(play = %ctx.play.name))]
    async fn run(
        &self,
        iterator: &mut PlayIterator,
        ctx: &mut StrategyContext<'_>,
    ) -> Result<RunCode> {
        let pre_failed: HashSet<Host> = iterator.get_failed_hosts().into_iter().collect();
        let pre_unreachable: HashSet<Host> =
            iterator.get_unreachable_hosts().into_iter().collect();

        let hosts = ctx.hosts.clone();
        // the task each host would run next; refilled as results come back
        let mut pending: HashMap<Host, Arc<Task>> = HashMap::new();
        let mut aborted = false;

        'batch: loop {
            if ctx.is_terminated() {
                debug!("terminate requested, stopping batch");
                aborted = true;
                break;
            }

            for host in &hosts {
                if !pending.contains_key(host) {
                    if let Some(task) = iterator.next_task_for_host(host) {
                        pending.insert(host.clone(), task);
                    }
                }
            }
            if pending.is_empty() {
                break;
            }

            // lock-step: dispatch only the hosts sitting at the earliest
            // position in the compiled order
            let min_seq = pending
                .values()
                .map(|t| t.seq)
                .min()
                .unwrap_or_default();
            let chosen: Vec<Host> = hosts
                .iter()
                .filter(|h| pending.get(*h).is_some_and(|t| t.seq == min_seq))
                .cloned()
                .collect();
            let task = match chosen.first().and_then(|h| pending.get(h)) {
                Some(task) => Arc::clone(task),
                None => break,
            };

            if task.is_meta() {
                for host in &chosen {
                    pending.remove(host);
                }
                match ctx.meta_action(&task) {
                    MetaAction::Continue => continue,
                    // nothing in flight here: the previous step was fully
                    // drained before this iteration
                    MetaAction::Flush => {
                        ctx.flush_handlers(iterator).await?;
                        continue;
                    }
                    MetaAction::EndPlay => break,
                }
            }

            ctx.callbacks.task_start(&task).await;
            for host in &chosen {
                if let Some(task) = pending.remove(host) {
                    ctx.dispatch(host, task).await?;
                }
            }

            let mut outstanding = chosen.len();
            let mut fatal = false;
            while outstanding > 0 {
                let unit = ctx.pool.recv().await?;
                outstanding -= 1;
                let processed = ctx.process_result(iterator, unit).await;
                if processed.hard_failed && ctx.play.any_errors_fatal {
                    fatal = true;
                }
            }
            if fatal {
                debug!("host failed with any_errors_fatal, aborting batch");
                aborted = true;
                break 'batch;
            }
        }

        if !aborted || ctx.play.force_handlers {
            ctx.flush_handlers(iterator).await?;
        }
        Ok(completion_code(
            iterator,
            &pre_failed,
            &pre_unreachable,
            aborted,
        ))
    }
}
