//! Unsynchronized scheduling.

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::executor::play_iterator::PlayIterator;
use crate::executor::RunCode;
use crate::inventory::Host;

use super::{completion_code, MetaAction, Strategy, StrategyContext};

/// Lets every host advance through its own task list as fast as worker
/// slots allow. No cross-host barrier exists; a host blocked on a slow task
/// never delays the others.
pub struct FreeStrategy;

#[async_trait]
impl Strategy for FreeStrategy {
    fn name(&self) -> &'static str {
        "free"
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
        let mut in_flight: HashSet<Host> = HashSet::new();
        let mut aborted = false;
        let mut ended = false;

        'outer: loop {
            if ctx.is_terminated() {
                debug!("terminate requested, stopping batch");
                aborted = true;
                break;
            }

            if !ended {
                // give every idle host its next task; at most one unit per
                // host is ever in flight
                'fill: for host in &hosts {
                    if in_flight.contains(host) {
                        continue;
                    }
                    while let Some(task) = iterator.next_task_for_host(host) {
                        if task.is_meta() {
                            match ctx.meta_action(&task) {
                                MetaAction::Continue => continue,
                                MetaAction::Flush => {
                                    // the flush consumes results by count, so
                                    // our own in-flight units must land first
                                    while !in_flight.is_empty() {
                                        let unit = ctx.pool.recv().await?;
                                        in_flight.remove(&unit.host);
                                        let processed =
                                            ctx.process_result(iterator, unit).await;
                                        if processed.hard_failed
                                            && ctx.play.any_errors_fatal
                                        {
                                            aborted = true;
                                        }
                                    }
                                    if aborted {
                                        break 'outer;
                                    }
                                    ctx.flush_handlers(iterator).await?;
                                    // hosts idled by the wait need a fresh
                                    // fill pass
                                    continue 'outer;
                                }
                                MetaAction::EndPlay => {
                                    ended = true;
                                    break 'fill;
                                }
                            }
                        }
                        ctx.callbacks.task_start(&task).await;
                        ctx.dispatch(host, task).await?;
                        in_flight.insert(host.clone());
                        break;
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let unit = ctx.pool.recv().await?;
            in_flight.remove(&unit.host);
            let processed = ctx.process_result(iterator, unit).await;
            if processed.hard_failed && ctx.play.any_errors_fatal {
                debug!("host failed with any_errors_fatal, aborting batch");
                aborted = true;
                break;
            }
        }

        // in-flight units are allowed to finish and be recorded
        while !in_flight.is_empty() {
            let unit = ctx.pool.recv().await?;
            in_flight.remove(&unit.host);
            ctx.process_result(iterator, unit).await;
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
