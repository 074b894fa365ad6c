//! Host-side handling of device callbacks.
//!
//! A callback names a running task by its token. A successful task feeds
//! the run statistics, spawns its continuation when it covered only part
//! of its chunk, and gives up its inner-buffer attachment; the last
//! attachment of a window with RIGHT/FULL depths turns into the
//! outer-join-only task. An overflowed task is resized and requeued ahead
//! of new work.

use serde::Serialize;

use gpujoin_device::StreamCompletion;

use crate::error::{Error, Result};
use crate::executor::{Executor, TaskOutcome};
use crate::multirels::Detached;
use crate::scheduler::TaskQueue;
use crate::sizing::RunStats;
use crate::task::TaskFactory;

/// Work counters of one join, reported by explain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinCounters {
    pub windows: u64,
    pub tasks: u64,
    pub retries: u64,
    pub outer_join_tasks: u64,
    pub result_chunks: u64,
    pub result_rows: u64,
}

/// Everything a completion may touch.
pub struct CompletionCtx<'a> {
    pub executor: &'a Executor,
    pub factory: &'a TaskFactory,
    pub stats: &'a mut RunStats,
    pub queue: &'a mut TaskQueue,
    pub counters: &'a mut JoinCounters,
}

/// Process one fired callback. Errors are fatal to the query; the failed
/// task has already released its device resources when this returns.
pub fn handle_completion(ctx: &mut CompletionCtx<'_>, done: StreamCompletion) -> Result<()> {
    let Some(mut task) = ctx.queue.take_running(done.token) else {
        return Err(Error::Invariant(format!(
            "callback for unknown task token {}",
            done.token
        )));
    };

    match ctx.executor.finish(&mut task, &done.status)? {
        TaskOutcome::Done {
            chunk,
            outer_nitems,
            processed,
        } => {
            if !task.is_outer_join() {
                ctx.stats.record(processed, &outer_nitems);
            }
            if let Some(next) = ctx.factory.continuation(ctx.stats, &task)? {
                ctx.counters.tasks += 1;
                ctx.queue.push_front(next);
            }
            if let Some(att) = task.take_attachment() {
                if let Detached::KickOuterJoin(att) = att.detach(false) {
                    let oj = ctx.factory.create_outer_join_task(ctx.stats, att)?;
                    ctx.counters.tasks += 1;
                    ctx.counters.outer_join_tasks += 1;
                    ctx.queue.push_pending(oj);
                }
            }
            tracing::debug!(
                task = task.id().get(),
                rows = chunk.nitems(),
                processed,
                "task completed"
            );
            if !chunk.is_empty() {
                ctx.counters.result_chunks += 1;
                ctx.counters.result_rows += chunk.nitems() as u64;
                ctx.queue.push_completed(chunk);
            }
        }
        TaskOutcome::Retry(obs) => {
            ctx.factory.resize_for_retry(ctx.stats, &mut task, obs)?;
            ctx.counters.retries += 1;
            ctx.queue.push_front(task);
        }
    }
    Ok(())
}
