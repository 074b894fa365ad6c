//! Join tasks and the factory that sizes them.
//!
//! A task covers a contiguous range of one outer chunk (or, for the
//! outer-join-only pass, no source at all) against one multi-relations
//! buffer. Its result buffers are sized by the [`Sizer`] from planner
//! estimates blended with the statistics of completed tasks.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use gpujoin_core::id::{DeviceId, IdGen, TaskId};
use gpujoin_planner::JoinPlan;

use crate::chunk::ColumnarChunk;
use crate::error::{Error, Result};
use crate::executor::Inflight;
use crate::multirels::MrbAttachment;
use crate::sizing::{compute_outer_ntuples_oj, ResultBufferPlan, RetryObservation, RunStats, Sizer};

/// Overflow retries allowed on one range before the query is abandoned.
pub const MAX_NOSPACE_RETRIES: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    Created,
    BuffersAllocated,
    KernelsLaunched,
    AwaitingDevice,
    Completed,
    RetryNoSpace,
    FatalError,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::FatalError)
    }

    fn allows(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Created | RetryNoSpace, BuffersAllocated) => true,
            (BuffersAllocated, KernelsLaunched) => true,
            (KernelsLaunched, AwaitingDevice) => true,
            (AwaitingDevice, Completed | RetryNoSpace) => true,
            (from, FatalError) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "CREATED",
            TaskState::BuffersAllocated => "BUFFERS_ALLOCATED",
            TaskState::KernelsLaunched => "KERNELS_LAUNCHED",
            TaskState::AwaitingDevice => "AWAITING_DEVICE",
            TaskState::Completed => "COMPLETED",
            TaskState::RetryNoSpace => "RETRY_NOSPACE",
            TaskState::FatalError => "FATAL_ERROR",
        };
        f.write_str(s)
    }
}

pub struct JoinTask {
    id: TaskId,
    src: Option<Arc<ColumnarChunk>>,
    oitems_base: usize,
    start_depth: usize,
    sizing: ResultBufferPlan,
    state: TaskState,
    retries: u32,
    device: Option<DeviceId>,
    // Device resources go before the attachment they depend on.
    pub(crate) inflight: Option<Inflight>,
    attachment: Option<MrbAttachment>,
}

impl JoinTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn src(&self) -> Option<&Arc<ColumnarChunk>> {
        self.src.as_ref()
    }

    pub fn is_outer_join(&self) -> bool {
        self.src.is_none()
    }

    pub fn oitems_base(&self) -> usize {
        self.oitems_base
    }

    /// Outer rows this attempt covers; for the outer-join-only pass, the
    /// estimated rows it emits.
    pub fn oitems_nums(&self) -> usize {
        self.sizing.oitems_nums
    }

    /// Source rows handed to the kernels.
    pub fn source_rows(&self) -> usize {
        if self.is_outer_join() {
            0
        } else {
            self.sizing.oitems_nums
        }
    }

    pub fn start_depth(&self) -> usize {
        self.start_depth
    }

    pub fn sizing(&self) -> &ResultBufferPlan {
        &self.sizing
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    pub(crate) fn set_device(&mut self, device: DeviceId) {
        self.device = Some(device);
    }

    pub fn attachment(&self) -> Option<&MrbAttachment> {
        self.attachment.as_ref()
    }

    pub(crate) fn take_attachment(&mut self) -> Option<MrbAttachment> {
        self.attachment.take()
    }

    /// Move to `to`, rejecting transitions the state machine does not have.
    pub fn advance(&mut self, to: TaskState) -> Result<()> {
        if !self.state.allows(to) {
            return Err(Error::Invariant(format!(
                "task {} cannot go from {} to {}",
                self.id, self.state, to
            )));
        }
        tracing::trace!(task = self.id.get(), from = %self.state, to = %to, "task state");
        self.state = to;
        Ok(())
    }
}

impl fmt::Debug for JoinTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinTask")
            .field("id", &self.id)
            .field("outer_join", &self.is_outer_join())
            .field("oitems_base", &self.oitems_base)
            .field("oitems_nums", &self.sizing.oitems_nums)
            .field("start_depth", &self.start_depth)
            .field("state", &self.state)
            .field("retries", &self.retries)
            .finish()
    }
}

/// Creates tasks bound to the current multi-relations buffer.
#[derive(Debug)]
pub struct TaskFactory {
    plan: Arc<JoinPlan>,
    sizer: Sizer,
    ids: IdGen,
}

impl TaskFactory {
    pub fn new(plan: Arc<JoinPlan>, sizer: Sizer) -> Self {
        Self {
            plan,
            sizer,
            ids: IdGen::new(),
        }
    }

    pub fn sizer(&self) -> &Sizer {
        &self.sizer
    }

    fn next_id(&self) -> TaskId {
        TaskId::new(self.ids.next_raw())
    }

    /// A task over every row of `src`, possibly reduced to fit the buffers.
    pub fn create_task(
        &self,
        stats: &RunStats,
        src: Arc<ColumnarChunk>,
        attachment: MrbAttachment,
    ) -> Result<JoinTask> {
        self.create_at(stats, src, 0, attachment)
    }

    fn create_at(
        &self,
        stats: &RunStats,
        src: Arc<ColumnarChunk>,
        base: usize,
        attachment: MrbAttachment,
    ) -> Result<JoinTask> {
        let remaining = src.nitems().saturating_sub(base);
        if remaining == 0 {
            return Err(Error::Invariant(format!(
                "task at row {base} of a {} row chunk",
                src.nitems()
            )));
        }
        let sizing = self.sizer.plan_outer(&self.plan, stats, remaining, None)?;
        let task = JoinTask {
            id: self.next_id(),
            src: Some(src),
            oitems_base: base,
            start_depth: 1,
            sizing,
            state: TaskState::Created,
            retries: 0,
            device: None,
            inflight: None,
            attachment: Some(attachment),
        };
        tracing::debug!(
            task = task.id.get(),
            oitems_base = base,
            oitems_nums = task.sizing.oitems_nums,
            total_items = task.sizing.total_items,
            dst_length = task.sizing.dst_length,
            "join task created"
        );
        Ok(task)
    }

    /// The task for rows of `done`'s chunk it did not cover, if any.
    pub fn continuation(
        &self,
        stats: &RunStats,
        done: &JoinTask,
    ) -> Result<Option<JoinTask>> {
        let Some(src) = done.src.as_ref() else {
            return Ok(None);
        };
        let next = done.oitems_base + done.sizing.oitems_nums;
        if next >= src.nitems() {
            return Ok(None);
        }
        let Some(att) = done.attachment.as_ref() else {
            return Err(Error::Invariant(format!("task {} has no inner buffer", done.id)));
        };
        let attachment = att.mrb().attach();
        self.create_at(stats, Arc::clone(src), next, attachment).map(Some)
    }

    /// The outer-join-only task, sized from the emitted-row estimate.
    pub fn create_outer_join_task(
        &self,
        stats: &RunStats,
        attachment: MrbAttachment,
    ) -> Result<JoinTask> {
        let mrb = attachment.mrb();
        let inner_nitems: Vec<usize> = (1..=mrb.num_rels())
            .map(|d| mrb.chunk(d).map_or(0, |c| c.nitems()))
            .collect();
        let Some(start_depth) = mrb.outer_join_start_depth() else {
            return Err(Error::Invariant(format!(
                "outer-join pass over buffer {} that emits no depth",
                mrb.id().get()
            )));
        };
        let ntuples = compute_outer_ntuples_oj(
            &self.sizer,
            &self.plan,
            stats,
            &inner_nitems,
            mrb.outer_join_emitting(),
        );
        let sizing = self.sizer.plan_outer_join(&self.plan, ntuples, None)?;
        let task = JoinTask {
            id: self.next_id(),
            src: None,
            oitems_base: 0,
            start_depth,
            sizing,
            state: TaskState::Created,
            retries: 0,
            device: None,
            inflight: None,
            attachment: Some(attachment),
        };
        tracing::debug!(
            task = task.id.get(),
            start_depth = task.start_depth,
            ntuples,
            "outer-join task created"
        );
        Ok(task)
    }

    /// Grow `task`'s buffers after an overflow; the range may shrink, in
    /// which case a continuation picks up the rest.
    pub fn resize_for_retry(
        &self,
        stats: &RunStats,
        task: &mut JoinTask,
        obs: RetryObservation,
    ) -> Result<()> {
        if task.retries >= MAX_NOSPACE_RETRIES {
            return Err(Error::Config(format!(
                "task {} still overflowed its result buffers after {} retries",
                task.id, task.retries
            )));
        }
        let prev = task.sizing.clone();
        task.sizing = if task.is_outer_join() {
            self.sizer
                .plan_outer_join(&self.plan, prev.oitems_nums, Some((&prev, &obs)))?
        } else {
            self.sizer
                .plan_outer(&self.plan, stats, prev.oitems_nums, Some((&prev, &obs)))?
        };
        task.retries += 1;
        tracing::debug!(
            task = task.id.get(),
            retries = task.retries,
            total_items = task.sizing.total_items,
            dst_length = task.sizing.dst_length,
            oitems_nums = task.sizing.oitems_nums,
            "result buffers resized after NoSpace"
        );
        Ok(())
    }
}
