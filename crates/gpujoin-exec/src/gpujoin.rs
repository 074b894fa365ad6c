//! The join node: windows over the inner relations, outer scans, and the
//! pull interface handing out result rows.
//!
//! For every window the outer relation is scanned once. Each outer chunk
//! becomes a task against the window's multi-relations buffer; the join
//! keeps its own attachment on that buffer until the outer scan runs out,
//! so the outer-join-only pass cannot start while normal tasks may still be
//! created.
//!
//! With several windows, RIGHT/FULL match flags are read back from each
//! closed window and handed to the next window over the same chunk; the
//! preloader decides which depths a window's outer-join pass emits.

use std::collections::VecDeque;
use std::sync::Arc;

use gpujoin_core::config::JoinConfig;
use gpujoin_core::id::{DeviceId, IdGen, MrbId, QueryId};
use gpujoin_core::join::JoinType;
use gpujoin_core::source::RowSource;
use gpujoin_core::types::{Row, RowBatch};
use gpujoin_device::{DeviceProgram, GpuRuntime};
use gpujoin_mem::{Codec, SpillManager};
use gpujoin_planner::JoinPlan;

use crate::chunk::ColumnarChunk;
use crate::completion::{handle_completion, CompletionCtx, JoinCounters};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::explain::ExplainReport;
use crate::inner::InnerPreloader;
use crate::kernels::ReferenceProgram;
use crate::metrics::emit_span;
use crate::multirels::{Detached, MrbAttachment, MultiRelsBuffer, OuterJoinCarry};
use crate::scheduler::TaskQueue;
use crate::sizing::{RunStats, Sizer};
use crate::task::{JoinTask, TaskFactory};

/// Consecutive polls without a callback tolerated while tasks are running.
pub const MAX_IDLE_POLLS: u32 = 8;

struct Window {
    mrb: Arc<MultiRelsBuffer>,
    /// The join's own attachment, held until the outer scan is exhausted.
    owner: Option<MrbAttachment>,
    outer_done: bool,
}

enum Phase {
    /// No window is open; the next pull opens the current one.
    Unloaded,
    Active(Window),
    Done,
}

pub struct GpuJoin {
    query_id: QueryId,
    plan: Arc<JoinPlan>,
    config: JoinConfig,
    runtime: Arc<dyn GpuRuntime>,
    executor: Executor,
    factory: TaskFactory,
    outer: Box<dyn RowSource>,
    preloader: InnerPreloader,
    stats: RunStats,
    queue: TaskQueue,
    counters: JoinCounters,
    mrb_ids: IdGen,
    phase: Phase,
    /// Outer rows read but not yet placed in a chunk.
    carry: VecDeque<Row>,
    next_device: usize,
    /// Rows of the chunk being handed out by `next_row`.
    pending_rows: VecDeque<Row>,
    program_fingerprint: String,
}

impl GpuJoin {
    /// Join over the reference kernels compiled from `plan`.
    pub fn new(
        plan: JoinPlan,
        config: JoinConfig,
        runtime: Arc<dyn GpuRuntime>,
        outer: Box<dyn RowSource>,
        inners: Vec<Box<dyn RowSource>>,
    ) -> Result<Self> {
        let plan = Arc::new(plan);
        let program = ReferenceProgram::compile(Arc::clone(&plan))?;
        Self::with_program(plan, config, runtime, &program, outer, inners)
    }

    pub fn with_program(
        plan: Arc<JoinPlan>,
        config: JoinConfig,
        runtime: Arc<dyn GpuRuntime>,
        program: &dyn DeviceProgram,
        outer: Box<dyn RowSource>,
        inners: Vec<Box<dyn RowSource>>,
    ) -> Result<Self> {
        config.validate()?;
        plan.validate(&config)?;
        let ndevs = runtime.num_devices();
        if ndevs == 0 {
            return Err(Error::Config("the device runtime has no devices".into()));
        }
        let max_alloc = (0..ndevs)
            .map(|d| runtime.max_alloc_size(DeviceId::from_index(d)))
            .min()
            .unwrap_or(0);

        let query_id = QueryId::new_random();
        let (storage, root) = gpujoin_io::build_storage(&config.spill_dir)?;
        let codec = [Codec::Zstd, Codec::Lz4]
            .into_iter()
            .find(|c| c.is_available())
            .unwrap_or(Codec::None);
        let spill = Arc::new(SpillManager::new(storage, codec, format!("{root}/{query_id}")));

        let executor = Executor::new(Arc::clone(&runtime), Arc::clone(&plan), program)?;
        let factory = TaskFactory::new(Arc::clone(&plan), Sizer::new(&config, max_alloc));
        let preloader = InnerPreloader::new(
            &plan,
            inners,
            max_alloc,
            config.chunk_size,
            config.chunk_size_margin,
            spill,
            config.spill_batch_rows,
        )?;

        tracing::debug!(
            query = %query_id,
            depths = plan.num_rels(),
            devices = ndevs,
            max_alloc,
            program = %program.fingerprint(),
            "gpu join initialized"
        );
        Ok(Self {
            query_id,
            stats: RunStats::new(plan.num_rels()),
            queue: TaskQueue::with_capacity(config.max_async_tasks),
            program_fingerprint: program.fingerprint(),
            plan,
            config,
            runtime,
            executor,
            factory,
            outer,
            preloader,
            counters: JoinCounters::default(),
            mrb_ids: IdGen::new(),
            phase: Phase::Unloaded,
            carry: VecDeque::new(),
            next_device: 0,
            pending_rows: VecDeque::new(),
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn plan(&self) -> &Arc<JoinPlan> {
        &self.plan
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn counters(&self) -> &JoinCounters {
        &self.counters
    }

    pub fn program_fingerprint(&self) -> &str {
        &self.program_fingerprint
    }

    /// Inner chunk cursor of every depth in the open window.
    pub fn window_cursor(&self) -> Vec<usize> {
        self.preloader.window_cursor()
    }

    /// Next result chunk, or `None` once every window is finished.
    ///
    /// Any error aborts the join: every task, attachment and device buffer
    /// is released before it is returned.
    pub fn next_chunk(&mut self) -> Result<Option<ColumnarChunk>> {
        match self.fetch() {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                tracing::warn!(query = %self.query_id, error = %e, "gpu join aborted");
                self.release_all();
                Err(e)
            }
        }
    }

    /// Next result row.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.pending_rows.pop_front() {
                return Ok(Some(row));
            }
            match self.next_chunk()? {
                Some(chunk) => self.pending_rows.extend(chunk.into_rows()),
                None => return Ok(None),
            }
        }
    }

    /// Next result chunk as a columnar batch; only in bulk mode.
    pub fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if !self.config.bulk_exec {
            return Err(Error::Config(
                "bulk result pulls need bulk_exec to be enabled".into(),
            ));
        }
        let names = self.plan.result_names();
        Ok(self.next_chunk()?.map(|c| c.to_batch(&names)))
    }

    /// Restart the join. With `params_changed` the inner relations are read
    /// again; otherwise the loaded chunks are replayed.
    pub fn rescan(&mut self, params_changed: bool) -> Result<()> {
        self.release_all();
        self.outer.rewind()?;
        if params_changed {
            self.preloader.reset()?;
            self.stats = RunStats::new(self.plan.num_rels());
        } else {
            self.preloader.rewind();
        }
        self.phase = Phase::Unloaded;
        tracing::debug!(query = %self.query_id, params_changed, "gpu join rescan");
        Ok(())
    }

    /// Release everything the join holds on the devices.
    pub fn end(&mut self) {
        self.release_all();
        self.phase = Phase::Done;
        emit_span(
            "gpujoin.end",
            &[
                ("query", self.query_id.to_string()),
                ("tasks", self.counters.tasks.to_string()),
                ("retries", self.counters.retries.to_string()),
                ("rows", self.counters.result_rows.to_string()),
            ],
        );
    }

    pub fn explain(&self) -> ExplainReport {
        ExplainReport::build(
            &self.plan,
            self.preloader.depths(),
            &self.stats,
            &self.counters,
            self.preloader.is_loaded().then(|| self.preloader.num_windows()),
        )
    }

    fn release_all(&mut self) {
        for task in self.queue.clear() {
            tracing::debug!(task = task.id().get(), state = %task.state(), "dropping task");
        }
        self.pending_rows.clear();
        self.carry.clear();
        if !matches!(self.phase, Phase::Done) {
            self.phase = Phase::Unloaded;
        }
    }

    fn fetch(&mut self) -> Result<Option<ColumnarChunk>> {
        let mut idle_polls = 0;
        loop {
            if let Some(chunk) = self.queue.pop_completed() {
                return Ok(Some(chunk));
            }
            match &self.phase {
                Phase::Done => return Ok(None),
                Phase::Unloaded => {
                    self.open_window()?;
                    continue;
                }
                Phase::Active(_) => {}
            }

            self.fill_pipeline()?;
            if self.window_finished() {
                self.close_window()?;
                continue;
            }
            if self.queue.num_running() == 0 {
                return Err(Error::Invariant(
                    "no task could be launched and none is running".into(),
                ));
            }

            let completions = self.runtime.poll()?;
            if completions.is_empty() {
                idle_polls += 1;
                if idle_polls >= MAX_IDLE_POLLS {
                    return Err(Error::Invariant(format!(
                        "{} tasks made no progress after {idle_polls} polls",
                        self.queue.num_running()
                    )));
                }
                continue;
            }
            idle_polls = 0;
            let mut ctx = CompletionCtx {
                executor: &self.executor,
                factory: &self.factory,
                stats: &mut self.stats,
                queue: &mut self.queue,
                counters: &mut self.counters,
            };
            for done in completions {
                handle_completion(&mut ctx, done)?;
            }
        }
    }

    fn open_window(&mut self) -> Result<()> {
        if !self.preloader.is_loaded() {
            self.preloader.preload()?;
        }
        let chunks = self.preloader.current_chunks()?;
        let join_types: Vec<JoinType> = self.plan.depths.iter().map(|d| d.join_type).collect();
        let carry = OuterJoinCarry {
            seeds: self.preloader.matched_maps(),
            emit: self.preloader.outer_join_depths(),
            collect: self.plan.has_right_outer() && self.preloader.num_windows() > 1,
        };
        let mrb = MultiRelsBuffer::with_carry(
            MrbId::new(self.mrb_ids.next_raw()),
            Arc::clone(&self.runtime),
            chunks,
            &join_types,
            carry,
        )?;
        let owner = mrb.attach();
        self.counters.windows += 1;
        tracing::debug!(
            query = %self.query_id,
            mrb = mrb.id().get(),
            cursor = ?self.preloader.window_cursor(),
            windows = self.preloader.num_windows(),
            "inner window opened"
        );
        self.phase = Phase::Active(Window {
            mrb,
            owner: Some(owner),
            outer_done: false,
        });
        Ok(())
    }

    fn window_finished(&self) -> bool {
        match &self.phase {
            Phase::Active(w) => w.outer_done && w.owner.is_none() && self.queue.is_idle(),
            _ => false,
        }
    }

    fn close_window(&mut self) -> Result<()> {
        if let Phase::Active(window) = std::mem::replace(&mut self.phase, Phase::Unloaded) {
            for (depth, flags) in window.mrb.take_matched_maps()? {
                self.preloader.store_matched(depth, flags)?;
            }
        }
        if self.preloader.advance_window() {
            self.outer.rewind()?;
            self.carry.clear();
        } else {
            tracing::debug!(
                query = %self.query_id,
                windows = self.counters.windows,
                tasks = self.counters.tasks,
                rows = self.counters.result_rows,
                "gpu join finished"
            );
            self.phase = Phase::Done;
        }
        Ok(())
    }

    /// Launch tasks until every slot is taken or no work is left.
    fn fill_pipeline(&mut self) -> Result<()> {
        while self.queue.has_slot() {
            let mut task = match self.queue.pop_pending() {
                Some(t) => t,
                None => match self.next_outer_task()? {
                    Some(t) => t,
                    None => break,
                },
            };
            if !self.launch_anywhere(&mut task)? {
                if self.queue.num_running() == 0 {
                    return Err(Error::Config(format!(
                        "task {} needs {} result bytes and fits on no device",
                        task.id(),
                        task.sizing().buffer_bytes(self.plan.num_rels())
                    )));
                }
                self.queue.push_front(task);
                break;
            }
            let token = task.id().get();
            if let Err(task) = self.queue.try_push_running(token, task) {
                self.queue.push_front(task);
                break;
            }
        }
        Ok(())
    }

    /// Try every device once, starting after the last one used.
    fn launch_anywhere(&mut self, task: &mut JoinTask) -> Result<bool> {
        let ndevs = self.runtime.num_devices();
        for i in 0..ndevs {
            let device = DeviceId::from_index((self.next_device + i) % ndevs);
            if self.executor.launch(task, device)? {
                self.next_device = (device.index() + 1) % ndevs;
                return Ok(true);
            }
            tracing::debug!(task = task.id().get(), device = device.get(), "device out of memory");
        }
        Ok(false)
    }

    /// A task over the next outer chunk; once the outer scan is exhausted,
    /// the outer-join-only task if this was the last attachment.
    fn next_outer_task(&mut self) -> Result<Option<JoinTask>> {
        let Phase::Active(window) = &mut self.phase else {
            return Ok(None);
        };
        if window.outer_done {
            return Ok(None);
        }
        let Some(owner) = window.owner.as_ref() else {
            return Ok(None);
        };
        let attachment = owner.mrb().attach();
        if let Some(src) = fill_outer_chunk(
            self.outer.as_mut(),
            &mut self.carry,
            self.plan.outer_schema.len(),
            self.config.chunk_size,
            self.config.outer_chunk_rows,
        )? {
            let task = self
                .factory
                .create_task(&self.stats, Arc::new(src), attachment)?;
            self.counters.tasks += 1;
            return Ok(Some(task));
        }
        drop(attachment);

        window.outer_done = true;
        tracing::debug!(mrb = window.mrb.id().get(), "outer scan exhausted for window");
        let Some(owner) = window.owner.take() else {
            return Ok(None);
        };
        match owner.detach(true) {
            Detached::KickOuterJoin(att) => {
                let task = self.factory.create_outer_join_task(&self.stats, att)?;
                self.counters.tasks += 1;
                self.counters.outer_join_tasks += 1;
                Ok(Some(task))
            }
            Detached::StillAttached | Detached::Released => Ok(None),
        }
    }
}

/// Build the next outer chunk from carried rows and the source. A row that
/// does not fit stays in `carry` for the next chunk.
fn fill_outer_chunk(
    outer: &mut dyn RowSource,
    carry: &mut VecDeque<Row>,
    ncols: usize,
    chunk_size: usize,
    max_rows: usize,
) -> Result<Option<ColumnarChunk>> {
    if carry.len() < max_rows {
        carry.extend(outer.next_chunk(max_rows - carry.len())?);
    }
    if carry.is_empty() {
        return Ok(None);
    }
    let mut chunk = ColumnarChunk::new_row(ncols, chunk_size);
    while chunk.nitems() < max_rows {
        let Some(row) = carry.pop_front() else {
            break;
        };
        if let Err(row) = chunk.insert_tuple(row) {
            if chunk.is_empty() {
                return Err(Error::PartitionImpossible {
                    size: ColumnarChunk::tuple_consumption(&row),
                    limit: chunk_size,
                });
            }
            carry.push_front(row);
            break;
        }
    }
    chunk.shrink();
    Ok(Some(chunk))
}

impl Drop for GpuJoin {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for GpuJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuJoin")
            .field("query_id", &self.query_id)
            .field("depths", &self.plan.num_rels())
            .field("queue", &self.queue)
            .field("counters", &self.counters)
            .finish()
    }
}
