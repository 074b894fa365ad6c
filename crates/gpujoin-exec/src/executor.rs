//! Join task executor: device buffers, kernel sequence, and result pickup.
//!
//! One task owns one device allocation laid out by [`TaskLayout`]: header,
//! the two result-index buffers, the source chunk and the destination
//! chunk. Launching queues every transfer and kernel on a fresh stream and
//! registers a callback; [`Executor::finish`] turns the returned header and
//! destination into a result chunk or a retry request.

use std::sync::Arc;

use gpujoin_core::id::{DeviceId, StreamId};
use gpujoin_core::join::{JoinMethod, ResultFormat};
use gpujoin_device::{
    DevicePtr, DeviceProgram, GpuRuntime, KernelArg, KernelFunction, LaunchDims, PinnedBuffer,
    StreamStatus,
};
use gpujoin_planner::JoinPlan;

use crate::chunk::ColumnarChunk;
use crate::error::{Error, Result};
use crate::kernels::{
    KERNEL_EXEC_HASHJOIN, KERNEL_EXEC_NESTLOOP, KERNEL_OUTER_HASHJOIN, KERNEL_OUTER_NESTLOOP,
    KERNEL_PREPARATION, KERNEL_PROJECTION_ROW, KERNEL_PROJECTION_SLOT,
};
use crate::layout::{
    ChunkFormat, KdsHeader, ResultBuf, TaskHeader, TaskLayout, ERR_CORRUPT, ERR_NOSPACE,
    ERR_SUCCESS, KDS_HEAD_LEN,
};
use crate::multirels::DeviceLease;
use crate::sizing::RetryObservation;
use crate::task::{JoinTask, TaskState};

/// Threads per block of every launch.
pub const MAX_BLOCK_SIZE: u32 = 256;

/// Entry points of the device program, resolved once per query.
#[derive(Debug, Clone)]
pub struct KernelSet {
    preparation: KernelFunction,
    exec_nestloop: KernelFunction,
    exec_hashjoin: KernelFunction,
    outer_nestloop: KernelFunction,
    outer_hashjoin: KernelFunction,
    projection_row: KernelFunction,
    projection_slot: KernelFunction,
}

impl KernelSet {
    pub fn resolve(program: &dyn DeviceProgram) -> Result<Self> {
        let get = |name: &str| {
            program
                .function(name)
                .ok_or_else(|| Error::MissingEntryPoint(name.to_string()))
        };
        Ok(Self {
            preparation: get(KERNEL_PREPARATION)?,
            exec_nestloop: get(KERNEL_EXEC_NESTLOOP)?,
            exec_hashjoin: get(KERNEL_EXEC_HASHJOIN)?,
            outer_nestloop: get(KERNEL_OUTER_NESTLOOP)?,
            outer_hashjoin: get(KERNEL_OUTER_HASHJOIN)?,
            projection_row: get(KERNEL_PROJECTION_ROW)?,
            projection_slot: get(KERNEL_PROJECTION_SLOT)?,
        })
    }

    fn probe(&self, method: JoinMethod) -> &KernelFunction {
        match method {
            JoinMethod::NestLoop => &self.exec_nestloop,
            JoinMethod::Hash => &self.exec_hashjoin,
        }
    }

    fn outer(&self, method: JoinMethod) -> &KernelFunction {
        match method {
            JoinMethod::NestLoop => &self.outer_nestloop,
            JoinMethod::Hash => &self.outer_hashjoin,
        }
    }

    fn projection(&self, format: ResultFormat) -> &KernelFunction {
        match format {
            ResultFormat::Row => &self.projection_row,
            ResultFormat::Slot => &self.projection_slot,
        }
    }
}

/// Device allocation returned to the runtime on drop.
struct DeviceBuffer {
    runtime: Arc<dyn GpuRuntime>,
    ptr: DevicePtr,
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.mem_free(self.ptr) {
            tracing::warn!(ptr = %self.ptr, error = %e, "failed to free task buffer");
        }
    }
}

/// Stream destroyed on drop, discarding work it has not run.
struct StreamGuard {
    runtime: Arc<dyn GpuRuntime>,
    stream: StreamId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.destroy_stream(self.stream) {
            tracing::warn!(stream = %self.stream, error = %e, "failed to destroy stream");
        }
    }
}

/// Device resources of a launched task. Fields drop in order: the stream
/// goes before the memory its queued work refers to.
pub struct Inflight {
    stream: StreamGuard,
    buffer: DeviceBuffer,
    lease: DeviceLease,
    head_out: PinnedBuffer,
    dst_out: PinnedBuffer,
}

/// What a finished attempt produced.
#[derive(Debug)]
pub enum TaskOutcome {
    Done {
        chunk: ColumnarChunk,
        /// Rows surviving each depth, as counted on the device.
        outer_nitems: Vec<u64>,
        /// Outer rows the attempt consumed.
        processed: usize,
    },
    Retry(RetryObservation),
}

pub struct Executor {
    runtime: Arc<dyn GpuRuntime>,
    plan: Arc<JoinPlan>,
    kernels: KernelSet,
}

impl Executor {
    pub fn new(
        runtime: Arc<dyn GpuRuntime>,
        plan: Arc<JoinPlan>,
        program: &dyn DeviceProgram,
    ) -> Result<Self> {
        let kernels = KernelSet::resolve(program)?;
        Ok(Self {
            runtime,
            plan,
            kernels,
        })
    }

    pub fn runtime(&self) -> &Arc<dyn GpuRuntime> {
        &self.runtime
    }

    fn dst_header(&self, task: &JoinTask) -> KdsHeader {
        let sizing = task.sizing();
        let ncols = self.plan.projection.len();
        match sizing.dst_format {
            ResultFormat::Row => KdsHeader::new(ChunkFormat::Row, ncols, sizing.dst_length),
            ResultFormat::Slot => {
                let mut head = KdsHeader::new(ChunkFormat::Slot, ncols, sizing.dst_length);
                head.nrooms = sizing.dst_nrooms.min(u32::MAX as usize) as u32;
                head
            }
        }
    }

    /// Allocate, transfer and queue every kernel of `task` on `device`.
    ///
    /// Returns `Ok(false)` when the device is out of memory right now; the
    /// task is unchanged and may be launched again later.
    pub fn launch(&self, task: &mut JoinTask, device: DeviceId) -> Result<bool> {
        if !matches!(task.state(), TaskState::Created | TaskState::RetryNoSpace) {
            return Err(Error::Invariant(format!(
                "launch of task {} in state {}",
                task.id(),
                task.state()
            )));
        }
        let mrb = match task.attachment() {
            Some(att) => Arc::clone(att.mrb()),
            None => {
                return Err(Error::Invariant(format!(
                    "task {} has no inner buffer",
                    task.id()
                )))
            }
        };
        let Some(lease) = mrb.get_buffer(device)? else {
            return Ok(false);
        };
        let src_image = task.src().map(|c| c.to_image()).transpose()?;
        let num_rels = self.plan.num_rels();
        let sizing = task.sizing().clone();
        let layout = TaskLayout::new(
            num_rels,
            sizing.total_items,
            src_image.as_ref().map(Vec::len),
            sizing.dst_length,
        );
        let Some(ptr) = self.runtime.mem_alloc(device, layout.total_len)? else {
            return Ok(false);
        };
        let buffer = DeviceBuffer {
            runtime: Arc::clone(&self.runtime),
            ptr,
        };
        task.advance(TaskState::BuffersAllocated)?;
        task.set_device(device);

        let stream = StreamGuard {
            runtime: Arc::clone(&self.runtime),
            stream: self.runtime.create_stream(device)?,
        };
        let s = stream.stream;
        lease.send(s)?;

        let total_items = sizing.total_items.min(u32::MAX as usize) as u32;
        let header = TaskHeader {
            kresults_1_offset: layout.kresults_1 as u64,
            kresults_2_offset: layout.kresults_2 as u64,
            kresults_total_items: total_items,
            kresults_max_items: 0,
            num_rels: num_rels as u32,
            start_depth: task.start_depth() as u32,
            errcode: ERR_SUCCESS,
            err_depth: 0,
            outer_nitems: vec![0; num_rels + 1],
        };
        self.runtime
            .memcpy_htod_async(ptr, Arc::from(header.to_bytes()), s)?;
        let empty = ResultBuf::empty(0, total_items).header_bytes();
        self.runtime
            .memcpy_htod_async(ptr.add(layout.kresults_1), Arc::from(empty.to_vec()), s)?;
        self.runtime
            .memcpy_htod_async(ptr.add(layout.kresults_2), Arc::from(empty.to_vec()), s)?;
        if let (Some((off, _)), Some(image)) = (layout.src, src_image) {
            self.runtime
                .memcpy_htod_async(ptr.add(off), Arc::from(image), s)?;
        }
        let dst = ptr.add(layout.dst_offset);
        self.runtime
            .memcpy_htod_async(dst, Arc::from(self.dst_header(task).to_bytes().to_vec()), s)?;
        if task.is_outer_join() {
            lease.colocate(s)?;
        }

        let kmrels = lease.kmrels()?;
        let ojmaps = lease.ojmaps();
        let (base, nums) = match task.src() {
            Some(src) => {
                let base = task.oitems_base();
                (base, task.oitems_nums().min(src.nitems().saturating_sub(base)))
            }
            None => (0, 0),
        };
        let args = |depth: usize| -> Vec<KernelArg> {
            vec![
                KernelArg::Ptr(ptr),
                KernelArg::Ptr(kmrels),
                KernelArg::from_ptr(layout.src.map(|(off, _)| ptr.add(off))),
                KernelArg::U32(depth as u32),
                KernelArg::U32(device.index() as u32),
                KernelArg::from_ptr(ojmaps),
                KernelArg::U64(base as u64),
                KernelArg::U64(nums as u64),
                KernelArg::Ptr(dst),
            ]
        };
        let dims = LaunchDims::for_items(nums.max(task.oitems_nums()), MAX_BLOCK_SIZE);
        let start = task.start_depth();
        for depth in start..=num_rels {
            let dp = self.plan.depth(depth);
            self.enqueue(&self.kernels.preparation, dims, args(depth), s)?;
            if !(task.is_outer_join() && depth == start) {
                self.enqueue(self.kernels.probe(dp.method), dims, args(depth), s)?;
            }
            if task.is_outer_join() && mrb.emits_unmatched(depth) {
                self.enqueue(self.kernels.outer(dp.method), dims, args(depth), s)?;
            }
        }
        self.enqueue(
            self.kernels.projection(sizing.dst_format),
            dims,
            args(num_rels + 1),
            s,
        )?;
        task.advance(TaskState::KernelsLaunched)?;

        let head_out = PinnedBuffer::new(layout.head_len);
        let dst_out = PinnedBuffer::new(layout.dst_len);
        self.runtime
            .memcpy_dtoh_async(&head_out, 0, ptr, layout.head_len, s)?;
        self.runtime
            .memcpy_dtoh_async(&dst_out, 0, dst, layout.dst_len, s)?;
        self.runtime.stream_add_callback(s, task.id().get())?;
        task.advance(TaskState::AwaitingDevice)?;

        tracing::debug!(
            task = task.id().get(),
            device = device.get(),
            bytes = layout.total_len,
            oitems_base = base,
            oitems_nums = nums,
            start_depth = start,
            "task launched"
        );
        task.inflight = Some(Inflight {
            stream,
            buffer,
            lease,
            head_out,
            dst_out,
        });
        Ok(true)
    }

    fn enqueue(
        &self,
        func: &KernelFunction,
        dims: LaunchDims,
        args: Vec<KernelArg>,
        stream: StreamId,
    ) -> Result<()> {
        tracing::trace!(kernel = func.name(), stream = %stream, "launch");
        self.runtime.launch_kernel(func, dims, args, stream)?;
        Ok(())
    }

    /// Read back a task whose callback fired and release its device
    /// resources.
    pub fn finish(&self, task: &mut JoinTask, status: &StreamStatus) -> Result<TaskOutcome> {
        let Some(inflight) = task.inflight.take() else {
            return Err(Error::Invariant(format!(
                "task {} completed without device resources",
                task.id()
            )));
        };
        if let StreamStatus::Failed(reason) = status {
            task.advance(TaskState::FatalError)?;
            return Err(Error::Device(gpujoin_device::Error::KernelFault {
                kernel: format!("join task {}", task.id().get()),
                reason: reason.clone(),
            }));
        }
        let head = TaskHeader::parse(&inflight.head_out.to_vec())?;
        match head.errcode {
            ERR_SUCCESS => {}
            ERR_NOSPACE => {
                let mut obs = RetryObservation {
                    oitems: task.oitems_nums(),
                    max_items: head.kresults_max_items as u64,
                    ..RetryObservation::default()
                };
                if head.err_depth as usize == self.plan.num_rels() + 1 {
                    let dst = inflight
                        .dst_out
                        .with_bytes(|b| KdsHeader::parse(&b[..KDS_HEAD_LEN.min(b.len())]))?;
                    obs.dst_nitems = dst.nitems as u64;
                    obs.dst_usage = dst.usage;
                }
                tracing::debug!(
                    task = task.id().get(),
                    err_depth = head.err_depth,
                    max_items = obs.max_items,
                    dst_nitems = obs.dst_nitems,
                    "task ran out of result space"
                );
                drop(inflight);
                task.advance(TaskState::RetryNoSpace)?;
                return Ok(TaskOutcome::Retry(obs));
            }
            ERR_CORRUPT => {
                task.advance(TaskState::FatalError)?;
                return Err(Error::DataCorruption(format!(
                    "task {} read corrupt data at depth {}",
                    task.id().get(),
                    head.err_depth
                )));
            }
            other => {
                task.advance(TaskState::FatalError)?;
                return Err(Error::DataCorruption(format!(
                    "task {} reported unknown status {other}",
                    task.id().get()
                )));
            }
        }

        let bytes = inflight.dst_out.to_vec();
        let chunk = match self.plan.result_format {
            ResultFormat::Row => ColumnarChunk::from_image(&bytes)?,
            ResultFormat::Slot => self.resolve_slots(task, &bytes)?,
        };
        drop(inflight);
        task.advance(TaskState::Completed)?;
        Ok(TaskOutcome::Done {
            chunk,
            outer_nitems: head.outer_nitems,
            processed: task.source_rows(),
        })
    }

    /// Turn slot references back into values from the source chunk and the
    /// inner chunks of the task's window.
    fn resolve_slots(&self, task: &JoinTask, bytes: &[u8]) -> Result<ColumnarChunk> {
        let columns: Vec<usize> = self.plan.projection.iter().map(|p| p.source.column).collect();
        let mrb = task.attachment().map(|a| Arc::clone(a.mrb()));
        let src = task.src().cloned();
        ColumnarChunk::from_slot_image(bytes, &columns, |depth, rowid, column| {
            let idx = (rowid as usize).checked_sub(1).ok_or_else(|| {
                Error::DataCorruption(format!("slot references row 0 of depth {depth}"))
            })?;
            let row = if depth == 0 {
                src.as_ref().and_then(|c| c.row(idx))
            } else {
                mrb.as_ref().and_then(|m| m.chunk(depth)).and_then(|c| c.row(idx))
            };
            row.and_then(|r| r.get(column))
                .cloned()
                .ok_or_else(|| {
                    Error::DataCorruption(format!(
                        "slot references missing row {rowid} of depth {depth}"
                    ))
                })
        })
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("devices", &self.runtime.num_devices())
            .field("kernels", &self.kernels)
            .finish()
    }
}
