//! Host-simulated multi-device runtime.
//!
//! Each simulated device owns a [`BudgetPool`] sized to its memory capacity;
//! every allocation is an [`AccountedBuf`] drawn from it, so exhaustion and
//! leaks show up exactly as they would on hardware. Stream operations are
//! queued and only executed by [`GpuRuntime::poll`], which also honours
//! event waits across streams and devices. An operation that fails marks its
//! stream as failed; the remaining work is skipped and callbacks report the
//! failure.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gpujoin_core::budget::MemoryBudget;
use gpujoin_core::id::{DeviceId, EventId, StreamId};
use gpujoin_mem::{AccountedBuf, BudgetPool};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::{DevicePtr, PinnedBuffer};
use crate::program::{DeviceMemory, KernelArg, KernelFunction, LaunchContext, LaunchDims};
use crate::runtime::{GpuRuntime, StreamCompletion, StreamStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    pub num_devices: usize,
    /// Memory capacity of each device (bytes).
    pub memory_per_device: usize,
    /// Largest single allocation (bytes).
    pub max_alloc_size: usize,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            num_devices: 1,
            memory_per_device: 1 << 30,
            max_alloc_size: 256 << 20,
        }
    }
}

impl SimDeviceConfig {
    pub fn with_devices(num_devices: usize) -> Self {
        Self {
            num_devices,
            ..Self::default()
        }
    }
}

enum Op {
    HtoD {
        dst: DevicePtr,
        src: Arc<[u8]>,
    },
    DtoH {
        dst: PinnedBuffer,
        dst_offset: usize,
        src: DevicePtr,
        len: usize,
    },
    Peer {
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
    },
    Launch {
        func: KernelFunction,
        dims: LaunchDims,
        args: Vec<KernelArg>,
    },
    Record {
        event: EventId,
    },
    Wait {
        event: EventId,
        generation: u64,
    },
    Callback {
        token: u64,
    },
}

struct SimDevice {
    pool: BudgetPool,
    allocations: HashMap<u64, AccountedBuf>,
}

struct SimStream {
    device: DeviceId,
    queue: VecDeque<Op>,
    error: Option<String>,
}

#[derive(Default)]
struct SimEvent {
    /// Records enqueued so far.
    enqueued: u64,
    /// Records executed so far.
    completed: u64,
}

#[derive(Default)]
struct Faults {
    failing_allocs: usize,
    failing_launches: HashSet<String>,
    faulting_kernels: HashSet<String>,
}

struct SimState {
    devices: Vec<SimDevice>,
    streams: BTreeMap<StreamId, SimStream>,
    events: HashMap<EventId, SimEvent>,
    next_id: u64,
    faults: Faults,
    launches: HashMap<String, usize>,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn device(&self, id: DeviceId) -> Result<&SimDevice> {
        self.devices
            .get(id.index())
            .ok_or(Error::UnknownDevice(id.index()))
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut SimStream> {
        self.streams.get_mut(&id).ok_or(Error::UnknownStream(id))
    }

    fn enqueue(&mut self, stream: StreamId, op: Op) -> Result<()> {
        self.stream_mut(stream)?.queue.push_back(op);
        Ok(())
    }
}

/// Borrowed view of all simulated device memory.
struct SimMemory<'a> {
    devices: &'a mut [SimDevice],
}

impl SimMemory<'_> {
    fn buf(&self, ptr: DevicePtr) -> Result<&AccountedBuf> {
        self.devices
            .get(ptr.device.index())
            .and_then(|d| d.allocations.get(&ptr.handle))
            .ok_or_else(|| Error::InvalidPointer(ptr.to_string()))
    }
}

impl DeviceMemory for SimMemory<'_> {
    fn read(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        let buf = self.buf(ptr)?;
        let end = ptr
            .offset
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| out_of_bounds(ptr, len, buf.len()))?;
        Ok(buf[ptr.offset..end].to_vec())
    }

    fn write(&mut self, ptr: DevicePtr, bytes: &[u8]) -> Result<()> {
        let buf = self
            .devices
            .get_mut(ptr.device.index())
            .and_then(|d| d.allocations.get_mut(&ptr.handle))
            .ok_or_else(|| Error::InvalidPointer(ptr.to_string()))?;
        let total = buf.len();
        let end = ptr
            .offset
            .checked_add(bytes.len())
            .filter(|end| *end <= total)
            .ok_or_else(|| out_of_bounds(ptr, bytes.len(), total))?;
        buf[ptr.offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn region_len(&self, ptr: DevicePtr) -> Result<usize> {
        let buf = self.buf(ptr)?;
        buf.len()
            .checked_sub(ptr.offset)
            .ok_or_else(|| out_of_bounds(ptr, 0, buf.len()))
    }
}

fn out_of_bounds(ptr: DevicePtr, len: usize, total: usize) -> Error {
    Error::InvalidPointer(format!(
        "{ptr}: access of {len} bytes beyond a {total} byte allocation"
    ))
}

pub struct SimRuntime {
    config: SimDeviceConfig,
    state: Mutex<SimState>,
}

impl SimRuntime {
    pub fn new(config: SimDeviceConfig) -> Self {
        let devices = (0..config.num_devices.max(1))
            .map(|_| SimDevice {
                pool: BudgetPool::new(config.memory_per_device),
                allocations: HashMap::new(),
            })
            .collect();
        Self {
            config,
            state: Mutex::new(SimState {
                devices,
                streams: BTreeMap::new(),
                events: HashMap::new(),
                next_id: 0,
                faults: Faults::default(),
                launches: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &SimDeviceConfig {
        &self.config
    }

    /// The next `n` allocations on any device report exhaustion.
    pub fn fail_next_allocs(&self, n: usize) {
        self.lock().faults.failing_allocs = n;
    }

    /// Launches of `kernel` are rejected synchronously.
    pub fn fail_launches_of(&self, kernel: &str) {
        self.lock().faults.failing_launches.insert(kernel.to_string());
    }

    /// `kernel` faults on the device when its launch executes.
    pub fn fault_kernel(&self, kernel: &str) {
        self.lock().faults.faulting_kernels.insert(kernel.to_string());
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    /// Launches of `kernel` enqueued so far.
    pub fn launch_count(&self, kernel: &str) -> usize {
        self.lock().launches.get(kernel).copied().unwrap_or(0)
    }

    pub fn peak_used(&self, device: DeviceId) -> usize {
        self.lock()
            .device(device)
            .map(|d| d.pool.peak_bytes())
            .unwrap_or(0)
    }

    pub fn live_allocations(&self, device: DeviceId) -> usize {
        self.lock()
            .device(device)
            .map(|d| d.allocations.len())
            .unwrap_or(0)
    }

    pub fn live_streams(&self) -> usize {
        self.lock().streams.len()
    }

    pub fn live_events(&self) -> usize {
        self.lock().events.len()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execute(state: &mut SimState, stream: StreamId, op: Op, out: &mut Vec<StreamCompletion>) {
        let Some(s) = state.streams.get(&stream) else {
            return;
        };
        let device = s.device;
        let failed = s.error.clone();
        match op {
            Op::Callback { token } => {
                out.push(StreamCompletion {
                    token,
                    stream,
                    status: failed.map_or(StreamStatus::Ok, StreamStatus::Failed),
                });
                return;
            }
            Op::Record { event } => {
                if let Some(ev) = state.events.get_mut(&event) {
                    ev.completed += 1;
                }
                return;
            }
            Op::Wait { .. } => return,
            _ if failed.is_some() => return,
            _ => {}
        }
        let faulting = &state.faults.faulting_kernels;
        let mut memory = SimMemory {
            devices: &mut state.devices,
        };
        let result = match op {
            Op::HtoD { dst, src } => memory.write(dst, &src),
            Op::DtoH {
                dst,
                dst_offset,
                src,
                len,
            } => memory
                .read(src, len)
                .and_then(|bytes| dst.write_at(dst_offset, &bytes)),
            Op::Peer { dst, src, len } => memory
                .read(src, len)
                .and_then(|bytes| memory.write(dst, &bytes)),
            Op::Launch { func, dims, args } => {
                tracing::trace!(kernel = func.name(), grid = dims.grid, block = dims.block, %stream, "kernel");
                if faulting.contains(func.name()) {
                    Err(Error::KernelFault {
                        kernel: func.name().to_string(),
                        reason: "injected fault".into(),
                    })
                } else {
                    let mut ctx = LaunchContext::new(device, dims, &mut memory);
                    func.invoke(&mut ctx, &args).map_err(|e| match e {
                        e @ Error::KernelFault { .. } => e,
                        other => Error::KernelFault {
                            kernel: func.name().to_string(),
                            reason: other.to_string(),
                        },
                    })
                }
            }
            Op::Record { .. } | Op::Wait { .. } | Op::Callback { .. } => Ok(()),
        };
        if let Err(e) = result {
            tracing::debug!(%stream, error = %e, "stream failed");
            if let Some(s) = state.streams.get_mut(&stream) {
                s.error = Some(e.to_string());
            }
        }
    }
}

impl GpuRuntime for SimRuntime {
    fn num_devices(&self) -> usize {
        self.lock().devices.len()
    }

    fn max_alloc_size(&self, _device: DeviceId) -> usize {
        self.config.max_alloc_size
    }

    fn mem_alloc(&self, device: DeviceId, bytes: usize) -> Result<Option<DevicePtr>> {
        if bytes > self.config.max_alloc_size {
            return Err(Error::AllocTooLarge {
                requested: bytes,
                max: self.config.max_alloc_size,
            });
        }
        let mut state = self.lock();
        state.device(device)?;
        if state.faults.failing_allocs > 0 {
            state.faults.failing_allocs -= 1;
            return Ok(None);
        }
        let handle = state.next_id();
        let dev = &mut state.devices[device.index()];
        let Some(buf) = AccountedBuf::try_new_zeroed(&dev.pool, bytes, "device") else {
            tracing::debug!(
                device = device.get(),
                bytes,
                used = dev.pool.used_bytes(),
                "device memory exhausted"
            );
            return Ok(None);
        };
        dev.allocations.insert(handle, buf);
        Ok(Some(DevicePtr::new(device, handle)))
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.lock();
        let dev = state
            .devices
            .get_mut(ptr.device.index())
            .ok_or(Error::UnknownDevice(ptr.device.index()))?;
        if ptr.offset != 0 || dev.allocations.remove(&ptr.handle).is_none() {
            return Err(Error::InvalidPointer(format!("free of {ptr}")));
        }
        Ok(())
    }

    fn mem_used(&self, device: DeviceId) -> usize {
        self.lock()
            .device(device)
            .map(|d| d.pool.used_bytes())
            .unwrap_or(0)
    }

    fn memset_zero(&self, ptr: DevicePtr, len: usize) -> Result<()> {
        let mut state = self.lock();
        let mut memory = SimMemory {
            devices: &mut state.devices,
        };
        memory.write(ptr, &vec![0u8; len])
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let mut memory = SimMemory {
            devices: &mut state.devices,
        };
        memory.write(dst, src)
    }

    fn memcpy_dtoh(&self, src: DevicePtr, len: usize) -> Result<Vec<u8>> {
        let mut state = self.lock();
        let memory = SimMemory {
            devices: &mut state.devices,
        };
        memory.read(src, len)
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamId> {
        let mut state = self.lock();
        state.device(device)?;
        let id = StreamId::new(state.next_id());
        state.streams.insert(
            id,
            SimStream {
                device,
                queue: VecDeque::new(),
                error: None,
            },
        );
        Ok(id)
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<()> {
        let mut state = self.lock();
        let s = state
            .streams
            .remove(&stream)
            .ok_or(Error::UnknownStream(stream))?;
        // Records that will never run must not leave waiters blocked.
        for op in s.queue {
            if let Op::Record { event } = op {
                if let Some(ev) = state.events.get_mut(&event) {
                    ev.completed += 1;
                }
            }
        }
        Ok(())
    }

    fn create_event(&self, device: DeviceId) -> Result<EventId> {
        let mut state = self.lock();
        state.device(device)?;
        let id = EventId::new(state.next_id());
        state.events.insert(id, SimEvent::default());
        Ok(id)
    }

    fn destroy_event(&self, event: EventId) -> Result<()> {
        self.lock()
            .events
            .remove(&event)
            .map(|_| ())
            .ok_or(Error::UnknownEvent(event))
    }

    fn memcpy_htod_async(&self, dst: DevicePtr, src: Arc<[u8]>, stream: StreamId) -> Result<()> {
        self.lock().enqueue(stream, Op::HtoD { dst, src })
    }

    fn memcpy_dtoh_async(
        &self,
        dst: &PinnedBuffer,
        dst_offset: usize,
        src: DevicePtr,
        len: usize,
        stream: StreamId,
    ) -> Result<()> {
        self.lock().enqueue(
            stream,
            Op::DtoH {
                dst: dst.clone(),
                dst_offset,
                src,
                len,
            },
        )
    }

    fn memcpy_peer_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
        stream: StreamId,
    ) -> Result<()> {
        self.lock().enqueue(stream, Op::Peer { dst, src, len })
    }

    fn launch_kernel(
        &self,
        func: &KernelFunction,
        dims: LaunchDims,
        args: Vec<KernelArg>,
        stream: StreamId,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.faults.failing_launches.contains(func.name()) {
            return Err(Error::Launch(format!("{}: injected launch failure", func.name())));
        }
        state.stream_mut(stream)?;
        *state.launches.entry(func.name().to_string()).or_default() += 1;
        state.enqueue(
            stream,
            Op::Launch {
                func: func.clone(),
                dims,
                args,
            },
        )
    }

    fn event_record(&self, event: EventId, stream: StreamId) -> Result<()> {
        let mut state = self.lock();
        state.stream_mut(stream)?;
        state
            .events
            .get_mut(&event)
            .ok_or(Error::UnknownEvent(event))?
            .enqueued += 1;
        state.enqueue(stream, Op::Record { event })
    }

    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> Result<()> {
        let mut state = self.lock();
        let generation = state
            .events
            .get(&event)
            .ok_or(Error::UnknownEvent(event))?
            .enqueued;
        if generation == 0 {
            state.stream_mut(stream)?;
            return Ok(());
        }
        state.enqueue(stream, Op::Wait { event, generation })
    }

    fn stream_add_callback(&self, stream: StreamId, token: u64) -> Result<()> {
        self.lock().enqueue(stream, Op::Callback { token })
    }

    fn poll(&self) -> Result<Vec<StreamCompletion>> {
        let mut state = self.lock();
        let mut out = Vec::new();
        loop {
            let mut progressed = false;
            let ids: Vec<StreamId> = state.streams.keys().copied().collect();
            for sid in ids {
                loop {
                    let Some(s) = state.streams.get_mut(&sid) else {
                        break;
                    };
                    let Some(op) = s.queue.pop_front() else {
                        break;
                    };
                    if let Op::Wait { event, generation } = op {
                        let ready = state
                            .events
                            .get(&event)
                            .map_or(true, |ev| ev.completed >= generation);
                        if !ready {
                            if let Some(s) = state.streams.get_mut(&sid) {
                                s.queue.push_front(op);
                            }
                            break;
                        }
                    }
                    progressed = true;
                    Self::execute(&mut state, sid, op, &mut out);
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ArgsExt, KernelImpl};

    fn dev(i: u64) -> DeviceId {
        DeviceId::new(i)
    }

    fn small(num_devices: usize) -> SimRuntime {
        SimRuntime::new(SimDeviceConfig {
            num_devices,
            memory_per_device: 1024,
            max_alloc_size: 512,
        })
    }

    /// Adds one to every byte of the region passed as argument 0.
    struct Increment;

    impl KernelImpl for Increment {
        fn run(&self, ctx: &mut LaunchContext<'_>, args: &[KernelArg]) -> Result<()> {
            let ptr = args.ptr(0)?;
            let mut bytes = ctx.read_region(ptr)?;
            for b in bytes.iter_mut() {
                *b += 1;
            }
            ctx.write(ptr, &bytes)
        }
    }

    fn increment() -> KernelFunction {
        KernelFunction::new("increment", Arc::new(Increment))
    }

    #[test]
    fn test_alloc_accounting_and_exhaustion() {
        let rt = small(1);
        let a = rt.mem_alloc(dev(0), 512).expect("alloc").expect("fits");
        let b = rt.mem_alloc(dev(0), 512).expect("alloc").expect("fits");
        assert!(rt.mem_alloc(dev(0), 1).expect("alloc").is_none());
        assert!(matches!(
            rt.mem_alloc(dev(0), 513),
            Err(Error::AllocTooLarge { .. })
        ));
        rt.mem_free(a).expect("free");
        rt.mem_free(b).expect("free");
        assert!(rt.mem_free(b).is_err());
        assert_eq!(rt.mem_used(dev(0)), 0);
        assert_eq!(rt.peak_used(dev(0)), 1024);
    }

    #[test]
    fn test_stream_runs_in_order_on_poll() {
        let rt = small(1);
        let ptr = rt.mem_alloc(dev(0), 4).expect("alloc").expect("fits");
        let s = rt.create_stream(dev(0)).expect("stream");
        let out = PinnedBuffer::new(4);
        rt.memcpy_htod_async(ptr, Arc::from(&[1u8, 2, 3, 4][..]), s)
            .expect("h2d");
        rt.launch_kernel(&increment(), LaunchDims::for_items(4, 32), vec![KernelArg::Ptr(ptr)], s)
            .expect("launch");
        rt.memcpy_dtoh_async(&out, 0, ptr, 4, s).expect("d2h");
        rt.stream_add_callback(s, 42).expect("callback");
        assert_eq!(out.to_vec(), vec![0; 4]);

        let done = rt.poll().expect("poll");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].token, 42);
        assert_eq!(done[0].status, StreamStatus::Ok);
        assert_eq!(out.to_vec(), vec![2, 3, 4, 5]);
        assert_eq!(rt.launch_count("increment"), 1);
    }

    #[test]
    fn test_event_wait_orders_streams() {
        let rt = small(1);
        let ptr = rt.mem_alloc(dev(0), 2).expect("alloc").expect("fits");
        let consumer = rt.create_stream(dev(0)).expect("stream");
        let producer = rt.create_stream(dev(0)).expect("stream");
        let ev = rt.create_event(dev(0)).expect("event");
        // Never recorded: no wait at all.
        rt.stream_wait_event(consumer, ev).expect("wait");

        // Consumer is created first, so it is polled first; the wait must
        // hold it back until the producer's record executes.
        let out = PinnedBuffer::new(2);
        rt.memcpy_htod_async(ptr, Arc::from(&[7u8, 7][..]), producer)
            .expect("h2d");
        rt.event_record(ev, producer).expect("record");
        rt.stream_wait_event(consumer, ev).expect("wait");
        rt.memcpy_dtoh_async(&out, 0, ptr, 2, consumer).expect("d2h");
        rt.stream_add_callback(consumer, 1).expect("callback");

        let done = rt.poll().expect("poll");
        assert_eq!(done.len(), 1);
        assert_eq!(out.to_vec(), vec![7, 7]);
    }

    #[test]
    fn test_kernel_fault_fails_stream() {
        let rt = small(1);
        let ptr = rt.mem_alloc(dev(0), 2).expect("alloc").expect("fits");
        let s = rt.create_stream(dev(0)).expect("stream");
        rt.fault_kernel("increment");
        let out = PinnedBuffer::new(2);
        rt.launch_kernel(&increment(), LaunchDims::for_items(2, 32), vec![KernelArg::Ptr(ptr)], s)
            .expect("launch is accepted");
        rt.memcpy_dtoh_async(&out, 0, ptr, 2, s).expect("d2h");
        rt.stream_add_callback(s, 5).expect("callback");
        let done = rt.poll().expect("poll");
        assert!(matches!(done[0].status, StreamStatus::Failed(_)));
    }

    #[test]
    fn test_launch_failure_is_synchronous() {
        let rt = small(1);
        let s = rt.create_stream(dev(0)).expect("stream");
        rt.fail_launches_of("increment");
        assert!(matches!(
            rt.launch_kernel(&increment(), LaunchDims::for_items(1, 1), vec![KernelArg::Null], s),
            Err(Error::Launch(_))
        ));
        assert_eq!(rt.launch_count("increment"), 0);
    }

    #[test]
    fn test_peer_copy_and_cross_device_access() {
        let rt = small(2);
        let a = rt.mem_alloc(dev(0), 3).expect("alloc").expect("fits");
        let b = rt.mem_alloc(dev(1), 3).expect("alloc").expect("fits");
        let s0 = rt.create_stream(dev(0)).expect("stream");
        let s1 = rt.create_stream(dev(1)).expect("stream");
        rt.memcpy_htod_async(a, Arc::from(&[1u8, 2, 3][..]), s0)
            .expect("h2d");
        rt.poll().expect("poll");
        rt.memcpy_peer_async(b, a, 3, s1).expect("peer");
        // A kernel on device 1 cannot read device 0 memory directly.
        rt.launch_kernel(&increment(), LaunchDims::for_items(3, 32), vec![KernelArg::Ptr(a)], s1)
            .expect("launch");
        rt.stream_add_callback(s1, 9).expect("callback");
        let done = rt.poll().expect("poll");
        assert!(matches!(done[0].status, StreamStatus::Failed(_)));

        let out = PinnedBuffer::new(3);
        let s2 = rt.create_stream(dev(1)).expect("stream");
        rt.memcpy_dtoh_async(&out, 0, b, 3, s2).expect("d2h");
        rt.poll().expect("poll");
        assert_eq!(out.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_synchronous_copies() {
        let rt = small(1);
        let ptr = rt.mem_alloc(dev(0), 4).expect("alloc").expect("fits");
        rt.memset_zero(ptr, 4).expect("zero");
        rt.memcpy_htod(ptr.add(1), &[9, 8]).expect("h2d");
        assert_eq!(rt.memcpy_dtoh(ptr, 4).expect("d2h"), vec![0, 9, 8, 0]);
        assert!(rt.memcpy_dtoh(ptr.add(2), 3).is_err());
        rt.mem_free(ptr).expect("free");
        assert!(rt.memcpy_htod(ptr, &[1]).is_err());
    }

    #[test]
    fn test_destroy_stream_releases_waiters() {
        let rt = small(1);
        let producer = rt.create_stream(dev(0)).expect("stream");
        let consumer = rt.create_stream(dev(0)).expect("stream");
        let ev = rt.create_event(dev(0)).expect("event");
        rt.event_record(ev, producer).expect("record");
        rt.stream_wait_event(consumer, ev).expect("wait");
        rt.stream_add_callback(consumer, 3).expect("callback");
        rt.destroy_stream(producer).expect("destroy");
        let done = rt.poll().expect("poll");
        assert_eq!(done.len(), 1);
        assert_eq!(rt.live_streams(), 1);
    }

    #[test]
    fn test_injected_alloc_failures() {
        let rt = small(1);
        rt.fail_next_allocs(1);
        assert!(rt.mem_alloc(dev(0), 8).expect("alloc").is_none());
        assert!(rt.mem_alloc(dev(0), 8).expect("alloc").is_some());
    }
}
