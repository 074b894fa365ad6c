//! The device runtime interface the executor is written against.

use std::sync::Arc;

use gpujoin_core::id::{DeviceId, EventId, StreamId};

use crate::error::Result;
use crate::memory::{DevicePtr, PinnedBuffer};
use crate::program::{KernelArg, KernelFunction, LaunchDims};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Ok,
    /// An earlier operation on the stream failed; later work was skipped.
    Failed(String),
}

/// A callback registered with [`GpuRuntime::stream_add_callback`] has fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCompletion {
    pub token: u64,
    pub stream: StreamId,
    pub status: StreamStatus,
}

/// Memory, streams, events and launches of one or more devices.
///
/// Every `*_async` operation and every launch is queued on a stream and runs
/// in stream order. Completion is observed by registering a callback token
/// and collecting it from [`GpuRuntime::poll`].
pub trait GpuRuntime: Send + Sync {
    fn num_devices(&self) -> usize;

    /// Largest single allocation `device` can satisfy.
    fn max_alloc_size(&self, device: DeviceId) -> usize;

    /// `Ok(None)` when the device is out of memory right now.
    fn mem_alloc(&self, device: DeviceId, bytes: usize) -> Result<Option<DevicePtr>>;

    fn mem_free(&self, ptr: DevicePtr) -> Result<()>;

    /// Bytes currently allocated on `device`.
    fn mem_used(&self, device: DeviceId) -> usize;

    /// Synchronous zero fill.
    fn memset_zero(&self, ptr: DevicePtr, len: usize) -> Result<()>;

    /// Synchronous host-to-device copy. Only for memory no queued work
    /// touches.
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Synchronous device-to-host copy of `len` bytes.
    fn memcpy_dtoh(&self, src: DevicePtr, len: usize) -> Result<Vec<u8>>;

    fn create_stream(&self, device: DeviceId) -> Result<StreamId>;

    /// Drops the stream together with any work not yet executed.
    fn destroy_stream(&self, stream: StreamId) -> Result<()>;

    fn create_event(&self, device: DeviceId) -> Result<EventId>;

    fn destroy_event(&self, event: EventId) -> Result<()>;

    fn memcpy_htod_async(&self, dst: DevicePtr, src: Arc<[u8]>, stream: StreamId) -> Result<()>;

    fn memcpy_dtoh_async(
        &self,
        dst: &PinnedBuffer,
        dst_offset: usize,
        src: DevicePtr,
        len: usize,
        stream: StreamId,
    ) -> Result<()>;

    /// Device-to-device copy; `stream` belongs to the destination device.
    fn memcpy_peer_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
        stream: StreamId,
    ) -> Result<()>;

    /// Fails synchronously when the launch itself is rejected.
    fn launch_kernel(
        &self,
        func: &KernelFunction,
        dims: LaunchDims,
        args: Vec<KernelArg>,
        stream: StreamId,
    ) -> Result<()>;

    fn event_record(&self, event: EventId, stream: StreamId) -> Result<()>;

    /// Later work on `stream` waits for the most recent record of `event`
    /// enqueued so far. Waiting on a never-recorded event is a no-op.
    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> Result<()>;

    fn stream_add_callback(&self, stream: StreamId, token: u64) -> Result<()>;

    /// Make progress on queued work and return the callbacks that fired.
    fn poll(&self) -> Result<Vec<StreamCompletion>>;
}
