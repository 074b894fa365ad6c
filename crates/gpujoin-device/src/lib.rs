#![forbid(unsafe_code)]
//! gpujoin-device: the boundary between the join executor and an accelerator.
//!
//! The executor only talks to [`GpuRuntime`]: device memory, streams, events,
//! asynchronous copies, kernel launches and completion callbacks. Kernels are
//! looked up by name from a [`DeviceProgram`]. [`SimRuntime`] implements the
//! runtime on the host; stream operations run when the runtime is polled, so
//! completion order and resource exhaustion behave like a real device queue.

pub mod error;
pub mod memory;
pub mod program;
pub mod runtime;
pub mod sim;

pub use error::{Error, Result};
pub use memory::{DevicePtr, PinnedBuffer};
pub use program::{
    ArgsExt, DeviceMemory, DeviceProgram, KernelArg, KernelFunction, KernelImpl, LaunchContext, LaunchDims,
};
pub use runtime::{GpuRuntime, StreamCompletion, StreamStatus};
pub use sim::{SimDeviceConfig, SimRuntime};
