//! GpuJoin: a multi-depth relational join executor for accelerators.
//!
//! This crate only re-exports the workspace members so integration tests and
//! benchmarks can reach them through one path.

pub use gpujoin_core as core;
pub use gpujoin_device as device;
pub use gpujoin_exec as exec;
pub use gpujoin_io as io;
pub use gpujoin_mem as mem;
pub use gpujoin_planner as planner;

pub use gpujoin_exec::{GpuJoin, ReferenceProgram};
