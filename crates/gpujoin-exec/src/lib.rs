#![forbid(unsafe_code)]
//! gpujoin-exec: the asynchronous GPU join executor.
//!
//! - `inner`/`histogram`: inner relations loaded into bounded chunks and
//!   the windows over them.
//! - `multirels`: one window's chunks shared by every task, with per-device
//!   leases and the exactly-once outer-join hand-off.
//! - `sizing`/`task`: result buffer sizing from blended selectivity, and
//!   the tasks it shapes.
//! - `executor`/`completion`/`scheduler`: launching, completing, and
//!   retrying tasks.
//! - `gpujoin`: the pull interface; `explain` reports on it.
//! - `kernels`: the reference device program; `sort`: the bitonic sort.

pub mod chunk;
pub mod completion;
pub mod error;
pub mod executor;
pub mod explain;
pub mod gpujoin;
pub mod histogram;
pub mod inner;
pub mod kernels;
pub mod layout;
pub mod metrics;
pub mod multirels;
pub mod scheduler;
pub mod sizing;
pub mod sort;
pub mod task;

pub use chunk::ColumnarChunk;
pub use completion::JoinCounters;
pub use error::{Error, Result};
pub use explain::{DepthExplain, ExplainReport};
pub use gpujoin::GpuJoin;
pub use kernels::ReferenceProgram;
pub use sort::{sort_chunks, SortKey};
