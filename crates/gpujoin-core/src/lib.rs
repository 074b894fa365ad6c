#![forbid(unsafe_code)]
//! gpujoin-core: shared vocabulary of the GpuJoin engine.
//!
//! Everything here is plain data: scalar values and their wire encoding,
//! join descriptors, typed identifiers, configuration, and the key hash used
//! by both the inner preloader and the probe kernels. The device seam lives
//! in `gpujoin-device`; execution lives in `gpujoin-exec`.

pub mod budget;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod join;
pub mod prelude;
pub mod schema;
pub mod source;
pub mod types;
