#![forbid(unsafe_code)]
//! gpujoin-io: storage backends for the tuple spill and row adapters.
//!
//! - `storage`: [`FsStorage`] and [`MemoryStorage`], both implementing
//!   `gpujoin_mem::Storage`, plus [`build_storage`] to pick one from the
//!   configured spill location.
//! - `readers`: [`CsvSource`], a rewindable `RowSource` over a CSV file.
//! - `writers`: JSONL and CSV sinks for result rows.

pub mod error;
pub mod readers;
pub mod storage;
pub mod writers;

pub use error::{Error, Result};
pub use readers::csv::CsvSource;
pub use storage::{build_storage, FsStorage, MemoryStorage};
pub use writers::csv::CsvWriter;
pub use writers::jsonl::JsonlWriter;
