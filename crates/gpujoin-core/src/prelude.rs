//! Convenient re-exports for downstream crates.

pub use crate::config::JoinConfig;
pub use crate::error::{Error, Result};
pub use crate::id::{DeviceId, EventId, MrbId, SpillId, StreamId, TaskId};
pub use crate::join::{JoinMethod, JoinType, ResultFormat};
pub use crate::schema::{DataType, Field, Schema};
pub use crate::types::{Column, Row, RowBatch, Scalar};
pub use crate::source::{RowSource, VecSource};
