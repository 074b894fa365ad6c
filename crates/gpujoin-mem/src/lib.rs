#![forbid(unsafe_code)]
//! gpujoin-mem: hard memory budgeting, accounted buffers, and spill.
//!
//! This crate provides the concrete implementations of the budget *interfaces*
//! in `gpujoin-core::budget`. The simulated device allocates its memory through
//! a [`BudgetPool`], so device capacity is enforced with the same RAII guards
//! as host memory.
//!
//! No device or object-store IO lives here. The `Storage` trait (in `spill::`)
//! is implemented by `gpujoin-io`.

pub mod error;
pub mod guard;
pub mod pool;
pub mod spill;

pub use guard::{BudgetPool, Reservation};
pub use pool::AccountedBuf;
pub use spill::{Codec, SpillManager, SpillReader, Storage, TupleSpill};
