//! Strongly-typed identifiers used across the engine.
//!
//! Downstream crates (exec, device, mem, etc.) should *not* pass raw integers
//! around as ids; a device index and a task id must never be confused.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(TaskId);
new_id!(MrbId);
new_id!(SpillId);
new_id!(StreamId);
new_id!(EventId);
new_id!(DeviceId);

impl DeviceId {
    /// Slot index of this device in per-device arrays.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn from_index(idx: usize) -> Self {
        Self(idx as u64)
    }
}

/// Identity of one query execution; namespaces spill files of concurrent joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(uuid::Uuid);

impl QueryId {
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Monotonic id source; one per owner (runtime, join state).
#[derive(Debug, Default)]
pub struct IdGen {
    next: std::sync::atomic::AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}
