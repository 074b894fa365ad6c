//! Byte budgets shared by host spill buffers and simulated device memory.
//!
//! `gpujoin-mem` implements these traits with a pool; the device layer only
//! sees the traits, so a device's capacity and a spill decode buffer are
//! charged the same way.

/// Bytes held against a [`MemoryBudget`]; returned to it on drop.
pub trait BudgetGuard: Send {
    fn bytes(&self) -> usize;

    /// Which consumer holds the bytes, for tracing.
    fn tag(&self) -> &'static str {
        "untagged"
    }
}

pub trait MemoryBudget: Send + Sync + 'static {
    type Guard: BudgetGuard;

    /// Charge `bytes` to the budget. `None` means exhaustion, which the
    /// caller treats as a reason to wait or to fall back to another device.
    fn try_acquire(&self, bytes: usize, tag: &'static str) -> Option<Self::Guard>;

    fn capacity_bytes(&self) -> usize;

    /// Bytes charged right now.
    fn used_bytes(&self) -> usize;
}
