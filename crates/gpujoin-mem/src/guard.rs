//! MemoryBudget + RAII reservation implementations.
//!
//! Every byte handed out by a [`BudgetPool`] is covered by a [`Reservation`];
//! dropping the reservation returns the bytes (panic-safe). The pool also
//! remembers its high-water mark so explain output and tests can check peaks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gpujoin_core::budget::{BudgetGuard, MemoryBudget};

struct PoolInner {
    capacity: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl PoolInner {
    fn try_acquire(&self, bytes: usize) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_add(bytes);
            if next > self.capacity {
                return false;
            }
            match self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    #[cfg(feature = "tracing")]
                    tracing::trace!(used_bytes = next, capacity = self.capacity, "budget acquire");
                    return true;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Capacity-capped byte budget. Cloning shares the same accounting.
#[derive(Clone)]
pub struct BudgetPool {
    inner: Arc<PoolInner>,
}

impl BudgetPool {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity: capacity_bytes,
                used: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Highest usage observed since creation.
    pub fn peak_bytes(&self) -> usize {
        self.inner.peak.load(Ordering::Relaxed)
    }

    pub fn available_bytes(&self) -> usize {
        self.inner
            .capacity
            .saturating_sub(self.inner.used.load(Ordering::Relaxed))
    }
}

impl std::fmt::Debug for BudgetPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetPool")
            .field("capacity", &self.inner.capacity)
            .field("used", &self.inner.used.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII reservation of `bytes` from a pool.
pub struct Reservation {
    inner: Arc<PoolInner>,
    bytes: usize,
    tag: &'static str,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.inner.release(self.bytes);
            self.bytes = 0;
        }
    }
}

impl BudgetGuard for Reservation {
    fn bytes(&self) -> usize {
        self.bytes
    }
    fn tag(&self) -> &'static str {
        self.tag
    }
}

impl Reservation {
    /// Resize in place. Shrinking always succeeds; growing fails without
    /// side effects when the pool cannot cover the difference.
    pub fn try_resize(&mut self, new_bytes: usize) -> bool {
        if new_bytes <= self.bytes {
            self.inner.release(self.bytes - new_bytes);
            self.bytes = new_bytes;
            return true;
        }
        if self.inner.try_acquire(new_bytes - self.bytes) {
            self.bytes = new_bytes;
            true
        } else {
            false
        }
    }
}

impl MemoryBudget for BudgetPool {
    type Guard = Reservation;

    fn try_acquire(&self, bytes: usize, tag: &'static str) -> Option<Self::Guard> {
        if bytes > 0 && !self.inner.try_acquire(bytes) {
            return None;
        }
        Some(Reservation {
            inner: Arc::clone(&self.inner),
            bytes,
            tag,
        })
    }

    fn capacity_bytes(&self) -> usize {
        self.inner.capacity
    }

    fn used_bytes(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_release_and_peak() {
        let pool = BudgetPool::new(1000);
        let a = pool.try_acquire(600, "a").expect("a");
        assert!(pool.try_acquire(500, "b").is_none());
        let b = pool.try_acquire(400, "b").expect("b");
        assert_eq!(pool.used_bytes(), 1000);
        drop(a);
        drop(b);
        assert_eq!(pool.used_bytes(), 0);
        assert_eq!(pool.peak_bytes(), 1000);
    }

    #[test]
    fn test_resize() {
        let pool = BudgetPool::new(100);
        let mut r = pool.try_acquire(10, "r").expect("r");
        assert!(r.try_resize(100));
        assert!(!r.try_resize(101));
        assert_eq!(r.bytes(), 100);
        assert!(r.try_resize(1));
        assert_eq!(pool.used_bytes(), 1);
    }
}
