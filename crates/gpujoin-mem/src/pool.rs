//! Zero-initialised byte buffers accounted against a [`BudgetPool`].
//!
//! The simulated device backs each allocation with one of these, so device
//! capacity is enforced by the same RAII accounting as host buffers.

use std::ops::{Deref, DerefMut};

use gpujoin_core::budget::{BudgetGuard, MemoryBudget};

use crate::error::{Error, Result};
use crate::guard::{BudgetPool, Reservation};

/// Owned byte buffer that returns its accounted bytes on drop.
pub struct AccountedBuf {
    _reservation: Reservation,
    buf: Vec<u8>,
}

impl AccountedBuf {
    /// Allocate `len` zeroed bytes, or fail with `BudgetExceeded`.
    pub fn new_zeroed(pool: &BudgetPool, len: usize, tag: &'static str) -> Result<Self> {
        let reservation = pool
            .try_acquire(len, tag)
            .ok_or_else(|| Error::BudgetExceeded {
                tag,
                requested: len,
                capacity: pool.capacity_bytes(),
                used: pool.used_bytes(),
            })?;
        Ok(Self {
            _reservation: reservation,
            buf: vec![0u8; len],
        })
    }

    /// Like [`AccountedBuf::new_zeroed`] but `None` when the pool is full.
    pub fn try_new_zeroed(pool: &BudgetPool, len: usize, tag: &'static str) -> Option<Self> {
        let reservation = pool.try_acquire(len, tag)?;
        Some(Self {
            _reservation: reservation,
            buf: vec![0u8; len],
        })
    }

    pub fn accounted_bytes(&self) -> usize {
        self._reservation.bytes()
    }
}

impl Deref for AccountedBuf {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for AccountedBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}
