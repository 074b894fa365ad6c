//! Device pointers and host staging buffers.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use gpujoin_core::id::DeviceId;

use crate::error::{Error, Result};

/// Address of a byte inside one device allocation.
///
/// `handle` names the allocation returned by [`crate::GpuRuntime::mem_alloc`];
/// `offset` is relative to its first byte. Only the allocation handle is
/// freed, so sub-pointers derived with [`DevicePtr::add`] never own memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    pub device: DeviceId,
    pub handle: u64,
    pub offset: usize,
}

impl DevicePtr {
    pub const fn new(device: DeviceId, handle: u64) -> Self {
        Self {
            device,
            handle,
            offset: 0,
        }
    }

    pub const fn add(self, bytes: usize) -> Self {
        Self {
            device: self.device,
            handle: self.handle,
            offset: self.offset + bytes,
        }
    }

    /// Pointer to the start of the owning allocation.
    pub const fn base(self) -> Self {
        Self::new(self.device, self.handle)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}:{:#x}+{}", self.device.get(), self.handle, self.offset)
    }
}

/// Host memory that a device-to-host copy lands in.
///
/// The copy completes asynchronously, so the bytes are shared between the
/// issuing task and the runtime; clones refer to the same storage.
#[derive(Clone, Default)]
pub struct PinnedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl PinnedBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Run `f` over the current contents without copying them out.
    pub fn with_bytes<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.lock())
    }

    /// Store `bytes` at `offset`; used by the runtime when a copy lands.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut buf = self.lock();
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                Error::HostBuffer(format!(
                    "copy of {} bytes at offset {offset} overruns a {} byte buffer",
                    bytes.len(),
                    buf.len()
                ))
            })?;
        buf[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_buffer_bounds() {
        let buf = PinnedBuffer::new(8);
        buf.write_at(4, &[1, 2, 3, 4]).expect("fits");
        assert!(buf.write_at(6, &[0; 4]).is_err());
        let shared = buf.clone();
        assert_eq!(shared.to_vec(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_sub_pointer_keeps_handle() {
        let p = DevicePtr::new(DeviceId::new(1), 7).add(16).add(8);
        assert_eq!(p.offset, 24);
        assert_eq!(p.base().offset, 0);
        assert_eq!(p.base().handle, 7);
    }
}
