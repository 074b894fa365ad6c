//! Compiled device programs and the kernel calling convention.
//!
//! A [`DeviceProgram`] exposes kernels by entry-point name. A kernel receives
//! a [`LaunchContext`] giving it byte access to the memory of the device it
//! runs on, plus positional [`KernelArg`]s. Kernels report data-dependent
//! outcomes (such as a full result buffer) through the buffers they write;
//! returning `Err` means the device itself faulted.

use std::fmt;
use std::sync::Arc;

use gpujoin_core::id::DeviceId;

use crate::error::{Error, Result};
use crate::memory::DevicePtr;

/// Grid/block geometry of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    pub grid: u32,
    pub block: u32,
}

impl LaunchDims {
    /// Enough blocks of at most `max_block` threads to cover `nitems`.
    pub fn for_items(nitems: usize, max_block: u32) -> Self {
        let max_block = max_block.max(1);
        let block = (nitems.min(max_block as usize) as u32).max(1);
        let grid = nitems.div_ceil(block as usize).max(1);
        Self {
            grid: grid.min(u32::MAX as usize) as u32,
            block,
        }
    }

    pub fn threads(&self) -> u64 {
        self.grid as u64 * self.block as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    /// An absent buffer (a NULL pointer on a real device).
    Null,
    U32(u32),
    U64(u64),
}

impl KernelArg {
    pub fn from_ptr(ptr: Option<DevicePtr>) -> Self {
        ptr.map_or(KernelArg::Null, KernelArg::Ptr)
    }
}

/// Typed access to positional arguments, failing like a bad launch would.
pub trait ArgsExt {
    fn ptr(&self, idx: usize) -> Result<DevicePtr>;
    fn opt_ptr(&self, idx: usize) -> Result<Option<DevicePtr>>;
    fn u32(&self, idx: usize) -> Result<u32>;
    fn u64(&self, idx: usize) -> Result<u64>;
}

impl ArgsExt for [KernelArg] {
    fn ptr(&self, idx: usize) -> Result<DevicePtr> {
        self.opt_ptr(idx)?
            .ok_or_else(|| Error::Launch(format!("argument {idx} is a null pointer")))
    }

    fn opt_ptr(&self, idx: usize) -> Result<Option<DevicePtr>> {
        match self.get(idx) {
            Some(KernelArg::Ptr(p)) => Ok(Some(*p)),
            Some(KernelArg::Null) => Ok(None),
            other => Err(bad_arg(idx, "pointer", other)),
        }
    }

    fn u32(&self, idx: usize) -> Result<u32> {
        match self.get(idx) {
            Some(KernelArg::U32(v)) => Ok(*v),
            other => Err(bad_arg(idx, "u32", other)),
        }
    }

    fn u64(&self, idx: usize) -> Result<u64> {
        match self.get(idx) {
            Some(KernelArg::U64(v)) => Ok(*v),
            Some(KernelArg::U32(v)) => Ok(*v as u64),
            other => Err(bad_arg(idx, "u64", other)),
        }
    }
}

fn bad_arg(idx: usize, want: &str, got: Option<&KernelArg>) -> Error {
    Error::Launch(format!("argument {idx}: expected {want}, got {got:?}"))
}

/// Byte-level view of one device's memory during a launch.
pub trait DeviceMemory {
    fn read(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, ptr: DevicePtr, bytes: &[u8]) -> Result<()>;
    /// Bytes from `ptr` to the end of its allocation.
    fn region_len(&self, ptr: DevicePtr) -> Result<usize>;
}

pub struct LaunchContext<'a> {
    pub device: DeviceId,
    pub dims: LaunchDims,
    memory: &'a mut dyn DeviceMemory,
}

impl<'a> LaunchContext<'a> {
    pub fn new(device: DeviceId, dims: LaunchDims, memory: &'a mut dyn DeviceMemory) -> Self {
        Self {
            device,
            dims,
            memory,
        }
    }

    pub fn read(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        self.check_device(ptr)?;
        self.memory.read(ptr, len)
    }

    /// Everything from `ptr` to the end of its allocation.
    pub fn read_region(&self, ptr: DevicePtr) -> Result<Vec<u8>> {
        let len = self.region_len(ptr)?;
        self.read(ptr, len)
    }

    pub fn write(&mut self, ptr: DevicePtr, bytes: &[u8]) -> Result<()> {
        self.check_device(ptr)?;
        self.memory.write(ptr, bytes)
    }

    pub fn region_len(&self, ptr: DevicePtr) -> Result<usize> {
        self.check_device(ptr)?;
        self.memory.region_len(ptr)
    }

    fn check_device(&self, ptr: DevicePtr) -> Result<()> {
        if ptr.device != self.device {
            return Err(Error::InvalidPointer(format!(
                "{ptr} is not addressable from device {}",
                self.device.get()
            )));
        }
        Ok(())
    }
}

pub trait KernelImpl: Send + Sync {
    fn run(&self, ctx: &mut LaunchContext<'_>, args: &[KernelArg]) -> Result<()>;
}

/// A resolved entry point of a [`DeviceProgram`].
#[derive(Clone)]
pub struct KernelFunction {
    name: Arc<str>,
    imp: Arc<dyn KernelImpl>,
}

impl KernelFunction {
    pub fn new(name: &str, imp: Arc<dyn KernelImpl>) -> Self {
        Self {
            name: Arc::from(name),
            imp,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, ctx: &mut LaunchContext<'_>, args: &[KernelArg]) -> Result<()> {
        self.imp.run(ctx, args)
    }
}

impl fmt::Debug for KernelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KernelFunction").field(&self.name).finish()
    }
}

pub trait DeviceProgram: Send + Sync {
    /// Stable identity of the compiled program.
    fn fingerprint(&self) -> String;

    fn function(&self, name: &str) -> Option<KernelFunction>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_dims_cover_items() {
        let d = LaunchDims::for_items(1000, 256);
        assert_eq!(d.block, 256);
        assert_eq!(d.grid, 4);
        assert!(d.threads() >= 1000);
        let empty = LaunchDims::for_items(0, 256);
        assert_eq!((empty.grid, empty.block), (1, 1));
    }

    #[test]
    fn test_args_ext() {
        let p = DevicePtr::new(DeviceId::new(0), 3);
        let args = [KernelArg::Ptr(p), KernelArg::Null, KernelArg::U32(9)];
        assert_eq!(args.ptr(0).expect("ptr"), p);
        assert_eq!(args.opt_ptr(1).expect("null"), None);
        assert!(args.ptr(1).is_err());
        assert_eq!(args.u32(2).expect("u32"), 9);
        assert_eq!(args.u64(2).expect("widened"), 9);
        assert!(args.u32(3).is_err());
    }
}
