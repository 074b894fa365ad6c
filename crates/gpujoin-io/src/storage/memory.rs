//! In-memory storage backend; used for `memory://` spill locations and tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gpujoin_mem::error::{Error as MemError, Result as MemResult};
use gpujoin_mem::Storage;

/// Thread-safe in-memory storage. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.data().contains_key(path)
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Flip one byte of a stored object; lets tests corrupt segments.
    pub fn corrupt(&self, path: &str, offset: usize) -> bool {
        match self.data().get_mut(path).and_then(|b| b.get_mut(offset)) {
            Some(byte) => {
                *byte ^= 0xff;
                true
            }
            None => false,
        }
    }
}

impl Storage for MemoryStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> MemResult<()> {
        self.data().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> MemResult<Vec<u8>> {
        let data = self.data();
        let bytes = data
            .get(path)
            .ok_or_else(|| MemError::Storage(format!("path not found: {path}")))?;
        let start = usize::try_from(offset)
            .map_err(|_| MemError::Storage(format!("offset {offset} out of range")))?;
        bytes
            .get(start..start.saturating_add(len))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                MemError::Storage(format!(
                    "range {start}+{len} exceeds size {} of {path}",
                    bytes.len()
                ))
            })
    }

    fn delete(&self, path: &str) -> MemResult<()> {
        self.data().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> MemResult<Vec<String>> {
        Ok(self
            .data()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn size(&self, path: &str) -> MemResult<u64> {
        self.data()
            .get(path)
            .map(|b| b.len() as u64)
            .ok_or_else(|| MemError::Storage(format!("path not found: {path}")))
    }
}
