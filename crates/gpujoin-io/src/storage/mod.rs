//! Storage backends implementing `gpujoin_mem::Storage`.
//!
//! - `fs`: local filesystem (default).
//! - `memory`: process-local map, selected with the `memory://` scheme.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use std::sync::Arc;

use gpujoin_mem::Storage;

use crate::error::{Error, Result};

/// Pick a backend for a spill location and return it with the root
/// directory segments should be written under.
///
/// `memory://name` selects [`MemoryStorage`]; `file:///dir` and bare paths
/// select [`FsStorage`].
pub fn build_storage(location: &str) -> Result<(Arc<dyn Storage>, String)> {
    match location.split_once("://") {
        Some(("memory", rest)) => Ok((Arc::new(MemoryStorage::new()), format!("mem/{rest}"))),
        Some(("file", rest)) => Ok((Arc::new(FsStorage::new()), rest.to_string())),
        Some((other, _)) => Err(Error::Config(format!("unsupported spill scheme '{other}'"))),
        None if location.is_empty() => Err(Error::Config("empty spill location".into())),
        None => Ok((Arc::new(FsStorage::new()), location.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_selection() {
        let (_, root) = build_storage("memory://join").unwrap();
        assert_eq!(root, "mem/join");
        let (_, root) = build_storage("file:///tmp/x").unwrap();
        assert_eq!(root, "/tmp/x");
        assert!(matches!(build_storage("s3://bucket"), Err(Error::Config(_))));
    }
}
