use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use gpujoin_mem::error::{Error as MemError, Result as MemResult};
use gpujoin_mem::Storage;

/// Local filesystem storage (rooted at the host filesystem).
#[derive(Debug, Clone, Default)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }
}

fn storage_err(op: &str, path: &str, e: std::io::Error) -> MemError {
    MemError::Storage(format!("{op} {path}: {e}"))
}

impl Storage for FsStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> MemResult<()> {
        let p = Path::new(path);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).map_err(|e| storage_err("mkdir", path, e))?;
        }
        let mut f = File::create(p).map_err(|e| storage_err("create", path, e))?;
        f.write_all(bytes).map_err(|e| storage_err("write", path, e))?;
        f.flush().map_err(|e| storage_err("flush", path, e))
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> MemResult<Vec<u8>> {
        let mut f = File::open(path).map_err(|e| storage_err("open", path, e))?;
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| storage_err("seek", path, e))?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf)
            .map_err(|e| storage_err("read", path, e))?;
        Ok(buf)
    }

    fn delete(&self, path: &str) -> MemResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("delete", path, e)),
        }
    }

    fn list(&self, prefix: &str) -> MemResult<Vec<String>> {
        fn visit(dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    visit(&path, out)?;
                } else if let Some(s) = path.to_str() {
                    out.push(s.to_string());
                }
            }
            Ok(())
        }

        let root = Path::new(prefix);
        let mut out = Vec::new();
        if root.is_file() {
            out.push(prefix.to_string());
        } else if root.is_dir() {
            visit(root, &mut out).map_err(|e| storage_err("list", prefix, e))?;
        }
        out.sort();
        Ok(out)
    }

    fn size(&self, path: &str) -> MemResult<u64> {
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| storage_err("stat", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_roundtrip_and_missing_delete() {
        let dir = std::env::temp_dir().join(format!("gpujoin-fs-{}", std::process::id()));
        let path = dir.join("a/seg.bin");
        let path = path.to_str().unwrap();
        let fs = FsStorage::new();
        fs.write(path, b"hello world").unwrap();
        assert_eq!(fs.read_range(path, 6, 5).unwrap(), b"world");
        assert!(fs.read_range(path, 6, 50).is_err());
        assert_eq!(fs.size(path).unwrap(), 11);
        assert_eq!(fs.list(dir.to_str().unwrap()).unwrap(), vec![path.to_string()]);
        fs.delete(path).unwrap();
        fs.delete(path).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
