//! Tuple spill store.
//!
//! The LEFT/FULL partitioner cannot hold every inner row of a depth while it
//! is still deciding chunk boundaries, so rows go through a [`TupleSpill`]:
//! buffered in memory, written out as checksummed segments once a batch is
//! full, and read back in insertion order through a [`SpillReader`].

pub mod codec;
pub mod segment;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gpujoin_core::budget::MemoryBudget;
use gpujoin_core::id::SpillId;
use gpujoin_core::types::Row;

use crate::error::{Error, Result};
use crate::guard::BudgetPool;

pub use codec::Codec;
pub use segment::{SegmentHeader, SegmentMeta, HEADER_LEN};

/// Abstract storage interface for spill segments.
///
/// Implemented by `gpujoin-io` (`FsStorage`, `MemoryStorage`).
pub trait Storage: Send + Sync {
    /// Write bytes to a path, replacing any previous content.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Read exactly `len` bytes starting at `offset`.
    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Delete a path. Deleting a missing path is not an error.
    fn delete(&self, path: &str) -> Result<()>;

    /// All paths under a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn size(&self, path: &str) -> Result<u64>;
}

/// Writes and reads row segments on a [`Storage`].
pub struct SpillManager {
    storage: Arc<dyn Storage>,
    codec: Codec,
    root_dir: String,
    next_run: AtomicU32,
    budget: Option<BudgetPool>,
}

impl SpillManager {
    pub fn new(storage: Arc<dyn Storage>, codec: Codec, root_dir: impl Into<String>) -> Self {
        Self {
            storage,
            codec,
            root_dir: root_dir.into(),
            next_run: AtomicU32::new(0),
            budget: None,
        }
    }

    /// Charge decoded segments against `pool` while they are being parsed.
    pub fn with_budget(mut self, pool: BudgetPool) -> Self {
        self.budget = Some(pool);
        self
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Serialize, compress and checksum `rows` into a new segment.
    pub fn write_rows(&self, spill: SpillId, rows: &[Row]) -> Result<SegmentMeta> {
        let raw = serde_json::to_vec(rows).map_err(|e| Error::Codec(format!("json: {e}")))?;
        let packed = self.codec.compress(&raw)?;
        let header = SegmentHeader {
            codec: self.codec,
            nrows: u32::try_from(rows.len())
                .map_err(|_| Error::Storage(format!("{} rows in one segment", rows.len())))?,
            uncompressed_len: raw.len() as u64,
            compressed_len: packed.len() as u64,
        };
        header.validate_sizes()?;

        let mut image = Vec::with_capacity(HEADER_LEN + packed.len());
        image.extend_from_slice(&header.to_bytes());
        image.extend_from_slice(&packed);
        let checksum: [u8; 32] = blake3::hash(&image).into();

        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let path = format!("{}/spill-{}-{run:06}.seg", self.root_dir, spill.get());
        self.storage.write(&path, &image)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(%spill, path = %path, nrows = rows.len(), bytes = image.len(), "spill segment written");

        Ok(SegmentMeta {
            path,
            nrows: header.nrows,
            total_len: image.len(),
            checksum,
        })
    }

    /// Read a segment back, verifying its checksum before decoding.
    pub fn read_rows(&self, meta: &SegmentMeta) -> Result<Vec<Row>> {
        let image = self.storage.read_range(&meta.path, 0, meta.total_len)?;
        let checksum: [u8; 32] = blake3::hash(&image).into();
        if checksum != meta.checksum {
            return Err(Error::ChecksumMismatch(meta.path.clone()));
        }
        let header = SegmentHeader::from_bytes(&image)?;
        let payload = image
            .get(HEADER_LEN..)
            .ok_or_else(|| Error::Storage("segment too short".into()))?;

        let _charge = match &self.budget {
            Some(pool) => Some(
                pool.try_acquire(header.uncompressed_len as usize, "spill_decode")
                    .ok_or(Error::BudgetExceeded {
                        tag: "spill_decode",
                        requested: header.uncompressed_len as usize,
                        capacity: pool.capacity_bytes(),
                        used: pool.used_bytes(),
                    })?,
            ),
            None => None,
        };
        let raw = header.codec.decompress(payload)?;
        let rows: Vec<Row> =
            serde_json::from_slice(&raw).map_err(|e| Error::Codec(format!("json: {e}")))?;
        if rows.len() != header.nrows as usize {
            return Err(Error::Storage(format!(
                "segment {} holds {} rows, header says {}",
                meta.path,
                rows.len(),
                header.nrows
            )));
        }
        Ok(rows)
    }

    pub fn delete(&self, meta: &SegmentMeta) -> Result<()> {
        self.storage.delete(&meta.path)
    }
}

impl std::fmt::Debug for SpillManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillManager")
            .field("codec", &self.codec)
            .field("root_dir", &self.root_dir)
            .finish()
    }
}

/// Append-only row store that writes a segment every `batch_rows` rows.
#[derive(Debug)]
pub struct TupleSpill {
    manager: Arc<SpillManager>,
    id: SpillId,
    batch_rows: usize,
    buffer: Vec<Row>,
    segments: Vec<SegmentMeta>,
    nrows: u64,
}

impl TupleSpill {
    pub fn new(manager: Arc<SpillManager>, id: SpillId, batch_rows: usize) -> Self {
        Self {
            manager,
            id,
            batch_rows: batch_rows.max(1),
            buffer: Vec::new(),
            segments: Vec::new(),
            nrows: 0,
        }
    }

    pub fn put(&mut self, row: Row) -> Result<()> {
        self.buffer.push(row);
        self.nrows += 1;
        if self.buffer.len() >= self.batch_rows {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let meta = self.manager.write_rows(self.id, &self.buffer)?;
        self.buffer.clear();
        self.segments.push(meta);
        Ok(())
    }

    /// Rows stored so far.
    pub fn len(&self) -> u64 {
        self.nrows
    }

    pub fn is_empty(&self) -> bool {
        self.nrows == 0
    }

    /// Segments written so far (the in-memory tail is not counted).
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Stop writing; the reader yields the rows in insertion order.
    pub fn finish(mut self) -> Result<SpillReader> {
        let tail = std::mem::take(&mut self.buffer);
        let segments = std::mem::take(&mut self.segments);
        Ok(SpillReader {
            manager: Arc::clone(&self.manager),
            segments: segments.into(),
            current: Vec::new().into_iter(),
            tail: Some(tail),
        })
    }
}

impl Drop for TupleSpill {
    fn drop(&mut self) {
        for meta in self.segments.drain(..) {
            let _ = self.manager.delete(&meta);
        }
    }
}

/// Sequential reader over a finished [`TupleSpill`]. Segments are deleted as
/// soon as they are consumed, the rest when the reader is dropped.
#[derive(Debug)]
pub struct SpillReader {
    manager: Arc<SpillManager>,
    segments: VecDeque<SegmentMeta>,
    current: std::vec::IntoIter<Row>,
    tail: Option<Vec<Row>>,
}

impl SpillReader {
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.current.next() {
                return Ok(Some(row));
            }
            if let Some(meta) = self.segments.pop_front() {
                let rows = self.manager.read_rows(&meta);
                self.manager.delete(&meta)?;
                self.current = rows?.into_iter();
                continue;
            }
            match self.tail.take() {
                Some(tail) => self.current = tail.into_iter(),
                None => return Ok(None),
            }
        }
    }
}

impl Drop for SpillReader {
    fn drop(&mut self) {
        for meta in self.segments.drain(..) {
            let _ = self.manager.delete(&meta);
        }
    }
}
