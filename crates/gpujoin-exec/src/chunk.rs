//! ColumnarChunk: the bounded container rows travel in.
//!
//! A chunk keeps its rows decoded on the host and tracks the byte footprint
//! its device image will have, so capacity checks are exact without
//! serializing on every insert. `length` is the capacity in bytes, `usage`
//! the bytes taken by tuple items.

use gpujoin_core::types::{encode_row, encoded_row_len, Row, RowBatch, Scalar};

use crate::error::{Error, Result};
use crate::layout::{
    align8, corrupt, get_u32, get_u64, hash_image_len, put_u32, row_image_len, split_slot_ref,
    to_u32, ChunkFormat, KdsHeader, KdsView, HASHITEM_HEAD_LEN, KDS_HEAD_LEN, SLOT_ENTRY_LEN,
    TUPITEM_HEAD_LEN,
};

/// Smallest slot array of a finished hash chunk that holds rows.
pub const MIN_FINAL_NSLOTS: usize = 128;

#[derive(Debug, Clone)]
pub struct ColumnarChunk {
    format: ChunkFormat,
    ncols: usize,
    length: usize,
    usage: usize,
    nslots: usize,
    nrooms: usize,
    hash_min: u32,
    hash_max: u32,
    rows: Vec<Row>,
    hashes: Vec<u32>,
}

impl ColumnarChunk {
    pub fn new_row(ncols: usize, length: usize) -> Self {
        Self::empty(ChunkFormat::Row, ncols, length, 0)
    }

    pub fn new_hash(ncols: usize, length: usize, nslots: usize) -> Self {
        Self::empty(ChunkFormat::Hash, ncols, length, nslots.max(1))
    }

    fn empty(format: ChunkFormat, ncols: usize, length: usize, nslots: usize) -> Self {
        Self {
            format,
            ncols,
            length,
            usage: 0,
            nslots,
            nrooms: u32::MAX as usize,
            hash_min: 0,
            hash_max: u32::MAX,
            rows: Vec::new(),
            hashes: Vec::new(),
        }
    }

    /// Bytes one row takes in a row-format chunk, its index entry included.
    pub fn tuple_consumption(row: &[Scalar]) -> usize {
        4 + align8(TUPITEM_HEAD_LEN + encoded_row_len(row))
    }

    /// Bytes one row takes in a hash chunk: index entry, its share of the
    /// slot array, and the hash item.
    pub fn hash_consumption(row: &[Scalar]) -> usize {
        8 + align8(HASHITEM_HEAD_LEN + encoded_row_len(row))
    }

    pub fn format(&self) -> ChunkFormat {
        self.format
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn nitems(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn nslots(&self) -> usize {
        self.nslots
    }

    pub fn nrooms(&self) -> usize {
        self.nrooms
    }

    pub fn hash_range(&self) -> (u32, u32) {
        (self.hash_min, self.hash_max)
    }

    pub fn set_hash_range(&mut self, hash_min: u32, hash_max: u32) {
        self.hash_min = hash_min;
        self.hash_max = hash_max;
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, idx: usize) -> Option<&Row> {
        self.rows.get(idx)
    }

    pub fn hashes(&self) -> &[u32] {
        &self.hashes
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Bytes of the device image of this chunk as it stands.
    pub fn image_len(&self) -> usize {
        match self.format {
            ChunkFormat::Row => row_image_len(self.rows.len(), self.usage),
            ChunkFormat::Hash => hash_image_len(self.nslots, self.rows.len(), self.usage),
            ChunkFormat::Slot => {
                KDS_HEAD_LEN + self.rows.len() * self.ncols * SLOT_ENTRY_LEN
            }
        }
    }

    fn fits(&self, item: usize) -> bool {
        let n = self.rows.len() + 1;
        let needed = match self.format {
            ChunkFormat::Hash => hash_image_len(self.nslots, n, self.usage + item),
            _ => row_image_len(n, self.usage + item),
        };
        needed <= self.length
    }

    /// Append a row to a row-format chunk; hands the row back when full.
    pub fn insert_tuple(&mut self, row: Row) -> std::result::Result<(), Row> {
        debug_assert_eq!(self.format, ChunkFormat::Row);
        let item = align8(TUPITEM_HEAD_LEN + encoded_row_len(&row));
        if !self.fits(item) {
            return Err(row);
        }
        self.usage += item;
        self.rows.push(row);
        Ok(())
    }

    /// Append a row with its key hash to a hash chunk; hands the row back
    /// when the chunk is out of bytes or slots.
    pub fn insert_hashitem(&mut self, row: Row, hash: u32) -> std::result::Result<(), Row> {
        debug_assert_eq!(self.format, ChunkFormat::Hash);
        let item = align8(HASHITEM_HEAD_LEN + encoded_row_len(&row));
        if self.rows.len() >= self.nslots || !self.fits(item) {
            return Err(row);
        }
        self.usage += item;
        self.rows.push(row);
        self.hashes.push(hash);
        Ok(())
    }

    /// Grow capacity in place; existing rows are kept.
    pub fn expand(&mut self, length: usize, nslots: usize) {
        self.length = self.length.max(length);
        if self.format == ChunkFormat::Hash {
            self.nslots = self.nslots.max(nslots);
        }
    }

    /// Trim capacity to exactly what the image needs.
    pub fn shrink(&mut self) {
        if self.format == ChunkFormat::Hash {
            self.nslots = self.nslots.min(self.rows.len().max(MIN_FINAL_NSLOTS));
        }
        self.length = self.image_len();
    }

    pub fn to_image(&self) -> Result<Vec<u8>> {
        let len = self.image_len();
        let mut out = vec![0u8; len];
        let mut head = KdsHeader::new(self.format, self.ncols, len);
        head.usage = self.usage as u64;
        head.nitems = to_u32(self.rows.len(), "row count")?;
        head.nslots = to_u32(self.nslots, "slot count")?;
        head.hash_min = self.hash_min;
        head.hash_max = self.hash_max;
        head.write_to(&mut out);

        let index_base = head.index_base();
        let mut off = head.items_base(self.rows.len());
        let mut slots = vec![0u32; self.nslots];
        let mut enc = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            enc.clear();
            encode_row(row, &mut enc);
            let at = to_u32(off, "item offset")?;
            put_u32(&mut out, index_base + 4 * i, at);
            let rowid = to_u32(i + 1, "row id")?;
            let body = match self.format {
                ChunkFormat::Hash => {
                    let hash = self.hashes[i];
                    let slot = hash as usize % self.nslots;
                    put_u32(&mut out, off, slots[slot]);
                    put_u32(&mut out, off + 4, hash);
                    put_u32(&mut out, off + 8, rowid);
                    put_u32(&mut out, off + 12, enc.len() as u32);
                    slots[slot] = at;
                    off + HASHITEM_HEAD_LEN
                }
                ChunkFormat::Row => {
                    put_u32(&mut out, off, enc.len() as u32);
                    put_u32(&mut out, off + 4, rowid);
                    off + TUPITEM_HEAD_LEN
                }
                ChunkFormat::Slot => {
                    return Err(Error::Invariant("slot chunks are produced by the device".into()))
                }
            };
            out[body..body + enc.len()].copy_from_slice(&enc);
            off = align8(body + enc.len());
        }
        for (i, s) in slots.iter().enumerate() {
            put_u32(&mut out, KDS_HEAD_LEN + 4 * i, *s);
        }
        Ok(out)
    }

    /// Rebuild a row or hash chunk from its image.
    pub fn from_image(bytes: &[u8]) -> Result<Self> {
        let view = KdsView::parse(bytes)?;
        let head = view.head;
        let rows = view.rows()?;
        let mut hashes = Vec::new();
        if head.format == ChunkFormat::Hash {
            for i in 0..rows.len() {
                let off = get_u32(bytes, head.index_base() + 4 * i)? as usize;
                hashes.push(get_u32(bytes, off + 4)?);
            }
        }
        Ok(Self {
            format: head.format,
            ncols: head.ncols as usize,
            length: head.length as usize,
            usage: head.usage as usize,
            nslots: head.nslots as usize,
            nrooms: head.nrooms as usize,
            hash_min: head.hash_min,
            hash_max: head.hash_max,
            rows,
            hashes,
        })
    }

    /// Materialize a slot-format destination image. Each entry references a
    /// row of some depth; `resolve(depth, rowid, column)` produces the value.
    pub fn from_slot_image<F>(bytes: &[u8], columns: &[usize], resolve: F) -> Result<Self>
    where
        F: Fn(usize, u32, usize) -> Result<Scalar>,
    {
        let head = KdsHeader::parse(bytes)?;
        if head.format != ChunkFormat::Slot {
            return Err(corrupt(format!(
                "expected a slot chunk, found {}",
                head.format.label()
            )));
        }
        let ncols = head.ncols as usize;
        if ncols != columns.len() {
            return Err(corrupt(format!(
                "slot chunk has {ncols} columns, projection has {}",
                columns.len()
            )));
        }
        let nitems = head.nitems as usize;
        let mut rows = Vec::with_capacity(nitems);
        for i in 0..nitems {
            let mut row = Vec::with_capacity(ncols);
            for (c, column) in columns.iter().enumerate() {
                let at = KDS_HEAD_LEN + (i * ncols + c) * SLOT_ENTRY_LEN;
                let isnull = *bytes
                    .get(at)
                    .ok_or_else(|| corrupt(format!("slot {i} beyond the image")))?;
                if isnull != 0 {
                    row.push(Scalar::Null);
                    continue;
                }
                let (depth, rowid) = split_slot_ref(get_u64(bytes, at + 1)?);
                row.push(resolve(depth, rowid, *column)?);
            }
            rows.push(row);
        }
        Ok(Self {
            format: ChunkFormat::Slot,
            ncols,
            length: head.length as usize,
            usage: 0,
            nslots: 0,
            nrooms: head.nrooms as usize,
            hash_min: 0,
            hash_max: u32::MAX,
            rows,
            hashes: Vec::new(),
        })
    }

    /// Columnar copy of the rows, for bulk consumers.
    pub fn to_batch(&self, names: &[String]) -> RowBatch {
        RowBatch::from_rows(names, &self.rows)
    }
}
