//! Byte layouts of everything the executor places in device memory.
//!
//! Host structures are never copied to the device as-is. Each image is
//! produced by an explicit writer from a typed header plus a layout plan
//! (offsets per section) and read back by a matching parser; all integers
//! are little-endian and every section starts 8-byte aligned.
//!
//! Chunk image (`KDS`): a 48 byte header, then
//! - row format: `row_index[nitems]` followed by tuple items
//!   `{t_len: u32, rowid: u32, encoded row}`;
//! - hash format: `hash_slot[nslots]`, `row_index[nitems]`, then hash items
//!   `{next: u32, hash: u32, rowid: u32, t_len: u32, encoded row}` chained
//!   per slot;
//! - slot format: `nrooms * ncols` entries of `{isnull: u8, ref: u64}` where
//!   `ref` names the depth and row a value comes from.
//!
//! Row indexes and chain links are byte offsets from the image start; 0 ends
//! a chain. Row ids are 1-based so that 0 can stand for a NULL-extended side.

use serde::{Deserialize, Serialize};

use gpujoin_core::join::JoinType;
use gpujoin_core::types::{decode_row, Row};

use crate::error::{Error, Result};

pub const KDS_HEAD_LEN: usize = 48;
pub const TUPITEM_HEAD_LEN: usize = 8;
pub const HASHITEM_HEAD_LEN: usize = 16;
pub const SLOT_ENTRY_LEN: usize = 9;
pub const RESULTBUF_HEAD_LEN: usize = 16;
pub const TASK_HEAD_FIXED_LEN: usize = 40;
pub const MRB_DEPTH_ENTRY_LEN: usize = 32;

const KDS_MAGIC: u32 = 0x4B44_5300;
const NO_OJMAP: u64 = u64::MAX;

/// Status codes a kernel leaves in the task header.
pub const ERR_SUCCESS: u32 = 0;
pub const ERR_NOSPACE: u32 = 1;
pub const ERR_CORRUPT: u32 = 2;

pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

pub(crate) fn corrupt(what: impl Into<String>) -> Error {
    Error::DataCorruption(what.into())
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> Result<u32> {
    buf.get(off..off + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| corrupt(format!("truncated u32 at offset {off}")))
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> Result<u64> {
    buf.get(off..off + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| corrupt(format!("truncated u64 at offset {off}")))
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn to_u32(v: usize, what: &str) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::Config(format!("{what} {v} does not fit a 32-bit offset")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkFormat {
    Row,
    Hash,
    Slot,
}

impl ChunkFormat {
    fn code(self) -> u32 {
        match self {
            ChunkFormat::Row => 1,
            ChunkFormat::Hash => 2,
            ChunkFormat::Slot => 3,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ChunkFormat::Row),
            2 => Some(ChunkFormat::Hash),
            3 => Some(ChunkFormat::Slot),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChunkFormat::Row => "KDS-Heap",
            ChunkFormat::Hash => "KDS-Hash",
            ChunkFormat::Slot => "KDS-Slot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdsHeader {
    pub format: ChunkFormat,
    pub ncols: u32,
    pub length: u64,
    pub usage: u64,
    pub nitems: u32,
    pub nrooms: u32,
    pub nslots: u32,
    pub hash_min: u32,
    pub hash_max: u32,
}

impl KdsHeader {
    pub fn new(format: ChunkFormat, ncols: usize, length: usize) -> Self {
        Self {
            format,
            ncols: ncols as u32,
            length: length as u64,
            usage: 0,
            nitems: 0,
            nrooms: u32::MAX,
            nslots: 0,
            hash_min: 0,
            hash_max: u32::MAX,
        }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        put_u32(out, 0, KDS_MAGIC | self.format.code());
        put_u32(out, 4, self.ncols);
        put_u64(out, 8, self.length);
        put_u64(out, 16, self.usage);
        put_u32(out, 24, self.nitems);
        put_u32(out, 28, self.nrooms);
        put_u32(out, 32, self.nslots);
        put_u32(out, 36, self.hash_min);
        put_u32(out, 40, self.hash_max);
        put_u32(out, 44, 0);
    }

    pub fn to_bytes(&self) -> [u8; KDS_HEAD_LEN] {
        let mut out = [0u8; KDS_HEAD_LEN];
        self.write_to(&mut out);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let magic = get_u32(bytes, 0)?;
        if magic & 0xFFFF_FF00 != KDS_MAGIC {
            return Err(corrupt(format!("bad chunk magic {magic:#x}")));
        }
        let format = ChunkFormat::from_code(magic & 0xFF)
            .ok_or_else(|| corrupt(format!("unknown chunk format {}", magic & 0xFF)))?;
        Ok(Self {
            format,
            ncols: get_u32(bytes, 4)?,
            length: get_u64(bytes, 8)?,
            usage: get_u64(bytes, 16)?,
            nitems: get_u32(bytes, 24)?,
            nrooms: get_u32(bytes, 28)?,
            nslots: get_u32(bytes, 32)?,
            hash_min: get_u32(bytes, 36)?,
            hash_max: get_u32(bytes, 40)?,
        })
    }

    /// Offset of `row_index[0]`.
    pub fn index_base(&self) -> usize {
        match self.format {
            ChunkFormat::Hash => KDS_HEAD_LEN + align8(4 * self.nslots as usize),
            _ => KDS_HEAD_LEN,
        }
    }

    /// Offset of the first item, given how many rows the index holds.
    pub fn items_base(&self, nitems: usize) -> usize {
        self.index_base() + align8(4 * nitems)
    }
}

pub fn row_image_len(nitems: usize, usage: usize) -> usize {
    KDS_HEAD_LEN + align8(4 * nitems) + usage
}

pub fn hash_image_len(nslots: usize, nitems: usize, usage: usize) -> usize {
    KDS_HEAD_LEN + align8(4 * nslots) + align8(4 * nitems) + usage
}

pub fn slot_image_len(nrooms: usize, ncols: usize) -> usize {
    KDS_HEAD_LEN + nrooms * ncols * SLOT_ENTRY_LEN
}

/// Read-only view over a row or hash chunk image.
pub struct KdsView<'a> {
    pub head: KdsHeader,
    bytes: &'a [u8],
}

impl<'a> KdsView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let head = KdsHeader::parse(bytes)?;
        if (bytes.len() as u64) < head.length {
            return Err(corrupt(format!(
                "chunk claims {} bytes but only {} are present",
                head.length,
                bytes.len()
            )));
        }
        if head.format == ChunkFormat::Slot {
            return Err(corrupt("slot chunks have no row index"));
        }
        Ok(Self { head, bytes })
    }

    pub fn nitems(&self) -> usize {
        self.head.nitems as usize
    }

    fn item_offset(&self, idx: usize) -> Result<usize> {
        if idx >= self.nitems() {
            return Err(corrupt(format!("row {idx} beyond nitems {}", self.nitems())));
        }
        Ok(get_u32(self.bytes, self.head.index_base() + 4 * idx)? as usize)
    }

    /// Decode row `idx` (0-based).
    pub fn row(&self, idx: usize) -> Result<Row> {
        let off = self.item_offset(idx)?;
        let body = match self.head.format {
            ChunkFormat::Hash => off + HASHITEM_HEAD_LEN,
            _ => off + TUPITEM_HEAD_LEN,
        };
        let (row, _) = decode_row(self.bytes, body).map_err(|e| corrupt(e.to_string()))?;
        Ok(row)
    }

    pub fn rows(&self) -> Result<Vec<Row>> {
        (0..self.nitems()).map(|i| self.row(i)).collect()
    }

    /// 0-based rows whose stored hash equals `hash`, walking its slot chain.
    pub fn bucket(&self, hash: u32) -> Result<Vec<usize>> {
        if self.head.format != ChunkFormat::Hash {
            return Err(corrupt("bucket lookup on a non-hash chunk"));
        }
        let nslots = self.head.nslots as usize;
        if nslots == 0 {
            return Ok(Vec::new());
        }
        let slot = KDS_HEAD_LEN + 4 * (hash as usize % nslots);
        let mut off = get_u32(self.bytes, slot)? as usize;
        let mut out = Vec::new();
        let mut steps = 0usize;
        while off != 0 {
            steps += 1;
            if steps > self.nitems() {
                return Err(corrupt("cycle in hash chain"));
            }
            let next = get_u32(self.bytes, off)? as usize;
            if get_u32(self.bytes, off + 4)? == hash {
                let rowid = get_u32(self.bytes, off + 8)? as usize;
                if rowid == 0 || rowid > self.nitems() {
                    return Err(corrupt(format!("hash item with rowid {rowid}")));
                }
                out.push(rowid - 1);
            }
            off = next;
        }
        // Chains are built by prepending, so restore insertion order.
        out.reverse();
        Ok(out)
    }
}

/// Header of one task's device buffer: sizing of the result-index buffers,
/// the kernel status, and per-depth row counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHeader {
    pub kresults_1_offset: u64,
    pub kresults_2_offset: u64,
    pub kresults_total_items: u32,
    pub kresults_max_items: u32,
    pub num_rels: u32,
    pub start_depth: u32,
    pub errcode: u32,
    pub err_depth: u32,
    /// Rows surviving depth `d`, for `d` in `0..=num_rels`.
    pub outer_nitems: Vec<u64>,
}

pub fn task_head_len(num_rels: usize) -> usize {
    align8(TASK_HEAD_FIXED_LEN + 8 * (num_rels + 1))
}

impl TaskHeader {
    pub fn head_len(&self) -> usize {
        task_head_len(self.num_rels as usize)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.head_len()];
        put_u64(&mut out, 0, self.kresults_1_offset);
        put_u64(&mut out, 8, self.kresults_2_offset);
        put_u32(&mut out, 16, self.kresults_total_items);
        put_u32(&mut out, 20, self.kresults_max_items);
        put_u32(&mut out, 24, self.num_rels);
        put_u32(&mut out, 28, self.start_depth);
        put_u32(&mut out, 32, self.errcode);
        put_u32(&mut out, 36, self.err_depth);
        for (i, n) in self.outer_nitems.iter().enumerate() {
            put_u64(&mut out, TASK_HEAD_FIXED_LEN + 8 * i, *n);
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let num_rels = get_u32(bytes, 24)?;
        let outer_nitems = (0..=num_rels as usize)
            .map(|i| get_u64(bytes, TASK_HEAD_FIXED_LEN + 8 * i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            kresults_1_offset: get_u64(bytes, 0)?,
            kresults_2_offset: get_u64(bytes, 8)?,
            kresults_total_items: get_u32(bytes, 16)?,
            kresults_max_items: get_u32(bytes, 20)?,
            num_rels,
            start_depth: get_u32(bytes, 28)?,
            errcode: get_u32(bytes, 32)?,
            err_depth: get_u32(bytes, 36)?,
            outer_nitems,
        })
    }

    /// Offset of the buffer depth `depth` reads its combinations from.
    pub fn in_results(&self, depth: usize) -> usize {
        if depth % 2 == 1 {
            self.kresults_1_offset as usize
        } else {
            self.kresults_2_offset as usize
        }
    }

    /// Offset of the buffer depth `depth` writes its combinations to.
    pub fn out_results(&self, depth: usize) -> usize {
        self.in_results(depth + 1)
    }
}

pub fn resultbuf_len(total_items: usize) -> usize {
    align8(RESULTBUF_HEAD_LEN + 4 * total_items)
}

/// One result-index buffer: combinations of `nrels` row ids each.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultBuf {
    pub nrels: u32,
    pub nrooms: u32,
    /// Combinations produced, including ones that did not fit.
    pub nitems: u32,
    pub errcode: u32,
    pub entries: Vec<u32>,
}

impl ResultBuf {
    pub fn empty(nrels: usize, nrooms: u32) -> Self {
        Self {
            nrels: nrels as u32,
            nrooms,
            nitems: 0,
            errcode: ERR_SUCCESS,
            entries: Vec::new(),
        }
    }

    pub fn header_bytes(&self) -> [u8; RESULTBUF_HEAD_LEN] {
        let mut out = [0u8; RESULTBUF_HEAD_LEN];
        put_u32(&mut out, 0, self.nrels);
        put_u32(&mut out, 4, self.nrooms);
        put_u32(&mut out, 8, self.nitems);
        put_u32(&mut out, 12, self.errcode);
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RESULTBUF_HEAD_LEN + 4 * self.entries.len());
        out.extend_from_slice(&self.header_bytes());
        for e in &self.entries {
            out.extend_from_slice(&e.to_le_bytes());
        }
        out
    }

    /// Parse a buffer image; only combinations that fit are materialized.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let nrels = get_u32(bytes, 0)?;
        let nrooms = get_u32(bytes, 4)?;
        let nitems = get_u32(bytes, 8)?;
        let errcode = get_u32(bytes, 12)?;
        let stored = (nitems as usize * nrels as usize).min(nrooms as usize);
        let entries = (0..stored)
            .map(|i| get_u32(bytes, RESULTBUF_HEAD_LEN + 4 * i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            nrels,
            nrooms,
            nitems,
            errcode,
            entries,
        })
    }

    /// Append one combination, or only count it once the buffer is full.
    pub fn push(&mut self, combo: &[u32]) -> bool {
        debug_assert_eq!(combo.len(), self.nrels as usize);
        self.nitems += 1;
        if self.entries.len() + combo.len() > self.nrooms as usize {
            self.errcode = ERR_NOSPACE;
            return false;
        }
        self.entries.extend_from_slice(combo);
        true
    }

    pub fn overflowed(&self) -> bool {
        self.errcode == ERR_NOSPACE
    }

    /// Slots this buffer would need to hold every combination.
    pub fn needed_items(&self) -> u64 {
        self.nitems as u64 * self.nrels as u64
    }

    pub fn combos(&self) -> impl Iterator<Item = &[u32]> {
        self.entries.chunks_exact(self.nrels.max(1) as usize)
    }
}

/// Offsets of one task's single device allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLayout {
    pub head_len: usize,
    pub kresults_1: usize,
    pub kresults_2: usize,
    pub kgjoin_len: usize,
    pub src: Option<(usize, usize)>,
    pub dst_offset: usize,
    pub dst_len: usize,
    pub total_len: usize,
}

impl TaskLayout {
    pub fn new(num_rels: usize, total_items: usize, src_len: Option<usize>, dst_len: usize) -> Self {
        let head_len = task_head_len(num_rels);
        let rb = resultbuf_len(total_items);
        let kgjoin_len = head_len + 2 * rb;
        let (src, dst_offset) = match src_len {
            Some(len) => (Some((kgjoin_len, len)), kgjoin_len + align8(len)),
            None => (None, kgjoin_len),
        };
        Self {
            head_len,
            kresults_1: head_len,
            kresults_2: head_len + rb,
            kgjoin_len,
            src,
            dst_offset,
            dst_len,
            total_len: dst_offset + align8(dst_len),
        }
    }
}

/// Per-depth entry of the multi-relations header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrbDepthEntry {
    pub chunk_offset: u64,
    pub chunk_length: u64,
    /// Start of this depth's outer-join map; each device owns
    /// `ojmap_region_len(nitems)` bytes of it.
    pub ojmap_offset: Option<u64>,
    pub nitems: u32,
    pub join_type: JoinType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrbHeader {
    pub ndevs: u32,
    pub depths: Vec<MrbDepthEntry>,
}

pub fn mrb_head_len(num_rels: usize) -> usize {
    align8(8 + MRB_DEPTH_ENTRY_LEN * num_rels)
}

pub fn ojmap_region_len(nitems: usize) -> usize {
    align8(nitems)
}

fn join_type_code(jt: JoinType) -> u32 {
    match jt {
        JoinType::Inner => 0,
        JoinType::Left => 1,
        JoinType::Right => 2,
        JoinType::Full => 3,
    }
}

fn join_type_from_code(code: u32) -> Result<JoinType> {
    Ok(match code {
        0 => JoinType::Inner,
        1 => JoinType::Left,
        2 => JoinType::Right,
        3 => JoinType::Full,
        other => return Err(corrupt(format!("unknown join type code {other}"))),
    })
}

impl MrbHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; mrb_head_len(self.depths.len())];
        put_u32(&mut out, 0, self.depths.len() as u32);
        put_u32(&mut out, 4, self.ndevs);
        for (i, d) in self.depths.iter().enumerate() {
            let base = 8 + MRB_DEPTH_ENTRY_LEN * i;
            put_u64(&mut out, base, d.chunk_offset);
            put_u64(&mut out, base + 8, d.chunk_length);
            put_u64(&mut out, base + 16, d.ojmap_offset.unwrap_or(NO_OJMAP));
            put_u32(&mut out, base + 24, d.nitems);
            put_u32(&mut out, base + 28, join_type_code(d.join_type));
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let nrels = get_u32(bytes, 0)? as usize;
        let ndevs = get_u32(bytes, 4)?;
        let depths = (0..nrels)
            .map(|i| {
                let base = 8 + MRB_DEPTH_ENTRY_LEN * i;
                let oj = get_u64(bytes, base + 16)?;
                Ok(MrbDepthEntry {
                    chunk_offset: get_u64(bytes, base)?,
                    chunk_length: get_u64(bytes, base + 8)?,
                    ojmap_offset: (oj != NO_OJMAP).then_some(oj),
                    nitems: get_u32(bytes, base + 24)?,
                    join_type: join_type_from_code(get_u32(bytes, base + 28)?)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ndevs, depths })
    }

    /// Entry of depth `depth` (1-indexed).
    pub fn depth(&self, depth: usize) -> Result<&MrbDepthEntry> {
        depth
            .checked_sub(1)
            .and_then(|i| self.depths.get(i))
            .ok_or_else(|| corrupt(format!("no depth {depth} in multi-relations header")))
    }

    /// Chunk image of `depth` within the whole multi-relations image.
    pub fn chunk<'a>(&self, image: &'a [u8], depth: usize) -> Result<&'a [u8]> {
        let d = self.depth(depth)?;
        let start = d.chunk_offset as usize;
        image
            .get(start..start + d.chunk_length as usize)
            .ok_or_else(|| corrupt(format!("depth {depth} chunk lies outside the buffer")))
    }
}

/// Slot-format reference to the row of `depth` with 1-based `rowid`.
pub fn slot_ref(depth: usize, rowid: u32) -> u64 {
    ((depth as u64) << 32) | rowid as u64
}

pub fn split_slot_ref(r: u64) -> (usize, u32) {
    ((r >> 32) as usize, (r & 0xFFFF_FFFF) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kds_header_rejects_garbage() {
        let h = KdsHeader {
            nitems: 3,
            nslots: 8,
            ..KdsHeader::new(ChunkFormat::Hash, 2, 4096)
        };
        let bytes = h.to_bytes();
        assert_eq!(KdsHeader::parse(&bytes).expect("parse"), h);
        assert_eq!(h.index_base(), KDS_HEAD_LEN + 32);
        assert!(matches!(
            KdsHeader::parse(&[0u8; KDS_HEAD_LEN]),
            Err(Error::DataCorruption(_))
        ));
    }

    #[test]
    fn test_task_header_ping_pong() {
        let h = TaskHeader {
            kresults_1_offset: 64,
            kresults_2_offset: 128,
            kresults_total_items: 12,
            kresults_max_items: 0,
            num_rels: 3,
            start_depth: 1,
            errcode: ERR_SUCCESS,
            err_depth: 0,
            outer_nitems: vec![5, 4, 3, 2],
        };
        assert_eq!(h.head_len(), 72);
        assert_eq!(TaskHeader::parse(&h.to_bytes()).expect("parse"), h);
        assert_eq!(h.in_results(1), 64);
        assert_eq!(h.out_results(1), 128);
        assert_eq!(h.in_results(2), 128);
        assert_eq!(h.out_results(2), 64);
    }

    #[test]
    fn test_result_buffer_counts_past_capacity() {
        let mut rb = ResultBuf::empty(2, 4);
        assert!(rb.push(&[1, 2]));
        assert!(rb.push(&[3, 0]));
        assert!(!rb.push(&[4, 4]));
        assert!(rb.overflowed());
        assert_eq!(rb.needed_items(), 6);
        let parsed = ResultBuf::parse(&rb.to_bytes()).expect("parse");
        assert_eq!(parsed.combos().collect::<Vec<_>>(), vec![&[1, 2][..], &[3, 0][..]]);
    }

    #[test]
    fn test_task_layout_is_aligned() {
        let l = TaskLayout::new(2, 10, Some(101), 300);
        assert_eq!(l.head_len, 64);
        assert_eq!(l.kresults_2 - l.kresults_1, resultbuf_len(10));
        assert_eq!(l.src, Some((l.kgjoin_len, 101)));
        assert_eq!(l.dst_offset % 8, 0);
        assert_eq!(l.total_len, l.dst_offset + 304);
    }

    #[test]
    fn test_slot_ref_split() {
        assert_eq!(split_slot_ref(slot_ref(3, 77)), (3, 77));
    }
}
