//! Ordering of result chunks by key columns.
//!
//! Every chunk is one bucket. `prepare` projects the key columns of each
//! row into a slot and seeds the index array with the identity; `sort`
//! runs the bitonic network over each bucket's part of the index array
//! while the bucket array stays fixed; `merge` combines the sorted buckets
//! with a k-way merge.

pub mod bitonic;

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use gpujoin_core::types::{scalar_cmp, Row, Scalar};

use crate::chunk::ColumnarChunk;
use crate::error::{Error, Result};

/// Workgroup size of the local sort.
pub const DEFAULT_SORT_BLOCK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: usize,
    #[serde(default)]
    pub descending: bool,
    /// NULLs before every value; defaults to the position ascending order
    /// would give them (last).
    #[serde(default)]
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            descending: false,
            nulls_first: false,
        }
    }

    pub fn desc(column: usize) -> Self {
        Self {
            column,
            descending: true,
            nulls_first: true,
        }
    }
}

/// Compare projected key slots under `keys`.
pub fn compare_keys(keys: &[SortKey], a: &[Scalar], b: &[Scalar]) -> Ordering {
    for (i, key) in keys.iter().enumerate() {
        let (x, y) = (&a[i], &b[i]);
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if key.nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if key.nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if key.descending => scalar_cmp(y, x),
            (false, false) => scalar_cmp(x, y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Index arrays of a bucketed sort.
#[derive(Debug)]
pub struct SortBuffer {
    keys: Vec<SortKey>,
    chunks: Vec<Arc<ColumnarChunk>>,
    /// Key slots of every entry, addressed by bucket base plus row.
    slots: Vec<Vec<Scalar>>,
    /// Bucket of every entry; never reordered.
    bucket: Vec<u32>,
    /// Row within the bucket; permuted by the network.
    index: Vec<u32>,
    /// First entry of every bucket, plus the total.
    bases: Vec<usize>,
    launches: usize,
}

impl SortBuffer {
    pub fn prepare(chunks: Vec<Arc<ColumnarChunk>>, keys: &[SortKey]) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::Config("sort needs at least one key".into()));
        }
        let total: usize = chunks.iter().map(|c| c.nitems()).sum();
        let mut slots = Vec::with_capacity(total);
        let mut bucket = Vec::with_capacity(total);
        let mut index = Vec::with_capacity(total);
        let mut bases = Vec::with_capacity(chunks.len() + 1);
        for (b, chunk) in chunks.iter().enumerate() {
            if let Some(key) = keys.iter().find(|k| k.column >= chunk.ncols()) {
                return Err(Error::Config(format!(
                    "sort key column {} is out of range for {} columns",
                    key.column,
                    chunk.ncols()
                )));
            }
            bases.push(slots.len());
            for (r, row) in chunk.rows().iter().enumerate() {
                slots.push(
                    keys.iter()
                        .map(|k| row.get(k.column).cloned().unwrap_or(Scalar::Null))
                        .collect(),
                );
                bucket.push(b as u32);
                index.push(r as u32);
            }
        }
        bases.push(slots.len());
        Ok(Self {
            keys: keys.to_vec(),
            chunks,
            slots,
            bucket,
            index,
            bases,
            launches: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn num_buckets(&self) -> usize {
        self.chunks.len()
    }

    /// Launches issued so far.
    pub fn launches(&self) -> usize {
        self.launches
    }

    /// Sort every bucket with workgroups of `block` entries.
    pub fn sort(&mut self, block: usize) {
        for b in 0..self.chunks.len() {
            let (lo, hi) = (self.bases[b], self.bases[b + 1]);
            let slots = &self.slots[lo..hi];
            let keys = &self.keys;
            self.launches += bitonic::bitonic_sort(&mut self.index[lo..hi], block, |x, y| {
                compare_keys(keys, &slots[x as usize], &slots[y as usize])
            });
        }
        tracing::debug!(
            entries = self.index.len(),
            buckets = self.chunks.len(),
            launches = self.launches,
            "buckets sorted"
        );
    }

    /// Row order of bucket `b`.
    pub fn bucket_order(&self, b: usize) -> &[u32] {
        match (self.bases.get(b), self.bases.get(b + 1)) {
            (Some(&lo), Some(&hi)) => &self.index[lo..hi],
            _ => &[],
        }
    }

    /// Bucket of every entry, in entry order.
    pub fn buckets(&self) -> &[u32] {
        &self.bucket
    }

    fn merge_head(&self, b: usize, pos: usize) -> Option<MergeHead<'_>> {
        let r = *self.bucket_order(b).get(pos)? as usize;
        Some(MergeHead {
            slot: self.slots.get(self.bases[b] + r)?,
            keys: &self.keys,
            bucket: b,
            pos,
        })
    }

    /// All rows in key order, merging the sorted buckets.
    pub fn merge(&self) -> Vec<Row> {
        let mut heap = BinaryHeap::new();
        for b in 0..self.chunks.len() {
            if let Some(h) = self.merge_head(b, 0) {
                heap.push(Reverse(h));
            }
        }
        let mut out = Vec::with_capacity(self.len());
        while let Some(Reverse(h)) = heap.pop() {
            let r = self.bucket_order(h.bucket)[h.pos] as usize;
            if let Some(row) = self.chunks[h.bucket].row(r) {
                out.push(row.clone());
            }
            if let Some(next) = self.merge_head(h.bucket, h.pos + 1) {
                heap.push(Reverse(next));
            }
        }
        out
    }
}

/// Next unmerged entry of one bucket.
struct MergeHead<'a> {
    slot: &'a [Scalar],
    keys: &'a [SortKey],
    bucket: usize,
    pos: usize,
}

impl PartialEq for MergeHead<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead<'_> {}

impl PartialOrd for MergeHead<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(self.keys, self.slot, other.slot).then(self.bucket.cmp(&other.bucket))
    }
}

/// Sort the rows of `chunks` by `keys`.
pub fn sort_chunks(chunks: Vec<Arc<ColumnarChunk>>, keys: &[SortKey]) -> Result<Vec<Row>> {
    let mut buf = SortBuffer::prepare(chunks, keys)?;
    buf.sort(DEFAULT_SORT_BLOCK);
    Ok(buf.merge())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(values: &[Option<i64>]) -> Arc<ColumnarChunk> {
        let mut c = ColumnarChunk::new_row(2, 1 << 16);
        for (i, v) in values.iter().enumerate() {
            let key = v.map_or(Scalar::Null, Scalar::I64);
            c.insert_tuple(vec![key, Scalar::I64(i as i64)])
                .expect("chunk capacity");
        }
        Arc::new(c)
    }

    fn keys_of(rows: &[Row]) -> Vec<Scalar> {
        rows.iter().map(|r| r[0].clone()).collect()
    }

    #[test]
    fn test_sort_across_buckets() {
        let chunks = vec![
            chunk(&[Some(5), Some(1), Some(9)]),
            chunk(&[Some(4), Some(8)]),
            chunk(&[Some(7), Some(2), Some(3), Some(6), Some(0)]),
        ];
        let mut buf = SortBuffer::prepare(chunks, &[SortKey::asc(0)]).expect("prepare");
        buf.sort(2);
        assert_eq!(buf.bucket_order(0), &[1, 0, 2]);
        assert_eq!(buf.buckets(), &[0, 0, 0, 1, 1, 2, 2, 2, 2, 2]);
        let rows = buf.merge();
        assert_eq!(
            keys_of(&rows),
            (0..10).map(Scalar::I64).collect::<Vec<_>>()
        );
        assert!(buf.launches() > 0);
    }

    #[test]
    fn test_descending_with_nulls_first() {
        let rows = sort_chunks(
            vec![chunk(&[Some(1), None, Some(3), Some(2)])],
            &[SortKey::desc(0)],
        )
        .expect("sort");
        assert_eq!(
            keys_of(&rows),
            vec![Scalar::Null, Scalar::I64(3), Scalar::I64(2), Scalar::I64(1)]
        );
    }

    #[test]
    fn test_key_out_of_range() {
        let err = SortBuffer::prepare(vec![chunk(&[Some(1)])], &[SortKey::asc(5)])
            .expect_err("column 5 does not exist");
        assert!(matches!(err, Error::Config(_)));
    }
}
