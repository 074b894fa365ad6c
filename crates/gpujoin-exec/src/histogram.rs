//! Hash-value histogram of one LEFT/FULL hash depth.
//!
//! The 32-bit hash space is cut into `2^bits` equal buckets, where `bits`
//! grows with the planned number of chunks: four bits of headroom over
//! `log2(nbatches_plan)`, clamped to [`MIN_HGRAM_BITS`, `MAX_HGRAM_BITS`].
//! While the inner relation is staged, every row adds its byte consumption
//! and a count to its bucket; once the relation is exhausted,
//! [`Histogram::plan_ranges`] groups consecutive buckets into hash ranges
//! that each fit one chunk.

use serde::Serialize;

use crate::error::{Error, Result};

pub const MIN_HGRAM_BITS: u32 = 8;
pub const MAX_HGRAM_BITS: u32 = 16;

/// One planned chunk: rows whose hash lies in `[hash_min, hash_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HashRange {
    pub hash_min: u32,
    pub hash_max: u32,
    pub nitems: usize,
    pub usage: usize,
}

#[derive(Debug, Clone)]
pub struct Histogram {
    shift: u32,
    size: Vec<usize>,
    nitems: Vec<usize>,
}

impl Histogram {
    /// A histogram sized for a relation planned as `nbatches_plan` chunks.
    pub fn for_batches(nbatches_plan: u32) -> Self {
        let log2 = u64::from(nbatches_plan.max(1)).next_power_of_two().trailing_zeros();
        let bits = (log2 + 4).clamp(MIN_HGRAM_BITS, MAX_HGRAM_BITS);
        let width = 1usize << bits;
        Self {
            shift: 32 - bits,
            size: vec![0; width],
            nitems: vec![0; width],
        }
    }

    pub fn width(&self) -> usize {
        self.size.len()
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn bucket_of(&self, hash: u32) -> usize {
        (hash >> self.shift) as usize
    }

    pub fn record(&mut self, hash: u32, consumption: usize) {
        let b = self.bucket_of(hash);
        self.size[b] += consumption;
        self.nitems[b] += 1;
    }

    pub fn total_size(&self) -> usize {
        self.size.iter().sum()
    }

    pub fn total_nitems(&self) -> usize {
        self.nitems.iter().sum()
    }

    pub fn clear(&mut self) {
        self.size.iter_mut().for_each(|s| *s = 0);
        self.nitems.iter_mut().for_each(|n| *n = 0);
    }

    /// Group buckets into ranges of at most `limit` bytes each.
    ///
    /// Fails when one bucket alone exceeds the limit, since rows of one hash
    /// bucket cannot be divided without breaking the outer-join map.
    pub fn plan_ranges(&self, limit: usize) -> Result<Vec<HashRange>> {
        let mut ranges = Vec::new();
        let mut start = 0usize;
        let mut curr = 0usize;
        let mut count = 0usize;
        for i in 0..self.width() {
            if curr + self.size[i] > limit {
                if curr == 0 {
                    return Err(Error::PartitionImpossible {
                        size: self.size[i],
                        limit,
                    });
                }
                ranges.push(self.range(start, i, count, curr));
                start = i;
                curr = 0;
                count = 0;
            }
            curr += self.size[i];
            count += self.nitems[i];
        }
        ranges.push(self.range(start, self.width(), count, curr));
        Ok(ranges)
    }

    fn range(&self, start: usize, end: usize, nitems: usize, usage: usize) -> HashRange {
        let hash_min = ((start as u64) << self.shift) as u32;
        let hash_max = (((end as u64) << self.shift) - 1).min(u32::MAX as u64) as u32;
        HashRange {
            hash_min,
            hash_max,
            nitems,
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_in(h: &Histogram, bucket: u32) -> u32 {
        (bucket << h.shift()) | 0x12
    }

    #[test]
    fn test_single_range_covers_hash_space() {
        let mut h = Histogram::for_batches(1);
        h.record(hash_in(&h, 3), 100);
        h.record(hash_in(&h, 200), 100);
        let ranges = h.plan_ranges(1000).expect("ranges");
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].hash_min, ranges[0].hash_max), (0, u32::MAX));
        assert_eq!(ranges[0].nitems, 2);
        assert_eq!(h.total_size(), 200);
    }

    #[test]
    fn test_ranges_are_contiguous_and_bounded() {
        let mut h = Histogram::for_batches(1);
        for b in 0..8u32 {
            h.record(hash_in(&h, b * 32), 400);
        }
        let ranges = h.plan_ranges(1000).expect("ranges");
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].hash_min, 0);
        assert_eq!(ranges.last().map(|r| r.hash_max), Some(u32::MAX));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].hash_max as u64 + 1, pair[1].hash_min as u64);
        }
        assert!(ranges.iter().all(|r| r.usage <= 1000));
        assert_eq!(ranges.iter().map(|r| r.nitems).sum::<usize>(), 8);
        let owners = |hash: u32| {
            ranges
                .iter()
                .filter(|r| r.hash_min <= hash && hash <= r.hash_max)
                .count()
        };
        assert_eq!(owners(hash_in(&h, 96)), 1);
        assert_eq!(owners(u32::MAX), 1);
    }

    #[test]
    fn test_oversized_bucket_is_impossible() {
        let mut h = Histogram::for_batches(1);
        h.record(hash_in(&h, 7), 600);
        h.record(hash_in(&h, 7), 600);
        assert!(matches!(
            h.plan_ranges(1000),
            Err(Error::PartitionImpossible { size: 1200, limit: 1000 })
        ));
    }

    #[test]
    fn test_width_follows_planned_batches() {
        assert_eq!(Histogram::for_batches(1).width(), 256);
        assert_eq!(Histogram::for_batches(16).width(), 256);
        assert_eq!(Histogram::for_batches(64).width(), 1024);
        assert_eq!(Histogram::for_batches(100).width(), 2048);
        assert_eq!(Histogram::for_batches(u32::MAX).width(), 1 << MAX_HGRAM_BITS);
        assert_eq!(Histogram::for_batches(64).shift(), 22);
    }

    #[test]
    fn test_finer_buckets_split_what_coarse_ones_cannot() {
        // Two hashes sharing a coarse bucket but not a fine one.
        let a = 0x0010_0000u32;
        let b = 0x00f0_0000u32;
        let mut coarse = Histogram::for_batches(1);
        coarse.record(a, 600);
        coarse.record(b, 600);
        assert!(coarse.plan_ranges(1000).is_err());

        let mut fine = Histogram::for_batches(256);
        fine.record(a, 600);
        fine.record(b, 600);
        let ranges = fine.plan_ranges(1000).expect("ranges");
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].hash_max < b && a <= ranges[0].hash_max);
    }
}
