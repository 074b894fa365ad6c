//! Inner preloading: every inner relation is read once into bounded chunks.
//!
//! Rows are pulled round-robin, one per depth, and counted against a shared
//! budget of half the device allocation limit. The first time the budget is
//! exceeded, each depth's chunk limit is frozen at what it holds so far;
//! from then on a depth starts a new chunk whenever its current one would
//! pass that limit. The chunks selected by each depth's cursor form one
//! window, and windows are enumerated like a mixed-radix counter with the
//! last depth turning fastest.
//!
//! A RIGHT/FULL chunk's match flags only depend on the shallower depths, so
//! they are complete once every shallower depth has reached its last chunk.
//! From then on each window over that chunk emits its unmatched rows,
//! joined with that window's deeper chunks; earlier windows only record
//! matches, which are kept here per chunk between windows.
//!
//! INNER and RIGHT hash depths may be split in arrival order. LEFT and FULL
//! hash depths must be split by hash range, so once such a depth overflows
//! its rows go to a tuple spill and are redistributed from the histogram
//! after the relation is exhausted.

use std::sync::Arc;

use gpujoin_core::hash::hash_join_key;
use gpujoin_core::id::{IdGen, SpillId};
use gpujoin_core::join::{JoinMethod, JoinType};
use gpujoin_core::source::RowSource;
use gpujoin_core::types::{Row, Scalar};
use gpujoin_mem::{SpillManager, TupleSpill};
use gpujoin_planner::{DepthPlan, HashKey, JoinPlan};

use crate::chunk::ColumnarChunk;
use crate::error::{Error, Result};
use crate::histogram::{HashRange, Histogram};
use crate::layout::{hash_image_len, mrb_head_len, KDS_HEAD_LEN};

/// Per-depth slack kept out of the inner budget.
const DEPTH_SLACK: usize = 8192;
/// Slots of the single chunk standing in for an empty relation.
const EMPTY_NSLOTS: usize = 4;

static NULL: Scalar = Scalar::Null;

/// Preload state of one depth.
#[derive(Debug)]
pub struct InnerPartitionState {
    pub depth: usize,
    pub join_type: JoinType,
    pub method: JoinMethod,
    pub pds_list: Vec<Arc<ColumnarChunk>>,
    pub pds_index: usize,
    /// Frozen byte limit of one chunk; 0 while unbounded.
    pub pds_limit: usize,
    /// Rows read from the relation.
    pub nrows: u64,
    ncols: usize,
    keys: Vec<HashKey>,
    first_length: usize,
    first_nslots: usize,
    consumed: usize,
    current: Option<ColumnarChunk>,
    histogram: Option<Histogram>,
    spill: Option<TupleSpill>,
    /// Match flags per chunk, saved between windows of a RIGHT/FULL depth.
    matched: Vec<Option<Arc<[u8]>>>,
}

impl InnerPartitionState {
    fn new(depth: usize, dp: &DepthPlan, chunk_size: usize) -> Self {
        let hash_split = dp.method == JoinMethod::Hash && dp.join_type.needs_hash_partitioning();
        Self {
            depth,
            join_type: dp.join_type,
            method: dp.method,
            pds_list: Vec::new(),
            pds_index: 0,
            pds_limit: 0,
            nrows: 0,
            ncols: dp.inner_schema.len(),
            keys: dp.hash_keys.clone(),
            first_length: dp.ichunk_size.max(chunk_size / 4),
            first_nslots: dp.hash_nslots.max(1),
            consumed: 0,
            current: None,
            histogram: hash_split.then(|| Histogram::for_batches(dp.nbatches_plan)),
            spill: None,
            matched: Vec::new(),
        }
    }

    fn is_hash(&self) -> bool {
        self.method == JoinMethod::Hash
    }

    fn hash_of(&self, row: &[Scalar]) -> u32 {
        hash_join_key(
            self.keys
                .iter()
                .map(|k| row.get(k.inner_column).unwrap_or(&NULL)),
        )
    }

    fn consumption(&self, row: &[Scalar]) -> usize {
        if self.is_hash() {
            ColumnarChunk::hash_consumption(row)
        } else {
            ColumnarChunk::tuple_consumption(row)
        }
    }

    fn fresh_chunk(&self, nslots: usize) -> ColumnarChunk {
        if self.is_hash() {
            ColumnarChunk::new_hash(self.ncols, self.first_length, nslots)
        } else {
            ColumnarChunk::new_row(self.ncols, self.first_length)
        }
    }

    /// Freeze the chunk limit at the current consumption.
    fn freeze(&mut self, fallback: usize) {
        if self.pds_limit == 0 {
            self.pds_limit = if self.consumed > 0 {
                self.consumed
            } else {
                fallback
            };
        }
    }

    /// Items in the relation so far, chunks already closed included.
    pub fn nitems(&self) -> usize {
        self.pds_list.iter().map(|c| c.nitems()).sum::<usize>()
            + self.current.as_ref().map_or(0, |c| c.nitems())
    }

    pub fn nbatches_exec(&self) -> usize {
        self.pds_list.len()
    }

    /// Chunk of the current window.
    pub fn current_chunk(&self) -> Option<&Arc<ColumnarChunk>> {
        self.pds_list.get(self.pds_index)
    }

    fn close_current(&mut self) {
        if let Some(mut chunk) = self.current.take() {
            chunk.shrink();
            self.pds_list.push(Arc::new(chunk));
        }
        self.consumed = 0;
    }

    fn push_row(&mut self, row: Row, consumption: usize, ctx: &SpillContext<'_>) -> Result<()> {
        self.nrows += 1;
        if !self.is_hash() {
            if self.pds_limit > 0
                && self.pds_limit < self.consumed + consumption
                && self.current.as_ref().is_some_and(|c| !c.is_empty())
            {
                self.close_current();
            }
            let fresh = self.fresh_chunk(0);
            let chunk = self.current.get_or_insert(fresh);
            insert_tuple_growing(chunk, row);
            self.consumed += consumption;
            return Ok(());
        }

        let hash = self.hash_of(&row);
        if let Some(h) = self.histogram.as_mut() {
            h.record(hash, consumption);
            if let Some(spill) = self.spill.as_mut() {
                spill.put(row)?;
                self.consumed += consumption;
                return Ok(());
            }
            if self.pds_limit > 0 && self.pds_limit < self.consumed + consumption {
                let mut spill = TupleSpill::new(Arc::clone(ctx.manager), ctx.next_id(), ctx.batch_rows);
                if let Some(staged) = self.current.take() {
                    for r in staged.into_rows() {
                        spill.put(r)?;
                    }
                }
                spill.put(row)?;
                tracing::debug!(
                    depth = self.depth,
                    rows = spill.len(),
                    pds_limit = self.pds_limit,
                    "inner relation spilled for hash partitioning"
                );
                self.spill = Some(spill);
                self.consumed += consumption;
                return Ok(());
            }
        } else if self.pds_limit > 0
            && self.pds_limit < self.consumed + consumption
            && self.current.as_ref().is_some_and(|c| !c.is_empty())
        {
            let prev = self.current.as_ref().map_or(0, |c| c.nitems());
            self.close_current();
            let nslots = (prev as f64 * ctx.margin) as usize;
            self.current = Some(self.fresh_chunk(nslots.max(1)));
        }
        let margin = ctx.margin;
        let fresh = self.fresh_chunk(self.first_nslots);
        let chunk = self.current.get_or_insert(fresh);
        insert_hash_growing(chunk, row, hash, margin);
        self.consumed += consumption;
        Ok(())
    }

    fn finish(&mut self, margin: f64) -> Result<()> {
        if let Some(spill) = self.spill.take() {
            let Some(histogram) = self.histogram.as_ref() else {
                return Err(Error::Invariant("spilled depth has no histogram".into()));
            };
            let ranges = histogram.plan_ranges(self.pds_limit)?;
            let mut chunks = range_chunks(&ranges, self.ncols, margin);
            let mut reader = spill.finish()?;
            while let Some(row) = reader.next_row()? {
                let hash = self.hash_of(&row);
                let idx = ranges
                    .partition_point(|r| r.hash_max < hash)
                    .min(chunks.len() - 1);
                insert_hash_growing(&mut chunks[idx], row, hash, margin);
            }
            tracing::debug!(
                depth = self.depth,
                nbatches = chunks.len(),
                "inner relation split by hash range"
            );
            for mut chunk in chunks {
                chunk.shrink();
                self.pds_list.push(Arc::new(chunk));
            }
        } else if self.current.as_ref().is_some_and(|c| !c.is_empty()) || self.pds_list.is_empty() {
            if self.current.is_none() {
                self.current = Some(self.fresh_chunk(EMPTY_NSLOTS));
            }
            self.close_current();
        }
        self.current = None;
        self.consumed = 0;
        self.matched = vec![None; self.pds_list.len()];
        Ok(())
    }

    /// Flags saved for the chunk of the current window.
    pub fn matched_map(&self) -> Option<&Arc<[u8]>> {
        self.matched.get(self.pds_index).and_then(Option::as_ref)
    }

    fn reset(&mut self) {
        self.pds_list.clear();
        self.matched.clear();
        self.pds_index = 0;
        self.pds_limit = 0;
        self.nrows = 0;
        self.consumed = 0;
        self.current = None;
        self.spill = None;
        if let Some(h) = self.histogram.as_mut() {
            h.clear();
        }
    }
}

fn range_chunks(ranges: &[HashRange], ncols: usize, margin: f64) -> Vec<ColumnarChunk> {
    let last = ranges.len().saturating_sub(1);
    ranges
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let mut nslots = ((r.nitems as f64 * margin) as usize).max(r.nitems).max(1);
            if i == last {
                nslots = nslots.max(crate::chunk::MIN_FINAL_NSLOTS);
            }
            let length = hash_image_len(nslots, r.nitems, r.usage);
            let mut chunk = ColumnarChunk::new_hash(ncols, length, nslots);
            chunk.set_hash_range(r.hash_min, r.hash_max);
            chunk
        })
        .collect()
}

fn insert_tuple_growing(chunk: &mut ColumnarChunk, mut row: Row) {
    loop {
        match chunk.insert_tuple(row) {
            Ok(()) => return,
            Err(back) => {
                row = back;
                let length = (chunk.length() * 2).max(KDS_HEAD_LEN * 2);
                chunk.expand(length, 0);
            }
        }
    }
}

fn insert_hash_growing(chunk: &mut ColumnarChunk, mut row: Row, hash: u32, margin: f64) {
    loop {
        match chunk.insert_hashitem(row, hash) {
            Ok(()) => return,
            Err(back) => {
                row = back;
                let nitems = chunk.nitems().max(1);
                let nslots = ((margin * 2.0 * nitems as f64) as usize).max(chunk.nslots() + 1);
                let length = (chunk.length() * 2).max(KDS_HEAD_LEN * 2);
                chunk.expand(length, nslots);
            }
        }
    }
}

struct SpillContext<'a> {
    manager: &'a Arc<SpillManager>,
    ids: &'a IdGen,
    batch_rows: usize,
    margin: f64,
}

impl SpillContext<'_> {
    fn next_id(&self) -> SpillId {
        SpillId::new(self.ids.next_raw())
    }
}

/// Loads every inner relation and enumerates the windows over its chunks.
pub struct InnerPreloader {
    sources: Vec<Box<dyn RowSource>>,
    depths: Vec<InnerPartitionState>,
    total_limit: usize,
    margin: f64,
    spill: Arc<SpillManager>,
    spill_batch_rows: usize,
    spill_ids: IdGen,
    loaded: bool,
}

impl InnerPreloader {
    pub fn new(
        plan: &JoinPlan,
        sources: Vec<Box<dyn RowSource>>,
        max_alloc: usize,
        chunk_size: usize,
        margin: f64,
        spill: Arc<SpillManager>,
        spill_batch_rows: usize,
    ) -> Result<Self> {
        if sources.len() != plan.num_rels() {
            return Err(Error::Config(format!(
                "{} inner sources for {} join depths",
                sources.len(),
                plan.num_rels()
            )));
        }
        let total_limit = (max_alloc / 2).saturating_sub(DEPTH_SLACK * plan.num_rels());
        if total_limit <= mrb_head_len(plan.num_rels()) {
            return Err(Error::Config(format!(
                "device allocation limit of {max_alloc} bytes leaves no room for inner relations"
            )));
        }
        let depths = plan
            .depths
            .iter()
            .enumerate()
            .map(|(i, dp)| InnerPartitionState::new(i + 1, dp, chunk_size))
            .collect();
        Ok(Self {
            sources,
            depths,
            total_limit,
            margin,
            spill,
            spill_batch_rows,
            spill_ids: IdGen::new(),
            loaded: false,
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn total_limit(&self) -> usize {
        self.total_limit
    }

    pub fn depths(&self) -> &[InnerPartitionState] {
        &self.depths
    }

    /// Read every inner relation into chunks.
    pub fn preload(&mut self) -> Result<()> {
        let n = self.depths.len();
        let mut total_usage = mrb_head_len(n);
        let mut frozen = false;
        let mut active: Vec<usize> = (0..n).collect();
        let ctx = SpillContext {
            manager: &self.spill,
            ids: &self.spill_ids,
            batch_rows: self.spill_batch_rows,
            margin: self.margin,
        };
        while !active.is_empty() {
            let mut i = 0;
            while i < active.len() {
                let idx = active[i];
                let Some(row) = self.sources[idx].next_row()? else {
                    active.remove(i);
                    continue;
                };
                let consumption = self.depths[idx].consumption(&row);
                if consumption + KDS_HEAD_LEN + 8 > self.total_limit {
                    return Err(Error::PartitionImpossible {
                        size: consumption,
                        limit: self.total_limit,
                    });
                }
                if !frozen && total_usage + consumption > self.total_limit {
                    frozen = true;
                    let fallback = self.total_limit / n;
                    for st in self.depths.iter_mut() {
                        st.freeze(fallback);
                    }
                    tracing::debug!(
                        total_usage,
                        limit = self.total_limit,
                        "inner budget reached; chunk limits frozen"
                    );
                }
                total_usage += consumption;
                self.depths[idx].push_row(row, consumption, &ctx)?;
                i += 1;
            }
        }
        for st in self.depths.iter_mut() {
            st.finish(self.margin)?;
            tracing::debug!(
                depth = st.depth,
                nrows = st.nrows,
                nbatches = st.nbatches_exec(),
                pds_limit = st.pds_limit,
                "inner relation loaded"
            );
        }
        self.loaded = true;
        Ok(())
    }

    /// Windows over the loaded chunks.
    pub fn num_windows(&self) -> usize {
        self.depths.iter().map(|s| s.pds_list.len().max(1)).product()
    }

    /// Per depth: whether the current window's outer-join pass emits the
    /// unmatched rows of the depth's chunk. True for RIGHT/FULL depths all
    /// of whose shallower depths are at their last chunk.
    pub fn outer_join_depths(&self) -> Vec<bool> {
        let mut shallower_done = true;
        self.depths
            .iter()
            .map(|st| {
                let emit = shallower_done && st.join_type.is_right_outer();
                shallower_done &= st.pds_index + 1 >= st.pds_list.len();
                emit
            })
            .collect()
    }

    /// Match flags saved for the current window's chunks.
    pub fn matched_maps(&self) -> Vec<Option<Arc<[u8]>>> {
        self.depths.iter().map(|st| st.matched_map().cloned()).collect()
    }

    /// Save the flags of the current window's chunk at `depth` (1-indexed).
    pub fn store_matched(&mut self, depth: usize, flags: Vec<u8>) -> Result<()> {
        let st = depth
            .checked_sub(1)
            .and_then(|i| self.depths.get_mut(i))
            .ok_or_else(|| Error::Invariant(format!("no inner depth {depth}")))?;
        let nitems = st.current_chunk().map_or(0, |c| c.nitems());
        if flags.len() != nitems {
            return Err(Error::Invariant(format!(
                "{} match flags for chunk {} of depth {depth} with {nitems} rows",
                flags.len(),
                st.pds_index
            )));
        }
        let Some(slot) = st.matched.get_mut(st.pds_index) else {
            return Err(Error::Invariant(format!(
                "depth {depth} has no chunk {}",
                st.pds_index
            )));
        };
        *slot = Some(Arc::from(flags));
        Ok(())
    }

    /// Chunks of the current window, one per depth.
    pub fn current_chunks(&self) -> Result<Vec<Arc<ColumnarChunk>>> {
        self.depths
            .iter()
            .map(|st| {
                st.current_chunk().cloned().ok_or_else(|| {
                    Error::Invariant(format!("depth {} has no chunk {}", st.depth, st.pds_index))
                })
            })
            .collect()
    }

    pub fn window_cursor(&self) -> Vec<usize> {
        self.depths.iter().map(|s| s.pds_index).collect()
    }

    /// Step to the next window, last depth first. Returns false after the
    /// last window, with every cursor back at the first chunk.
    pub fn advance_window(&mut self) -> bool {
        for st in self.depths.iter_mut().rev() {
            if st.pds_index + 1 < st.pds_list.len() {
                st.pds_index += 1;
                return true;
            }
            st.pds_index = 0;
        }
        false
    }

    /// Replay the windows from the first one without reloading. Saved match
    /// flags belong to the previous scan and are dropped.
    pub fn rewind(&mut self) {
        for st in self.depths.iter_mut() {
            st.pds_index = 0;
            st.matched.iter_mut().for_each(|m| *m = None);
        }
    }

    /// Forget every chunk; the next preload reads the relations again.
    pub fn reset(&mut self) -> Result<()> {
        for st in self.depths.iter_mut() {
            st.reset();
        }
        for src in self.sources.iter_mut() {
            src.rewind()?;
        }
        self.loaded = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpujoin_core::schema::{DataType, Field, Schema};
    use gpujoin_core::source::VecSource;
    use gpujoin_io::MemoryStorage;
    use gpujoin_mem::Codec;
    use gpujoin_planner::{ColumnRef, ProjectionItem};

    fn depth_plan(join_type: JoinType, method: JoinMethod) -> DepthPlan {
        DepthPlan {
            join_type,
            method,
            inner_schema: Schema::new(vec![
                Field::new("k", DataType::Int64, false),
                Field::new("v", DataType::Utf8, true),
            ]),
            hash_keys: vec![HashKey {
                outer: ColumnRef::new(0, 0),
                inner_column: 0,
            }],
            join_quals: None,
            nrows_ratio: 1.0,
            ichunk_size: 1024,
            nbatches_plan: 1,
            hash_nslots: 16,
        }
    }

    fn plan(depths: Vec<DepthPlan>) -> JoinPlan {
        JoinPlan {
            outer_schema: Schema::new(vec![Field::new("k", DataType::Int64, false)]),
            depths,
            outer_quals: None,
            outer_ratio: 1.0,
            outer_plan_rows: 100.0,
            plan_rows: 100.0,
            projection: vec![ProjectionItem {
                name: "k".into(),
                source: ColumnRef::new(0, 0),
            }],
            result_format: Default::default(),
            result_width: 0,
        }
    }

    fn rows(n: i64) -> Vec<Row> {
        (0..n)
            .map(|i| vec![Scalar::I64(i), Scalar::Str(format!("{i:04}"))])
            .collect()
    }

    fn spill() -> Arc<SpillManager> {
        Arc::new(SpillManager::new(
            Arc::new(MemoryStorage::new()),
            Codec::None,
            "mem/inner-test",
        ))
    }

    /// Device allocation limit giving `rows` rows' worth of inner budget.
    fn max_alloc_for(p: &JoinPlan, rows: usize, per_row: usize) -> usize {
        2 * (mrb_head_len(p.num_rels()) + rows * per_row + DEPTH_SLACK * p.num_rels())
    }

    fn preloader(p: &JoinPlan, sources: Vec<Vec<Row>>, max_alloc: usize) -> InnerPreloader {
        let sources = sources
            .into_iter()
            .map(|r| Box::new(VecSource::new(r)) as Box<dyn RowSource>)
            .collect();
        InnerPreloader::new(p, sources, max_alloc, 4096, 1.25, spill(), 4).expect("preloader")
    }

    #[test]
    fn test_budget_splits_after_seventh_row() {
        let p = plan(vec![depth_plan(JoinType::Inner, JoinMethod::Hash)]);
        let per_row = ColumnarChunk::hash_consumption(&rows(1)[0]);
        let mut pre = preloader(&p, vec![rows(10)], max_alloc_for(&p, 7, per_row));
        pre.preload().expect("preload");
        let st = &pre.depths()[0];
        assert_eq!(st.pds_list.len(), 2);
        assert_eq!(st.pds_list[0].nitems(), 7);
        assert_eq!(st.pds_list[1].nitems(), 3);
        assert_eq!(st.pds_limit, 7 * per_row);
        assert_eq!(pre.num_windows(), 2);
    }

    #[test]
    fn test_single_window_without_freezing() {
        let p = plan(vec![
            depth_plan(JoinType::Inner, JoinMethod::Hash),
            depth_plan(JoinType::Inner, JoinMethod::NestLoop),
        ]);
        let mut pre = preloader(&p, vec![rows(5), rows(3)], 64 << 20);
        pre.preload().expect("preload");
        assert!(pre.depths().iter().all(|s| s.pds_limit == 0));
        assert_eq!(pre.num_windows(), 1);
        let chunks = pre.current_chunks().expect("chunks");
        assert_eq!(chunks[0].nitems(), 5);
        assert_eq!(chunks[1].nitems(), 3);
        assert!(!pre.advance_window());
    }

    #[test]
    fn test_empty_relation_gets_one_chunk() {
        let p = plan(vec![
            depth_plan(JoinType::Left, JoinMethod::Hash),
            depth_plan(JoinType::Inner, JoinMethod::NestLoop),
        ]);
        let mut pre = preloader(&p, vec![Vec::new(), Vec::new()], 64 << 20);
        pre.preload().expect("preload");
        for st in pre.depths() {
            assert_eq!(st.pds_list.len(), 1);
            assert!(st.pds_list[0].is_empty());
        }
        assert_eq!(pre.depths()[0].pds_list[0].nslots(), EMPTY_NSLOTS);
    }

    #[test]
    fn test_left_join_split_by_hash_range() {
        let p = plan(vec![depth_plan(JoinType::Left, JoinMethod::Hash)]);
        let data = rows(400);
        let per_row = ColumnarChunk::hash_consumption(&data[0]);
        let mut pre = preloader(&p, vec![data.clone()], max_alloc_for(&p, 150, per_row));
        pre.preload().expect("preload");
        let st = &pre.depths()[0];
        assert!(st.pds_list.len() >= 3);
        assert_eq!(st.pds_list.iter().map(|c| c.nitems()).sum::<usize>(), 400);
        for chunk in &st.pds_list {
            let (lo, hi) = chunk.hash_range();
            assert!(chunk.hashes().iter().all(|h| lo <= *h && *h <= hi));
        }
        let ranges: Vec<_> = st.pds_list.iter().map(|c| c.hash_range()).collect();
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().map(|r| r.1), Some(u32::MAX));
    }

    #[test]
    fn test_planned_batches_refine_hash_ranges() {
        // Keys whose hashes all share the top byte.
        let top = |k: i64| hash_join_key([Scalar::I64(k)].iter()) >> 24;
        let target = top(0);
        let data: Vec<Row> = (0..200_000i64)
            .filter(|k| top(*k) == target)
            .take(40)
            .map(|k| vec![Scalar::I64(k), Scalar::Str(format!("{k:08}"))])
            .collect();
        assert_eq!(data.len(), 40);
        let per_row = ColumnarChunk::hash_consumption(&data[0]);

        let coarse = plan(vec![depth_plan(JoinType::Left, JoinMethod::Hash)]);
        let max_alloc = max_alloc_for(&coarse, 20, per_row);
        let mut pre = preloader(&coarse, vec![data.clone()], max_alloc);
        assert!(matches!(
            pre.preload(),
            Err(Error::PartitionImpossible { .. })
        ));

        let mut dp = depth_plan(JoinType::Left, JoinMethod::Hash);
        dp.nbatches_plan = 4096;
        let fine = plan(vec![dp]);
        let mut pre = preloader(&fine, vec![data], max_alloc);
        pre.preload().expect("preload");
        let st = &pre.depths()[0];
        assert!(st.pds_list.len() >= 2);
        assert_eq!(st.pds_list.iter().map(|c| c.nitems()).sum::<usize>(), 40);
    }

    #[test]
    fn test_oversized_row_is_impossible() {
        let p = plan(vec![depth_plan(JoinType::Inner, JoinMethod::NestLoop)]);
        let big = vec![vec![Scalar::I64(1), Scalar::Str("x".repeat(64 << 10))]];
        let mut pre = preloader(&p, vec![big], 2 * (DEPTH_SLACK + (16 << 10)));
        assert!(matches!(
            pre.preload(),
            Err(Error::PartitionImpossible { .. })
        ));
    }

    #[test]
    fn test_odometer_turns_last_depth_first() {
        let p = plan(vec![
            depth_plan(JoinType::Inner, JoinMethod::Hash),
            depth_plan(JoinType::Inner, JoinMethod::Hash),
        ]);
        let per_row = ColumnarChunk::hash_consumption(&rows(1)[0]);
        // Budget reached while both depths hold two rows each.
        let mut pre = preloader(&p, vec![rows(6), rows(6)], max_alloc_for(&p, 4, per_row));
        pre.preload().expect("preload");
        let lens: Vec<usize> = pre.depths().iter().map(|s| s.pds_list.len()).collect();
        assert_eq!(lens, vec![3, 3]);
        let mut seen = vec![pre.window_cursor()];
        while pre.advance_window() {
            seen.push(pre.window_cursor());
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(seen[1], vec![0, 1]);
        assert_eq!(seen[3], vec![1, 0]);
        assert_eq!(seen[8], vec![2, 2]);
        assert_eq!(pre.window_cursor(), vec![0, 0]);
    }

    #[test]
    fn test_outer_join_depths_follow_the_cursor() {
        let p = plan(vec![
            depth_plan(JoinType::Right, JoinMethod::Hash),
            depth_plan(JoinType::Inner, JoinMethod::Hash),
            depth_plan(JoinType::Right, JoinMethod::Hash),
        ]);
        let per_row = ColumnarChunk::hash_consumption(&rows(1)[0]);
        // Budget reached while every depth holds two rows.
        let mut pre = preloader(
            &p,
            vec![rows(4), rows(4), rows(2)],
            max_alloc_for(&p, 6, per_row),
        );
        pre.preload().expect("preload");
        let lens: Vec<usize> = pre.depths().iter().map(|s| s.pds_list.len()).collect();
        assert_eq!(lens, vec![2, 2, 1]);

        let mut seen = Vec::new();
        loop {
            seen.push((pre.window_cursor(), pre.outer_join_depths()));
            if !pre.advance_window() {
                break;
            }
        }
        assert_eq!(seen.len(), 4);
        // Depth 1 emits in every window; depth 3 once depths 1 and 2 are
        // both at their last chunk.
        assert_eq!(seen[0], (vec![0, 0, 0], vec![true, false, false]));
        assert_eq!(seen[2], (vec![1, 0, 0], vec![true, false, false]));
        assert_eq!(seen[3], (vec![1, 1, 0], vec![true, false, true]));
    }

    #[test]
    fn test_match_flags_are_kept_per_chunk() {
        let p = plan(vec![
            depth_plan(JoinType::Inner, JoinMethod::Hash),
            depth_plan(JoinType::Right, JoinMethod::Hash),
        ]);
        let per_row = ColumnarChunk::hash_consumption(&rows(1)[0]);
        let mut pre = preloader(&p, vec![rows(6), rows(6)], max_alloc_for(&p, 4, per_row));
        pre.preload().expect("preload");
        assert_eq!(pre.num_windows(), 9);
        assert_eq!(pre.matched_maps(), vec![None, None]);

        let n = pre.current_chunks().expect("chunks")[1].nitems();
        let mut flags = vec![0u8; n];
        flags[0] = 1;
        pre.store_matched(2, flags.clone()).expect("store");
        assert!(pre.store_matched(2, vec![0; n + 1]).is_err());
        assert!(pre.store_matched(3, Vec::new()).is_err());

        // The next window moves depth 2 to another chunk.
        assert!(pre.advance_window());
        assert_eq!(pre.matched_maps()[1], None);
        // Three windows later depth 2 is back at its first chunk.
        for _ in 0..2 {
            assert!(pre.advance_window());
        }
        assert_eq!(pre.window_cursor(), vec![1, 0]);
        assert_eq!(pre.matched_maps()[1].as_deref(), Some(&flags[..]));

        pre.rewind();
        assert_eq!(pre.matched_maps(), vec![None, None]);
    }

    #[test]
    fn test_reset_reloads_from_sources() {
        let p = plan(vec![depth_plan(JoinType::Inner, JoinMethod::Hash)]);
        let mut pre = preloader(&p, vec![rows(5)], 64 << 20);
        pre.preload().expect("preload");
        pre.reset().expect("reset");
        assert!(!pre.is_loaded());
        pre.preload().expect("reload");
        assert_eq!(pre.depths()[0].pds_list[0].nitems(), 5);
    }
}
