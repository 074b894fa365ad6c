//! Selectivity statistics and result-buffer sizing.
//!
//! Every task gets two result-index buffers (the ping-pong pair the depth
//! kernels read from and write to) and one destination chunk. Their sizes
//! come from the planner's row ratios blended with what completed tasks
//! actually produced. When a projected buffer would exceed the per-chunk
//! ceiling, the task processes fewer outer rows instead; the remainder runs
//! as a continuation.

use serde::Serialize;

use gpujoin_core::config::JoinConfig;
use gpujoin_core::join::ResultFormat;
use gpujoin_planner::JoinPlan;

use crate::error::{Error, Result};
use crate::layout::{align8, resultbuf_len, slot_image_len, task_head_len, KDS_HEAD_LEN};

/// Rows observed so far across completed tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    /// Outer rows processed.
    pub source_nitems: u64,
    /// Rows surviving each depth; index 0 counts outer rows passing the
    /// outer quals.
    pub outer_nitems: Vec<u64>,
}

impl RunStats {
    pub fn new(num_rels: usize) -> Self {
        Self {
            source_nitems: 0,
            outer_nitems: vec![0; num_rels + 1],
        }
    }

    pub fn record(&mut self, processed: usize, outer_nitems: &[u64]) {
        self.source_nitems += processed as u64;
        for (acc, n) in self.outer_nitems.iter_mut().zip(outer_nitems) {
            *acc += n;
        }
    }

    /// Observed rows per outer row at `depth`, if anything was processed.
    pub fn observed_ratio(&self, depth: usize) -> Option<f64> {
        if self.source_nitems == 0 {
            return None;
        }
        let n = self.outer_nitems.get(depth).copied().unwrap_or(0);
        Some(n as f64 / self.source_nitems as f64)
    }
}

/// Blend a planned ratio with an observed one.
///
/// Observation counts for nothing with zero rows seen and for everything
/// once `trust * outer_plan_rows` rows were seen; the weight grows linearly
/// in between.
pub fn blend(
    planned: f64,
    observed: f64,
    source_nitems: u64,
    outer_plan_rows: f64,
    trust: f64,
) -> f64 {
    if source_nitems == 0 {
        return planned;
    }
    let threshold = outer_plan_rows * trust;
    if threshold <= 0.0 || source_nitems as f64 >= threshold {
        return observed;
    }
    let w = source_nitems as f64 / threshold;
    planned * (1.0 - w) + observed * w
}

/// What a task that overflowed reported about the space it needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RetryObservation {
    /// Outer rows (or estimated emitted rows) the attempt covered.
    pub oitems: usize,
    /// Result-index slots the widest depth needed.
    pub max_items: u64,
    /// Destination rows needed, when the destination overflowed.
    pub dst_nitems: u64,
    /// Destination tuple bytes needed, when the destination overflowed.
    pub dst_usage: u64,
}

/// Sizes chosen for one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultBufferPlan {
    pub oitems_nums: usize,
    pub kresults_ratio: f64,
    pub dst_ratio: f64,
    /// Slots of each result-index buffer.
    pub total_items: usize,
    pub dst_format: ResultFormat,
    pub dst_length: usize,
    pub dst_nrooms: usize,
}

impl ResultBufferPlan {
    /// Device bytes one attempt will allocate besides its source chunk.
    pub fn buffer_bytes(&self, num_rels: usize) -> usize {
        task_head_len(num_rels) + 2 * resultbuf_len(self.total_items) + align8(self.dst_length)
    }
}

/// Computes [`ResultBufferPlan`]s for one query.
#[derive(Debug, Clone)]
pub struct Sizer {
    chunk_size: usize,
    chunk_size_limit: usize,
    margin: f64,
    trust: f64,
    max_alloc: usize,
}

fn slots(ratio: f64, nitems: usize, margin: f64) -> usize {
    (ratio * nitems as f64 * margin - 1e-6).ceil().max(0.0) as usize
}

impl Sizer {
    pub fn new(config: &JoinConfig, max_alloc: usize) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_size_limit: config.chunk_size_limit,
            margin: config.chunk_size_margin,
            trust: config.observed_trust_fraction,
            max_alloc,
        }
    }

    /// Blended rows per outer row surviving `depth`.
    pub fn depth_ratio(&self, plan: &JoinPlan, stats: &RunStats, depth: usize) -> f64 {
        let planned = if depth == 0 {
            plan.outer_ratio
        } else {
            plan.depth(depth).nrows_ratio
        };
        match stats.observed_ratio(depth) {
            Some(observed) => blend(
                planned,
                observed,
                stats.source_nitems,
                plan.outer_plan_rows,
                self.trust,
            ),
            None => planned,
        }
    }

    /// Blended result-index slots per outer row: the widest depth, each
    /// combination taking one slot per participating relation.
    pub fn kresults_ratio(&self, plan: &JoinPlan, stats: &RunStats) -> f64 {
        (0..=plan.num_rels())
            .map(|d| (d + 1) as f64 * self.depth_ratio(plan, stats, d))
            .fold(0.0, f64::max)
    }

    /// Sizes for a task over `oitems` outer rows. `retry` carries the
    /// previous attempt on the same range and what it observed.
    pub fn plan_outer(
        &self,
        plan: &JoinPlan,
        stats: &RunStats,
        oitems: usize,
        retry: Option<(&ResultBufferPlan, &RetryObservation)>,
    ) -> Result<ResultBufferPlan> {
        let mut kr = self.kresults_ratio(plan, stats);
        let mut dst_ratio = self.depth_ratio(plan, stats, plan.num_rels());
        apply_retry(&mut kr, &mut dst_ratio, retry);
        self.finish(plan, oitems.max(1), kr, dst_ratio, retry, false)
    }

    /// Sizes for the outer-join-only task, with `ntuples` estimated
    /// emitted rows as its basis.
    pub fn plan_outer_join(
        &self,
        plan: &JoinPlan,
        ntuples: usize,
        retry: Option<(&ResultBufferPlan, &RetryObservation)>,
    ) -> Result<ResultBufferPlan> {
        let mut kr = (plan.num_rels() + 1) as f64;
        let mut dst_ratio = 1.0;
        apply_retry(&mut kr, &mut dst_ratio, retry);
        self.finish(plan, ntuples.max(1), kr, dst_ratio, retry, true)
    }

    fn finish(
        &self,
        plan: &JoinPlan,
        mut oitems: usize,
        kr: f64,
        dst_ratio: f64,
        retry: Option<(&ResultBufferPlan, &RetryObservation)>,
        outer_join: bool,
    ) -> Result<ResultBufferPlan> {
        let num_rels = plan.num_rels();
        let head = task_head_len(num_rels);
        let mut total_items = slots(kr, oitems, self.margin).max(num_rels + 1);
        if let Some((prev, obs)) = retry {
            if obs.oitems == oitems {
                total_items = total_items.max(prev.total_items);
            }
        }

        if !outer_join && head + 2 * resultbuf_len(total_items) > self.chunk_size {
            let half = (self.chunk_size.saturating_sub(head) / 2) & !7;
            let reduced = half.saturating_sub(16) / 4;
            let nitems = (oitems as f64 * reduced as f64 / total_items as f64) as usize;
            if nitems < 1 {
                return Err(Error::Config(format!(
                    "Kresults growth ratio too large: {kr:.2} slots per outer row"
                )));
            }
            tracing::debug!(
                from = oitems,
                to = nitems,
                kresults_ratio = kr,
                "Reduction of outer ntuples to fit the result-index buffers"
            );
            oitems = nitems;
            total_items = reduced;
        }

        let (dst_length, dst_nrooms) = match plan.result_format {
            ResultFormat::Row => {
                self.size_row_dst(plan, &mut oitems, dst_ratio, retry, outer_join)?
            }
            ResultFormat::Slot => {
                self.size_slot_dst(plan, &mut oitems, dst_ratio, retry, outer_join)?
            }
        };

        let out = ResultBufferPlan {
            oitems_nums: oitems,
            kresults_ratio: kr,
            dst_ratio,
            total_items,
            dst_format: plan.result_format,
            dst_length,
            dst_nrooms,
        };
        if out.buffer_bytes(num_rels) > self.max_alloc {
            return Err(Error::Config(format!(
                "a task needs {} bytes of device memory, above the {} byte allocation limit",
                out.buffer_bytes(num_rels),
                self.max_alloc
            )));
        }
        Ok(out)
    }

    fn size_row_dst(
        &self,
        plan: &JoinPlan,
        oitems: &mut usize,
        dst_ratio: f64,
        retry: Option<(&ResultBufferPlan, &RetryObservation)>,
        outer_join: bool,
    ) -> Result<(usize, usize)> {
        let observed_width = retry
            .map(|(_, obs)| obs)
            .filter(|obs| obs.dst_nitems > 0)
            .map(|obs| align8(obs.dst_usage.div_ceil(obs.dst_nitems) as usize));
        let width = observed_width.unwrap_or_else(|| align8(8 + plan.estimated_result_width()));
        let per_row = 4 + width;

        let nrows = slots(dst_ratio, *oitems, self.margin);
        let mut length = (KDS_HEAD_LEN + nrows * per_row + 8).max(self.chunk_size / 4);
        if let Some((prev, obs)) = retry {
            if obs.oitems == *oitems {
                length = length.max(prev.dst_length);
                if obs.dst_nitems > 0 {
                    let needed = KDS_HEAD_LEN
                        + align8(4 * obs.dst_nitems as usize)
                        + obs.dst_usage as usize;
                    length = length.max(needed);
                }
            }
        }

        if !outer_join && length > self.chunk_size_limit && *oitems > 1 {
            let room = self.chunk_size_limit - KDS_HEAD_LEN - 8;
            let scaled = (*oitems as f64 * room as f64 / (length - KDS_HEAD_LEN - 8) as f64) as usize;
            let nitems = scaled.max(1);
            tracing::debug!(
                from = *oitems,
                to = nitems,
                dst_length = length,
                "Reduction of outer ntuples to fit the destination chunk"
            );
            *oitems = nitems;
            length = self.chunk_size_limit;
        }
        Ok((length, u32::MAX as usize))
    }

    fn size_slot_dst(
        &self,
        plan: &JoinPlan,
        oitems: &mut usize,
        dst_ratio: f64,
        retry: Option<(&ResultBufferPlan, &RetryObservation)>,
        outer_join: bool,
    ) -> Result<(usize, usize)> {
        let ncols = plan.projection.len();
        if ncols == 0 {
            return Ok((KDS_HEAD_LEN, i32::MAX as usize));
        }
        let row_len = ncols * crate::layout::SLOT_ENTRY_LEN;
        let mut nrooms = slots(dst_ratio, *oitems, self.margin);
        if let Some((prev, obs)) = retry {
            if obs.oitems == *oitems {
                nrooms = nrooms.max(prev.dst_nrooms).max(obs.dst_nitems as usize);
            }
        }
        let floor = self.chunk_size / 4;
        if slot_image_len(nrooms, ncols) < floor {
            nrooms = (floor - KDS_HEAD_LEN) / row_len;
        }
        let limit_rooms = (self.chunk_size_limit - KDS_HEAD_LEN) / row_len;
        if !outer_join && nrooms > limit_rooms && *oitems > 1 {
            let nitems = ((*oitems as f64 * limit_rooms as f64 / nrooms as f64) as usize).max(1);
            tracing::debug!(
                from = *oitems,
                to = nitems,
                nrooms,
                "Reduction of outer ntuples to fit the destination slots"
            );
            *oitems = nitems;
            nrooms = limit_rooms;
        }
        Ok((slot_image_len(nrooms, ncols), nrooms))
    }
}

fn apply_retry(
    kr: &mut f64,
    dst_ratio: &mut f64,
    retry: Option<(&ResultBufferPlan, &RetryObservation)>,
) {
    if let Some((prev, obs)) = retry {
        if obs.oitems > 0 {
            *kr = kr.max(obs.max_items as f64 / obs.oitems as f64);
            *dst_ratio = dst_ratio.max(obs.dst_nitems as f64 / obs.oitems as f64);
        }
        *kr = kr.max(prev.kresults_ratio);
        *dst_ratio = dst_ratio.max(prev.dst_ratio);
    }
}

/// Estimated rows the outer-join-only pass emits.
///
/// `emitting` flags, per depth, the RIGHT/FULL chunks whose unmatched rows
/// this pass produces. Those rows are counted in full from the first such
/// depth on, and carried through the later depths by their blended step
/// ratios.
pub fn compute_outer_ntuples_oj(
    sizer: &Sizer,
    plan: &JoinPlan,
    stats: &RunStats,
    inner_nitems: &[usize],
    emitting: &[bool],
) -> usize {
    let emits = |d: usize| emitting.get(d - 1).copied().unwrap_or(false);
    let Some(start) = (1..=plan.num_rels()).find(|d| emits(*d)) else {
        return 1;
    };
    let mut ntuples = 0.0f64;
    for d in start..=plan.num_rels() {
        if d > start {
            let prev = sizer.depth_ratio(plan, stats, d - 1);
            let step = if prev > 0.0 {
                sizer.depth_ratio(plan, stats, d) / prev
            } else {
                1.0
            };
            let step = if plan.depth(d).join_type.is_left_outer() {
                step.max(1.0)
            } else {
                step
            };
            ntuples *= step;
        }
        if emits(d) {
            ntuples += inner_nitems.get(d - 1).copied().unwrap_or(0) as f64;
        }
    }
    (ntuples.ceil() as usize).max(1)
}
