//! Bitonic sorting network over an index array.
//!
//! Work is split the way the device kernels split it: a workgroup of
//! `block` entries sorts its own slice in local memory (`Local`), distances
//! larger than one workgroup are handled by separate `Step` launches that
//! each compare entries at one fixed stride, and once the distance fits a
//! workgroup again a `Merge` launch finishes every slice locally.
//!
//! The network uses the flip form of the first comparison of every stage
//! (entry `i` against the mirrored entry of the other half), so every
//! comparator orders ascending and no direction flag is needed. Sizes that
//! are not a power of two behave as if padded with entries greater than
//! every real one; comparisons that reach past the end are skipped.

use std::cmp::Ordering;

/// One launch of the host-driven schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPass {
    /// Full sort of every `block`-sized slice.
    Local { block: usize },
    /// One global compare-and-swap round at half-distance `unitsz / 2`.
    /// `reversing` selects the flip comparison that opens a stage.
    Step { unitsz: usize, reversing: bool },
    /// Half-cleaner rounds from distance `block / 2` down to 1 in every
    /// slice.
    Merge { block: usize },
}

/// The launches that sort `nitems` entries with workgroups of `block`
/// entries. `block` is rounded up to a power of two.
pub fn schedule(nitems: usize, block: usize) -> Vec<SortPass> {
    let block = block.max(2).next_power_of_two();
    if nitems < 2 {
        return Vec::new();
    }
    let mut passes = vec![SortPass::Local { block }];
    let total = nitems.next_power_of_two();
    let mut unitsz = block * 2;
    while unitsz <= total {
        passes.push(SortPass::Step {
            unitsz,
            reversing: true,
        });
        let mut u = unitsz / 2;
        while u > block {
            passes.push(SortPass::Step {
                unitsz: u,
                reversing: false,
            });
            u /= 2;
        }
        passes.push(SortPass::Merge { block });
        unitsz *= 2;
    }
    passes
}

fn compare_swap<F>(index: &mut [u32], lo: usize, hi: usize, cmp: &F)
where
    F: Fn(u32, u32) -> Ordering,
{
    if hi < index.len() && cmp(index[lo], index[hi]) == Ordering::Greater {
        index.swap(lo, hi);
    }
}

/// One compare-and-swap round over all of `index`.
fn round<F>(index: &mut [u32], unitsz: usize, reversing: bool, cmp: &F)
where
    F: Fn(u32, u32) -> Ordering,
{
    let half = unitsz / 2;
    let n = index.len();
    let mut start = 0;
    while start < n {
        for k in 0..half {
            let lo = start + k;
            if lo >= n {
                break;
            }
            let hi = if reversing {
                start + unitsz - 1 - k
            } else {
                lo + half
            };
            compare_swap(index, lo, hi, cmp);
        }
        start += unitsz;
    }
}

/// Half-cleaner rounds `unitsz, unitsz/2, .., 2` inside each slice of
/// `block` entries.
fn merge_local<F>(index: &mut [u32], block: usize, from: usize, cmp: &F)
where
    F: Fn(u32, u32) -> Ordering,
{
    for slice in index.chunks_mut(block) {
        let mut u = from;
        while u >= 2 {
            round(slice, u, false, cmp);
            u /= 2;
        }
    }
}

/// Execute one launch of the schedule.
pub fn run_pass<F>(index: &mut [u32], pass: SortPass, cmp: &F)
where
    F: Fn(u32, u32) -> Ordering,
{
    match pass {
        SortPass::Local { block } => {
            for slice in index.chunks_mut(block) {
                let mut unitsz = 2;
                while unitsz <= block {
                    round(slice, unitsz, true, cmp);
                    let mut u = unitsz / 2;
                    while u >= 2 {
                        round(slice, u, false, cmp);
                        u /= 2;
                    }
                    unitsz *= 2;
                }
            }
        }
        SortPass::Step { unitsz, reversing } => round(index, unitsz, reversing, cmp),
        SortPass::Merge { block } => merge_local(index, block, block, cmp),
    }
}

/// Sort `index` ascending by `cmp`; returns the number of launches used.
pub fn bitonic_sort<F>(index: &mut [u32], block: usize, cmp: F) -> usize
where
    F: Fn(u32, u32) -> Ordering,
{
    let passes = schedule(index.len(), block);
    for pass in &passes {
        tracing::trace!(?pass, nitems = index.len(), "bitonic pass");
        run_pass(index, *pass, &cmp);
    }
    passes.len()
}
