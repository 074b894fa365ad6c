//! Reference implementation of the join program's device entry points.
//!
//! Every kernel shares one calling convention:
//!
//! | arg | value |
//! |---|---|
//! | 0 | task buffer (header + two result-index buffers) |
//! | 1 | multi-relations image |
//! | 2 | source chunk, or null for the outer-join-only pass |
//! | 3 | depth |
//! | 4 | index of the device within the multi-relations buffer |
//! | 5 | outer-join maps, or null |
//! | 6 | first source row of the task |
//! | 7 | number of source rows of the task |
//! | 8 | destination chunk, or null |
//!
//! A kernel does nothing once the task header carries an error. Overflow of
//! a result-index or destination buffer is reported through the header
//! (`ERR_NOSPACE` plus the failing depth) and never drops a combination
//! silently; undecodable input yields `ERR_CORRUPT`.

use std::sync::Arc;

use gpujoin_core::hash::hash_join_key;
use gpujoin_core::types::{Row, Scalar};
use gpujoin_device::{
    ArgsExt, DevicePtr, DeviceProgram, KernelArg, KernelFunction, KernelImpl, LaunchContext,
};
use gpujoin_planner::{ColumnRef, JoinPlan};

use crate::chunk::ColumnarChunk;
use crate::error::Result;
use crate::layout::{
    get_u32, mrb_head_len, ojmap_region_len, resultbuf_len, slot_ref, task_head_len, ChunkFormat, KdsHeader,
    KdsView, MrbHeader, ResultBuf, TaskHeader, ERR_CORRUPT, ERR_NOSPACE, ERR_SUCCESS,
    KDS_HEAD_LEN, SLOT_ENTRY_LEN, TASK_HEAD_FIXED_LEN,
};

pub const KERNEL_PREPARATION: &str = "gpujoin_preparation";
pub const KERNEL_EXEC_NESTLOOP: &str = "gpujoin_exec_nestloop";
pub const KERNEL_EXEC_HASHJOIN: &str = "gpujoin_exec_hashjoin";
pub const KERNEL_OUTER_NESTLOOP: &str = "gpujoin_outer_nestloop";
pub const KERNEL_OUTER_HASHJOIN: &str = "gpujoin_outer_hashjoin";
pub const KERNEL_PROJECTION_ROW: &str = "gpujoin_projection_row";
pub const KERNEL_PROJECTION_SLOT: &str = "gpujoin_projection_slot";

pub mod arg {
    pub const KGJOIN: usize = 0;
    pub const KMRELS: usize = 1;
    pub const SRC: usize = 2;
    pub const DEPTH: usize = 3;
    pub const CUDA_INDEX: usize = 4;
    pub const OJMAPS: usize = 5;
    pub const OITEMS_BASE: usize = 6;
    pub const OITEMS_NUMS: usize = 7;
    pub const DST: usize = 8;
}

static NULL: Scalar = Scalar::Null;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Preparation,
    NestLoop,
    HashJoin,
    OuterEmit,
    ProjectionRow,
    ProjectionSlot,
}

/// The join plan compiled into host-executed kernels.
pub struct ReferenceProgram {
    plan: Arc<JoinPlan>,
    fingerprint: String,
}

impl ReferenceProgram {
    pub fn compile(plan: Arc<JoinPlan>) -> Result<Self> {
        let fingerprint = plan.fingerprint()?.to_hex();
        tracing::debug!(%fingerprint, depths = plan.num_rels(), "join program compiled");
        Ok(Self { plan, fingerprint })
    }

    /// A copy of this program missing one entry point, for exercising
    /// configuration failures.
    pub fn without(self, name: &'static str) -> PartialProgram {
        PartialProgram {
            inner: self,
            missing: name,
        }
    }
}

impl DeviceProgram for ReferenceProgram {
    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    fn function(&self, name: &str) -> Option<KernelFunction> {
        let entry = match name {
            KERNEL_PREPARATION => Entry::Preparation,
            KERNEL_EXEC_NESTLOOP => Entry::NestLoop,
            KERNEL_EXEC_HASHJOIN => Entry::HashJoin,
            KERNEL_OUTER_NESTLOOP | KERNEL_OUTER_HASHJOIN => Entry::OuterEmit,
            KERNEL_PROJECTION_ROW => Entry::ProjectionRow,
            KERNEL_PROJECTION_SLOT => Entry::ProjectionSlot,
            _ => return None,
        };
        Some(KernelFunction::new(
            name,
            Arc::new(JoinKernel {
                plan: Arc::clone(&self.plan),
                entry,
            }),
        ))
    }
}

/// [`ReferenceProgram`] with one entry point removed.
pub struct PartialProgram {
    inner: ReferenceProgram,
    missing: &'static str,
}

impl DeviceProgram for PartialProgram {
    fn fingerprint(&self) -> String {
        self.inner.fingerprint()
    }

    fn function(&self, name: &str) -> Option<KernelFunction> {
        if name == self.missing {
            None
        } else {
            self.inner.function(name)
        }
    }
}

struct JoinKernel {
    plan: Arc<JoinPlan>,
    entry: Entry,
}

/// Decoded rows of every depth a combination may reference; index 0 holds
/// the source rows.
struct DepthRows {
    depths: Vec<Vec<Row>>,
}

impl DepthRows {
    fn column<'a>(&'a self, combo: &[u32], c: ColumnRef) -> Option<&'a Scalar> {
        let rowid = *combo.get(c.depth)? as usize;
        if rowid == 0 {
            return None;
        }
        self.depths.get(c.depth)?.get(rowid - 1)?.get(c.column)
    }
}

/// Device-side failure that is reported through the task header.
enum Abort {
    Corrupt(String),
    Device(gpujoin_device::Error),
}

impl From<gpujoin_device::Error> for Abort {
    fn from(e: gpujoin_device::Error) -> Self {
        Abort::Device(e)
    }
}

impl From<crate::error::Error> for Abort {
    fn from(e: crate::error::Error) -> Self {
        Abort::Corrupt(e.to_string())
    }
}

type KResult<T> = std::result::Result<T, Abort>;

/// Arguments common to every entry point.
struct Launch {
    kgjoin: DevicePtr,
    kmrels: DevicePtr,
    src: Option<DevicePtr>,
    depth: usize,
    cuda_index: usize,
    ojmaps: Option<DevicePtr>,
    oitems_base: usize,
    oitems_nums: usize,
    dst: Option<DevicePtr>,
}

impl Launch {
    fn parse(args: &[KernelArg]) -> gpujoin_device::Result<Self> {
        Ok(Self {
            kgjoin: args.ptr(arg::KGJOIN)?,
            kmrels: args.ptr(arg::KMRELS)?,
            src: args.opt_ptr(arg::SRC)?,
            depth: args.u32(arg::DEPTH)? as usize,
            cuda_index: args.u32(arg::CUDA_INDEX)? as usize,
            ojmaps: args.opt_ptr(arg::OJMAPS)?,
            oitems_base: args.u64(arg::OITEMS_BASE)? as usize,
            oitems_nums: args.u64(arg::OITEMS_NUMS)? as usize,
            dst: args.opt_ptr(arg::DST)?,
        })
    }
}

fn load_header(ctx: &LaunchContext<'_>, kgjoin: DevicePtr) -> KResult<TaskHeader> {
    let fixed = ctx.read(kgjoin, TASK_HEAD_FIXED_LEN)?;
    let num_rels = get_u32(&fixed, 24)? as usize;
    let bytes = ctx.read(kgjoin, task_head_len(num_rels))?;
    Ok(TaskHeader::parse(&bytes)?)
}

fn load_resultbuf(ctx: &LaunchContext<'_>, l: &Launch, head: &TaskHeader, offset: usize) -> KResult<ResultBuf> {
    let len = resultbuf_len(head.kresults_total_items as usize);
    let bytes = ctx.read(l.kgjoin.add(offset), len)?;
    Ok(ResultBuf::parse(&bytes)?)
}

/// Row or hash chunk image starting at `ptr`, sized by its own header.
fn load_chunk(ctx: &LaunchContext<'_>, ptr: DevicePtr) -> KResult<Vec<u8>> {
    let head = KdsHeader::parse(&ctx.read(ptr, KDS_HEAD_LEN)?)?;
    Ok(ctx.read(ptr, head.length as usize)?)
}

impl JoinKernel {
    fn source_rows(&self, ctx: &LaunchContext<'_>, l: &Launch) -> KResult<Vec<Row>> {
        match l.src {
            Some(src) => Ok(KdsView::parse(&load_chunk(ctx, src)?)?.rows()?),
            None => Ok(Vec::new()),
        }
    }

    /// Rows of the source and of inner depths `1..=upto`.
    fn depth_rows(
        &self,
        ctx: &LaunchContext<'_>,
        l: &Launch,
        mrb: &MrbHeader,
        image: &[u8],
        upto: usize,
    ) -> KResult<DepthRows> {
        let mut depths = Vec::with_capacity(upto + 1);
        depths.push(self.source_rows(ctx, l)?);
        for d in 1..=upto {
            depths.push(KdsView::parse(mrb.chunk(image, d)?)?.rows()?);
        }
        Ok(DepthRows { depths })
    }

    fn preparation(&self, ctx: &mut LaunchContext<'_>, l: &Launch, head: &mut TaskHeader) -> KResult<()> {
        let total = head.kresults_total_items;
        let depth = l.depth;
        if depth == head.start_depth as usize {
            let mut seed = ResultBuf::empty(depth, total);
            if l.src.is_some() {
                let rows = self.source_rows(ctx, l)?;
                let end = (l.oitems_base + l.oitems_nums).min(rows.len());
                let mut passed = 0u64;
                for i in l.oitems_base..end {
                    let ok = match &self.plan.outer_quals {
                        Some(q) => q.passes(&|c: ColumnRef| {
                            (c.depth == 0).then(|| rows[i].get(c.column)).flatten()
                        }),
                        None => true,
                    };
                    if ok {
                        seed.push(&[(i + 1) as u32]);
                        passed += 1;
                    }
                }
                head.outer_nitems[0] += passed;
                head.kresults_max_items = head
                    .kresults_max_items
                    .max(seed.needed_items().min(u32::MAX as u64) as u32);
                note_overflow(head, &seed, depth);
            }
            let at = head.in_results(depth);
            ctx.write(l.kgjoin.add(at), &seed.to_bytes())?;
        }
        let out = ResultBuf::empty(depth + 1, total);
        let at = head.out_results(depth);
        ctx.write(l.kgjoin.add(at), &out.header_bytes())?;
        Ok(())
    }

    fn probe(&self, ctx: &mut LaunchContext<'_>, l: &Launch, head: &mut TaskHeader, hash: bool) -> KResult<()> {
        let depth = l.depth;
        let dp = self.plan.depth(depth);
        let input = load_resultbuf(ctx, l, head, head.in_results(depth))?;
        let mut out = load_resultbuf(ctx, l, head, head.out_results(depth))?;

        let image = ctx.read_region(l.kmrels)?;
        let mrb = MrbHeader::parse(&image)?;
        let view = KdsView::parse(mrb.chunk(&image, depth)?)?;
        let rows = self.depth_rows(ctx, l, &mrb, &image, depth)?;
        let inner = &rows.depths[depth];
        let (hash_min, hash_max) = (view.head.hash_min, view.head.hash_max);

        let mut matched = vec![false; inner.len()];
        let mut ext = Vec::with_capacity(depth + 1);
        let before = out.nitems;
        for combo in input.combos() {
            let candidates: Vec<usize> = if hash {
                let key = hash_join_key(
                    dp.hash_keys
                        .iter()
                        .map(|k| rows.column(combo, k.outer).unwrap_or(&NULL)),
                );
                if key < hash_min || key > hash_max {
                    // Another chunk of this depth owns the combination.
                    continue;
                }
                view.bucket(key)?
            } else {
                (0..inner.len()).collect()
            };

            let mut any = false;
            for r in candidates {
                ext.clear();
                ext.extend_from_slice(combo);
                ext.push((r + 1) as u32);
                let keys_equal = dp.hash_keys.iter().all(|k| {
                    let outer = rows.column(&ext, k.outer).unwrap_or(&NULL);
                    let inner_val = inner[r].get(k.inner_column).unwrap_or(&NULL);
                    outer.sql_eq(inner_val) == Some(true)
                });
                if !keys_equal {
                    continue;
                }
                let quals_pass = dp
                    .join_quals
                    .as_ref()
                    .map_or(true, |q| q.passes(&|c: ColumnRef| rows.column(&ext, c)));
                if !quals_pass {
                    continue;
                }
                out.push(&ext);
                matched[r] = true;
                any = true;
            }
            if !any && dp.join_type.is_left_outer() {
                ext.clear();
                ext.extend_from_slice(combo);
                ext.push(0);
                out.push(&ext);
            }
        }

        if dp.join_type.is_right_outer() {
            self.mark_matched(ctx, l, &mrb, depth, &matched)?;
        }
        head.outer_nitems[depth] += (out.nitems - before) as u64;
        head.kresults_max_items = head
            .kresults_max_items
            .max(out.needed_items().min(u32::MAX as u64) as u32);
        note_overflow(head, &out, depth);
        let at = head.out_results(depth);
        ctx.write(l.kgjoin.add(at), &out.to_bytes())?;
        Ok(())
    }

    /// OR this launch's matches into the device's own map region.
    fn mark_matched(
        &self,
        ctx: &mut LaunchContext<'_>,
        l: &Launch,
        mrb: &MrbHeader,
        depth: usize,
        matched: &[bool],
    ) -> KResult<()> {
        let entry = mrb.depth(depth)?;
        let (Some(ojmaps), Some(base)) = (l.ojmaps, entry.ojmap_offset) else {
            return Err(Abort::Corrupt(format!("depth {depth} has no outer-join map")));
        };
        let region = ojmap_region_len(entry.nitems as usize);
        let at = ojmaps.add(base as usize + l.cuda_index * region);
        let mut bits = ctx.read(at, entry.nitems as usize)?;
        for (b, m) in bits.iter_mut().zip(matched) {
            if *m {
                *b = 1;
            }
        }
        ctx.write(at, &bits)?;
        Ok(())
    }

    /// Emit `[NULL; depth] + inner row` for rows no device matched.
    fn outer_emit(&self, ctx: &mut LaunchContext<'_>, l: &Launch, head: &mut TaskHeader) -> KResult<()> {
        let depth = l.depth;
        let mut out = load_resultbuf(ctx, l, head, head.out_results(depth))?;
        let image = ctx.read(l.kmrels, mrb_head_len(self.plan.num_rels()))?;
        let mrb = MrbHeader::parse(&image)?;
        let entry = mrb.depth(depth)?;
        let (Some(ojmaps), Some(base)) = (l.ojmaps, entry.ojmap_offset) else {
            return Err(Abort::Corrupt(format!("depth {depth} has no outer-join map")));
        };
        let nitems = entry.nitems as usize;
        let region = ojmap_region_len(nitems);
        let mut seen = vec![false; nitems];
        for dev in 0..mrb.ndevs as usize {
            let bits = ctx.read(ojmaps.add(base as usize + dev * region), nitems)?;
            for (s, b) in seen.iter_mut().zip(bits) {
                *s |= b != 0;
            }
        }
        let before = out.nitems;
        let mut combo = vec![0u32; depth + 1];
        for (r, _) in seen.iter().enumerate().filter(|(_, s)| !**s) {
            combo[depth] = (r + 1) as u32;
            out.push(&combo);
        }
        head.outer_nitems[depth] += (out.nitems - before) as u64;
        head.kresults_max_items = head
            .kresults_max_items
            .max(out.needed_items().min(u32::MAX as u64) as u32);
        note_overflow(head, &out, depth);
        let at = head.out_results(depth);
        ctx.write(l.kgjoin.add(at), &out.to_bytes())?;
        Ok(())
    }

    fn final_rows(&self, ctx: &LaunchContext<'_>, l: &Launch, head: &TaskHeader) -> KResult<(ResultBuf, DepthRows)> {
        let nrels = self.plan.num_rels();
        let results = load_resultbuf(ctx, l, head, head.in_results(nrels + 1))?;
        let image = ctx.read_region(l.kmrels)?;
        let mrb = MrbHeader::parse(&image)?;
        let rows = self.depth_rows(ctx, l, &mrb, &image, nrels)?;
        Ok((results, rows))
    }

    fn projection_row(&self, ctx: &mut LaunchContext<'_>, l: &Launch, head: &mut TaskHeader) -> KResult<()> {
        let dst = l
            .dst
            .ok_or_else(|| Abort::Corrupt("row projection without a destination".into()))?;
        let mut dst_head = KdsHeader::parse(&ctx.read(dst, KDS_HEAD_LEN)?)?;
        let (results, rows) = self.final_rows(ctx, l, head)?;
        let mut chunk = ColumnarChunk::new_row(self.plan.projection.len(), dst_head.length as usize);
        let mut overflow: Option<(usize, usize)> = None;
        for combo in results.combos() {
            let row: Row = self
                .plan
                .projection
                .iter()
                .map(|p| rows.column(combo, p.source).cloned().unwrap_or(Scalar::Null))
                .collect();
            if let Some((n, usage)) = overflow.as_mut() {
                *n += 1;
                *usage += ColumnarChunk::tuple_consumption(&row) - 4;
                continue;
            }
            if let Err(row) = chunk.insert_tuple(row) {
                let usage = chunk.usage() + ColumnarChunk::tuple_consumption(&row) - 4;
                overflow = Some((chunk.nitems() + 1, usage));
            }
        }
        match overflow {
            Some((nitems, usage)) => {
                dst_head.nitems = nitems as u32;
                dst_head.usage = usage as u64;
                ctx.write(dst, &dst_head.to_bytes())?;
                head.errcode = ERR_NOSPACE;
                head.err_depth = (self.plan.num_rels() + 1) as u32;
            }
            None => ctx.write(dst, &chunk.to_image()?)?,
        }
        Ok(())
    }

    fn projection_slot(&self, ctx: &mut LaunchContext<'_>, l: &Launch, head: &mut TaskHeader) -> KResult<()> {
        let dst = l
            .dst
            .ok_or_else(|| Abort::Corrupt("slot projection without a destination".into()))?;
        let mut dst_head = KdsHeader::parse(&ctx.read(dst, KDS_HEAD_LEN)?)?;
        if dst_head.format != ChunkFormat::Slot {
            return Err(Abort::Corrupt("slot projection into a non-slot chunk".into()));
        }
        let (results, rows) = self.final_rows(ctx, l, head)?;
        let nitems = results.combos().count();
        dst_head.nitems = nitems as u32;
        if nitems > dst_head.nrooms as usize {
            ctx.write(dst, &dst_head.to_bytes())?;
            head.errcode = ERR_NOSPACE;
            head.err_depth = (self.plan.num_rels() + 1) as u32;
            return Ok(());
        }
        let ncols = self.plan.projection.len();
        let mut image = vec![0u8; KDS_HEAD_LEN + nitems * ncols * SLOT_ENTRY_LEN];
        dst_head.write_to(&mut image);
        for (i, combo) in results.combos().enumerate() {
            for (c, p) in self.plan.projection.iter().enumerate() {
                let at = KDS_HEAD_LEN + (i * ncols + c) * SLOT_ENTRY_LEN;
                let rowid = combo.get(p.source.depth).copied().unwrap_or(0);
                let value = rows.column(combo, p.source);
                if value.map_or(true, Scalar::is_null) {
                    image[at] = 1;
                } else {
                    image[at + 1..at + SLOT_ENTRY_LEN]
                        .copy_from_slice(&slot_ref(p.source.depth, rowid).to_le_bytes());
                }
            }
        }
        ctx.write(dst, &image)?;
        Ok(())
    }

    fn dispatch(&self, ctx: &mut LaunchContext<'_>, l: &Launch, head: &mut TaskHeader) -> KResult<()> {
        match self.entry {
            Entry::Preparation => self.preparation(ctx, l, head),
            Entry::NestLoop => self.probe(ctx, l, head, false),
            Entry::HashJoin => self.probe(ctx, l, head, true),
            Entry::OuterEmit => self.outer_emit(ctx, l, head),
            Entry::ProjectionRow => self.projection_row(ctx, l, head),
            Entry::ProjectionSlot => self.projection_slot(ctx, l, head),
        }
    }
}

fn note_overflow(head: &mut TaskHeader, buf: &ResultBuf, depth: usize) {
    if buf.overflowed() && head.errcode == ERR_SUCCESS {
        head.errcode = ERR_NOSPACE;
        head.err_depth = depth as u32;
    }
}

impl KernelImpl for JoinKernel {
    fn run(&self, ctx: &mut LaunchContext<'_>, args: &[KernelArg]) -> gpujoin_device::Result<()> {
        let l = Launch::parse(args)?;
        let mut head = match load_header(ctx, l.kgjoin) {
            Ok(h) => h,
            Err(Abort::Device(e)) => return Err(e),
            Err(Abort::Corrupt(reason)) => {
                tracing::warn!(%reason, "unreadable task header");
                return Ok(());
            }
        };
        if head.errcode != ERR_SUCCESS {
            return Ok(());
        }
        tracing::trace!(entry = ?self.entry, depth = l.depth, "kernel launch");
        match self.dispatch(ctx, &l, &mut head) {
            Ok(()) => {}
            Err(Abort::Device(e)) => return Err(e),
            Err(Abort::Corrupt(reason)) => {
                tracing::warn!(entry = ?self.entry, depth = l.depth, %reason, "corrupt device data");
                head.errcode = ERR_CORRUPT;
                head.err_depth = l.depth as u32;
            }
        }
        ctx.write(l.kgjoin, &head.to_bytes())?;
        Ok(())
    }
}
