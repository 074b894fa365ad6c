//! Multi-relations buffer: the chunks of one inner window, shared by every
//! task of that window.
//!
//! Two independent counts govern its lifetime:
//! - host attachments ([`MrbAttachment`]), one per task plus one held by the
//!   join while the window is open; the last detach of a buffer with
//!   RIGHT/FULL depths hands its attachment to the outer-join-only task
//!   instead of releasing, exactly once;
//! - per-device leases ([`DeviceLease`]), which keep that device's copy of
//!   the image alive. A device's copy goes away with its last lease, while
//!   its outer-join map stays until the buffer itself is released.
//!
//! When the inner relations span several windows, a RIGHT/FULL chunk is
//! visited by more than one buffer. Its match flags then travel with an
//! [`OuterJoinCarry`]: each device's map starts from the flags of earlier
//! windows, and the merged flags are read back when the buffer is
//! released. Only the depths the carry marks as emitting produce unmatched
//! rows in this buffer's outer-join pass.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::OnceCell;

use gpujoin_core::id::{DeviceId, EventId, MrbId, StreamId};
use gpujoin_core::join::JoinType;
use gpujoin_device::{DevicePtr, GpuRuntime};

use crate::chunk::ColumnarChunk;
use crate::error::{Error, Result};
use crate::layout::{align8, mrb_head_len, ojmap_region_len, MrbDepthEntry, MrbHeader};

#[derive(Debug, Default)]
struct DeviceSlot {
    kmrels: Option<DevicePtr>,
    ojmaps: Option<DevicePtr>,
    refcnt: u32,
    event: Option<EventId>,
    sent: bool,
}

#[derive(Debug)]
struct MrbState {
    n_attached: u32,
    armed: bool,
    kicked: bool,
    slots: Vec<DeviceSlot>,
    /// Match flags read back on release, by depth.
    collected: Option<Result<Vec<(usize, Vec<u8>)>>>,
}

/// Outer-join state one window shares with the other windows over the same
/// RIGHT/FULL chunks. All vectors are indexed by depth - 1.
#[derive(Debug, Clone)]
pub struct OuterJoinCarry {
    /// Rows matched by earlier windows, one byte per row of the chunk.
    pub seeds: Vec<Option<Arc<[u8]>>>,
    /// Whether this window's outer-join pass emits the chunk's unmatched
    /// rows.
    pub emit: Vec<bool>,
    /// Read the merged flags back when the buffer is released.
    pub collect: bool,
}

impl OuterJoinCarry {
    /// The only window: every RIGHT/FULL depth emits, nothing is carried.
    pub fn single_window(join_types: &[JoinType]) -> Self {
        Self {
            seeds: vec![None; join_types.len()],
            emit: join_types.iter().map(|jt| jt.is_right_outer()).collect(),
            collect: false,
        }
    }
}

pub struct MultiRelsBuffer {
    id: MrbId,
    runtime: Arc<dyn GpuRuntime>,
    chunks: Vec<Arc<ColumnarChunk>>,
    header: MrbHeader,
    usage_length: usize,
    ojmap_length: usize,
    carry: OuterJoinCarry,
    image: OnceCell<Arc<[u8]>>,
    state: Mutex<MrbState>,
}

/// Result of dropping one host attachment.
#[derive(Debug)]
pub enum Detached {
    StillAttached,
    /// The last attachment is gone; device memory has been returned.
    Released,
    /// Every normal task is done; the attachment now belongs to the
    /// outer-join-only task.
    KickOuterJoin(MrbAttachment),
}

impl MultiRelsBuffer {
    /// Buffer of the only window over `chunks`.
    pub fn new(
        id: MrbId,
        runtime: Arc<dyn GpuRuntime>,
        chunks: Vec<Arc<ColumnarChunk>>,
        join_types: &[JoinType],
    ) -> Result<Arc<Self>> {
        let carry = OuterJoinCarry::single_window(join_types);
        Self::with_carry(id, runtime, chunks, join_types, carry)
    }

    /// Lay out one chunk per depth. Fails when the image would not leave
    /// room for two task buffers of similar size in one device allocation.
    pub fn with_carry(
        id: MrbId,
        runtime: Arc<dyn GpuRuntime>,
        chunks: Vec<Arc<ColumnarChunk>>,
        join_types: &[JoinType],
        carry: OuterJoinCarry,
    ) -> Result<Arc<Self>> {
        if chunks.len() != join_types.len() || chunks.is_empty() {
            return Err(Error::Invariant(format!(
                "{} chunks for {} depths",
                chunks.len(),
                join_types.len()
            )));
        }
        if carry.seeds.len() != chunks.len() || carry.emit.len() != chunks.len() {
            return Err(Error::Invariant(format!(
                "outer-join carry covers {} depths, the window has {}",
                carry.emit.len(),
                chunks.len()
            )));
        }
        for (i, (chunk, jt)) in chunks.iter().zip(join_types).enumerate() {
            if carry.emit[i] && !jt.is_right_outer() {
                return Err(Error::Invariant(format!(
                    "depth {} is {jt:?} and has no unmatched rows to emit",
                    i + 1
                )));
            }
            if let Some(seed) = &carry.seeds[i] {
                if !jt.is_right_outer() || seed.len() != chunk.nitems() {
                    return Err(Error::Invariant(format!(
                        "outer-join map of {} rows for depth {} with {} rows",
                        seed.len(),
                        i + 1,
                        chunk.nitems()
                    )));
                }
            }
        }
        let ndevs = runtime.num_devices();
        let mut offset = mrb_head_len(chunks.len());
        let mut oj_offset = 0usize;
        let mut depths = Vec::with_capacity(chunks.len());
        for (chunk, jt) in chunks.iter().zip(join_types) {
            let len = chunk.image_len();
            let ojmap_offset = if jt.is_right_outer() {
                let at = oj_offset;
                oj_offset += ndevs * ojmap_region_len(chunk.nitems());
                Some(at as u64)
            } else {
                None
            };
            depths.push(MrbDepthEntry {
                chunk_offset: offset as u64,
                chunk_length: len as u64,
                ojmap_offset,
                nitems: chunk.nitems() as u32,
                join_type: *jt,
            });
            offset += align8(len);
        }

        let limit = (0..ndevs)
            .map(|d| runtime.max_alloc_size(DeviceId::from_index(d)))
            .min()
            .unwrap_or(0)
            / 2;
        if offset > limit {
            return Err(Error::Invariant(format!(
                "inner window of {offset} bytes exceeds half of the device allocation limit ({limit})"
            )));
        }

        tracing::debug!(
            mrb = id.get(),
            depths = chunks.len(),
            usage_length = offset,
            ojmap_length = oj_offset,
            emit = ?carry.emit,
            "multi-relations buffer built"
        );
        Ok(Arc::new(Self {
            id,
            runtime,
            carry,
            chunks,
            header: MrbHeader {
                ndevs: ndevs as u32,
                depths,
            },
            usage_length: offset,
            ojmap_length: oj_offset,
            image: OnceCell::new(),
            state: Mutex::new(MrbState {
                n_attached: 0,
                armed: false,
                kicked: false,
                slots: (0..ndevs).map(|_| DeviceSlot::default()).collect(),
                collected: None,
            }),
        }))
    }

    pub fn id(&self) -> MrbId {
        self.id
    }

    pub fn num_rels(&self) -> usize {
        self.chunks.len()
    }

    /// Chunk of `depth` (1-indexed).
    pub fn chunk(&self, depth: usize) -> Option<&Arc<ColumnarChunk>> {
        depth.checked_sub(1).and_then(|i| self.chunks.get(i))
    }

    pub fn header(&self) -> &MrbHeader {
        &self.header
    }

    pub fn usage_length(&self) -> usize {
        self.usage_length
    }

    pub fn ojmap_length(&self) -> usize {
        self.ojmap_length
    }

    /// Whether the last attachment schedules an outer-join-only pass.
    pub fn has_outer_join_pass(&self) -> bool {
        self.carry.emit.iter().any(|e| *e)
    }

    /// Whether the outer-join pass emits the unmatched rows of `depth`.
    pub fn emits_unmatched(&self, depth: usize) -> bool {
        depth
            .checked_sub(1)
            .and_then(|i| self.carry.emit.get(i))
            .copied()
            .unwrap_or(false)
    }

    /// First depth the outer-join pass emits rows for.
    pub fn outer_join_start_depth(&self) -> Option<usize> {
        self.carry.emit.iter().position(|e| *e).map(|i| i + 1)
    }

    pub fn outer_join_emitting(&self) -> &[bool] {
        &self.carry.emit
    }

    /// Match flags of every RIGHT/FULL depth merged across devices, taken
    /// once after the buffer was released with its window closed. Empty
    /// when the carry did not ask for them.
    pub fn take_matched_maps(&self) -> Result<Vec<(usize, Vec<u8>)>> {
        self.lock().collected.take().unwrap_or_else(|| Ok(Vec::new()))
    }

    pub fn n_attached(&self) -> u32 {
        self.lock().n_attached
    }

    /// Leases currently held on `device`.
    pub fn refcnt(&self, device: DeviceId) -> u32 {
        self.lock()
            .slots
            .get(device.index())
            .map_or(0, |s| s.refcnt)
    }

    pub fn outer_join_kicked(&self) -> bool {
        self.lock().kicked
    }

    fn lock(&self) -> MutexGuard<'_, MrbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialized once, on the first transfer to any device.
    fn image(&self) -> Result<Arc<[u8]>> {
        self.image
            .get_or_try_init(|| {
                let mut out = vec![0u8; self.usage_length];
                let head = self.header.to_bytes();
                out[..head.len()].copy_from_slice(&head);
                for (chunk, entry) in self.chunks.iter().zip(&self.header.depths) {
                    let bytes = chunk.to_image()?;
                    let at = entry.chunk_offset as usize;
                    out[at..at + bytes.len()].copy_from_slice(&bytes);
                }
                Ok::<_, Error>(Arc::from(out))
            })
            .cloned()
    }

    pub fn attach(self: &Arc<Self>) -> MrbAttachment {
        self.lock().n_attached += 1;
        MrbAttachment {
            mrb: Arc::clone(self),
            live: true,
        }
    }

    fn detach(self: &Arc<Self>, may_kick: bool, allow_kick: bool) -> Detached {
        let mut st = self.lock();
        if may_kick {
            st.armed = true;
        }
        if allow_kick
            && st.n_attached == 1
            && st.armed
            && self.has_outer_join_pass()
            && !st.kicked
        {
            st.kicked = true;
            tracing::debug!(mrb = self.id.get(), "scheduling the outer-join pass");
            return Detached::KickOuterJoin(MrbAttachment {
                mrb: Arc::clone(self),
                live: true,
            });
        }
        st.n_attached = st.n_attached.saturating_sub(1);
        if st.n_attached > 0 {
            return Detached::StillAttached;
        }
        if st.armed && self.carry.collect {
            let collected = self.collect_maps(&st.slots);
            st.collected = Some(collected);
        }
        for slot in st.slots.iter_mut() {
            self.release_slot(slot);
            self.free_ojmaps(slot);
        }
        tracing::debug!(mrb = self.id.get(), "multi-relations buffer released");
        Detached::Released
    }

    /// OR every device's own map region, on top of the seed, per RIGHT/FULL
    /// depth.
    fn collect_maps(&self, slots: &[DeviceSlot]) -> Result<Vec<(usize, Vec<u8>)>> {
        let mut out = Vec::new();
        for (i, entry) in self.header.depths.iter().enumerate() {
            let Some(base) = entry.ojmap_offset else {
                continue;
            };
            let nitems = entry.nitems as usize;
            let mut flags = match &self.carry.seeds[i] {
                Some(seed) => seed.to_vec(),
                None => vec![0u8; nitems],
            };
            let region = ojmap_region_len(nitems);
            for (dev, slot) in slots.iter().enumerate() {
                let Some(ojmaps) = slot.ojmaps else {
                    continue;
                };
                if nitems == 0 {
                    continue;
                }
                let bits = self
                    .runtime
                    .memcpy_dtoh(ojmaps.add(base as usize + dev * region), nitems)?;
                for (f, b) in flags.iter_mut().zip(bits) {
                    *f |= b;
                }
            }
            out.push((i + 1, flags));
        }
        Ok(out)
    }

    fn free_ojmaps(&self, slot: &mut DeviceSlot) {
        if let Some(ptr) = slot.ojmaps.take() {
            if let Err(e) = self.runtime.mem_free(ptr) {
                tracing::warn!(mrb = self.id.get(), error = %e, "failed to free outer-join map");
            }
        }
    }

    fn free_quietly(&self, ptr: DevicePtr, what: &'static str) {
        if let Err(e) = self.runtime.mem_free(ptr) {
            tracing::warn!(mrb = self.id.get(), error = %e, "failed to free {what}");
        }
    }

    /// Zero this device's maps, then write the flags of earlier windows into
    /// its own region.
    fn init_ojmaps(&self, device: DeviceId, ojmaps: DevicePtr) -> Result<()> {
        self.runtime.memset_zero(ojmaps, self.ojmap_length)?;
        for (entry, seed) in self.header.depths.iter().zip(&self.carry.seeds) {
            let (Some(base), Some(seed)) = (entry.ojmap_offset, seed) else {
                continue;
            };
            if seed.is_empty() {
                continue;
            }
            let region = ojmap_region_len(entry.nitems as usize);
            let at = ojmaps.add(base as usize + device.index() * region);
            self.runtime.memcpy_htod(at, seed)?;
        }
        Ok(())
    }

    fn release_slot(&self, slot: &mut DeviceSlot) {
        if let Some(ptr) = slot.kmrels.take() {
            self.free_quietly(ptr, "inner buffer");
        }
        if let Some(ev) = slot.event.take() {
            if let Err(e) = self.runtime.destroy_event(ev) {
                tracing::warn!(mrb = self.id.get(), error = %e, "failed to destroy event");
            }
        }
        slot.sent = false;
        slot.refcnt = 0;
    }

    /// Lease this buffer's copy on `device`, allocating it on first use.
    /// `Ok(None)` means the device is out of memory right now.
    pub fn get_buffer(self: &Arc<Self>, device: DeviceId) -> Result<Option<DeviceLease>> {
        let mut st = self.lock();
        let slot = st
            .slots
            .get_mut(device.index())
            .ok_or(gpujoin_device::Error::UnknownDevice(device.index()))?;
        if slot.kmrels.is_none() {
            let Some(kmrels) = self.runtime.mem_alloc(device, self.usage_length)? else {
                return Ok(None);
            };
            if self.ojmap_length > 0 && slot.ojmaps.is_none() {
                let ojmaps = match self.runtime.mem_alloc(device, self.ojmap_length) {
                    Ok(Some(p)) => p,
                    other => {
                        self.free_quietly(kmrels, "inner buffer");
                        return other.map(|_| None).map_err(Error::from);
                    }
                };
                if let Err(e) = self.init_ojmaps(device, ojmaps) {
                    self.free_quietly(ojmaps, "outer-join map");
                    self.free_quietly(kmrels, "inner buffer");
                    return Err(e);
                }
                slot.ojmaps = Some(ojmaps);
            }
            slot.kmrels = Some(kmrels);
        }
        slot.refcnt += 1;
        Ok(Some(DeviceLease {
            mrb: Arc::clone(self),
            device,
        }))
    }

    fn put_buffer(&self, device: DeviceId) {
        let mut st = self.lock();
        let Some(slot) = st.slots.get_mut(device.index()) else {
            return;
        };
        slot.refcnt = slot.refcnt.saturating_sub(1);
        if slot.refcnt == 0 {
            self.release_slot(slot);
        }
    }
}

impl Drop for MultiRelsBuffer {
    fn drop(&mut self) {
        let mut st = self.lock();
        let slots = std::mem::take(&mut st.slots);
        drop(st);
        for mut slot in slots {
            self.release_slot(&mut slot);
            self.free_ojmaps(&mut slot);
        }
    }
}

impl std::fmt::Debug for MultiRelsBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiRelsBuffer")
            .field("id", &self.id)
            .field("num_rels", &self.chunks.len())
            .field("usage_length", &self.usage_length)
            .field("ojmap_length", &self.ojmap_length)
            .finish()
    }
}

/// One host-side reference to a [`MultiRelsBuffer`].
///
/// Dropping it detaches without ever scheduling the outer-join pass; that is
/// the abort path. Normal teardown goes through [`MrbAttachment::detach`].
#[derive(Debug)]
pub struct MrbAttachment {
    mrb: Arc<MultiRelsBuffer>,
    live: bool,
}

impl MrbAttachment {
    pub fn mrb(&self) -> &Arc<MultiRelsBuffer> {
        &self.mrb
    }

    /// Drop this attachment. `may_kick` marks the window as closed, which
    /// allows the outer-join pass once the last attachment goes.
    pub fn detach(mut self, may_kick: bool) -> Detached {
        self.live = false;
        self.mrb.detach(may_kick, true)
    }
}

impl Drop for MrbAttachment {
    fn drop(&mut self) {
        if self.live {
            self.mrb.detach(false, false);
        }
    }
}

/// A task's hold on one device copy of a [`MultiRelsBuffer`].
#[derive(Debug)]
pub struct DeviceLease {
    mrb: Arc<MultiRelsBuffer>,
    device: DeviceId,
}

impl DeviceLease {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn kmrels(&self) -> Result<DevicePtr> {
        self.mrb.lock().slots[self.device.index()]
            .kmrels
            .ok_or_else(|| Error::Invariant("leased inner buffer is not allocated".into()))
    }

    pub fn ojmaps(&self) -> Option<DevicePtr> {
        self.mrb.lock().slots[self.device.index()].ojmaps
    }

    /// Make the image available to work queued on `stream`: the first task
    /// on a device transfers it and records an event, later ones wait on it.
    pub fn send(&self, stream: StreamId) -> Result<()> {
        let rt = &self.mrb.runtime;
        let mut st = self.mrb.lock();
        let slot = &mut st.slots[self.device.index()];
        if slot.sent {
            if let Some(ev) = slot.event {
                rt.stream_wait_event(stream, ev)?;
            }
            return Ok(());
        }
        let kmrels = slot
            .kmrels
            .ok_or_else(|| Error::Invariant("leased inner buffer is not allocated".into()))?;
        let event = match slot.event {
            Some(ev) => ev,
            None => {
                let ev = rt.create_event(self.device)?;
                slot.event = Some(ev);
                ev
            }
        };
        let image = self.mrb.image()?;
        rt.memcpy_htod_async(kmrels, image, stream)?;
        rt.event_record(event, stream)?;
        slot.sent = true;
        Ok(())
    }

    /// Copy every other device's part of the outer-join maps into the same
    /// position on this device, so this device sees all matches.
    pub fn colocate(&self, stream: StreamId) -> Result<()> {
        let rt = &self.mrb.runtime;
        let st = self.mrb.lock();
        let Some(dst) = st.slots[self.device.index()].ojmaps else {
            return Ok(());
        };
        for entry in &self.mrb.header.depths {
            let Some(base) = entry.ojmap_offset else {
                continue;
            };
            let region = ojmap_region_len(entry.nitems as usize);
            if region == 0 {
                continue;
            }
            for (i, slot) in st.slots.iter().enumerate() {
                if i == self.device.index() {
                    continue;
                }
                if let Some(src) = slot.ojmaps {
                    let at = base as usize + i * region;
                    rt.memcpy_peer_async(dst.add(at), src.add(at), region, stream)?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.mrb.put_buffer(self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpujoin_core::types::Scalar;
    use gpujoin_device::{SimDeviceConfig, SimRuntime};

    fn chunk(n: i64) -> Arc<ColumnarChunk> {
        let mut c = ColumnarChunk::new_row(1, 1 << 12);
        for i in 0..n {
            c.insert_tuple(vec![Scalar::I64(i)]).expect("fits");
        }
        c.shrink();
        Arc::new(c)
    }

    fn build(rt: &Arc<SimRuntime>, types: &[JoinType]) -> Arc<MultiRelsBuffer> {
        let chunks = types.iter().map(|_| chunk(5)).collect();
        MultiRelsBuffer::new(MrbId::new(1), rt.clone(), chunks, types).expect("mrb")
    }

    #[test]
    fn test_kick_happens_once_after_last_task() {
        let rt = Arc::new(SimRuntime::new(SimDeviceConfig::default()));
        let mrb = build(&rt, &[JoinType::Right]);
        let owner = mrb.attach();
        let t1 = mrb.attach();
        let t2 = mrb.attach();
        assert_eq!(mrb.n_attached(), 3);

        assert!(matches!(owner.detach(true), Detached::StillAttached));
        assert!(matches!(t1.detach(false), Detached::StillAttached));
        let oj = match t2.detach(false) {
            Detached::KickOuterJoin(att) => att,
            other => panic!("expected a kick, got {other:?}"),
        };
        assert_eq!(mrb.n_attached(), 1);
        assert!(mrb.outer_join_kicked());
        assert!(matches!(oj.detach(false), Detached::Released));
        assert_eq!(mrb.n_attached(), 0);
    }

    #[test]
    fn test_no_kick_without_right_outer_or_on_drop() {
        let rt = Arc::new(SimRuntime::new(SimDeviceConfig::default()));
        let inner = build(&rt, &[JoinType::Inner, JoinType::Left]);
        assert!(matches!(inner.attach().detach(true), Detached::Released));

        let right = build(&rt, &[JoinType::Full]);
        let owner = right.attach();
        let task = right.attach();
        assert!(matches!(owner.detach(true), Detached::StillAttached));
        drop(task);
        assert_eq!(right.n_attached(), 0);
        assert!(!right.outer_join_kicked());
    }

    #[test]
    fn test_device_copy_follows_leases() {
        let rt = Arc::new(SimRuntime::new(SimDeviceConfig::with_devices(2)));
        let mrb = build(&rt, &[JoinType::Inner, JoinType::Right]);
        assert_eq!(mrb.ojmap_length(), 2 * 2 * ojmap_region_len(5));
        let att = mrb.attach();
        let d0 = DeviceId::from_index(0);
        let a = mrb.get_buffer(d0).expect("alloc").expect("room");
        let b = mrb.get_buffer(d0).expect("alloc").expect("room");
        assert_eq!(mrb.refcnt(d0), 2);
        assert_eq!(rt.live_allocations(d0), 2);

        let stream = rt.create_stream(d0).expect("stream");
        a.send(stream).expect("send");
        b.send(stream).expect("wait");
        rt.poll().expect("poll");

        drop(a);
        drop(b);
        assert_eq!(mrb.refcnt(d0), 0);
        // The outer-join map outlives the device copy of the chunks.
        assert_eq!(rt.live_allocations(d0), 1);
        assert!(matches!(att.detach(false), Detached::Released));
        assert_eq!(rt.mem_used(d0), 0);
        rt.destroy_stream(stream).expect("destroy");
        assert_eq!(rt.live_events(), 0);
    }

    #[test]
    fn test_carried_flags_seed_and_merge() {
        let rt = Arc::new(SimRuntime::new(SimDeviceConfig::with_devices(2)));
        let types = [JoinType::Inner, JoinType::Right];
        let carry = OuterJoinCarry {
            seeds: vec![None, Some(Arc::from(vec![1u8, 0, 0, 0, 0]))],
            emit: vec![false, false],
            collect: true,
        };
        let chunks = types.iter().map(|_| chunk(5)).collect();
        let mrb = MultiRelsBuffer::with_carry(MrbId::new(2), rt.clone(), chunks, &types, carry)
            .expect("mrb");
        assert!(!mrb.has_outer_join_pass());
        assert_eq!(mrb.outer_join_start_depth(), None);

        let owner = mrb.attach();
        let task = mrb.attach();
        let (d0, d1) = (DeviceId::from_index(0), DeviceId::from_index(1));
        let a = mrb.get_buffer(d0).expect("alloc").expect("room");
        let b = mrb.get_buffer(d1).expect("alloc").expect("room");
        let base = mrb.header().depths[1].ojmap_offset.expect("map offset") as usize;
        let region = ojmap_region_len(5);
        let own0 = a.ojmaps().expect("map").add(base);
        assert_eq!(rt.memcpy_dtoh(own0, 5).expect("read"), vec![1, 0, 0, 0, 0]);
        // A match recorded by a task on device 1.
        let own1 = b.ojmaps().expect("map").add(base + region);
        rt.memcpy_htod(own1.add(3), &[1]).expect("mark");
        drop(a);
        drop(b);

        assert!(matches!(owner.detach(true), Detached::StillAttached));
        assert!(matches!(task.detach(false), Detached::Released));
        assert!(!mrb.outer_join_kicked());
        assert_eq!(
            mrb.take_matched_maps().expect("maps"),
            vec![(2, vec![1, 0, 0, 1, 0])]
        );
        assert!(mrb.take_matched_maps().expect("taken").is_empty());
        assert_eq!(rt.mem_used(d0) + rt.mem_used(d1), 0);
    }

    #[test]
    fn test_emitting_depths_pick_the_outer_join_start() {
        let rt = Arc::new(SimRuntime::new(SimDeviceConfig::default()));
        let types = [JoinType::Full, JoinType::Inner, JoinType::Right];
        let carry = OuterJoinCarry {
            seeds: vec![None; 3],
            emit: vec![false, false, true],
            collect: true,
        };
        let chunks = types.iter().map(|_| chunk(5)).collect();
        let mrb = MultiRelsBuffer::with_carry(MrbId::new(3), rt.clone(), chunks, &types, carry)
            .expect("mrb");
        assert_eq!(mrb.outer_join_start_depth(), Some(3));
        assert!(!mrb.emits_unmatched(1));
        assert!(mrb.emits_unmatched(3));

        let owner = mrb.attach();
        let oj = match owner.detach(true) {
            Detached::KickOuterJoin(att) => att,
            other => panic!("expected a kick, got {other:?}"),
        };
        assert!(matches!(oj.detach(false), Detached::Released));
        // Never leased: the flags are the (empty) seeds.
        assert_eq!(
            mrb.take_matched_maps().expect("maps"),
            vec![(1, vec![0; 5]), (3, vec![0; 5])]
        );
    }

    #[test]
    fn test_carry_must_fit_the_window() {
        let rt = Arc::new(SimRuntime::new(SimDeviceConfig::default()));
        let types = [JoinType::Inner];
        let emit_inner = OuterJoinCarry {
            seeds: vec![None],
            emit: vec![true],
            collect: false,
        };
        assert!(matches!(
            MultiRelsBuffer::with_carry(MrbId::new(4), rt.clone(), vec![chunk(2)], &types, emit_inner),
            Err(Error::Invariant(_))
        ));
        let short_seed = OuterJoinCarry {
            seeds: vec![Some(Arc::from(vec![0u8; 1]))],
            emit: vec![true],
            collect: false,
        };
        assert!(matches!(
            MultiRelsBuffer::with_carry(
                MrbId::new(5),
                rt.clone(),
                vec![chunk(2)],
                &[JoinType::Right],
                short_seed
            ),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let rt = Arc::new(SimRuntime::new(SimDeviceConfig::default()));
        let mrb = build(&rt, &[JoinType::Right]);
        rt.fail_next_allocs(1);
        assert!(mrb.get_buffer(DeviceId::from_index(0)).expect("ok").is_none());
        assert_eq!(rt.mem_used(DeviceId::from_index(0)), 0);
        assert_eq!(mrb.refcnt(DeviceId::from_index(0)), 0);
    }

    #[test]
    fn test_failed_free_is_logged_not_raised() {
        let rt = Arc::new(SimRuntime::new(SimDeviceConfig::default()));
        let mrb = build(&rt, &[JoinType::Right]);
        let d0 = DeviceId::from_index(0);
        let ptr = rt.mem_alloc(d0, 64).expect("alloc").expect("room");
        rt.mem_free(ptr).expect("free");
        mrb.free_quietly(ptr, "chunks");

        let mut slot = DeviceSlot {
            ojmaps: Some(ptr),
            ..Default::default()
        };
        mrb.free_ojmaps(&mut slot);
        assert!(slot.ojmaps.is_none());
        assert_eq!(rt.mem_used(d0), 0);
    }
}
