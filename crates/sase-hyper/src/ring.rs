//! Packet Ring Transport
//!
//! Bounded ring of pre-allocated packet slots for zero-copy handoff between
//! the ingestion path and consumers.
//!
//! # Design
//!
//! - Power-of-two capacity, mask-based indexing
//! - One cache-line aligned payload arena, allocated once
//! - Lock-free cursors; producers and consumers claim positions with CAS,
//!   so the same ring serves SPSC and MPMC use
//! - Per-slot control word packing `{generation, pins, state}`; handles
//!   carry the generation so reuse after wraparound is detected
//! - Slots move `Free → Filled → InFlight → Processed → Free`; a pinned
//!   slot (open view or pending crypto job) cannot be released
//!
//! The generation of a slot equals the lap of the cursor that wrote it:
//! position `p` lives in slot `p & mask` with generation `p >> log2(N)`.
//! Releasing a slot bumps its generation, which is exactly what the
//! producer one lap ahead is waiting for.

use crate::caps::Capabilities;
use crate::config::BackPressure;
use crate::error::{HyperError, HyperResult};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Cache line size
pub const CACHE_LINE: usize = 64;

/// Largest supported ring
pub const MAX_RING_CAPACITY: usize = 1 << 16;

/// Concurrent pins per slot
const MAX_PINS: u32 = (1 << 24) - 1;

/// Slot occupancy state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    /// Available to the producer
    Free = 0,
    /// Written, waiting for a consumer
    Filled = 1,
    /// Owned by a consumer (or a crypto job on its behalf)
    InFlight = 2,
    /// Crypto transform completed
    Processed = 3,
}

impl SlotState {
    #[inline(always)]
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => SlotState::Filled,
            2 => SlotState::InFlight,
            3 => SlotState::Processed,
            _ => SlotState::Free,
        }
    }
}

/// Packed slot control word: generation (32) | pins (24) | state (8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Control(u64);

impl Control {
    #[inline(always)]
    const fn new(generation: u32, pins: u32, state: SlotState) -> Self {
        Self(((generation as u64) << 32) | (((pins & MAX_PINS) as u64) << 8) | state as u64)
    }

    #[inline(always)]
    fn state(self) -> SlotState {
        SlotState::from_bits(self.0 as u8)
    }

    #[inline(always)]
    fn pins(self) -> u32 {
        ((self.0 >> 8) as u32) & MAX_PINS
    }

    #[inline(always)]
    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Packet metadata stamped on write
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketMeta {
    /// Capture timestamp (nanoseconds)
    pub timestamp_ns: u64,
    /// Payload length
    pub length: u32,
    /// Packet flags
    pub flags: u16,
    /// Queue identifier
    pub queue: u16,
}

/// Caller-supplied part of the metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Capture timestamp (nanoseconds)
    pub timestamp_ns: u64,
    /// Packet flags
    pub flags: u16,
    /// Queue identifier
    pub queue: u16,
}

impl PacketHeader {
    /// Header with timestamp only
    pub fn at(timestamp_ns: u64) -> Self {
        Self {
            timestamp_ns,
            ..Default::default()
        }
    }
}

/// Opaque slot reference `{index, generation}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

impl SlotHandle {
    /// Slot index in the ring
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the handle was issued for
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Encode as a non-zero 64-bit value
    #[inline]
    pub fn as_raw(&self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64 + 1)
    }

    /// Decode a raw value; `0` is the null handle
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Self> {
        let low = raw as u32;
        if low == 0 {
            return None;
        }
        Some(Self {
            index: low - 1,
            generation: (raw >> 32) as u32,
        })
    }
}

/// Payload copy implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyPath {
    /// Bulk copy, lowered to vector loads/stores
    Vectorized,
    /// Word-at-a-time copy
    Scalar,
}

impl CopyPath {
    /// Pick the copy path for the detected hardware
    pub fn select(caps: Capabilities, force_scalar: bool) -> Self {
        if caps.has_vector_copy() && !force_scalar {
            CopyPath::Vectorized
        } else {
            CopyPath::Scalar
        }
    }

    #[inline(always)]
    fn copy(self, dst: &mut [u8], src: &[u8]) {
        match self {
            CopyPath::Vectorized => dst.copy_from_slice(src),
            CopyPath::Scalar => copy_scalar(dst, src),
        }
    }
}

#[inline]
fn copy_scalar(dst: &mut [u8], src: &[u8]) {
    let mut dst_words = dst.chunks_exact_mut(8);
    let mut src_words = src.chunks_exact(8);
    for (d, s) in (&mut dst_words).zip(&mut src_words) {
        d.copy_from_slice(s);
    }
    for (d, s) in dst_words.into_remainder().iter_mut().zip(src_words.remainder()) {
        *d = *s;
    }
}

/// Ring slot (cache-line aligned)
#[repr(C, align(64))]
struct Slot {
    ctl: AtomicU64,
    meta: UnsafeCell<PacketMeta>,
}

/// Bounded packet ring
pub struct PacketRing {
    /// Next position to write (producer side)
    write_cursor: CachePadded,
    /// Next position to read (consumer side)
    read_cursor: CachePadded,
    slots: Box<[Slot]>,
    capacity: usize,
    mask: u64,
    shift: u32,
    payload_size: usize,
    /// Distance between payload regions
    stride: usize,
    arena: NonNull<u8>,
    layout: Layout,
    copy_path: CopyPath,
    back_pressure: BackPressure,
    /// Producers parked by the blocking policy
    waiters: AtomicUsize,
    space: Mutex<()>,
    space_cond: Condvar,
}

#[repr(align(64))]
struct CachePadded(AtomicU64);

// SAFETY: payload and metadata cells are only written by the producer that
// claimed the slot's position while the slot is unpublished, and only read
// after the Release store that publishes it. Ownership transitions go
// through the control word CAS.
unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

impl PacketRing {
    /// Create ring with the drop policy and the detected copy path
    pub fn new(capacity: usize, payload_size: usize) -> HyperResult<Self> {
        Self::with_policy(
            capacity,
            payload_size,
            BackPressure::Drop,
            CopyPath::select(Capabilities::detect(), false),
        )
    }

    /// Create ring with an explicit back-pressure policy and copy path
    pub fn with_policy(
        capacity: usize,
        payload_size: usize,
        back_pressure: BackPressure,
        copy_path: CopyPath,
    ) -> HyperResult<Self> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_RING_CAPACITY {
            return Err(HyperError::Initialization(format!(
                "capacity {} must be a power of two in 1..={}",
                capacity, MAX_RING_CAPACITY
            )));
        }
        if payload_size == 0 || payload_size > u32::MAX as usize {
            return Err(HyperError::Initialization(format!(
                "invalid payload size {}",
                payload_size
            )));
        }

        let stride = payload_size
            .checked_next_multiple_of(CACHE_LINE)
            .ok_or_else(|| HyperError::Initialization("payload size overflow".into()))?;
        let arena_size = stride
            .checked_mul(capacity)
            .ok_or_else(|| HyperError::Initialization("payload arena overflow".into()))?;
        let layout = Layout::from_size_align(arena_size, CACHE_LINE)
            .map_err(|e| HyperError::Initialization(format!("payload arena layout: {}", e)))?;

        // SAFETY: layout has non-zero size (capacity and payload size are positive)
        let arena = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| {
            HyperError::Initialization(format!("failed to allocate {} byte payload arena", arena_size))
        })?;

        let slots = (0..capacity)
            .map(|_| Slot {
                ctl: AtomicU64::new(Control::new(0, 0, SlotState::Free).0),
                meta: UnsafeCell::new(PacketMeta::default()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        tracing::debug!(capacity, payload_size, ?copy_path, ?back_pressure, "packet ring created");

        Ok(Self {
            write_cursor: CachePadded(AtomicU64::new(0)),
            read_cursor: CachePadded(AtomicU64::new(0)),
            slots,
            capacity,
            mask: capacity as u64 - 1,
            shift: capacity.trailing_zeros(),
            payload_size,
            stride,
            arena,
            layout,
            copy_path,
            back_pressure,
            waiters: AtomicUsize::new(0),
            space: Mutex::new(()),
            space_cond: Condvar::new(),
        })
    }

    /// Number of slots
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload bytes per slot
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Selected copy path
    #[inline]
    pub fn copy_path(&self) -> CopyPath {
        self.copy_path
    }

    /// Configured full-ring policy
    #[inline]
    pub fn back_pressure(&self) -> BackPressure {
        self.back_pressure
    }

    /// Packets written but not yet read
    pub fn len(&self) -> usize {
        let read = self.read_cursor.0.load(Ordering::Acquire);
        let write = self.write_cursor.0.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    /// Nothing waiting to be read
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    fn position(&self, pos: u64) -> (usize, u32) {
        ((pos & self.mask) as usize, (pos >> self.shift) as u32)
    }

    #[inline(always)]
    fn payload_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: index < capacity, so the offset stays inside the arena
        unsafe { self.arena.as_ptr().add(index * self.stride) }
    }

    #[inline]
    fn slot(&self, handle: SlotHandle) -> HyperResult<&Slot> {
        self.slots
            .get(handle.index as usize)
            .ok_or(HyperError::StaleHandle)
    }

    /// Write a packet taken from `data[offset..offset + length]`
    ///
    /// On a full ring the drop policy fails with `CapacityExceeded` and the
    /// blocking policy waits up to its timeout, failing with `Timeout`.
    pub fn write(
        &self,
        data: &[u8],
        offset: usize,
        length: usize,
        header: PacketHeader,
    ) -> HyperResult<SlotHandle> {
        let end = offset.checked_add(length).filter(|end| *end <= data.len());
        let Some(end) = end else {
            return Err(HyperError::InvalidRange {
                offset,
                length,
                available: data.len(),
            });
        };
        if length > self.payload_size {
            return Err(HyperError::PayloadTooLarge {
                len: length,
                max: self.payload_size,
            });
        }
        let src = &data[offset..end];

        if let Some(handle) = self.try_write(src, header) {
            return Ok(handle);
        }

        let Some(timeout) = self.back_pressure.timeout() else {
            return Err(HyperError::CapacityExceeded);
        };

        // No deadline when the timeout does not fit in an Instant
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if !self.wait_for_space(deadline) {
                return Err(HyperError::Timeout);
            }
            if let Some(handle) = self.try_write(src, header) {
                return Ok(handle);
            }
        }
    }

    /// Write a whole buffer
    #[inline]
    pub fn push(&self, payload: &[u8], header: PacketHeader) -> HyperResult<SlotHandle> {
        self.write(payload, 0, payload.len(), header)
    }

    fn try_write(&self, src: &[u8], header: PacketHeader) -> Option<SlotHandle> {
        let mut pos = self.write_cursor.0.load(Ordering::Relaxed);
        let (index, lap) = loop {
            let (index, lap) = self.position(pos);
            let ctl = Control(self.slots[index].ctl.load(Ordering::Acquire));

            if ctl.generation() == lap && ctl.state() == SlotState::Free {
                match self.write_cursor.0.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break (index, lap),
                    Err(actual) => pos = actual,
                }
            } else if ctl.generation() == lap.wrapping_sub(1) {
                // Previous lap still owns the slot
                let current = self.write_cursor.0.load(Ordering::Relaxed);
                if current == pos {
                    return None;
                }
                pos = current;
            } else {
                pos = self.write_cursor.0.load(Ordering::Relaxed);
            }
        };

        let slot = &self.slots[index];
        // SAFETY: the cursor CAS gave this producer exclusive ownership of the
        // position; the slot stays Free (invisible to consumers) until the
        // Release store below.
        unsafe {
            let dst = std::slice::from_raw_parts_mut(self.payload_ptr(index), src.len());
            self.copy_path.copy(dst, src);
            *slot.meta.get() = PacketMeta {
                timestamp_ns: header.timestamp_ns,
                length: src.len() as u32,
                flags: header.flags,
                queue: header.queue,
            };
        }
        slot.ctl
            .store(Control::new(lap, 0, SlotState::Filled).0, Ordering::Release);

        Some(SlotHandle {
            index: index as u32,
            generation: lap,
        })
    }

    fn has_space(&self) -> bool {
        let pos = self.write_cursor.0.load(Ordering::SeqCst);
        let (index, lap) = self.position(pos);
        let ctl = Control(self.slots[index].ctl.load(Ordering::SeqCst));
        ctl.generation() == lap && ctl.state() == SlotState::Free
    }

    /// Park until a slot may be free. Returns false once the deadline passed
    /// with the ring still full; `None` waits without a deadline.
    fn wait_for_space(&self, deadline: Option<Instant>) -> bool {
        let mut guard = self.space.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        let ready = loop {
            if self.has_space() {
                break true;
            }
            match deadline {
                Some(deadline) => {
                    if self.space_cond.wait_until(&mut guard, deadline).timed_out() {
                        break self.has_space();
                    }
                }
                None => self.space_cond.wait(&mut guard),
            }
        };

        self.waiters.fetch_sub(1, Ordering::SeqCst);
        ready
    }

    fn notify_space(&self) {
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.space.lock();
            self.space_cond.notify_all();
        }
    }

    /// Take the next filled slot in FIFO order
    ///
    /// The slot becomes `InFlight` and must be released exactly once.
    pub fn read(&self) -> Option<SlotHandle> {
        let mut pos = self.read_cursor.0.load(Ordering::Relaxed);
        loop {
            let (index, lap) = self.position(pos);
            let slot = &self.slots[index];
            let ctl = Control(slot.ctl.load(Ordering::Acquire));

            if ctl.generation() == lap && ctl.state() == SlotState::Filled {
                match self.read_cursor.0.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.ctl.store(
                            Control::new(lap, 0, SlotState::InFlight).0,
                            Ordering::Release,
                        );
                        return Some(SlotHandle {
                            index: index as u32,
                            generation: lap,
                        });
                    }
                    Err(actual) => pos = actual,
                }
            } else if (ctl.generation() == lap && ctl.state() == SlotState::Free)
                || ctl.generation() == lap.wrapping_sub(1)
            {
                // Not yet published
                let current = self.read_cursor.0.load(Ordering::Relaxed);
                if current == pos {
                    return None;
                }
                pos = current;
            } else {
                pos = self.read_cursor.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Drain up to `max` filled slots into `out`, returning how many were taken
    pub fn read_batch(&self, max: usize, out: &mut Vec<SlotHandle>) -> usize {
        let mut taken = 0;
        while taken < max {
            match self.read() {
                Some(handle) => {
                    out.push(handle);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    /// Return a read slot to the ring
    pub fn release(&self, handle: SlotHandle) -> HyperResult<()> {
        let slot = self.slot(handle)?;
        let mut current = slot.ctl.load(Ordering::Acquire);
        loop {
            let ctl = Control(current);
            if ctl.generation() != handle.generation {
                return Err(HyperError::StaleHandle);
            }
            match ctl.state() {
                SlotState::InFlight | SlotState::Processed => {}
                SlotState::Filled => return Err(HyperError::InvalidSlotState("slot not read yet")),
                SlotState::Free => return Err(HyperError::StaleHandle),
            }
            if ctl.pins() > 0 {
                return Err(HyperError::SlotBusy);
            }

            let next = Control::new(handle.generation.wrapping_add(1), 0, SlotState::Free);
            match slot.ctl.compare_exchange_weak(
                current,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if self.back_pressure != BackPressure::Drop {
            self.notify_space();
        }
        Ok(())
    }

    /// Current state of the slot a handle refers to
    pub fn state(&self, handle: SlotHandle) -> HyperResult<SlotState> {
        let ctl = Control(self.slot(handle)?.ctl.load(Ordering::Acquire));
        if ctl.generation() != handle.generation {
            return Err(HyperError::StaleHandle);
        }
        Ok(ctl.state())
    }

    /// Pin a read slot so it cannot be released
    pub(crate) fn pin(&self, handle: SlotHandle) -> HyperResult<()> {
        let slot = self.slot(handle)?;
        let mut current = slot.ctl.load(Ordering::Acquire);
        loop {
            let ctl = Control(current);
            if ctl.generation() != handle.generation {
                return Err(HyperError::StaleHandle);
            }
            match ctl.state() {
                SlotState::InFlight | SlotState::Processed => {}
                SlotState::Filled => return Err(HyperError::InvalidSlotState("slot not read yet")),
                SlotState::Free => return Err(HyperError::StaleHandle),
            }
            if ctl.pins() >= MAX_PINS {
                return Err(HyperError::SlotBusy);
            }

            let next = Control::new(ctl.generation(), ctl.pins() + 1, ctl.state());
            match slot.ctl.compare_exchange_weak(
                current,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a pin; `processed` moves an InFlight slot to Processed
    pub(crate) fn unpin(&self, handle: SlotHandle, processed: bool) {
        let Ok(slot) = self.slot(handle) else {
            return;
        };
        let mut current = slot.ctl.load(Ordering::Acquire);
        loop {
            let ctl = Control(current);
            debug_assert_eq!(ctl.generation(), handle.generation, "pinned slot recycled");
            debug_assert!(ctl.pins() > 0, "unpin without pin");
            if ctl.generation() != handle.generation || ctl.pins() == 0 {
                return;
            }

            let state = if processed && ctl.state() == SlotState::InFlight {
                SlotState::Processed
            } else {
                ctl.state()
            };
            let next = Control::new(ctl.generation(), ctl.pins() - 1, state);
            match slot.ctl.compare_exchange_weak(
                current,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Metadata and payload of a pinned slot
    ///
    /// Caller must hold a pin on `handle`.
    pub(crate) fn pinned_parts(&self, handle: SlotHandle) -> (PacketMeta, &[u8]) {
        let index = handle.index as usize;
        // SAFETY: the pin keeps the slot out of Free, so no producer can claim
        // it; the contents were published before the slot left Filled.
        unsafe {
            let meta = *self.slots[index].meta.get();
            let payload = std::slice::from_raw_parts(self.payload_ptr(index), meta.length as usize);
            (meta, payload)
        }
    }

    /// Borrow a read slot's payload and metadata
    ///
    /// The slot is pinned for the lifetime of the view.
    pub fn view(&self, handle: SlotHandle) -> HyperResult<SlotView<'_>> {
        self.pin(handle)?;
        Ok(SlotView { ring: self, handle })
    }
}

impl Drop for PacketRing {
    fn drop(&mut self) {
        // SAFETY: arena was allocated in `with_policy` with this layout
        unsafe {
            dealloc(self.arena.as_ptr(), self.layout);
        }
    }
}

impl fmt::Debug for PacketRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRing")
            .field("capacity", &self.capacity)
            .field("payload_size", &self.payload_size)
            .field("len", &self.len())
            .field("copy_path", &self.copy_path)
            .field("back_pressure", &self.back_pressure)
            .finish()
    }
}

/// Pinned, read-only view of a slot
pub struct SlotView<'a> {
    ring: &'a PacketRing,
    handle: SlotHandle,
}

impl SlotView<'_> {
    /// Slot handle
    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    /// Packet metadata
    pub fn meta(&self) -> PacketMeta {
        self.ring.pinned_parts(self.handle).0
    }

    /// Packet payload
    pub fn payload(&self) -> &[u8] {
        self.ring.pinned_parts(self.handle).1
    }
}

impl Drop for SlotView<'_> {
    fn drop(&mut self) {
        self.ring.unpin(self.handle, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn header(ts: u64) -> PacketHeader {
        PacketHeader {
            timestamp_ns: ts,
            flags: 0x1,
            queue: 3,
        }
    }

    #[test]
    fn test_create_rejects_invalid() {
        for capacity in [0, 3, 6, MAX_RING_CAPACITY * 2] {
            assert!(matches!(
                PacketRing::new(capacity, 16),
                Err(HyperError::Initialization(_))
            ));
        }
        assert!(matches!(
            PacketRing::new(4, 0),
            Err(HyperError::Initialization(_))
        ));
    }

    #[test]
    fn test_drop_policy_scenario() {
        let ring = PacketRing::new(4, 16).unwrap();
        let packets: [&[u8]; 4] = [b"AAAAAAAA", b"BBBBBBBB", b"CCCCCCCC", b"DDDDDDDD"];

        for (i, p) in packets.iter().enumerate() {
            ring.push(p, header(i as u64)).unwrap();
        }
        assert_eq!(ring.len(), 4);

        // Full: rejected, state unchanged
        assert_eq!(
            ring.push(b"EEEEEEEE", header(4)),
            Err(HyperError::CapacityExceeded)
        );
        assert_eq!(ring.len(), 4);

        let mut handles = Vec::new();
        for p in packets.iter() {
            let h = ring.read().unwrap();
            assert_eq!(ring.view(h).unwrap().payload(), *p);
            handles.push(h);
        }
        assert!(ring.read().is_none());

        ring.release(handles[0]).unwrap();
        let e = ring.push(b"EEEEEEEE", header(4)).unwrap();
        assert_eq!(e.index(), handles[0].index());
        assert_ne!(e.generation(), handles[0].generation());
    }

    #[test]
    fn test_metadata_round_trip() {
        let ring = PacketRing::new(8, 64).unwrap();
        let data = [7u8; 40];
        ring.write(&data, 8, 24, header(123_456_789)).unwrap();

        let h = ring.read().unwrap();
        let view = ring.view(h).unwrap();
        assert_eq!(
            view.meta(),
            PacketMeta {
                timestamp_ns: 123_456_789,
                length: 24,
                flags: 0x1,
                queue: 3,
            }
        );
        assert_eq!(view.payload(), &data[8..32]);
    }

    #[test]
    fn test_write_validation() {
        let ring = PacketRing::new(4, 16).unwrap();
        assert_eq!(
            ring.push(&[0u8; 17], header(0)),
            Err(HyperError::PayloadTooLarge { len: 17, max: 16 })
        );
        assert!(matches!(
            ring.write(&[0u8; 8], 4, 8, header(0)),
            Err(HyperError::InvalidRange { .. })
        ));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let ring = PacketRing::new(2, 16).unwrap();
        ring.push(b"one", header(0)).unwrap();
        let h = ring.read().unwrap();
        ring.release(h).unwrap();

        assert_eq!(ring.release(h), Err(HyperError::StaleHandle));
        assert!(matches!(ring.view(h), Err(HyperError::StaleHandle)));
        assert_eq!(ring.state(h), Err(HyperError::StaleHandle));

        // Same index reused on the next lap
        ring.push(b"two", header(1)).unwrap();
        ring.push(b"three", header(2)).unwrap();
        let h2 = ring.read().unwrap();
        let h3 = ring.read().unwrap();
        assert_eq!(h3.index(), h.index());
        assert_eq!(ring.release(h), Err(HyperError::StaleHandle));
        ring.release(h2).unwrap();
        ring.release(h3).unwrap();
    }

    #[test]
    fn test_release_requires_read() {
        let ring = PacketRing::new(2, 16).unwrap();
        let written = ring.push(b"x", header(0)).unwrap();
        assert_eq!(ring.state(written), Ok(SlotState::Filled));
        assert!(matches!(
            ring.release(written),
            Err(HyperError::InvalidSlotState(_))
        ));
    }

    #[test]
    fn test_view_pins_slot() {
        let ring = PacketRing::new(2, 16).unwrap();
        ring.push(b"pinned", header(0)).unwrap();
        let h = ring.read().unwrap();

        let view = ring.view(h).unwrap();
        assert_eq!(ring.release(h), Err(HyperError::SlotBusy));
        drop(view);
        ring.release(h).unwrap();
    }

    #[test]
    fn test_raw_handle() {
        let ring = PacketRing::new(4, 16).unwrap();
        let h = ring.push(b"raw", header(0)).unwrap();
        assert_ne!(h.as_raw(), 0);
        assert_eq!(SlotHandle::from_raw(h.as_raw()), Some(h));
        assert_eq!(SlotHandle::from_raw(0), None);

        let foreign = SlotHandle::from_raw(100).unwrap();
        assert_eq!(ring.release(foreign), Err(HyperError::StaleHandle));
    }

    #[test]
    fn test_scalar_copy_path() {
        let ring = PacketRing::with_policy(4, 64, BackPressure::Drop, CopyPath::Scalar).unwrap();
        assert_eq!(ring.copy_path(), CopyPath::Scalar);

        let data: Vec<u8> = (0..61).collect();
        ring.push(&data, header(0)).unwrap();
        let h = ring.read().unwrap();
        assert_eq!(ring.view(h).unwrap().payload(), data.as_slice());
    }

    #[test]
    fn test_copy_path_selection() {
        assert_eq!(CopyPath::select(Capabilities::SIMD, false), CopyPath::Vectorized);
        assert_eq!(CopyPath::select(Capabilities::SIMD, true), CopyPath::Scalar);
        assert_eq!(CopyPath::select(Capabilities::empty(), false), CopyPath::Scalar);
    }

    #[test]
    fn test_block_policy_times_out() {
        let ring = PacketRing::with_policy(
            2,
            16,
            BackPressure::Block { timeout_ms: 20 },
            CopyPath::Vectorized,
        )
        .unwrap();
        ring.push(b"a", header(0)).unwrap();
        ring.push(b"b", header(1)).unwrap();

        let start = Instant::now();
        assert_eq!(ring.push(b"c", header(2)), Err(HyperError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_block_policy_wakes_on_release() {
        let ring = Arc::new(
            PacketRing::with_policy(
                2,
                16,
                BackPressure::Block { timeout_ms: 5_000 },
                CopyPath::Vectorized,
            )
            .unwrap(),
        );
        ring.push(b"a", header(0)).unwrap();
        ring.push(b"b", header(1)).unwrap();
        let first = ring.read().unwrap();

        let releaser = {
            let ring = ring.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ring.release(first).unwrap();
            })
        };

        let start = Instant::now();
        let h = ring.push(b"c", header(2)).unwrap();
        assert_eq!(h.index(), first.index());
        assert!(start.elapsed() < Duration::from_secs(5));
        releaser.join().unwrap();
    }

    #[test]
    fn test_block_policy_unbounded_timeout() {
        // Deadline does not fit in an Instant; waits until space frees up
        let ring = Arc::new(
            PacketRing::with_policy(
                1,
                16,
                BackPressure::Block { timeout_ms: u64::MAX },
                CopyPath::Vectorized,
            )
            .unwrap(),
        );
        ring.push(b"a", header(0)).unwrap();
        let first = ring.read().unwrap();

        let releaser = {
            let ring = ring.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ring.release(first).unwrap();
            })
        };

        let h = ring.push(b"b", header(1)).unwrap();
        assert_eq!(h.index(), first.index());
        assert_eq!(h.generation(), first.generation() + 1);
        releaser.join().unwrap();
    }

    #[test]
    fn test_spsc_fifo_concurrent() {
        const COUNT: u32 = 20_000;
        let ring = Arc::new(PacketRing::new(64, 16).unwrap());

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for seq in 0..COUNT {
                    let bytes = seq.to_le_bytes();
                    while ring.push(&bytes, header(seq as u64)).is_err() {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0u32;
        while expected < COUNT {
            let Some(h) = ring.read() else {
                thread::yield_now();
                continue;
            };
            {
                let view = ring.view(h).unwrap();
                let seq = u32::from_le_bytes(view.payload().try_into().unwrap());
                assert_eq!(seq, expected);
                assert_eq!(view.meta().timestamp_ns, expected as u64);
            }
            ring.release(h).unwrap();
            expected += 1;
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_concurrent_writers_fifo_per_producer() {
        const PER_PRODUCER: u32 = 5_000;
        const PRODUCERS: u32 = 4;
        let ring = Arc::new(PacketRing::new(32, 8).unwrap());

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|id| {
                let ring = ring.clone();
                thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        let mut bytes = [0u8; 8];
                        bytes[..4].copy_from_slice(&id.to_le_bytes());
                        bytes[4..].copy_from_slice(&seq.to_le_bytes());
                        while ring.push(&bytes, header(seq as u64)).is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut next = [0u32; PRODUCERS as usize];
        let mut received = 0;
        while received < PER_PRODUCER * PRODUCERS {
            let Some(h) = ring.read() else {
                thread::yield_now();
                continue;
            };
            let (id, seq) = {
                let view = ring.view(h).unwrap();
                let payload = view.payload();
                (
                    u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize,
                    u32::from_le_bytes(payload[4..].try_into().unwrap()),
                )
            };
            // Each producer's packets arrive once and in its own order
            assert_eq!(seq, next[id], "producer {}", id);
            next[id] += 1;
            ring.release(h).unwrap();
            received += 1;
        }

        for producer in producers {
            producer.join().unwrap();
        }
        assert!(next.iter().all(|&n| n == PER_PRODUCER));
        assert!(ring.read().is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_concurrent_readers_exclusive() {
        const COUNT: u32 = 10_000;
        const READERS: usize = 4;
        let ring = Arc::new(PacketRing::new(32, 8).unwrap());

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for seq in 0..COUNT {
                    while ring.push(&seq.to_le_bytes(), header(0)).is_err() {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumed = Arc::new(AtomicUsize::new(0));
        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let ring = ring.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while consumed.load(Ordering::Acquire) < COUNT as usize {
                        match ring.read() {
                            Some(h) => {
                                let seq = {
                                    let view = ring.view(h).unwrap();
                                    u32::from_le_bytes(view.payload().try_into().unwrap())
                                };
                                seen.push(seq);
                                ring.release(h).unwrap();
                                consumed.fetch_add(1, Ordering::AcqRel);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    seen
                })
            })
            .collect();

        producer.join().unwrap();
        let mut all = HashSet::new();
        for reader in readers {
            for seq in reader.join().unwrap() {
                assert!(all.insert(seq), "packet {} delivered twice", seq);
            }
        }
        assert_eq!(all.len(), COUNT as usize);
    }

    proptest! {
        #[test]
        fn prop_fifo_round_trip(
            ops in proptest::collection::vec(
                prop_oneof![
                    proptest::collection::vec(any::<u8>(), 0..=32).prop_map(Some),
                    Just(None),
                ],
                1..200,
            )
        ) {
            let ring = PacketRing::new(8, 32).unwrap();
            let mut model = std::collections::VecDeque::new();

            for (ts, op) in ops.into_iter().enumerate() {
                match op {
                    Some(payload) => {
                        let result = ring.push(&payload, PacketHeader::at(ts as u64));
                        if model.len() == 8 {
                            prop_assert_eq!(result, Err(HyperError::CapacityExceeded));
                        } else {
                            prop_assert!(result.is_ok());
                            model.push_back((ts as u64, payload));
                        }
                    }
                    None => match (ring.read(), model.pop_front()) {
                        (Some(h), Some((ts, payload))) => {
                            {
                                let view = ring.view(h).unwrap();
                                prop_assert_eq!(view.payload(), payload.as_slice());
                                prop_assert_eq!(view.meta().timestamp_ns, ts);
                            }
                            ring.release(h).unwrap();
                        }
                        (None, None) => {}
                        (got, want) => prop_assert!(false, "ring {:?} vs model {:?}", got, want),
                    },
                }
            }
            prop_assert_eq!(ring.len(), model.len());
        }
    }
}
