//! Split virtqueue
//!
//! Implements the split virtqueue as defined in VirtIO spec section 2.6:
//! a descriptor table, an available ring (driver to device) and a used
//! ring (device to driver), carved out of one contiguous arena.
//!
//! # Memory layout (modern devices)
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │         Descriptor Table              │  16 bytes * queue_len
//! ├── page boundary ──────────────────────┤
//! │         Available Ring                │  6 + 2 * queue_len bytes
//! │  flags, idx, ring[]                   │
//! ├── page boundary ──────────────────────┤
//! │         Used Ring                     │  6 + 8 * queue_len bytes
//! │  flags, idx, ring[]                   │
//! └───────────────────────────────────────┘
//! ```
//!
//! Legacy (version 1) devices derive the ring offsets themselves, so the
//! legacy layout packs the available ring directly behind the descriptor
//! table and aligns only the used ring.
//!
//! All cross-boundary ordering lives in two primitives: [`Virtqueue::publish`]
//! (store ring entry, write barrier, store `avail.idx`) and
//! [`Virtqueue::device_used_idx`] (load `used.idx`, read barrier). Nothing
//! else touches the index fields.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};

use crate::desc::DescBitmap;
use crate::request::{IoRequest, IoState, IoVec};
use crate::{VirtioError, VirtioResult, PAGE_SIZE};

/// Virtqueue descriptor flags
pub mod desc_flags {
    /// Buffer continues via the next field
    pub const NEXT: u16 = 1;
    /// Buffer is device write-only (otherwise read-only)
    pub const WRITE: u16 = 2;
    /// Buffer contains an indirect descriptor table
    pub const INDIRECT: u16 = 4;
}

/// Virtqueue descriptor (16 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtqDesc {
    /// Physical address of the buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub len: u32,
    /// Descriptor flags
    pub flags: u16,
    /// Next descriptor index (if NEXT flag is set)
    pub next: u16,
}

impl VirtqDesc {
    pub const SIZE: usize = 16;
}

/// Used ring element
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtqUsedElem {
    /// Index of the head of the used descriptor chain
    pub id: u32,
    /// Total bytes the device wrote to the chain
    pub len: u32,
}

impl VirtqUsedElem {
    pub const SIZE: usize = 8;
}

/// Maximum queue length we support
pub const MAX_QUEUE_SIZE: u16 = 256;

/// Translates an engine virtual address into a device-visible address.
///
/// The platform layer supplies this at device init; on identity-mapped
/// configurations [`identity_translate`] is enough. Ring arenas must be
/// physically contiguous for the translation to hold across the arena.
pub type VirtToPhys = fn(usize) -> u64;

/// Translation for identity-mapped memory.
pub fn identity_translate(addr: usize) -> u64 {
    addr as u64
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Offsets of the three ring regions within one queue arena.
///
/// Computed once at queue setup; every pointer into the arena is derived
/// from these offsets and never recomputed afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueLayout {
    /// Queue length the layout was computed for
    pub len: u16,
    /// Available ring offset from the arena base
    pub avail_offset: usize,
    /// Used ring offset from the arena base
    pub used_offset: usize,
    /// Total arena size in bytes
    pub total_size: usize,
}

impl QueueLayout {
    const fn desc_bytes(len: u16) -> usize {
        VirtqDesc::SIZE * len as usize
    }

    const fn avail_bytes(len: u16) -> usize {
        // flags + idx + ring + used_event
        6 + 2 * len as usize
    }

    const fn used_bytes(len: u16) -> usize {
        // flags + idx + ring + avail_event
        6 + VirtqUsedElem::SIZE * len as usize
    }

    /// Layout for modern (version 2) devices: each region is rounded up to
    /// a page boundary and programmed into the transport separately.
    pub fn split(len: u16) -> Self {
        let avail_offset = align_up(Self::desc_bytes(len), PAGE_SIZE);
        let used_offset = avail_offset + align_up(Self::avail_bytes(len), PAGE_SIZE);
        let total_size = used_offset + align_up(Self::used_bytes(len), PAGE_SIZE);
        Self { len, avail_offset, used_offset, total_size }
    }

    /// Layout for legacy (version 1) devices, which compute the ring
    /// offsets from the page frame number themselves: the available ring
    /// follows the descriptor table directly and only the used ring is
    /// placed on the next `align` boundary.
    pub fn legacy(len: u16, align: usize) -> Self {
        let avail_offset = Self::desc_bytes(len);
        let used_offset = align_up(avail_offset + Self::avail_bytes(len), align);
        let total_size = align_up(used_offset + Self::used_bytes(len), PAGE_SIZE);
        Self { len, avail_offset, used_offset, total_size }
    }
}

/// A split virtqueue and its driver-side bookkeeping.
pub struct Virtqueue {
    /// Queue index on the device
    id: u16,
    /// Queue length (number of descriptors)
    len: u16,
    layout: QueueLayout,
    /// Ring arena, page aligned, owned by this queue
    arena: *mut u8,
    arena_layout: Layout,
    desc: *mut VirtqDesc,
    avail: *mut u8,
    used: *mut u8,
    /// Device-visible address of the arena base
    base_phys: u64,
    free: DescBitmap,
    /// Completion cursor, trails `used.idx`
    last_used: u16,
    /// In-flight request records, keyed by head descriptor index.
    ///
    /// The used ring echoes the head descriptor id back, so completion
    /// looks up by exactly what the device reports. The table is sized to
    /// the descriptor count for the same reason.
    requests: Box<[Option<IoRequest>]>,
    /// Set when the device violated the ring protocol; the queue refuses
    /// all further work once poisoned.
    broken: bool,
}

// SAFETY: the raw pointers target the queue's own arena, which lives and
// dies with the Virtqueue. Access is serialized by the owning device.
unsafe impl Send for Virtqueue {}

impl Virtqueue {
    /// Build a queue over a freshly allocated, zeroed arena.
    pub fn new(id: u16, len: u16, layout: QueueLayout, translate: VirtToPhys) -> VirtioResult<Self> {
        if len == 0 || len > MAX_QUEUE_SIZE || !len.is_power_of_two() {
            return Err(VirtioError::InvalidArgument);
        }
        if layout.len != len {
            return Err(VirtioError::InvalidArgument);
        }

        let arena_layout = Layout::from_size_align(layout.total_size, PAGE_SIZE)
            .map_err(|_| VirtioError::InvalidArgument)?;
        // SAFETY: layout has non-zero size for any valid queue length.
        let arena = unsafe { alloc_zeroed(arena_layout) };
        if arena.is_null() {
            return Err(VirtioError::OutOfMemory);
        }

        let desc = arena as *mut VirtqDesc;
        // SAFETY: offsets are within the arena by construction of QueueLayout.
        let avail = unsafe { arena.add(layout.avail_offset) };
        let used = unsafe { arena.add(layout.used_offset) };

        let requests = (0..len).map(|_| None).collect::<Vec<_>>().into_boxed_slice();

        Ok(Self {
            id,
            len,
            layout,
            arena,
            arena_layout,
            desc,
            avail,
            used,
            base_phys: translate(arena as usize),
            free: DescBitmap::new(len),
            last_used: 0,
            requests,
            broken: false,
        })
    }

    /// Queue index on the device.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Queue length.
    pub fn len(&self) -> u16 {
        self.len
    }

    /// Device-visible addresses of (descriptor table, avail ring, used ring).
    pub fn ring_addresses(&self) -> (u64, u64, u64) {
        (
            self.base_phys,
            self.base_phys + self.layout.avail_offset as u64,
            self.base_phys + self.layout.used_offset as u64,
        )
    }

    /// True when the device has completions we have not drained yet.
    pub fn pending_used(&self) -> bool {
        !self.broken && self.device_used_idx() != self.last_used
    }

    /// True when every submitted chain has been drained.
    pub fn is_empty(&self) -> bool {
        self.device_used_idx() == self.last_used
    }

    /// Build a descriptor chain for `segments` and publish it.
    ///
    /// Segments at positions below `read_count` are device-readable (the
    /// driver filled them); the rest are device-writable. Returns the head
    /// descriptor index, or `None` when `segments` is empty (a no-op).
    /// On descriptor exhaustion every slot taken for the partial chain is
    /// returned to the free pool and `WouldBlock` is reported; the caller
    /// may retry once completions have been drained.
    pub fn enqueue(
        &mut self,
        segments: &[IoVec],
        read_count: usize,
        mut request: IoRequest,
    ) -> VirtioResult<Option<u16>> {
        if self.broken {
            return Err(VirtioError::BadRingIndex);
        }
        if segments.is_empty() {
            return Ok(None);
        }
        if segments.len() > self.len as usize {
            return Err(VirtioError::InvalidArgument);
        }

        let mut head: u16 = 0;
        let mut prev: Option<u16> = None;
        for (i, seg) in segments.iter().enumerate() {
            let idx = match self.free.alloc() {
                Some(idx) => idx,
                None => {
                    // Unwind from the recorded head, following the links
                    // laid down so far. The tail descriptor has no NEXT
                    // flag yet, so the walk frees exactly the partial
                    // chain.
                    if prev.is_some() {
                        self.free_chain(head)?;
                    }
                    return Err(VirtioError::WouldBlock);
                }
            };

            // SAFETY: idx < len, the descriptor table holds len entries.
            let d = unsafe { &mut *self.desc.add(idx as usize) };
            d.addr = seg.addr;
            d.len = seg.len;
            d.flags = if i >= read_count { desc_flags::WRITE } else { 0 };
            d.next = 0;

            match prev {
                Some(p) => {
                    // SAFETY: p was returned by the allocator above.
                    let pd = unsafe { &mut *self.desc.add(p as usize) };
                    pd.flags |= desc_flags::NEXT;
                    pd.next = idx;
                }
                None => head = idx,
            }
            prev = Some(idx);
        }

        request.state = IoState::Pending;
        self.requests[head as usize] = Some(request);
        self.publish(head);
        Ok(Some(head))
    }

    /// Drain one completion from the used ring.
    ///
    /// Returns the request record (ownership passes back to the driver)
    /// and the byte count the device reported. The record is marked `Done`
    /// here; the owning device applies its completion policy on top.
    pub fn dequeue(&mut self) -> VirtioResult<Option<(IoRequest, u32)>> {
        if self.broken {
            return Err(VirtioError::BadRingIndex);
        }

        let used_idx = self.device_used_idx();
        if used_idx == self.last_used {
            return Ok(None);
        }

        let elem = self.read_used_elem(self.last_used % self.len);
        if elem.id >= self.len as u32 {
            // The device handed back an index outside the table. Freeing
            // along it would corrupt the allocator, so poison the queue.
            self.broken = true;
            return Err(VirtioError::BadRingIndex);
        }
        let head = elem.id as u16;

        let mut request = match self.requests[head as usize].take() {
            Some(request) => request,
            None => {
                // A used entry for a chain we never submitted (or already
                // reclaimed) is the same class of protocol violation.
                self.broken = true;
                return Err(VirtioError::BadRingIndex);
            }
        };

        self.free_chain(head)?;
        self.last_used = self.last_used.wrapping_add(1);

        request.state = IoState::Done;
        request.transferred = elem.len;
        Ok(Some((request, elem.len)))
    }

    /// Free a descriptor chain starting at `head`, tail included.
    ///
    /// The walk is bounded by the queue length; a longer chain means the
    /// next links form a cycle or point outside the table, which poisons
    /// the queue.
    fn free_chain(&mut self, head: u16) -> VirtioResult<()> {
        let mut idx = head;
        let mut freed: u16 = 0;
        loop {
            if idx >= self.len || freed >= self.len {
                self.broken = true;
                return Err(VirtioError::BadRingIndex);
            }
            // SAFETY: idx < len checked above.
            let d = unsafe { &*self.desc.add(idx as usize) };
            let next = d.next;
            let has_next = d.flags & desc_flags::NEXT != 0;
            self.free.free(idx);
            freed += 1;
            if !has_next {
                return Ok(());
            }
            idx = next;
        }
    }

    /// Publish a chain head on the available ring.
    ///
    /// This is the driver-to-device ordering point: the ring entry store
    /// must be visible before the index store, and the index store before
    /// the caller's notify register write.
    fn publish(&mut self, head: u16) {
        let idx = self.avail_idx();
        self.write_avail_entry(idx % self.len, head);
        fence(Ordering::SeqCst);
        self.write_avail_idx(idx.wrapping_add(1));
        fence(Ordering::SeqCst);
    }

    /// Load `used.idx` as the device last published it.
    ///
    /// This is the device-to-driver ordering point: the index load
    /// completes before any used element contents are read.
    fn device_used_idx(&self) -> u16 {
        // SAFETY: used points at the used ring header inside the arena.
        let idx = unsafe { read_volatile((self.used as *const u16).add(1)) };
        fence(Ordering::SeqCst);
        idx
    }

    fn avail_idx(&self) -> u16 {
        // SAFETY: avail points at the avail ring header inside the arena.
        unsafe { read_volatile((self.avail as *const u16).add(1)) }
    }

    fn write_avail_idx(&mut self, idx: u16) {
        // SAFETY: as above.
        unsafe { write_volatile((self.avail as *mut u16).add(1), idx) }
    }

    fn write_avail_entry(&mut self, slot: u16, head: u16) {
        // SAFETY: slot < len, ring entries start after the 4-byte header.
        unsafe { write_volatile((self.avail as *mut u16).add(2 + slot as usize), head) }
    }

    fn read_used_elem(&self, slot: u16) -> VirtqUsedElem {
        // SAFETY: slot < len, elements start after the 4-byte header.
        unsafe { read_volatile((self.used.add(4) as *const VirtqUsedElem).add(slot as usize)) }
    }
}

impl Drop for Virtqueue {
    fn drop(&mut self) {
        // SAFETY: arena was allocated with arena_layout in new().
        unsafe { dealloc(self.arena, self.arena_layout) }
    }
}

impl core::fmt::Debug for Virtqueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Virtqueue")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("free", &self.free.free_count())
            .field("last_used", &self.last_used)
            .field("broken", &self.broken)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::IoOp;

    fn queue(len: u16) -> Virtqueue {
        Virtqueue::new(0, len, QueueLayout::split(len), identity_translate).unwrap()
    }

    fn req(tag: u64) -> IoRequest {
        IoRequest::new(IoOp::Write, tag, 512)
    }

    /// Acts as the device: push a used element for `head` and publish it.
    fn device_complete(q: &mut Virtqueue, head: u16, len: u32) {
        unsafe {
            let used_idx = read_volatile((q.used as *const u16).add(1));
            let elem = (q.used.add(4) as *mut VirtqUsedElem).add((used_idx % q.len) as usize);
            write_volatile(elem, VirtqUsedElem { id: head as u32, len });
            write_volatile((q.used as *mut u16).add(1), used_idx.wrapping_add(1));
        }
    }

    fn read_desc(q: &Virtqueue, idx: u16) -> VirtqDesc {
        unsafe { *q.desc.add(idx as usize) }
    }

    fn read_avail_entry(q: &Virtqueue, slot: u16) -> u16 {
        unsafe { read_volatile((q.avail as *const u16).add(2 + slot as usize)) }
    }

    #[test]
    fn test_split_layout() {
        let layout = QueueLayout::split(8);
        assert_eq!(layout.avail_offset, 4096);
        assert_eq!(layout.used_offset, 8192);
        assert_eq!(layout.total_size, 12288);
    }

    #[test]
    fn test_legacy_layout() {
        let layout = QueueLayout::legacy(8, 4096);
        assert_eq!(layout.avail_offset, 128);
        assert_eq!(layout.used_offset, 4096);
        assert_eq!(layout.total_size, 8192);
    }

    #[test]
    fn test_empty_submission_is_noop() {
        let mut q = queue(4);
        assert_eq!(q.enqueue(&[], 0, req(0)).unwrap(), None);
        assert_eq!(q.avail_idx(), 0);
        assert_eq!(q.free.free_count(), 4);
    }

    #[test]
    fn test_chain_links_in_submission_order() {
        let mut q = queue(4);
        let segs = [IoVec::new(0x1000, 16), IoVec::new(0x2000, 512)];
        let head = q.enqueue(&segs, 1, req(1)).unwrap().unwrap();

        let first = read_desc(&q, head);
        assert_eq!(first.addr, 0x1000);
        assert_eq!(first.len, 16);
        assert_eq!(first.flags, desc_flags::NEXT);

        let second = read_desc(&q, first.next);
        assert_eq!(second.addr, 0x2000);
        assert_eq!(second.len, 512);
        assert_eq!(second.flags, desc_flags::WRITE);
        assert_eq!(second.next, 0);

        assert_eq!(q.avail_idx(), 1);
        assert_eq!(read_avail_entry(&q, 0), head);
        assert_eq!(q.free.free_count(), 2);
    }

    #[test]
    fn test_round_trip() {
        let mut q = queue(4);
        let segs = [IoVec::new(0x1000, 16), IoVec::new(0x2000, 512)];
        let head = q.enqueue(&segs, 1, req(7)).unwrap().unwrap();
        assert!(!q.pending_used());

        device_complete(&mut q, head, 513);
        assert!(q.pending_used());

        let (done, used_len) = q.dequeue().unwrap().unwrap();
        assert_eq!(done.state, IoState::Done);
        assert_eq!(done.transferred, 513);
        assert_eq!(done.buf, 7);
        assert_eq!(used_len, 513);

        // The whole chain came back to the free pool.
        assert_eq!(q.free.free_count(), 4);
        assert!(q.is_empty());
        assert!(q.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let mut q = queue(4);
        let seg = [IoVec::new(0x1000, 64)];
        let mut heads = Vec::new();
        for i in 0..4 {
            heads.push(q.enqueue(&seg, 1, req(i)).unwrap().unwrap());
        }
        assert!(q.free.is_exhausted());
        assert_eq!(q.enqueue(&seg, 1, req(9)).unwrap_err(), VirtioError::WouldBlock);

        device_complete(&mut q, heads[0], 0);
        q.dequeue().unwrap().unwrap();
        assert!(q.enqueue(&seg, 1, req(10)).unwrap().is_some());
    }

    #[test]
    fn test_partial_chain_unwinds_from_head() {
        let mut q = queue(4);
        let seg = [IoVec::new(0x1000, 64)];
        for i in 0..3 {
            q.enqueue(&seg, 1, req(i)).unwrap();
        }
        assert_eq!(q.free.free_count(), 1);

        // Two segments, one slot: the first allocation succeeds and must
        // be unwound when the second fails.
        let segs = [IoVec::new(0x3000, 64), IoVec::new(0x4000, 64)];
        assert_eq!(q.enqueue(&segs, 1, req(9)).unwrap_err(), VirtioError::WouldBlock);
        assert_eq!(q.free.free_count(), 1);

        // The freed slot is usable again.
        assert!(q.enqueue(&seg, 1, req(10)).unwrap().is_some());
    }

    #[test]
    fn test_out_of_order_completion() {
        // queueLen=4: submit A,B,C,D, complete A and C, drain twice.
        let mut q = queue(4);
        let seg = [IoVec::new(0x1000, 64)];
        let mut heads = Vec::new();
        for i in 0..4u64 {
            heads.push(q.enqueue(&seg, 1, req(i)).unwrap().unwrap());
        }
        assert_eq!(q.avail_idx(), 4);
        assert!(q.free.is_exhausted());

        device_complete(&mut q, heads[0], 100);
        device_complete(&mut q, heads[2], 300);

        let (a, _) = q.dequeue().unwrap().unwrap();
        assert_eq!(a.buf, 0);
        assert_eq!(a.transferred, 100);
        assert!(q.free.is_free(heads[0]));

        let (c, _) = q.dequeue().unwrap().unwrap();
        assert_eq!(c.buf, 2);
        assert_eq!(c.transferred, 300);
        assert!(q.free.is_free(heads[2]));

        // Exactly A and C's slots are free; B and D stay allocated.
        assert_eq!(q.free.free_count(), 2);
        assert!(!q.free.is_free(heads[1]));
        assert!(!q.free.is_free(heads[3]));
    }

    #[test]
    fn test_indices_are_monotonic() {
        let mut q = queue(4);
        let seg = [IoVec::new(0x1000, 64)];
        let mut last_avail = 0u16;
        for i in 0..10 {
            let head = q.enqueue(&seg, 1, req(i)).unwrap().unwrap();
            let avail = q.avail_idx();
            assert_eq!(avail, last_avail.wrapping_add(1));
            last_avail = avail;

            device_complete(&mut q, head, 64);
            q.dequeue().unwrap().unwrap();
            assert_eq!(q.last_used, q.device_used_idx());
        }
    }

    #[test]
    fn test_bad_used_id_poisons_queue() {
        let mut q = queue(4);
        let seg = [IoVec::new(0x1000, 64)];
        q.enqueue(&seg, 1, req(0)).unwrap();

        device_complete(&mut q, 7, 64); // 7 >= queue length
        assert_eq!(q.dequeue().unwrap_err(), VirtioError::BadRingIndex);

        // Everything fails after poisoning.
        assert_eq!(q.dequeue().unwrap_err(), VirtioError::BadRingIndex);
        assert_eq!(q.enqueue(&seg, 1, req(1)).unwrap_err(), VirtioError::BadRingIndex);
    }

    #[test]
    fn test_used_entry_without_request_poisons_queue() {
        let mut q = queue(4);
        // Descriptor 2 was never submitted.
        device_complete(&mut q, 2, 64);
        assert_eq!(q.dequeue().unwrap_err(), VirtioError::BadRingIndex);
    }

    #[test]
    fn test_ring_addresses_match_layout() {
        let q = queue(8);
        let (desc, avail, used) = q.ring_addresses();
        assert_eq!(avail - desc, 4096);
        assert_eq!(used - desc, 8192);
        assert_eq!(desc % PAGE_SIZE as u64, 0);
    }
}
