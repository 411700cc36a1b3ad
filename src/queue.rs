//! The legacy split virtqueue: descriptor table, available ring, used
//! ring, and the engine that walks them.
//!
//! Queue sizes are powers of two so that `% qs` can be computed as
//! `& (qs - 1)`, same convention the teacher's const-generic queue used
//! (there, `SIZE` was a compile-time const; here it is a runtime field
//! because a real VMM learns it from the negotiated queue size).

use crate::error::QueueError;
use crate::mem::{consume_fence, publish_fence, GuestAddr, GuestMemory};

/// Guest page size; vring offsets are aligned to this boundary.
pub const VIRTQUEUE_ALIGN: usize = 4096;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct DescFlag: u16 {
        /// Descriptor chain continues via `next`.
        const NEXT = 1;
        /// Device writes this descriptor (driver reads it).
        const WRITE = 2;
        /// Indirect descriptor table; not negotiated, ignored if set.
        const INDIRECT = 4;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: DescFlag,
    pub next: u16,
}

impl Descriptor {
    fn from_bytes(b: &[u8]) -> Self {
        debug_assert_eq!(b.len(), 16);
        Descriptor {
            addr: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            flags: DescFlag::from_bits_truncate(u16::from_le_bytes(b[12..14].try_into().unwrap())),
            next: u16::from_le_bytes(b[14..16].try_into().unwrap()),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

/// Per-queue device-side state: the recorded ring geometry plus the
/// consumer/producer cursors. The engine never mutates descriptors; it
/// only reads them.
pub struct VirtQueue {
    pub qs: u16,
    pub gpa: GuestAddr,
    pub avail_offset: u64,
    pub used_offset: u64,
    pub last_avail: u16,
    /// Snapshot of `avail.idx` taken on RX-notify (net-only); zero and
    /// unused by other devices.
    pub notified_avail: u16,
}

impl VirtQueue {
    pub fn new(qs: u16, gpa: GuestAddr) -> Self {
        assert!(qs.is_power_of_two() && qs <= 256, "queue size must be a power of two <= 256");
        let avail_offset = 16 * qs as u64;
        let desc_avail_len = 16 * qs as u64 + 2 * (2 + qs as u64);
        let used_offset = align_up(desc_avail_len, VIRTQUEUE_ALIGN as u64);
        VirtQueue {
            qs,
            gpa,
            avail_offset,
            used_offset,
            last_avail: 0,
            notified_avail: 0,
        }
    }

    /// Total vring size in bytes, per the formula in the external
    /// interfaces section: `align(16*qs + 2*(2+qs)) + align(2*2 + 8*qs)`.
    pub fn total_size(qs: u16) -> u64 {
        let desc_avail = align_up(16 * qs as u64 + 2 * (2 + qs as u64), VIRTQUEUE_ALIGN as u64);
        let used = align_up(4 + 8 * qs as u64, VIRTQUEUE_ALIGN as u64);
        desc_avail + used
    }

    fn mask(&self, idx: u16) -> u16 {
        idx & (self.qs - 1)
    }

    fn desc_addr(&self, index: u16) -> GuestAddr {
        self.gpa.offset(index as u64 * 16)
    }

    fn avail_idx_addr(&self) -> GuestAddr {
        self.gpa.offset(self.avail_offset + 2)
    }

    fn avail_ring_addr(&self, slot: u16) -> GuestAddr {
        self.gpa.offset(self.avail_offset + 4 + slot as u64 * 2)
    }

    fn used_idx_addr(&self) -> GuestAddr {
        self.gpa.offset(self.used_offset + 2)
    }

    fn used_ring_addr(&self, slot: u16) -> GuestAddr {
        self.gpa.offset(self.used_offset + 4 + slot as u64 * 8)
    }

    fn read_u16(mem: &dyn GuestMemory, addr: GuestAddr) -> Result<u16, QueueError> {
        let mut b = [0u8; 2];
        mem.read(addr, &mut b).map_err(|_| QueueError::Cycle)?;
        Ok(u16::from_le_bytes(b))
    }

    /// Returns the head descriptor index at `avail.ring[last_avail %
    /// qs]` if `avail.idx != last_avail`, and advances `last_avail`.
    pub fn pop_avail(&mut self, mem: &dyn GuestMemory) -> Option<u16> {
        let avail_idx = Self::read_u16(mem, self.avail_idx_addr()).ok()?;
        if avail_idx == self.last_avail {
            return None;
        }
        consume_fence();
        let slot = self.mask(self.last_avail);
        let head = Self::read_u16(mem, self.avail_ring_addr(slot)).ok()?;
        self.last_avail = self.last_avail.wrapping_add(1);
        Some(head)
    }

    /// Snapshot `avail.idx`, for the net RX path's producer/consumer gap
    /// bound.
    pub fn snapshot_avail(&mut self, mem: &dyn GuestMemory) {
        if let Ok(idx) = Self::read_u16(mem, self.avail_idx_addr()) {
            self.notified_avail = idx;
        }
    }

    /// Number of avail entries not yet consumed, bounded by `qs`.
    pub fn pending(&self) -> u16 {
        self.notified_avail.wrapping_sub(self.last_avail)
    }

    /// Yields the descriptor chain starting at `head`, following `next`
    /// while `NEXT` is set, up to `qs` descriptors. Errors on cycle or
    /// overflow without dereferencing beyond the qs-th element.
    pub fn walk_chain(&self, mem: &dyn GuestMemory, head: u16) -> Result<Vec<Descriptor>, QueueError> {
        let mut out = Vec::new();
        let mut idx = head;
        for _ in 0..self.qs {
            let mut raw = [0u8; 16];
            mem.read(self.desc_addr(idx), &mut raw)
                .map_err(|_| QueueError::Cycle)?;
            let desc = Descriptor::from_bytes(&raw);
            let has_next = desc.flags.contains(DescFlag::NEXT);
            let next = desc.next;
            out.push(desc);
            if !has_next {
                return Ok(out);
            }
            idx = next;
        }
        Err(QueueError::ChainTooLong)
    }

    /// Writes `used.ring[used.idx % qs] = {id, len}`, fences, increments
    /// `used.idx`.
    pub fn push_used(&mut self, mem: &dyn GuestMemory, id: u16, len: u32) {
        let used_idx = Self::read_u16(mem, self.used_idx_addr()).unwrap_or(0);
        let slot = self.mask(used_idx);
        let elem = self.used_ring_addr(slot);
        let mut raw = [0u8; 8];
        raw[0..4].copy_from_slice(&(id as u32).to_le_bytes());
        raw[4..8].copy_from_slice(&len.to_le_bytes());
        let _ = mem.write(elem, &raw);
        publish_fence();
        let _ = mem.write(self.used_idx_addr(), &used_idx.wrapping_add(1).to_le_bytes());
    }

    /// Resets per-queue runtime state, as happens when `device_status`
    /// is written with 0.
    pub fn reset(&mut self) {
        self.last_avail = 0;
        self.notified_avail = 0;
    }
}

const fn align_up(size: u64, align: u64) -> u64 {
    (size + align - 1) & !(align - 1)
}
