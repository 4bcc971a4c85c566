//! Virtqueue memory layout and per-queue state
//!
//! The descriptor table, available ring and used ring are views over bytes
//! the front-end owns; we never treat them as owned Rust objects, only as
//! raw pointers read/written with explicit atomic fences around the index
//! words.

use std::os::fd::RawFd;
use std::sync::atomic::{fence, AtomicU16, Ordering};

use bitflags::bitflags;

/// Maximum number of entries in a single virtqueue; the wire format allows
/// any power of two up to this.
pub const QUEUE_MAX_SIZE: u16 = 32768;

/// Fixed queue count/identity for this device: index 0 is host->guest
/// (receive), index 1 is guest->host (transmit).
pub const QUEUE_COUNT: usize = 2;
pub const QUEUE_RX: usize = 0;
pub const QUEUE_TX: usize = 1;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        const NEXT = 0x1;
        const WRITE = 0x2;
        const INDIRECT = 0x4;
    }
}

/// Raw virtio 1.0 (legacy split virtqueue) descriptor, as laid out in guest
/// memory. 16 bytes, no padding.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawDescriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<RawDescriptor>();

/// Reads a descriptor out of guest memory at `table_base + idx * 16`.
///
/// ### Safety
/// `table_base` must point at a valid, live descriptor table of at least
/// `idx + 1` entries.
pub unsafe fn read_descriptor(table_base: *mut u8, idx: u16) -> RawDescriptor {
    let ptr = table_base.add(idx as usize * DESCRIPTOR_SIZE) as *const RawDescriptor;
    std::ptr::read_volatile(ptr)
}

/// Reads the available ring's `idx` field with acquire ordering, so every
/// descriptor-chain read dominated by this one is safe to perform.
///
/// ### Safety
/// `avail_base` must point at a live available ring.
pub unsafe fn read_avail_idx(avail_base: *mut u8) -> u16 {
    let ptr = avail_base.add(2) as *const AtomicU16;
    (*ptr).load(Ordering::Acquire)
}

/// Reads `avail.ring[slot]`, the head descriptor index for one chain.
///
/// ### Safety
/// `avail_base` must point at a live available ring with at least `slot + 1`
/// ring entries.
pub unsafe fn read_avail_ring(avail_base: *mut u8, slot: u16) -> u16 {
    let ptr = avail_base.add(4 + slot as usize * 2) as *const u16;
    std::ptr::read_volatile(ptr)
}

/// Writes one `used.ring[slot] = {id, len}` entry.
///
/// ### Safety
/// `used_base` must point at a live used ring with at least `slot + 1` ring
/// entries.
pub unsafe fn write_used_elem(used_base: *mut u8, slot: u16, id: u32, len: u32) {
    let ptr = used_base.add(4 + slot as usize * 8) as *mut u32;
    std::ptr::write_volatile(ptr, id);
    std::ptr::write_volatile(ptr.add(1), len);
}

/// Publishes `used.idx` with release ordering so every used-ring entry
/// written beforehand is observable to the guest before it sees the new
/// index.
///
/// ### Safety
/// `used_base` must point at a live used ring.
pub unsafe fn write_used_idx(used_base: *mut u8, idx: u16) {
    let ptr = used_base.add(2) as *const AtomicU16;
    (*ptr).store(idx, Ordering::Release);
    fence(Ordering::Release);
}

/// Byte length of the used ring for a queue of `num` entries: a `u16` flags
/// field, a `u16` idx field, then `num` 8-byte used elements. Used by the
/// dirty-log size computation.
pub fn used_ring_size(num: u16) -> u64 {
    4 + 8 * num as u64
}

/// Per-queue state: the three ring addresses (already translated to host
/// pointers), the shadow indices, and the notification descriptors.
///
/// Lifecycle: slots start at sentinel values, are filled in progressively
/// by SET_VRING_NUM / SET_VRING_ADDR / SET_VRING_BASE / SET_VRING_KICK /
/// SET_VRING_CALL, and are torn down only when the owning session ends.
pub struct VirtQueue {
    pub num: u16,
    pub desc: Option<*mut u8>,
    pub avail: Option<*mut u8>,
    pub used: Option<*mut u8>,
    pub flags: u32,
    /// Guest-physical base of the used ring, used to compute dirty-log bit
    /// offsets for used-ring writes.
    pub log_guest_addr: u64,
    pub last_avail_idx: u16,
    pub last_used_idx: u16,
    pub kick_fd: Option<RawFd>,
    pub call_fd: Option<RawFd>,
    pub err_fd: Option<RawFd>,
}

// SAFETY: the raw pointers here alias front-end-owned shared memory, not
// Rust-owned data; the queue is only ever touched by the single reactor
// thread that owns its session.
unsafe impl Send for VirtQueue {}

impl Default for VirtQueue {
    fn default() -> Self {
        Self {
            num: 0,
            desc: None,
            avail: None,
            used: None,
            flags: 0,
            log_guest_addr: 0,
            last_avail_idx: 0,
            last_used_idx: 0,
            kick_fd: None,
            call_fd: None,
            err_fd: None,
        }
    }
}

impl VirtQueue {
    pub fn is_ready(&self) -> bool {
        self.num > 0 && self.desc.is_some() && self.avail.is_some() && self.used.is_some()
    }

    /// Sets the three ring addresses and, per the vhost-user contract,
    /// snapshots `last_used_idx` from the ring's current `used.idx`.
    ///
    /// This snapshot is only correct if the front-end has not yet produced
    /// used entries at the time it sends SET_VRING_ADDR — a constraint the
    /// protocol leaves implicit rather than one this code can verify.
    ///
    /// ### Safety
    /// `used` must point at a live used ring (or be about to before any
    /// ring walk runs).
    pub unsafe fn set_addresses(&mut self, desc: *mut u8, avail: *mut u8, used: *mut u8) {
        self.desc = Some(desc);
        self.avail = Some(avail);
        self.used = Some(used);
        self.last_used_idx = read_used_idx(used);
    }
}

/// Reads `used.idx` without ordering requirements, used only for the
/// SET_VRING_ADDR snapshot above (no descriptor-chain data depends on it).
///
/// ### Safety
/// `used_base` must point at a live used ring.
unsafe fn read_used_idx(used_base: *mut u8) -> u16 {
    let ptr = used_base.add(2) as *const u16;
    std::ptr::read_volatile(ptr)
}

/// Holds state for all queues of a session. Exactly [`QUEUE_COUNT`] queues exist, by fixed index.
pub struct RingTable {
    queues: [VirtQueue; QUEUE_COUNT],
}

impl Default for RingTable {
    fn default() -> Self {
        Self {
            queues: [VirtQueue::default(), VirtQueue::default()],
        }
    }
}

impl RingTable {
    pub fn get(&self, idx: usize) -> Option<&VirtQueue> {
        self.queues.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut VirtQueue> {
        self.queues.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtQueue> {
        self.queues.iter()
    }
}
