//! The ring processor: walks a virtqueue's available ring, gathers
//! descriptor chains into flat buffers (or scatters flat buffers into
//! writable chains), and publishes the used ring.
//!
//! This is deliberately hand-rolled rather than delegated to a ring-walking
//! crate — translating descriptor addresses through the memory map and
//! getting the acquire/release pairing right around `avail.idx`/`used.idx`
//! is the part of this backend that actually needs to be gotten right.

use crate::{
    log::DirtyLog,
    memory::MemoryMap,
    vring::{
        read_avail_idx, read_avail_ring, read_descriptor, write_used_elem, write_used_idx,
        DescFlags, VirtQueue, QUEUE_MAX_SIZE,
    },
};

/// Legacy virtio-net header length (`struct virtio_net_hdr`) prepended to
/// every packet buffer. This backend negotiates no offload features, so the
/// header is always this minimal 10-byte form padded to 12 bytes as qemu's
/// vhost-user front-ends expect.
pub const VIRTIO_NET_HDR_LEN: usize = 12;

/// Largest packet (header included) this device will gather from a transmit
/// chain or attempt to place into a receive chain. Chains that would exceed
/// this are dropped rather than partially filled.
pub const MAX_PACKET_SIZE: usize = 65536;

/// One descriptor chain, resolved to host pointers, in traversal order.
struct Chain {
    head: u16,
    segments: Vec<Segment>,
}

struct Segment {
    ptr: *mut u8,
    /// Guest-physical address this segment's bytes live at, used to mark
    /// the dirty log when the processor writes into it.
    gpa: u64,
    len: u32,
    writable: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TxOutcome {
    pub chains_consumed: u32,
    pub bytes_gathered: u64,
    pub dropped_oversized: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RxOutcome {
    pub chains_consumed: u32,
    pub bytes_written: u64,
    pub packets_dropped_no_buffer: u32,
}

/// Walks one descriptor chain starting at `head`, following `NEXT` links and
/// expanding at most one level of `INDIRECT` table. Returns the resolved
/// segments in order, or `None` if any address in the chain fails to
/// translate — the chain is then skipped entirely rather than partially
/// processed.
fn gather_chain(memory: &MemoryMap, table_base: *mut u8, head: u16, queue_num: u16) -> Option<Chain> {
    let max_chain_len = queue_num.max(1) as usize;
    let mut segments = Vec::new();
    let mut idx = head;
    let mut visited = 0usize;
    let mut base = table_base;
    let mut in_indirect = false;

    loop {
        visited += 1;
        if visited > max_chain_len {
            tracing::warn!(head, max_chain_len, "descriptor chain exceeded max length, dropping");
            return None;
        }

        // SAFETY: base is either the queue's own descriptor table or a
        // translated indirect table, both live for the duration of this walk.
        let desc = unsafe { read_descriptor(base, idx) };
        let flags = DescFlags::from_bits_truncate(desc.flags);

        if flags.contains(DescFlags::INDIRECT) {
            if in_indirect {
                tracing::warn!(head, "nested indirect descriptor table, dropping chain");
                return None;
            }
            let indirect_base = memory.translate_guest(desc.addr)?;
            let count = desc.len as usize / crate::vring::DESCRIPTOR_SIZE;
            if count == 0 || count > QUEUE_MAX_SIZE as usize {
                tracing::warn!(head, count, "indirect table has invalid entry count");
                return None;
            }
            in_indirect = true;
            base = indirect_base;
            idx = 0;
            continue;
        }

        let ptr = memory.translate_guest(desc.addr)?;
        segments.push(Segment {
            ptr,
            gpa: desc.addr,
            len: desc.len,
            writable: flags.contains(DescFlags::WRITE),
        });

        if !flags.contains(DescFlags::NEXT) {
            break;
        }
        idx = desc.next;
    }

    Some(Chain { head, segments })
}

/// Publishes one used-ring entry for `chain`, advancing `last_used_idx` and
/// marking the used-ring bytes dirty in `log` (if present).
fn publish_used(queue: &mut VirtQueue, log: Option<&DirtyLog>, head: u16, len: u32) {
    let used = match queue.used {
        Some(p) => p,
        None => return,
    };
    let slot = queue.last_used_idx % queue.num.max(1);

    // SAFETY: used points at a live used ring of at least queue.num entries.
    unsafe {
        write_used_elem(used, slot, head as u32, len);
    }
    queue.last_used_idx = queue.last_used_idx.wrapping_add(1);
    // SAFETY: as above.
    unsafe {
        write_used_idx(used, queue.last_used_idx);
    }

    if let Some(log) = log {
        log.mark_dirty(queue.log_guest_addr, crate::vring::used_ring_size(queue.num));
    }
}

/// Drains every available transmit chain, concatenating each chain's
/// readable segments (minus the leading virtio-net header) into one buffer
/// per packet and handing it to `sink`. Used-ring entries are published with
/// `len = 0`, the customary value for transmit completions.
pub fn process_tx(
    queue: &mut VirtQueue,
    memory: &MemoryMap,
    log: Option<&DirtyLog>,
    mut sink: impl FnMut(Vec<u8>),
) -> TxOutcome {
    let mut outcome = TxOutcome::default();
    let (desc, avail) = match (queue.desc, queue.avail) {
        (Some(d), Some(a)) => (d, a),
        _ => return outcome,
    };

    // SAFETY: avail points at a live available ring.
    let avail_idx = unsafe { read_avail_idx(avail) };

    while queue.last_avail_idx != avail_idx {
        let slot = queue.last_avail_idx % queue.num.max(1);
        // SAFETY: avail points at a live available ring with queue.num entries.
        let head = unsafe { read_avail_ring(avail, slot) };
        queue.last_avail_idx = queue.last_avail_idx.wrapping_add(1);

        let chain = match gather_chain(memory, desc, head, queue.num) {
            Some(c) => c,
            None => {
                publish_used(queue, log, head, 0);
                continue;
            }
        };

        let total: u64 = chain.segments.iter().map(|s| s.len as u64).sum();
        if total as usize > MAX_PACKET_SIZE {
            outcome.dropped_oversized += 1;
            publish_used(queue, log, head, 0);
            continue;
        }

        let mut buf = Vec::with_capacity(total as usize);
        for seg in &chain.segments {
            if seg.writable {
                continue;
            }
            // SAFETY: seg.ptr/len were produced by gather_chain from a
            // translated, in-bounds region.
            let slice = unsafe { std::slice::from_raw_parts(seg.ptr, seg.len as usize) };
            buf.extend_from_slice(slice);
        }

        outcome.chains_consumed += 1;
        outcome.bytes_gathered += buf.len() as u64;
        publish_used(queue, log, head, 0);

        if buf.len() >= VIRTIO_NET_HDR_LEN {
            sink(buf.split_off(VIRTIO_NET_HDR_LEN));
        }
    }

    outcome
}

/// Fills as many available receive chains as there are packets returned by
/// `source`, prepending a zeroed virtio-net header to each. Stops when
/// either the ring runs dry or `source` returns `None`. A packet (plus
/// header) that doesn't fit in the head chain pulled for it is dropped, not
/// partially written.
pub fn process_rx(
    queue: &mut VirtQueue,
    memory: &MemoryMap,
    log: Option<&DirtyLog>,
    mut source: impl FnMut() -> Option<Vec<u8>>,
) -> RxOutcome {
    let mut outcome = RxOutcome::default();
    let (desc, avail) = match (queue.desc, queue.avail) {
        (Some(d), Some(a)) => (d, a),
        _ => return outcome,
    };

    loop {
        // SAFETY: avail points at a live available ring.
        let avail_idx = unsafe { read_avail_idx(avail) };
        if queue.last_avail_idx == avail_idx {
            break;
        }

        let packet = match source() {
            Some(p) => p,
            None => break,
        };

        let slot = queue.last_avail_idx % queue.num.max(1);
        // SAFETY: avail points at a live available ring with queue.num entries.
        let head = unsafe { read_avail_ring(avail, slot) };
        queue.last_avail_idx = queue.last_avail_idx.wrapping_add(1);

        let chain = match gather_chain(memory, desc, head, queue.num) {
            Some(c) => c,
            None => {
                publish_used(queue, log, head, 0);
                continue;
            }
        };

        let capacity: u64 = chain
            .segments
            .iter()
            .filter(|s| s.writable)
            .map(|s| s.len as u64)
            .sum();
        let needed = (VIRTIO_NET_HDR_LEN + packet.len()) as u64;

        if capacity < needed {
            tracing::warn!(capacity, needed, "receive chain too small, dropping packet");
            outcome.packets_dropped_no_buffer += 1;
            publish_used(queue, log, head, 0);
            continue;
        }

        let mut written = 0u64;
        let mut remaining: &[u8] = &[0u8; VIRTIO_NET_HDR_LEN];
        let mut header_done = false;
        let mut packet_cursor = &packet[..];

        for seg in chain.segments.iter().filter(|s| s.writable) {
            let mut dst = seg.ptr;
            let mut space = seg.len as usize;
            let mut seg_written = 0u64;

            if !header_done {
                let take = space.min(remaining.len());
                // SAFETY: dst is a translated, in-bounds writable region.
                unsafe { std::ptr::copy_nonoverlapping(remaining.as_ptr(), dst, take) };
                remaining = &remaining[take..];
                dst = unsafe { dst.add(take) };
                space -= take;
                written += take as u64;
                seg_written += take as u64;
                if remaining.is_empty() {
                    header_done = true;
                }
            }

            if header_done && space > 0 && !packet_cursor.is_empty() {
                let take = space.min(packet_cursor.len());
                // SAFETY: as above.
                unsafe { std::ptr::copy_nonoverlapping(packet_cursor.as_ptr(), dst, take) };
                packet_cursor = &packet_cursor[take..];
                written += take as u64;
                seg_written += take as u64;
            }

            if seg_written > 0 {
                if let Some(log) = log {
                    log.mark_dirty(seg.gpa, seg_written);
                }
            }

            if header_done && packet_cursor.is_empty() {
                break;
            }
        }

        outcome.chains_consumed += 1;
        outcome.bytes_written += written;
        publish_used(queue, log, head, written as u32);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegion;
    use crate::vring::DESCRIPTOR_SIZE;
    use std::os::fd::AsRawFd;

    /// Builds a single guest-memory region large enough to hold a descriptor
    /// table, available ring, used ring, and some packet scratch space, all
    /// at fixed offsets, and returns host pointers to each.
    struct Harness {
        _memory: MemoryMap,
        desc: *mut u8,
        avail: *mut u8,
        used: *mut u8,
        data: *mut u8,
    }

    fn harness(num: u16) -> Harness {
        let region_len = 0x10000u64;
        let file = tempfile::tempfile().unwrap();
        file.set_len(region_len).unwrap();
        let region = MemoryRegion::map(file.as_raw_fd(), 0, 0, region_len, 0).unwrap();

        let desc = region.translate_guest(0).unwrap();
        let avail = region.translate_guest(0x1000).unwrap();
        let used = region.translate_guest(0x2000).unwrap();
        let data = region.translate_guest(0x3000).unwrap();

        let mut memory = MemoryMap::new();
        memory.push(region).unwrap();

        unsafe {
            std::ptr::write_bytes(avail, 0, 4 + num as usize * 2);
            std::ptr::write_bytes(used, 0, 4 + num as usize * 8);
        }

        Harness {
            _memory: memory,
            desc,
            avail,
            used,
            data,
        }
    }

    unsafe fn write_desc(table: *mut u8, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let ptr = table.add(idx as usize * DESCRIPTOR_SIZE) as *mut u8;
        std::ptr::write_unaligned(ptr as *mut u64, addr);
        std::ptr::write_unaligned(ptr.add(8) as *mut u32, len);
        std::ptr::write_unaligned(ptr.add(12) as *mut u16, flags);
        std::ptr::write_unaligned(ptr.add(14) as *mut u16, next);
    }

    unsafe fn set_avail(avail: *mut u8, slot: u16, head: u16, idx: u16) {
        let ring_ptr = avail.add(4 + slot as usize * 2) as *mut u16;
        std::ptr::write_unaligned(ring_ptr, head);
        std::ptr::write_unaligned(avail.add(2) as *mut u16, idx);
    }

    fn queue_of(h: &Harness, num: u16) -> VirtQueue {
        let mut q = VirtQueue::default();
        q.num = num;
        q.desc = Some(h.desc);
        q.avail = Some(h.avail);
        q.used = Some(h.used);
        q
    }

    #[test]
    fn tx_single_descriptor_chain_strips_header() {
        let h = harness(4);
        let mut q = queue_of(&h, 4);

        unsafe {
            std::ptr::write_bytes(h.data, 0, VIRTIO_NET_HDR_LEN);
            std::ptr::copy_nonoverlapping(b"hi".as_ptr(), h.data.add(VIRTIO_NET_HDR_LEN), 2);
            write_desc(h.desc, 0, 0x3000, VIRTIO_NET_HDR_LEN as u32 + 2, 0, 0);
            set_avail(h.avail, 0, 0, 1);
        }

        let mut seen = Vec::new();
        let outcome = process_tx(&mut q, &h._memory, None, |pkt| seen.push(pkt));

        assert_eq!(outcome.chains_consumed, 1);
        assert_eq!(seen, vec![b"hi".to_vec()]);
        assert_eq!(q.last_avail_idx, 1);
    }

    #[test]
    fn tx_chained_descriptor_is_concatenated() {
        let h = harness(4);
        let mut q = queue_of(&h, 4);

        unsafe {
            std::ptr::write_bytes(h.data, 0, VIRTIO_NET_HDR_LEN);
            std::ptr::copy_nonoverlapping(b"ab".as_ptr(), h.data.add(0x100), 2);
            write_desc(h.desc, 0, 0x3000, VIRTIO_NET_HDR_LEN as u32, DescFlags::NEXT.bits(), 1);
            write_desc(h.desc, 1, 0x3100, 2, 0, 0);
            set_avail(h.avail, 0, 0, 1);
        }

        let mut seen = Vec::new();
        process_tx(&mut q, &h._memory, None, |pkt| seen.push(pkt));
        assert_eq!(seen, vec![b"ab".to_vec()]);
    }

    #[test]
    fn rx_drops_packet_too_large_for_chain() {
        let h = harness(4);
        let mut q = queue_of(&h, 4);

        unsafe {
            write_desc(h.desc, 0, 0x3000, 4, DescFlags::WRITE.bits(), 0);
            set_avail(h.avail, 0, 0, 1);
        }

        let mut calls = 0;
        let outcome = process_rx(&mut q, &h._memory, None, || {
            calls += 1;
            if calls == 1 {
                Some(vec![0u8; 64])
            } else {
                None
            }
        });

        assert_eq!(outcome.packets_dropped_no_buffer, 1);
        assert_eq!(q.last_avail_idx, 1);
    }

    #[test]
    fn rx_writes_header_then_payload() {
        let h = harness(4);
        let mut q = queue_of(&h, 4);

        unsafe {
            write_desc(h.desc, 0, 0x3000, 256, DescFlags::WRITE.bits(), 0);
            set_avail(h.avail, 0, 0, 1);
        }

        let mut calls = 0;
        let outcome = process_rx(&mut q, &h._memory, None, || {
            calls += 1;
            if calls == 1 {
                Some(b"payload".to_vec())
            } else {
                None
            }
        });

        assert_eq!(outcome.chains_consumed, 1);
        assert_eq!(outcome.bytes_written as usize, VIRTIO_NET_HDR_LEN + 7);

        let written = unsafe {
            std::slice::from_raw_parts(h.data.add(VIRTIO_NET_HDR_LEN), 7)
        };
        assert_eq!(written, b"payload");
    }

    #[test]
    fn unready_queue_is_a_no_op() {
        let h = harness(4);
        let mut q = VirtQueue::default();
        let outcome = process_tx(&mut q, &h._memory, None, |_| panic!("sink should not run"));
        assert_eq!(outcome.chains_consumed, 0);
    }

    #[test]
    fn rx_write_marks_dirty_log_for_written_bytes() {
        use crate::log::{DirtyLog, LOG_CHUNK};
        use std::os::fd::AsRawFd;

        let h = harness(4);
        let mut q = queue_of(&h, 4);

        unsafe {
            write_desc(h.desc, 0, 0x3000, 256, DescFlags::WRITE.bits(), 0);
            set_avail(h.avail, 0, 0, 1);
        }

        let log_file = tempfile::tempfile().unwrap();
        log_file.set_len(64).unwrap();
        let log = DirtyLog::map(log_file.as_raw_fd(), 64).unwrap();

        let mut calls = 0;
        process_rx(&mut q, &h._memory, Some(&log), || {
            calls += 1;
            if calls == 1 {
                Some(b"payload".to_vec())
            } else {
                None
            }
        });

        // the write-segment lives at guest address 0x3000, spanning into the
        // payload bytes beyond the header; its chunk must be marked dirty
        // independently of whatever chunk the used ring lives in.
        assert!(log.get_bit(0x3000 / LOG_CHUNK));
    }

    #[test]
    fn chain_length_exactly_num_is_not_dropped() {
        let num = 8u16;
        let h = harness(num);
        let mut q = queue_of(&h, num);

        // build a chain of exactly `num` descriptors, each carrying 1 byte of
        // the readable payload, so the chain walk visits `num` descriptors
        // before hitting the end of the NEXT links.
        unsafe {
            for i in 0..num {
                let addr = 0x3000 + i as u64;
                std::ptr::write_bytes(h.data.add(i as usize), b'x', 1);
                let next = if i + 1 < num { i + 1 } else { 0 };
                let flags = if i + 1 < num { DescFlags::NEXT.bits() } else { 0 };
                write_desc(h.desc, i, addr, 1, flags, next);
            }
            set_avail(h.avail, 0, 0, 1);
        }

        let mut seen = Vec::new();
        let outcome = process_tx(&mut q, &h._memory, None, |pkt| seen.push(pkt));

        assert_eq!(outcome.chains_consumed, 1, "a chain of length == num must not be dropped as too long");
    }
}
