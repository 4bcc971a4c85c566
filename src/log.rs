//! Dirty-page log for live migration.
//!
//! A host mapping of a front-end-supplied descriptor, interpreted as a bit
//! array indexed by `guest_phys_addr / LOG_CHUNK`.

use std::{
    fs::File,
    num::NonZeroUsize,
    os::fd::{AsRawFd, FromRawFd, RawFd},
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::unistd;

use crate::{
    error::MemoryError,
    memory::MemoryMap,
    vring::{used_ring_size, RingTable},
};

/// Granularity, in bytes, of one dirty-log bit.
pub const LOG_CHUNK: u64 = 4096;

/// Computes the required log size in bytes: the maximum, over every mapped
/// memory region and every configured ring's used-ring extent, of
/// `(last_byte / LOG_CHUNK + 1)` bits, rounded up to whole bytes.
pub fn required_log_size(memory: &MemoryMap, rings: &RingTable) -> u64 {
    let mut highest_chunk = memory
        .highest_guest_byte()
        .map(|last| last / LOG_CHUNK)
        .unwrap_or(0);

    for queue in rings.iter() {
        if queue.num == 0 {
            continue;
        }
        let last = queue.log_guest_addr + used_ring_size(queue.num) - 1;
        highest_chunk = highest_chunk.max(last / LOG_CHUNK);
    }

    (highest_chunk + 1).div_ceil(8)
}

/// A mapped dirty-page bitmap plus the optional eventfd used to notify the
/// front-end after a batch of writes.
pub struct DirtyLog {
    base: NonNull<u8>,
    len: usize,
    _backing: File,
    notify_fd: Option<RawFd>,
}

// SAFETY: log bits are set with an atomic OR on the owning byte; the map is
// only ever touched by the single reactor thread owning the session plus
// the front-end, which only reads it.
unsafe impl Send for DirtyLog {}

impl DirtyLog {
    /// Maps `fd` for `size_bytes` bytes of dirty-log storage.
    pub fn map(fd: RawFd, size_bytes: u64) -> Result<Self, MemoryError> {
        let len = NonZeroUsize::new(size_bytes as usize).ok_or(MemoryError::EmptyRegion)?;
        let file = unsafe { File::from_raw_fd(nix::unistd::dup(fd).map_err(MemoryError::Mmap)?) };

        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let flags = MapFlags::MAP_SHARED;
        let ptr =
            unsafe { mman::mmap(None, len, prot, flags, &file, 0) }.map_err(MemoryError::Mmap)?;

        Ok(Self {
            base: ptr.cast(),
            len: len.get(),
            _backing: file,
            notify_fd: None,
        })
    }

    pub fn set_notify_fd(&mut self, fd: RawFd) {
        self.notify_fd = Some(fd);
    }

    /// Sets the dirty bit for every `LOG_CHUNK`-aligned chunk overlapping
    /// `[guest_addr, guest_addr + len)`. Out-of-range chunks are silently
    /// ignored — a log that is simply too small to cover a write must never
    /// panic the session.
    pub fn mark_dirty(&self, guest_addr: u64, len: u64) {
        if len == 0 {
            return;
        }

        let first_chunk = guest_addr / LOG_CHUNK;
        let last_chunk = (guest_addr + len - 1) / LOG_CHUNK;

        for chunk in first_chunk..=last_chunk {
            self.set_bit(chunk);
        }
    }

    fn set_bit(&self, chunk: u64) {
        let byte_idx = (chunk / 8) as usize;
        if byte_idx >= self.len {
            return;
        }
        let bit = 1u8 << (chunk % 8);

        // SAFETY: byte_idx < len, within the mapped region.
        let byte = unsafe { &*(self.base.as_ptr().add(byte_idx) as *const AtomicU8) };
        byte.fetch_or(bit, Ordering::Relaxed);
    }

    /// Reads a single dirty bit; exposed for tests.
    #[cfg(test)]
    pub(crate) fn get_bit(&self, chunk: u64) -> bool {
        let byte_idx = (chunk / 8) as usize;
        if byte_idx >= self.len {
            return false;
        }
        let byte = unsafe { &*(self.base.as_ptr().add(byte_idx) as *const AtomicU8) };
        (byte.load(Ordering::Relaxed) >> (chunk % 8)) & 1 == 1
    }

    /// Notifies the front-end (if a log eventfd is set) that a batch of
    /// dirty bits has been written.
    pub fn notify(&self) {
        if let Some(fd) = self.notify_fd {
            if let Err(error) = unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &1u64.to_le_bytes()) {
                tracing::warn!(?error, "failed to notify log eventfd");
            }
        }
    }
}

impl Drop for DirtyLog {
    fn drop(&mut self) {
        if let Some(len) = NonZeroUsize::new(self.len) {
            if let Err(error) = unsafe { mman::munmap(self.base.cast(), len.get()) } {
                tracing::warn!(?error, "failed to unmap dirty log");
            }
        }
        if let Some(fd) = self.notify_fd.take() {
            let _ = unistd::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(size: u64) -> DirtyLog {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size).unwrap();
        DirtyLog::map(file.as_raw_fd(), size).unwrap()
    }

    #[test]
    fn marks_correct_chunk() {
        let log = log_of(32 * 1024);
        log.mark_dirty(0x10000, 1);
        assert!(log.get_bit(0x10000 / LOG_CHUNK));
        assert!(!log.get_bit(0x10000 / LOG_CHUNK + 1));
    }

    #[test]
    fn marks_every_chunk_spanned() {
        let log = log_of(32 * 1024);
        // spans chunk 0 and chunk 1
        log.mark_dirty(LOG_CHUNK - 1, 2);
        assert!(log.get_bit(0));
        assert!(log.get_bit(1));
    }

    #[test]
    fn out_of_range_write_does_not_panic() {
        let log = log_of(8);
        log.mark_dirty(LOG_CHUNK * 1000, 16);
    }

    #[test]
    fn required_size_accounts_for_regions_and_rings() {
        use crate::memory::MemoryRegion;

        let mut memory = MemoryMap::new();
        let file = tempfile::tempfile().unwrap();
        file.set_len(0x10000).unwrap();
        let region = MemoryRegion::map(file.as_raw_fd(), 0, 0x7f00_0000_0000, 0x10000, 0).unwrap();
        memory.push(region).unwrap();

        let rings = RingTable::default();
        let size = required_log_size(&memory, &rings);
        assert!(size >= 1);
    }
}
