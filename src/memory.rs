//! Guest memory region table and address translation
//!
//! Owns every memory region the front-end has mapped into this session via
//! `SET_MEM_TABLE`, and translates addresses in either the guest-physical or
//! front-end-userspace address space into a host pointer this process can
//! dereference.

use std::{
    fs::File,
    num::NonZeroUsize,
    os::fd::{AsRawFd, FromRawFd, RawFd},
    ptr::NonNull,
};

use nix::sys::mman::{self, MapFlags, ProtFlags};

use crate::error::MemoryError;

/// Upper bound on the number of memory regions a single session may hold.
/// The wire format's `memory` payload caps `nregions` at this value too.
pub const MAX_REGIONS: usize = 8;

/// One mapped slice of guest memory.
///
/// Invariant: `host_base`, `guest_phys_base` and `user_base` name the same
/// underlying bytes under three address spaces; any offset `< len` is valid
/// under all three bases.
pub struct MemoryRegion {
    pub guest_phys_base: u64,
    pub user_base: u64,
    pub len: u64,
    host_base: NonNull<u8>,
    /// kept alive only so the mapping isn't torn down under us; the mapping
    /// itself does not read through this descriptor after `mmap` returns.
    _backing: File,
}

// SAFETY: the region owns an exclusive mmap of shared memory and is only
// ever touched by the single reactor thread that owns the session.
unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    /// Maps `fd` (owned) for `len` bytes and records its three addresses.
    ///
    /// ### Arguments
    /// * `fd` - descriptor received from the front-end, already `dup`'d/owned
    /// * `guest_phys_base` - base address of this region in guest-physical space
    /// * `user_base` - base address of this region in the front-end's address space
    /// * `len` - length of the region in bytes
    /// * `mmap_offset` - offset into `fd` where the region's bytes begin
    pub fn map(
        fd: RawFd,
        guest_phys_base: u64,
        user_base: u64,
        len: u64,
        mmap_offset: u64,
    ) -> Result<Self, MemoryError> {
        if len == 0 {
            return Err(MemoryError::EmptyRegion);
        }

        let file = unsafe { File::from_raw_fd(fd_dup(fd)?) };
        let sz = NonZeroUsize::new(len as usize).ok_or(MemoryError::EmptyRegion)?;
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let flags = MapFlags::MAP_SHARED | MapFlags::MAP_NORESERVE;

        let ptr = unsafe { mman::mmap(None, sz, prot, flags, &file, mmap_offset as i64) }
            .map_err(MemoryError::Mmap)?;

        tracing::debug!(
            gpa = format!("0x{guest_phys_base:08x}"),
            uva = format!("0x{user_base:08x}"),
            len,
            host = ?ptr,
            "mapped memory region"
        );

        Ok(Self {
            guest_phys_base,
            user_base,
            len,
            host_base: ptr.cast(),
            _backing: file,
        })
    }

    /// Returns the host pointer for `addr`, if `addr` falls within this
    /// region in the given address space.
    fn translate(&self, base: u64, addr: u64) -> Option<*mut u8> {
        if addr < base || addr - base >= self.len {
            return None;
        }

        let offset = (addr - base) as usize;
        // SAFETY: offset < len, within the mapped region.
        Some(unsafe { self.host_base.as_ptr().add(offset) })
    }

    pub fn translate_guest(&self, addr: u64) -> Option<*mut u8> {
        self.translate(self.guest_phys_base, addr)
    }

    pub fn translate_user(&self, addr: u64) -> Option<*mut u8> {
        self.translate(self.user_base, addr)
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let len = match NonZeroUsize::new(self.len as usize) {
            Some(len) => len,
            None => return,
        };

        // SAFETY: host_base/len were returned together by a prior mmap call
        // and nothing else holds a live reference into this region by the
        // time the session drops it.
        if let Err(error) = unsafe { mman::munmap(self.host_base.cast(), len.get()) } {
            tracing::warn!(?error, "failed to unmap memory region");
        }
    }
}

fn fd_dup(fd: RawFd) -> Result<RawFd, MemoryError> {
    nix::unistd::dup(fd).map_err(MemoryError::Mmap)
}

/// Ordered collection of at most [`MAX_REGIONS`] memory regions, rebuilt
/// wholesale on every `SET_MEM_TABLE`.
#[derive(Default)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self { regions: Vec::new() }
    }

    /// Tears down all previously mapped regions. Called first on every
    /// `SET_MEM_TABLE`, and on session teardown.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn push(&mut self, region: MemoryRegion) -> Result<(), MemoryError> {
        if self.regions.len() >= MAX_REGIONS {
            return Err(MemoryError::TableFull(MAX_REGIONS));
        }
        self.regions.push(region);
        Ok(())
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Translates a guest-physical address to a host pointer.
    ///
    /// Returns `None` if `addr` falls outside every mapped region; callers
    /// must treat that as fatal for the current ring walk only, never for
    /// the session.
    pub fn translate_guest(&self, addr: u64) -> Option<*mut u8> {
        self.regions.iter().find_map(|r| r.translate_guest(addr))
    }

    /// Translates a front-end userspace address to a host pointer. Used only
    /// while handling `SET_VRING_ADDR`.
    pub fn translate_user(&self, addr: u64) -> Option<*mut u8> {
        self.regions.iter().find_map(|r| r.translate_user(addr))
    }

    /// Highest guest-physical byte mapped by any region, used by the dirty
    /// log size computation.
    pub fn highest_guest_byte(&self) -> Option<u64> {
        self.regions
            .iter()
            .map(|r| r.guest_phys_base + r.len - 1)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn anon_region(gpa: u64, uva: u64, len: u64) -> MemoryRegion {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len).unwrap();
        MemoryRegion::map(file.as_raw_fd(), gpa, uva, len, 0).unwrap()
    }

    #[test]
    fn translate_guest_hits_region() {
        let region = anon_region(0x1000, 0x7f00_0000_0000, 0x1_0000);
        let mut map = MemoryMap::new();
        map.push(region).unwrap();

        let a = map.translate_guest(0x1234).unwrap();
        let b = map.translate_user(0x7f00_0000_0234).unwrap();
        assert_eq!(a as usize - 0x234, b as usize - 0x234);
    }

    #[test]
    fn translate_outside_region_is_none() {
        let region = anon_region(0x1000, 0x7f00_0000_0000, 0x1000);
        let mut map = MemoryMap::new();
        map.push(region).unwrap();

        assert!(map.translate_guest(0x10).is_none());
        assert!(map.translate_guest(0x10000).is_none());
    }

    #[test]
    fn table_full_is_rejected() {
        let mut map = MemoryMap::new();
        for i in 0..MAX_REGIONS {
            let region = anon_region((i as u64) * 0x1000, (i as u64) * 0x2000, 0x1000);
            map.push(region).unwrap();
        }

        let extra = anon_region(0x100000, 0x200000, 0x1000);
        assert!(matches!(map.push(extra), Err(MemoryError::TableFull(_))));
    }
}
