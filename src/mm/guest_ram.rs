//! Host-allocated guest RAM.
//!
//! A fixed set of regions, each backed by a page-aligned host allocation.
//! The layout is frozen once the map is shared; only permissions may
//! change afterwards (see [`GuestRam::protect`]).

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use super::{ForeignData, GuestMemory, MemFlags};
use crate::error::MemoryError;

const HOST_ALIGN: usize = 4096;

struct RamRegion {
    base: u64,
    len: u64,
    flags: AtomicU8,
    host: NonNull<u8>,
    layout: Layout,
}

impl RamRegion {
    fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.base + self.len,
            None => false,
        }
    }
}

impl Drop for RamRegion {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.host.as_ptr(), self.layout) };
    }
}

/// Guest physical memory made of host-backed regions.
#[derive(Default)]
pub struct GuestRam {
    regions: Vec<RamRegion>,
}

// SAFETY: region memory is only reached through `ForeignData`, which makes
// no exclusivity claims; the region table itself is immutable once shared
// and permissions are atomics.
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zero-filled region of `len` bytes at guest address `base`.
    pub fn add_region(&mut self, base: u64, len: u64, flags: MemFlags) -> Result<(), MemoryError> {
        let end = base.checked_add(len).ok_or(MemoryError::Unmapped { addr: base, len })?;
        if len == 0 {
            return Err(MemoryError::Unmapped { addr: base, len });
        }
        if self.regions.iter().any(|r| base < r.base + r.len && r.base < end) {
            return Err(MemoryError::Overlap { base, len });
        }
        let size = usize::try_from(len).map_err(|_| MemoryError::Unmapped { addr: base, len })?;
        let layout = Layout::from_size_align(size, HOST_ALIGN)
            .map_err(|_| MemoryError::Unmapped { addr: base, len })?;
        // Safety: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let host = match NonNull::new(raw) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        self.regions.push(RamRegion { base, len, flags: AtomicU8::new(flags.bits()), host, layout });
        Ok(())
    }

    /// Builder form of [`add_region`](Self::add_region) for RW RAM.
    pub fn with_region(mut self, base: u64, len: u64) -> Result<Self, MemoryError> {
        self.add_region(base, len, MemFlags::RW)?;
        Ok(self)
    }

    /// Change the permissions of the region starting at `base`.
    ///
    /// Returns false if no region starts there.
    pub fn protect(&self, base: u64, flags: MemFlags) -> bool {
        match self.regions.iter().find(|r| r.base == base) {
            Some(r) => {
                r.flags.store(flags.bits(), Ordering::Release);
                true
            }
            None => false,
        }
    }
}

impl GuestMemory for GuestRam {
    fn view(&self, addr: u64, len: u64, access: MemFlags) -> Result<ForeignData<'_>, MemoryError> {
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(addr, len))
            .ok_or(MemoryError::Unmapped { addr, len })?;
        let flags = MemFlags::from_bits_truncate(region.flags.load(Ordering::Acquire));
        if !flags.contains(access) {
            return Err(MemoryError::Permission { addr, len, needed: access });
        }
        let offset = (addr - region.base) as usize;
        // Safety: the range lies inside the region allocation, which lives
        // as long as `self`.
        Ok(unsafe {
            ForeignData::from_raw_parts(
                NonNull::new_unchecked(region.host.as_ptr().add(offset)),
                len as usize,
            )
        })
    }
}
