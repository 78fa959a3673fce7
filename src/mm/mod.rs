//! Guest memory access.
//!
//! The VMM owns the guest address-space map; this module only consumes
//! it through [`GuestMemory`]. Every access resolves the target range
//! against the current map, so permission changes take effect on the next
//! access.

pub mod foreign;
pub mod guest_ram;

use core::mem::size_of;

use bitflags::bitflags;
use bytemuck::Pod;

use crate::error::MemoryError;

pub use foreign::{ForeignData, ForeignPtr};
pub use guest_ram::GuestRam;

bitflags! {
    /// Access permissions of a guest memory range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Guest address-space map supplied by the VMM.
pub trait GuestMemory: Send + Sync {
    /// Resolve `[addr, addr + len)` to a host view.
    ///
    /// Fails unless the whole range is backed and grants `access`.
    fn view(&self, addr: u64, len: u64, access: MemFlags) -> Result<ForeignData<'_>, MemoryError>;
}

impl dyn GuestMemory + '_ {
    pub fn check(&self, addr: u64, len: u64, access: MemFlags) -> Result<(), MemoryError> {
        self.view(addr, len, access).map(|_| ())
    }

    pub fn read_obj<T: Pod>(&self, addr: u64) -> Result<T, MemoryError> {
        self.view(addr, size_of::<T>() as u64, MemFlags::READ)?.read(0)
    }

    pub fn write_obj<T: Pod>(&self, addr: u64, val: T) -> Result<(), MemoryError> {
        self.view(addr, size_of::<T>() as u64, MemFlags::WRITE)?.write(0, val)
    }

    pub fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        self.view(addr, dst.len() as u64, MemFlags::READ)?.read_bytes(0, dst)
    }

    pub fn write_bytes(&self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        self.view(addr, src.len() as u64, MemFlags::WRITE)?.write_bytes(0, src)
    }
}
