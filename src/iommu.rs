//! IOMMU-mediated guest memory.
//!
//! Without an IOMMU a device addresses guest memory directly. Once one is
//! attached, every ring and buffer address of a queue is an IOVA that must
//! fall inside the mapping currently installed for that queue's buffer
//! class; anything else is unmapped.

use core::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{IommuError, MemoryError};
use crate::mm::{ForeignData, GuestMemory, MemFlags};

/// A DMA buffer class. Each queue role of a device is one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferClass(pub u16);

impl fmt::Display for BufferClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An active IOVA → guest-physical window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoMapping {
    pub iova: u64,
    pub len: u64,
    pub gpa: u64,
    pub flags: MemFlags,
}

impl IoMapping {
    /// Guest-physical address for `[iova, iova + len)` if it lies inside
    /// this window.
    pub fn translate(&self, iova: u64, len: u64) -> Option<u64> {
        let end = iova.checked_add(len)?;
        if iova < self.iova || end > self.iova.saturating_add(self.len) {
            return None;
        }
        self.gpa.checked_add(iova - self.iova)
    }
}

/// IOMMU translation service.
pub trait Iommu: Send + Sync {
    fn attach(&self) -> Result<(), IommuError>;
    fn detach(&self);
    fn map(&self, iova: u64, len: u64, flags: MemFlags) -> Result<IoMapping, IommuError>;
    fn unmap(&self, mapping: &IoMapping) -> Result<(), IommuError>;
}

struct DmaState {
    iommu: Option<Arc<dyn Iommu>>,
    classes: Vec<Option<IoMapping>>,
}

/// Per-device table of active mappings, one slot per buffer class.
pub struct DmaMappings {
    state: RwLock<DmaState>,
}

impl DmaMappings {
    pub fn new(classes: u16) -> Self {
        Self {
            state: RwLock::new(DmaState { iommu: None, classes: vec![None; classes as usize] }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DmaState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DmaState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn iommu(&self) -> Option<Arc<dyn Iommu>> {
        self.read().iommu.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.read().iommu.is_some()
    }

    pub fn class_count(&self) -> u16 {
        self.read().classes.len() as u16
    }

    pub fn mapping(&self, class: BufferClass) -> Option<IoMapping> {
        self.read().classes.get(class.0 as usize).copied().flatten()
    }

    pub(crate) fn set_iommu(&self, iommu: Option<Arc<dyn Iommu>>) {
        self.write().iommu = iommu;
    }

    pub(crate) fn insert(&self, class: BufferClass, mapping: IoMapping) -> Result<(), IommuError> {
        let mut state = self.write();
        let slot = state.classes.get_mut(class.0 as usize).ok_or(IommuError::UnknownClass(class))?;
        if slot.is_some() {
            return Err(IommuError::AlreadyMapped(class));
        }
        *slot = Some(mapping);
        Ok(())
    }

    pub(crate) fn remove(&self, class: BufferClass) -> Result<IoMapping, IommuError> {
        let mut state = self.write();
        let slot = state.classes.get_mut(class.0 as usize).ok_or(IommuError::UnknownClass(class))?;
        slot.take().ok_or(IommuError::NotMapped(class))
    }

    /// Resolve an address issued for `class` to a guest-physical one.
    fn resolve(&self, class: BufferClass, addr: u64, len: u64, access: MemFlags) -> Result<u64, MemoryError> {
        let state = self.read();
        if state.iommu.is_none() {
            return Ok(addr);
        }
        let mapping = state
            .classes
            .get(class.0 as usize)
            .copied()
            .flatten()
            .ok_or(MemoryError::Unmapped { addr, len })?;
        let gpa = mapping.translate(addr, len).ok_or(MemoryError::Unmapped { addr, len })?;
        if !mapping.flags.contains(access) {
            return Err(MemoryError::Permission { addr, len, needed: access });
        }
        Ok(gpa)
    }
}

/// The memory a queue sees: guest RAM, seen through the device's mapping
/// for one buffer class.
#[derive(Clone)]
pub struct DmaSpace {
    ram: Arc<dyn GuestMemory>,
    mappings: Arc<DmaMappings>,
    class: BufferClass,
}

impl DmaSpace {
    pub fn new(ram: Arc<dyn GuestMemory>, mappings: Arc<DmaMappings>, class: BufferClass) -> Self {
        Self { ram, mappings, class }
    }

    pub fn class(&self) -> BufferClass {
        self.class
    }
}

impl GuestMemory for DmaSpace {
    fn view(&self, addr: u64, len: u64, access: MemFlags) -> Result<ForeignData<'_>, MemoryError> {
        let gpa = self.mappings.resolve(self.class, addr, len, access)?;
        self.ram.view(gpa, len, access)
    }
}
