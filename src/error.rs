//! Error types for the virtio device core.
//!
//! Guest protocol violations surface as `AccessError` (register traffic)
//! or `QueueError` (ring contents). Neither is fatal to the host: the
//! transport rejects the access or fails the affected queue.

use thiserror::Error;

use crate::iommu::BufferClass;
use crate::mm::MemFlags;

/// Rejected register access. The access has no side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("unsupported access size {size} at offset {offset:#x}")]
    BadSize { offset: u64, size: u8 },

    #[error("offset {0:#x} does not name a register")]
    BadOffset(u64),

    #[error("register at {0:#x} is read-only")]
    ReadOnly(u64),

    #[error("register at {0:#x} is write-only")]
    WriteOnly(u64),
}

/// Failed foreign-memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("guest range {addr:#x}+{len:#x} is not backed by memory")]
    Unmapped { addr: u64, len: u64 },

    #[error("guest range {addr:#x}+{len:#x} does not allow {needed:?}")]
    Permission { addr: u64, len: u64, needed: MemFlags },

    #[error("offset {offset:#x}+{len:#x} exceeds a {size:#x}-byte view")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("region {base:#x}+{len:#x} overlaps an existing region")]
    Overlap { base: u64, len: u64 },
}

/// Queue construction or descriptor-walk failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue size {0} is not a non-zero power of two")]
    BadSize(u16),

    #[error("queue size {size} exceeds the maximum of {max}")]
    TooLarge { size: u16, max: u16 },

    #[error("{ring} ring at {addr:#x} is misaligned")]
    Misaligned { ring: &'static str, addr: u64 },

    #[error("{ring} ring is not backed by guest memory: {source}")]
    Unbacked {
        ring: &'static str,
        #[source]
        source: MemoryError,
    },

    #[error("{0} and {1} rings overlap")]
    Overlap(&'static str, &'static str),

    #[error("descriptor index {index} out of range for a table of {size}")]
    DescriptorIndex { index: u16, size: u16 },

    #[error("descriptor chain longer than {0} entries")]
    ChainTooLong(u16),

    #[error("available index moved by {0} entries")]
    AvailOverrun(u16),

    #[error("malformed indirect descriptor")]
    BadIndirect,

    #[error("device-readable descriptor follows a device-writable one")]
    OrderViolation,

    #[error("descriptor buffer is not accessible: {0}")]
    Buffer(#[from] MemoryError),

    #[error("queue has failed and needs a device reset")]
    Failed,

    #[error("queue was retired by a device reset")]
    Retired,
}

/// IOMMU or backend mapping failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IommuError {
    #[error("no IOMMU is attached")]
    NotAttached,

    #[error("an IOMMU is already attached")]
    AlreadyAttached,

    #[error("IOMMU refused to attach the device")]
    AttachFailed,

    #[error("buffer class {0} does not exist on this device")]
    UnknownClass(BufferClass),

    #[error("buffer class {0} is already mapped")]
    AlreadyMapped(BufferClass),

    #[error("buffer class {0} is not mapped")]
    NotMapped(BufferClass),

    #[error("IOVA range {iova:#x}+{len:#x} is empty or wraps")]
    InvalidRange { iova: u64, len: u64 },

    #[error("mapping of {iova:#x}+{len:#x} failed")]
    MapFailed { iova: u64, len: u64 },

    #[error("unmapping {iova:#x} failed")]
    UnmapFailed { iova: u64 },
}

/// Device-tree discovery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DtbError {
    #[error("blob is not a valid flattened device tree")]
    Invalid,

    #[error("virtio,mmio node has no reg property")]
    MissingReg,

    #[error("virtio,mmio node has no usable interrupts property")]
    MissingInterrupt,
}

/// Rejected device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("maximum queue size {0} is not a power of two in 1..=32768")]
    QueueSize(u16),

    #[error("device needs {0} queues, more than the transport supports")]
    TooManyQueues(u16),

    #[error("config block of {0} bytes does not fit the MMIO window")]
    ConfigTooLarge(usize),

    #[error("MMIO window at {0:#x} is not 0x200-aligned")]
    Misaligned(u64),

    #[error("context ID {0} is reserved")]
    ReservedCid(u64),
}
