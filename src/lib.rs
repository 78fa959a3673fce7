//! Virtio device core for a virtual machine monitor.
//!
//! Presents paravirtualized block, network, socket and console devices to
//! a guest over the virtio-mmio transport. Every register value, ring
//! address and descriptor the guest supplies is validated before the host
//! touches memory, talks to a backend or raises an interrupt.
//!
//! Entry points: [`devices::DeviceConfig::build`] creates a device,
//! [`devices::MmioDevice`] is the bus-facing side, and
//! [`devices::virtio::backend::Backend`] is what an I/O backend implements.

pub mod devices;
pub mod dtb;
pub mod error;
pub mod iommu;
pub mod irq;
pub mod mm;
pub mod platform;
pub mod sync;

pub use devices::{Device, DeviceConfig, DeviceKind, MmioDevice};
pub use error::{AccessError, ConfigError, DtbError, IommuError, MemoryError, QueueError};
