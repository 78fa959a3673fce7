//! Virtio device framework.
//!
//! Implements the virtio-mmio transport and the event orchestration shared
//! by all device types. A concrete device (block, net, vsock, console)
//! implements [`VirtioDevice`]: it supplies its config layout and feature
//! defaults and forwards lifecycle events to an external backend through a
//! [`BackendPort`](backend::BackendPort).

pub mod backend;
pub mod blk;
pub mod config;
pub mod console;
pub mod device;
pub mod mmio;
pub mod net;
pub mod queue;
pub mod vsock;

use core::ops::Range;

use bitflags::bitflags;

use backend::{ActiveDevice, BackendPort};

/// Transport limit on queues per device (doorbells are tracked in a u64).
pub const MAX_QUEUES: u16 = 64;

/// Largest queue size the split ring format allows.
pub const MAX_QUEUE_SIZE: u16 = 32768;

// ── Feature bits shared by all device types ────────────────────────
pub const VIRTIO_F_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Virtio device IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceId {
    Net = 1,
    Block = 2,
    Console = 3,
    Socket = 19,
}

bitflags! {
    /// Device status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

/// Hooks a concrete virtio device provides to the framework.
///
/// The framework owns register state and queues; the device owns its
/// config layout and its connection to the backend. Lifecycle hooks
/// forward to the backend by default.
pub trait VirtioDevice {
    fn device_id(&self) -> DeviceId;

    /// Offered feature bits.
    fn device_features(&self) -> u64;

    fn num_queues(&self) -> u16;

    fn max_queue_size(&self) -> u16 {
        256
    }

    /// Power-on contents of the device-specific config block (MMIO 0x100).
    fn config_space(&self) -> Vec<u8>;

    /// Byte ranges of the config block the driver may write.
    fn config_writable(&self) -> &[Range<usize>] {
        &[]
    }

    fn port(&self) -> &BackendPort;

    /// Doorbell for `queue`.
    fn notify(&mut self, queue: u16) {
        self.port().notify(queue);
    }

    /// The driver set DRIVER_OK; `device` carries the live queues.
    fn driver_ok(&mut self, device: ActiveDevice) {
        self.port().driver_ok(device);
    }

    /// The driver reset the device.
    fn reset(&mut self) {
        self.port().device_reset();
    }

    /// The VMM is tearing the device down.
    fn shutdown(&mut self) {
        self.port().shutdown();
    }
}
