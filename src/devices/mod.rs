//! Device Emulation Framework
//!
//! Routes MMIO accesses to emulated devices via enum dispatch. The bus
//! that maps guest addresses to devices belongs to the VMM; it only needs
//! [`MmioDevice`].

pub mod virtio;

use std::sync::Arc;

use crate::error::{AccessError, ConfigError};
use crate::irq::IrqController;
use crate::mm::GuestMemory;
use crate::platform::MmioSlot;
use virtio::backend::{Backend, BackendPort};
use virtio::blk::{BlkConfig, VirtioBlk};
use virtio::console::{ConsoleConfig, VirtioConsole};
use virtio::device::{DeviceSettings, VirtioMmioDevice};
use virtio::net::{NetConfig, VirtioNet};
use virtio::vsock::{VirtioVsock, VsockConfig, VMADDR_CID_HOST};
use virtio::DeviceId;

/// Trait for MMIO-accessible devices
///
/// - `read()`/`write()` receive offsets relative to `base_address()`
/// - `size` parameter indicates access width (1, 2, 4, or 8 bytes)
/// - Rejected accesses return an error and change nothing
pub trait MmioDevice {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64, AccessError>;
    fn write(&mut self, offset: u64, value: u64, size: u8) -> Result<(), AccessError>;
    fn base_address(&self) -> u64;
    fn size(&self) -> u64;

    fn contains(&self, addr: u64) -> bool {
        let base = self.base_address();
        addr >= base && addr - base < self.size()
    }

    /// Return a pending INTID if the device wants to assert an interrupt.
    fn pending_irq(&self) -> Option<u32> {
        None
    }

    /// Acknowledge/clear the device-side interrupt.
    fn ack_irq(&mut self) {}
}

// ── Enum dispatch ──────────────────────────────────────────────────

/// Device variant enum, one variant per supported device type.
/// Adding a new device requires adding a variant here.
pub enum Device {
    VirtioBlk(VirtioMmioDevice<VirtioBlk>),
    VirtioNet(VirtioMmioDevice<VirtioNet>),
    VirtioSock(VirtioMmioDevice<VirtioVsock>),
    VirtioConsole(VirtioMmioDevice<VirtioConsole>),
}

impl Device {
    pub fn device_id(&self) -> DeviceId {
        match self {
            Device::VirtioBlk(_) => DeviceId::Block,
            Device::VirtioNet(_) => DeviceId::Net,
            Device::VirtioSock(_) => DeviceId::Socket,
            Device::VirtioConsole(_) => DeviceId::Console,
        }
    }

    /// Release the device's backend; see [`VirtioMmioDevice::shutdown`].
    pub fn shutdown(&mut self) {
        match self {
            Device::VirtioBlk(d) => d.shutdown(),
            Device::VirtioNet(d) => d.shutdown(),
            Device::VirtioSock(d) => d.shutdown(),
            Device::VirtioConsole(d) => d.shutdown(),
        }
    }
}

impl MmioDevice for Device {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64, AccessError> {
        match self {
            Device::VirtioBlk(d) => d.read(offset, size),
            Device::VirtioNet(d) => d.read(offset, size),
            Device::VirtioSock(d) => d.read(offset, size),
            Device::VirtioConsole(d) => d.read(offset, size),
        }
    }

    fn write(&mut self, offset: u64, value: u64, size: u8) -> Result<(), AccessError> {
        match self {
            Device::VirtioBlk(d) => d.write(offset, value, size),
            Device::VirtioNet(d) => d.write(offset, value, size),
            Device::VirtioSock(d) => d.write(offset, value, size),
            Device::VirtioConsole(d) => d.write(offset, value, size),
        }
    }

    fn base_address(&self) -> u64 {
        match self {
            Device::VirtioBlk(d) => d.base_address(),
            Device::VirtioNet(d) => d.base_address(),
            Device::VirtioSock(d) => d.base_address(),
            Device::VirtioConsole(d) => d.base_address(),
        }
    }

    fn size(&self) -> u64 {
        match self {
            Device::VirtioBlk(d) => d.size(),
            Device::VirtioNet(d) => d.size(),
            Device::VirtioSock(d) => d.size(),
            Device::VirtioConsole(d) => d.size(),
        }
    }

    fn pending_irq(&self) -> Option<u32> {
        match self {
            Device::VirtioBlk(d) => d.pending_irq(),
            Device::VirtioNet(d) => d.pending_irq(),
            Device::VirtioSock(d) => d.pending_irq(),
            Device::VirtioConsole(d) => d.pending_irq(),
        }
    }

    fn ack_irq(&mut self) {
        match self {
            Device::VirtioBlk(d) => d.ack_irq(),
            Device::VirtioNet(d) => d.ack_irq(),
            Device::VirtioSock(d) => d.ack_irq(),
            Device::VirtioConsole(d) => d.ack_irq(),
        }
    }
}

// ── Configuration ──────────────────────────────────────────────────

/// Which device, with its type-specific settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block(BlkConfig),
    Net(NetConfig),
    Socket(VsockConfig),
    Console(ConsoleConfig),
}

/// Everything needed to instantiate one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub slot: MmioSlot,
    pub kind: DeviceKind,
    pub max_queue_size: u16,
    pub indirect_desc: bool,
}

impl DeviceConfig {
    pub fn new(slot: MmioSlot, kind: DeviceKind) -> Self {
        Self { slot, kind, max_queue_size: 256, indirect_desc: false }
    }

    /// Checks that need no device instance. Layout limits are enforced
    /// again when the device is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let qs = self.max_queue_size;
        if qs == 0 || !qs.is_power_of_two() || qs > virtio::MAX_QUEUE_SIZE {
            return Err(ConfigError::QueueSize(qs));
        }
        if self.slot.base % virtio::mmio::MMIO_SIZE != 0 {
            return Err(ConfigError::Misaligned(self.slot.base));
        }
        if let DeviceKind::Socket(cfg) = self.kind {
            if cfg.guest_cid <= VMADDR_CID_HOST {
                return Err(ConfigError::ReservedCid(cfg.guest_cid));
            }
        }
        Ok(())
    }

    fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            base: self.slot.base,
            intid: self.slot.intid,
            max_queue_size: self.max_queue_size,
            indirect_desc: self.indirect_desc,
        }
    }

    /// Instantiate the device, wired to `backend`.
    pub fn build(
        &self,
        backend: Arc<dyn Backend>,
        mem: Arc<dyn GuestMemory>,
        irq: Arc<dyn IrqController>,
    ) -> Result<Device, ConfigError> {
        self.validate()?;
        let settings = self.settings();
        let port = BackendPort::new(backend);
        Ok(match self.kind {
            DeviceKind::Block(cfg) => Device::VirtioBlk(VirtioMmioDevice::new(VirtioBlk::new(cfg, port), settings, mem, irq)?),
            DeviceKind::Net(cfg) => Device::VirtioNet(VirtioMmioDevice::new(VirtioNet::new(cfg, port), settings, mem, irq)?),
            DeviceKind::Socket(cfg) => {
                Device::VirtioSock(VirtioMmioDevice::new(VirtioVsock::new(cfg, port), settings, mem, irq)?)
            }
            DeviceKind::Console(cfg) => {
                Device::VirtioConsole(VirtioMmioDevice::new(VirtioConsole::new(cfg, port), settings, mem, irq)?)
            }
        })
    }
}
