//! Virtio console device.
//!
//! A single port: RX carries host input to the guest, TX guest output to
//! the host. Terminal size is published when the host knows it, and a
//! resize is a config change.

use super::backend::BackendPort;
use super::device::VirtioMmioDevice;
use super::{DeviceId, VirtioDevice};
use crate::error::ConfigError;

pub const VIRTIO_CONSOLE_F_SIZE: u64 = 1 << 0;

pub const RX_QUEUE: u16 = 0;
pub const TX_QUEUE: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsoleConfig {
    /// Terminal size as (cols, rows)
    pub size: Option<(u16, u16)>,
}

pub struct VirtioConsole {
    config: ConsoleConfig,
    port: BackendPort,
}

impl VirtioConsole {
    pub fn new(config: ConsoleConfig, port: BackendPort) -> Self {
        Self { config, port }
    }
}

impl VirtioDevice for VirtioConsole {
    fn device_id(&self) -> DeviceId {
        DeviceId::Console
    }

    fn device_features(&self) -> u64 {
        if self.config.size.is_some() {
            VIRTIO_CONSOLE_F_SIZE
        } else {
            0
        }
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn config_space(&self) -> Vec<u8> {
        // cols u16, rows u16, max_nr_ports u32, emerg_wr u32
        let (cols, rows) = self.config.size.unwrap_or((0, 0));
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(&cols.to_le_bytes());
        bytes.extend_from_slice(&rows.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes
    }

    fn port(&self) -> &BackendPort {
        &self.port
    }
}

impl VirtioMmioDevice<VirtioConsole> {
    /// The host terminal changed size.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ConfigError> {
        let mut bytes = [0u8; 4];
        bytes[..2].copy_from_slice(&cols.to_le_bytes());
        bytes[2..].copy_from_slice(&rows.to_le_bytes());
        self.update_config(0, &bytes)
    }
}
