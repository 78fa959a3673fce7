//! Virtio network device.
//!
//! Publishes MAC address, link status and MTU. Frames are moved by the
//! backend: it pops transmit chains from TX and fills receive buffers
//! posted on RX, each prefixed by a `virtio_net_hdr_v1`.

use super::backend::BackendPort;
use super::device::VirtioMmioDevice;
use super::{DeviceId, VirtioDevice};
use crate::error::ConfigError;

// ── Feature bits ────────────────────────────────────────────────────
pub const VIRTIO_NET_F_MTU: u64 = 1 << 3;
pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const VIRTIO_NET_F_STATUS: u64 = 1 << 16;

// Status bits
pub const VIRTIO_NET_S_LINK_UP: u16 = 1;

/// Size of virtio_net_hdr_v1 (with num_buffers field).
/// Linux always uses this size for VERSION_1 devices.
pub const VIRTIO_NET_HDR_SIZE: usize = 12;

pub const RX_QUEUE: u16 = 0;
pub const TX_QUEUE: u16 = 1;

const STATUS_OFFSET: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetConfig {
    pub mac: [u8; 6],
    pub link_up: bool,
    pub mtu: Option<u16>,
}

impl NetConfig {
    /// Link up, locally administered MAC for `vm_id`.
    pub fn for_vm(vm_id: usize) -> Self {
        Self { mac: mac_for_vm(vm_id), link_up: true, mtu: None }
    }

    fn status(&self) -> u16 {
        if self.link_up {
            VIRTIO_NET_S_LINK_UP
        } else {
            0
        }
    }
}

/// Generate a deterministic MAC address for a VM.
/// VM 0 -> 52:54:00:00:00:01, VM 1 -> 52:54:00:00:00:02
pub fn mac_for_vm(vm_id: usize) -> [u8; 6] {
    [0x52, 0x54, 0x00, 0x00, 0x00, (vm_id + 1) as u8]
}

/// Virtio-net device.
pub struct VirtioNet {
    config: NetConfig,
    port: BackendPort,
}

impl VirtioNet {
    pub fn new(config: NetConfig, port: BackendPort) -> Self {
        Self { config, port }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }
}

impl VirtioDevice for VirtioNet {
    fn device_id(&self) -> DeviceId {
        DeviceId::Net
    }

    fn device_features(&self) -> u64 {
        let mut features = VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS;
        if self.config.mtu.is_some() {
            features |= VIRTIO_NET_F_MTU;
        }
        features
    }

    fn num_queues(&self) -> u16 {
        2
    } // RX=0, TX=1

    fn config_space(&self) -> Vec<u8> {
        // Config space layout:
        //   0x00-0x05: mac[6]
        //   0x06-0x07: status
        //   0x08-0x09: max_virtqueue_pairs
        //   0x0A-0x0B: mtu
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(&self.config.mac);
        bytes.extend_from_slice(&self.config.status().to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&self.config.mtu.unwrap_or(0).to_le_bytes());
        bytes
    }

    fn port(&self) -> &BackendPort {
        &self.port
    }
}

/// Link state changes reach the driver as a config change.
impl VirtioMmioDevice<VirtioNet> {
    pub fn set_link(&mut self, up: bool) -> Result<(), ConfigError> {
        let status = if up { VIRTIO_NET_S_LINK_UP } else { 0 };
        self.update_config(STATUS_OFFSET, &status.to_le_bytes())
    }
}
