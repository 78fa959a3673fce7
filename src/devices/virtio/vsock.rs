//! Virtio socket device.
//!
//! Carries host↔guest stream connections. The config block holds only the
//! guest's context ID; packets on RX/TX and transport events on EVENT are
//! the backend's business.

use super::backend::BackendPort;
use super::{DeviceId, VirtioDevice};

pub const RX_QUEUE: u16 = 0;
pub const TX_QUEUE: u16 = 1;
pub const EVENT_QUEUE: u16 = 2;

/// CID of the host. 0 and 1 are reserved as well.
pub const VMADDR_CID_HOST: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsockConfig {
    pub guest_cid: u64,
}

pub struct VirtioVsock {
    config: VsockConfig,
    port: BackendPort,
}

impl VirtioVsock {
    pub fn new(config: VsockConfig, port: BackendPort) -> Self {
        Self { config, port }
    }

    pub fn guest_cid(&self) -> u64 {
        self.config.guest_cid
    }
}

impl VirtioDevice for VirtioVsock {
    fn device_id(&self) -> DeviceId {
        DeviceId::Socket
    }

    fn device_features(&self) -> u64 {
        0
    }

    fn num_queues(&self) -> u16 {
        3
    }

    fn config_space(&self) -> Vec<u8> {
        self.config.guest_cid.to_le_bytes().to_vec()
    }

    fn port(&self) -> &BackendPort {
        &self.port
    }
}
