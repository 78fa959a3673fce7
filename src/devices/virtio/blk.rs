//! Virtio block device.
//!
//! The device only publishes the disk's geometry and feature set; request
//! processing belongs to the backend, which pops chains from the request
//! queue. The request header layout and status codes are exported for it.

use core::ops::Range;

use bytemuck::{Pod, Zeroable};

use super::backend::BackendPort;
use super::{DeviceId, VirtioDevice};

// ── Virtio-blk request types ────────────────────────────────────────
pub const VIRTIO_BLK_T_IN: u32 = 0; // Read from disk
pub const VIRTIO_BLK_T_OUT: u32 = 1; // Write to disk
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8; // Get device ID string

// ── Virtio-blk status codes ────────────────────────────────────────
pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

// ── Virtio-blk feature bits ────────────────────────────────────────
pub const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
pub const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
pub const VIRTIO_BLK_F_GEOMETRY: u64 = 1 << 4;
pub const VIRTIO_BLK_F_RO: u64 = 1 << 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;
pub const VIRTIO_BLK_F_CONFIG_WCE: u64 = 1 << 11;

pub const REQUEST_QUEUE: u16 = 0;

pub const SECTOR_SIZE: u64 = 512;

/// Offset of the `writeback` byte in the config block.
pub const WRITEBACK_OFFSET: usize = 32;

/// Virtio-blk request header (16 bytes, from guest memory).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BlkReqHeader {
    pub req_type: u32,
    pub reserved: u32,
    pub sector: u64,
}

/// `struct virtio_blk_config`, little-endian.
#[repr(C, packed)]
#[derive(Clone, Copy, Default, Pod, Zeroable)]
struct RawBlkConfig {
    capacity: u64,
    size_max: u32,
    seg_max: u32,
    cylinders: u16,
    heads: u8,
    sectors: u8,
    blk_size: u32,
    physical_block_exp: u8,
    alignment_offset: u8,
    min_io_size: u16,
    opt_io_size: u32,
    writeback: u8,
    unused0: u8,
    num_queues: u16,
    max_discard_sectors: u32,
    max_discard_seg: u32,
    discard_sector_alignment: u32,
    max_write_zeroes_sectors: u32,
    max_write_zeroes_seg: u32,
    write_zeroes_may_unmap: u8,
    unused1: [u8; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkConfig {
    /// Capacity in 512-byte sectors
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub geometry: Option<BlkGeometry>,
    pub blk_size: Option<u32>,
    pub read_only: bool,
    /// Initial write-cache mode; the driver may flip it.
    pub writeback: bool,
}

impl BlkConfig {
    /// A disk of `disk_size` bytes with 2MB segments, up to 128 per request.
    pub fn for_disk(disk_size: u64) -> Self {
        Self {
            capacity: disk_size / SECTOR_SIZE,
            size_max: 0x0020_0000,
            seg_max: 128,
            geometry: None,
            blk_size: Some(SECTOR_SIZE as u32),
            read_only: false,
            writeback: true,
        }
    }

    fn features(&self) -> u64 {
        let mut features = VIRTIO_BLK_F_SIZE_MAX | VIRTIO_BLK_F_SEG_MAX | VIRTIO_BLK_F_FLUSH | VIRTIO_BLK_F_CONFIG_WCE;
        if self.geometry.is_some() {
            features |= VIRTIO_BLK_F_GEOMETRY;
        }
        if self.blk_size.is_some() {
            features |= VIRTIO_BLK_F_BLK_SIZE;
        }
        if self.read_only {
            features |= VIRTIO_BLK_F_RO;
        }
        features
    }

    fn to_bytes(self) -> Vec<u8> {
        let geometry = self.geometry.unwrap_or(BlkGeometry { cylinders: 0, heads: 0, sectors: 0 });
        let raw = RawBlkConfig {
            capacity: self.capacity.to_le(),
            size_max: self.size_max.to_le(),
            seg_max: self.seg_max.to_le(),
            cylinders: geometry.cylinders.to_le(),
            heads: geometry.heads,
            sectors: geometry.sectors,
            blk_size: self.blk_size.unwrap_or(0).to_le(),
            writeback: self.writeback as u8,
            num_queues: 1u16.to_le(),
            ..RawBlkConfig::default()
        };
        bytemuck::bytes_of(&raw).to_vec()
    }
}

/// Virtio-blk device.
pub struct VirtioBlk {
    config: BlkConfig,
    port: BackendPort,
}

impl VirtioBlk {
    pub fn new(config: BlkConfig, port: BackendPort) -> Self {
        Self { config, port }
    }

    pub fn config(&self) -> &BlkConfig {
        &self.config
    }
}

impl VirtioDevice for VirtioBlk {
    fn device_id(&self) -> DeviceId {
        DeviceId::Block
    }

    fn device_features(&self) -> u64 {
        self.config.features()
    }

    fn num_queues(&self) -> u16 {
        1
    } // Single request queue

    fn config_space(&self) -> Vec<u8> {
        self.config.to_bytes()
    }

    fn config_writable(&self) -> &[Range<usize>] {
        const WRITABLE: &[Range<usize>] = &[WRITEBACK_OFFSET..WRITEBACK_OFFSET + 1];
        WRITABLE
    }

    fn port(&self) -> &BackendPort {
        &self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_layout() {
        assert_eq!(core::mem::size_of::<RawBlkConfig>(), 60);
        let mut cfg = BlkConfig::for_disk(1 << 20);
        cfg.geometry = Some(BlkGeometry { cylinders: 0x102, heads: 4, sectors: 32 });
        let bytes = cfg.to_bytes();
        assert_eq!(&bytes[0..8], &2048u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x0020_0000u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &128u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &[0x02, 0x01, 4, 32]);
        assert_eq!(&bytes[20..24], &512u32.to_le_bytes());
        assert_eq!(bytes[WRITEBACK_OFFSET], 1);
        assert_eq!(&bytes[34..36], &1u16.to_le_bytes());
    }

    #[test]
    fn test_features_follow_config() {
        let mut cfg = BlkConfig::for_disk(4096);
        assert_eq!(cfg.features() & VIRTIO_BLK_F_RO, 0);
        assert_ne!(cfg.features() & VIRTIO_BLK_F_BLK_SIZE, 0);
        cfg.read_only = true;
        cfg.blk_size = None;
        assert_ne!(cfg.features() & VIRTIO_BLK_F_RO, 0);
        assert_eq!(cfg.features() & VIRTIO_BLK_F_BLK_SIZE, 0);
        assert_eq!(cfg.features() & VIRTIO_BLK_F_GEOMETRY, 0);
    }
}
