//! Common virtio configuration state.
//!
//! Feature negotiation, the device status machine and the device-specific
//! config block. Register decoding lives in the transport; this module
//! only enforces what a value written to a field may do.

use core::ops::Range;

use tracing::{debug, warn};

use super::DeviceStatus;
use crate::error::ConfigError;

/// Outcome of a guest write to the Status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    /// The driver wrote 0; the state is back at power-on defaults.
    Reset,
    /// The status now holds the written value.
    Accepted { driver_ok: bool },
    /// The write would have cleared or skipped bits; status unchanged.
    Rejected,
}

/// Outcome of a guest write into the device-specific block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWrite {
    Written { changed: bool },
    ReadOnly,
    OutOfRange,
}

pub struct ConfigState {
    device_feature: u64,
    driver_feature: u64,
    device_feature_sel: u32,
    driver_feature_sel: u32,
    status: DeviceStatus,
    queue_sel: u16,
    config_generation: u32,
    device_specific: Vec<u8>,
    writable: Vec<Range<usize>>,
}

impl ConfigState {
    pub fn new(device_feature: u64, device_specific: Vec<u8>, writable: &[Range<usize>]) -> Self {
        Self {
            device_feature,
            driver_feature: 0,
            device_feature_sel: 0,
            driver_feature_sel: 0,
            status: DeviceStatus::empty(),
            queue_sel: 0,
            config_generation: 0,
            device_specific,
            writable: writable.to_vec(),
        }
    }

    /// Back to power-on defaults. The generation counter and the
    /// device-specific block survive.
    pub fn reset(&mut self) {
        self.driver_feature = 0;
        self.device_feature_sel = 0;
        self.driver_feature_sel = 0;
        self.status = DeviceStatus::empty();
        self.queue_sel = 0;
    }

    pub fn device_features(&self) -> u64 {
        self.device_feature
    }

    pub fn driver_features(&self) -> u64 {
        self.driver_feature
    }

    pub fn negotiated(&self) -> u64 {
        self.driver_feature & self.device_feature
    }

    /// The 32-bit DeviceFeatures window selected by DeviceFeaturesSel.
    pub fn device_feature_window(&self) -> u32 {
        match self.device_feature_sel {
            0 => self.device_feature as u32,
            1 => (self.device_feature >> 32) as u32,
            _ => 0,
        }
    }

    pub fn select_device_features(&mut self, sel: u32) {
        self.device_feature_sel = sel;
    }

    pub fn select_driver_features(&mut self, sel: u32) {
        self.driver_feature_sel = sel;
    }

    /// Store one 32-bit half of the driver features.
    ///
    /// Only honoured between DRIVER and FEATURES_OK; returns whether the
    /// value was taken.
    pub fn write_driver_features(&mut self, val: u32) -> bool {
        let open = self.status.contains(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER)
            && !self.status.intersects(DeviceStatus::FEATURES_OK | DeviceStatus::FAILED);
        if !open {
            return false;
        }
        match self.driver_feature_sel {
            0 => self.driver_feature = (self.driver_feature & !0xFFFF_FFFF) | val as u64,
            1 => self.driver_feature = (self.driver_feature & 0xFFFF_FFFF) | ((val as u64) << 32),
            _ => return false,
        }
        true
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn write_status(&mut self, val: u32) -> StatusWrite {
        if val == 0 {
            self.reset();
            return StatusWrite::Reset;
        }
        let Some(new) = u8::try_from(val).ok().and_then(DeviceStatus::from_bits) else {
            warn!(val, "status write with unknown bits");
            return StatusWrite::Rejected;
        };
        // Only the device raises DEVICE_NEEDS_RESET.
        let new = new - DeviceStatus::DEVICE_NEEDS_RESET;
        let cur = self.status;

        if cur.contains(DeviceStatus::FAILED) || !new.contains(cur) {
            warn!(?cur, ?new, "status write would clear bits");
            return StatusWrite::Rejected;
        }
        let out_of_order = (new.contains(DeviceStatus::DRIVER) && !new.contains(DeviceStatus::ACKNOWLEDGE))
            || (new.contains(DeviceStatus::FEATURES_OK) && !new.contains(DeviceStatus::DRIVER))
            || (new.contains(DeviceStatus::DRIVER_OK) && !new.contains(DeviceStatus::FEATURES_OK));
        if out_of_order {
            warn!(?cur, ?new, "status bits set out of order");
            return StatusWrite::Rejected;
        }

        let added = new - cur;
        if added.contains(DeviceStatus::FEATURES_OK) {
            self.driver_feature &= self.device_feature;
            debug!(features = self.driver_feature, "features negotiated");
        }
        if added.contains(DeviceStatus::FAILED) {
            debug!("driver gave up on the device");
        }
        self.status = new;
        StatusWrite::Accepted { driver_ok: added.contains(DeviceStatus::DRIVER_OK) }
    }

    pub fn queue_sel(&self) -> u16 {
        self.queue_sel
    }

    /// Selections past the 16-bit queue space all name no queue.
    pub fn select_queue(&mut self, sel: u32) {
        self.queue_sel = u16::try_from(sel).unwrap_or(u16::MAX);
    }

    pub fn generation(&self) -> u32 {
        self.config_generation
    }

    pub fn config_len(&self) -> usize {
        self.device_specific.len()
    }

    pub fn device_specific(&self) -> &[u8] {
        &self.device_specific
    }

    fn span(&self, offset: usize, size: usize) -> Option<Range<usize>> {
        let end = offset.checked_add(size)?;
        (end <= self.device_specific.len()).then_some(offset..end)
    }

    /// Little-endian read of `size` bytes from the config block.
    pub fn read_config(&self, offset: usize, size: usize) -> Option<u64> {
        let span = self.span(offset, size)?;
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&self.device_specific[span]);
        Some(u64::from_le_bytes(buf))
    }

    /// Guest write into the config block. Only fields the device declared
    /// writable accept it.
    pub fn write_config(&mut self, offset: usize, size: usize, val: u64) -> ConfigWrite {
        let Some(span) = self.span(offset, size) else {
            return ConfigWrite::OutOfRange;
        };
        if !self.writable.iter().any(|w| w.start <= span.start && span.end <= w.end) {
            return ConfigWrite::ReadOnly;
        }
        let bytes = val.to_le_bytes();
        let changed = self.device_specific[span.clone()] != bytes[..size];
        if changed {
            self.device_specific[span].copy_from_slice(&bytes[..size]);
            self.config_generation = self.config_generation.wrapping_add(1);
        }
        ConfigWrite::Written { changed }
    }

    /// Device-side rewrite of part of the config block.
    ///
    /// Any change bumps the generation; returns whether the driver must be
    /// told (bytes changed while DRIVER_OK).
    pub fn update(&mut self, offset: usize, bytes: &[u8]) -> Result<bool, ConfigError> {
        let span = self
            .span(offset, bytes.len())
            .ok_or(ConfigError::ConfigTooLarge(offset.saturating_add(bytes.len())))?;
        if self.device_specific[span.clone()] == *bytes {
            return Ok(false);
        }
        self.device_specific[span].copy_from_slice(bytes);
        self.config_generation = self.config_generation.wrapping_add(1);
        Ok(self.status.contains(DeviceStatus::DRIVER_OK))
    }
}
