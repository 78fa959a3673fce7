//! Virtio-MMIO transport layer (virtio spec v2, "modern" only).
//!
//! Decodes register accesses against the configuration and queue state.
//! Writes never call into the device directly: anything with consequences
//! beyond a register field raises an event flag, and the owning device
//! drains the flags after the access (see `device.rs`).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use super::config::{ConfigState, ConfigWrite, StatusWrite};
use super::queue::{QueueState, Ring};
use super::{DeviceId, DeviceStatus};
use crate::error::AccessError;
use crate::irq::{InterruptCause, InterruptLine};

// ── Virtio-MMIO register offsets ────────────────────────────────────
pub const MAGIC_VALUE: u64 = 0x000;
pub const VERSION: u64 = 0x004;
pub const DEVICE_ID: u64 = 0x008;
pub const VENDOR_ID: u64 = 0x00C;
pub const DEVICE_FEATURES: u64 = 0x010;
pub const DEVICE_FEATURES_SEL: u64 = 0x014;
pub const DRIVER_FEATURES: u64 = 0x020;
pub const DRIVER_FEATURES_SEL: u64 = 0x024;
pub const QUEUE_SEL: u64 = 0x030;
pub const QUEUE_NUM_MAX: u64 = 0x034;
pub const QUEUE_NUM: u64 = 0x038;
pub const QUEUE_READY: u64 = 0x044;
pub const QUEUE_NOTIFY: u64 = 0x050;
pub const INTERRUPT_STATUS: u64 = 0x060;
pub const INTERRUPT_ACK: u64 = 0x064;
pub const STATUS: u64 = 0x070;
pub const QUEUE_DESC_LOW: u64 = 0x080;
pub const QUEUE_DESC_HIGH: u64 = 0x084;
pub const QUEUE_DRIVER_LOW: u64 = 0x090;
pub const QUEUE_DRIVER_HIGH: u64 = 0x094;
pub const QUEUE_DEVICE_LOW: u64 = 0x0A0;
pub const QUEUE_DEVICE_HIGH: u64 = 0x0A4;
pub const CONFIG_GENERATION: u64 = 0x0FC;
pub const CONFIG_SPACE: u64 = 0x100;

/// Size of the register window.
pub const MMIO_SIZE: u64 = 0x200;

// ── Magic and version ───────────────────────────────────────────────
pub const VIRTIO_MMIO_MAGIC: u32 = 0x74726976; // "virt"
pub const VIRTIO_MMIO_VERSION: u32 = 2; // Modern (non-legacy)
pub const VIRTIO_VENDOR_ID: u32 = 0x554D4551; // "QEMU"

bitflags! {
    /// Edge-triggered work left behind by an access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const CONSTRUCT_QUEUE = 1 << 0;
        const STATUS_CHANGED = 1 << 1;
        const IRQ_ACK = 1 << 2;
        const NOTIFY = 1 << 3;
    }
}

/// Events drained by one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvents {
    pub flags: EventFlags,
    /// Queues whose QueueReady went to 1.
    pub construct: u64,
    /// Acknowledged interrupt causes.
    pub ack: InterruptCause,
    /// Queues whose doorbell was rung.
    pub notify: u64,
}

/// Event flags are set by the access path and read-and-cleared (`swap`)
/// by the event pass, so no edge is lost or seen twice.
#[derive(Default)]
struct Events {
    flags: AtomicU32,
    construct: AtomicU64,
    ack: AtomicU32,
    notify: AtomicU64,
}

impl Events {
    fn raise(&self, flag: EventFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn take(&self) -> PendingEvents {
        let flags = EventFlags::from_bits_truncate(self.flags.swap(0, Ordering::AcqRel));
        PendingEvents {
            flags,
            construct: self.construct.swap(0, Ordering::AcqRel),
            ack: InterruptCause::from_bits_truncate(self.ack.swap(0, Ordering::AcqRel)),
            notify: self.notify.swap(0, Ordering::AcqRel),
        }
    }
}

/// Register file of one virtio-mmio device.
pub struct Transport {
    device_id: DeviceId,
    max_queue_size: u16,
    config: ConfigState,
    queues: Vec<QueueState>,
    irq: Arc<InterruptLine>,
    events: Events,
}

impl Transport {
    pub fn new(device_id: DeviceId, max_queue_size: u16, num_queues: u16, config: ConfigState, irq: Arc<InterruptLine>) -> Self {
        Self {
            device_id,
            max_queue_size,
            config,
            queues: (0..num_queues).map(|_| QueueState::new()).collect(),
            irq,
            events: Events::default(),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn max_queue_size(&self) -> u16 {
        self.max_queue_size
    }

    pub fn config(&self) -> &ConfigState {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConfigState {
        &mut self.config
    }

    pub fn num_queues(&self) -> u16 {
        self.queues.len() as u16
    }

    pub fn queue(&self, index: u16) -> Option<&QueueState> {
        self.queues.get(index as usize)
    }

    pub fn queue_mut(&mut self, index: u16) -> Option<&mut QueueState> {
        self.queues.get_mut(index as usize)
    }

    pub fn queues(&self) -> &[QueueState] {
        &self.queues
    }

    /// Status as the driver reads it: DEVICE_NEEDS_RESET is set while any
    /// constructed queue has failed.
    pub fn status(&self) -> DeviceStatus {
        let failed = self.queues.iter().filter_map(QueueState::queue).any(|q| q.is_failed());
        if failed {
            self.config.status() | DeviceStatus::DEVICE_NEEDS_RESET
        } else {
            self.config.status()
        }
    }

    /// Power-on state for registers and queues.
    pub fn reset(&mut self) {
        self.config.reset();
        for q in &mut self.queues {
            q.reset();
        }
    }

    pub fn take_events(&self) -> PendingEvents {
        self.events.take()
    }

    fn selected(&self) -> Option<u16> {
        let sel = self.config.queue_sel();
        (sel < self.num_queues()).then_some(sel)
    }

    fn selected_mut(&mut self) -> Option<&mut QueueState> {
        let sel = self.selected()?;
        self.queues.get_mut(sel as usize)
    }

    fn check_size(offset: u64, size: u8) -> Result<(), AccessError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(AccessError::BadSize { offset, size });
        }
        if offset < CONFIG_SPACE {
            if size != 4 {
                return Err(AccessError::BadSize { offset, size });
            }
            if offset % 4 != 0 {
                return Err(AccessError::BadOffset(offset));
            }
        }
        Ok(())
    }

    /// Register read. Reads never change device state.
    pub fn read(&self, offset: u64, size: u8) -> Result<u64, AccessError> {
        Self::check_size(offset, size)?;
        if offset >= CONFIG_SPACE {
            let off = (offset - CONFIG_SPACE) as usize;
            return self.config.read_config(off, size as usize).ok_or(AccessError::BadOffset(offset));
        }

        let val = match offset {
            MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            VERSION => VIRTIO_MMIO_VERSION,
            DEVICE_ID => self.device_id as u32,
            VENDOR_ID => VIRTIO_VENDOR_ID,
            DEVICE_FEATURES => self.config.device_feature_window(),
            QUEUE_NUM_MAX => match self.selected() {
                Some(_) => self.max_queue_size as u32,
                None => 0,
            },
            QUEUE_READY => match self.selected() {
                Some(sel) => self.queues[sel as usize].is_constructed() as u32,
                None => 0,
            },
            INTERRUPT_STATUS => self.irq.pending().bits(),
            STATUS => self.status().bits() as u32,
            CONFIG_GENERATION => self.config.generation(),

            DEVICE_FEATURES_SEL | DRIVER_FEATURES | DRIVER_FEATURES_SEL | QUEUE_SEL | QUEUE_NUM | QUEUE_NOTIFY
            | INTERRUPT_ACK | QUEUE_DESC_LOW | QUEUE_DESC_HIGH | QUEUE_DRIVER_LOW | QUEUE_DRIVER_HIGH
            | QUEUE_DEVICE_LOW | QUEUE_DEVICE_HIGH => return Err(AccessError::WriteOnly(offset)),

            _ => return Err(AccessError::BadOffset(offset)),
        };
        trace!(offset, val, "virtio-mmio read");
        Ok(val as u64)
    }

    /// Register write.
    pub fn write(&mut self, offset: u64, size: u8, value: u64) -> Result<(), AccessError> {
        Self::check_size(offset, size)?;
        if offset >= CONFIG_SPACE {
            let off = (offset - CONFIG_SPACE) as usize;
            return match self.config.write_config(off, size as usize, value) {
                ConfigWrite::Written { .. } => Ok(()),
                ConfigWrite::ReadOnly => Err(AccessError::ReadOnly(offset)),
                ConfigWrite::OutOfRange => Err(AccessError::BadOffset(offset)),
            };
        }

        let val = value as u32;
        trace!(offset, val, "virtio-mmio write");

        match offset {
            DEVICE_FEATURES_SEL => self.config.select_device_features(val),

            DRIVER_FEATURES => {
                if !self.config.write_driver_features(val) {
                    debug!(val, "driver features write ignored");
                }
            }

            DRIVER_FEATURES_SEL => self.config.select_driver_features(val),

            QUEUE_SEL => self.config.select_queue(val),

            QUEUE_NUM => {
                if let Some(q) = self.selected_mut() {
                    q.set_size(val);
                }
            }

            QUEUE_READY => {
                // Queues are torn down only by a device reset.
                if val != 0 {
                    if let Some(sel) = self.selected() {
                        self.queues[sel as usize].set_ready();
                        self.events.construct.fetch_or(1 << sel, Ordering::AcqRel);
                        self.events.raise(EventFlags::CONSTRUCT_QUEUE);
                    }
                }
            }

            QUEUE_NOTIFY => {
                if val < self.num_queues() as u32 {
                    self.events.notify.fetch_or(1 << val, Ordering::AcqRel);
                    self.events.raise(EventFlags::NOTIFY);
                } else {
                    trace!(queue = val, "doorbell for unknown queue");
                }
            }

            INTERRUPT_ACK => {
                let cause = InterruptCause::from_bits_truncate(val);
                if !cause.is_empty() {
                    self.events.ack.fetch_or(cause.bits(), Ordering::AcqRel);
                    self.events.raise(EventFlags::IRQ_ACK);
                }
            }

            STATUS => match self.config.write_status(val) {
                StatusWrite::Reset => {
                    for q in &mut self.queues {
                        q.reset();
                    }
                    self.events.raise(EventFlags::STATUS_CHANGED);
                }
                StatusWrite::Accepted { driver_ok: true } => self.events.raise(EventFlags::STATUS_CHANGED),
                StatusWrite::Accepted { driver_ok: false } => {}
                StatusWrite::Rejected => warn!(val, status = ?self.config.status(), "status write rejected"),
            },

            QUEUE_DESC_LOW | QUEUE_DESC_HIGH | QUEUE_DRIVER_LOW | QUEUE_DRIVER_HIGH | QUEUE_DEVICE_LOW
            | QUEUE_DEVICE_HIGH => {
                let ring = match offset {
                    QUEUE_DESC_LOW | QUEUE_DESC_HIGH => Ring::Desc,
                    QUEUE_DRIVER_LOW | QUEUE_DRIVER_HIGH => Ring::Driver,
                    _ => Ring::Device,
                };
                let high = offset & 0x4 != 0;
                if let Some(q) = self.selected_mut() {
                    q.set_addr(ring, high, val);
                }
            }

            MAGIC_VALUE | VERSION | DEVICE_ID | VENDOR_ID | DEVICE_FEATURES | QUEUE_NUM_MAX | INTERRUPT_STATUS
            | CONFIG_GENERATION => return Err(AccessError::ReadOnly(offset)),

            _ => return Err(AccessError::BadOffset(offset)),
        }
        Ok(())
    }
}
