//! Shared fixtures: guest RAM, a recording interrupt controller and
//! backend, and a minimal guest-side driver for the register interface.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use virtio_core::devices::virtio::backend::{ActiveDevice, Backend, BackendPort, Doorbell};
use virtio_core::devices::virtio::blk::{BlkConfig, VirtioBlk};
use virtio_core::devices::virtio::device::{DeviceSettings, VirtioMmioDevice};
use virtio_core::devices::virtio::mmio::*;
use virtio_core::devices::virtio::queue::{Descriptor, VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use virtio_core::devices::virtio::VirtioDevice;
use virtio_core::devices::MmioDevice;
use virtio_core::iommu::{BufferClass, IoMapping, Iommu};
use virtio_core::irq::IrqController;
use virtio_core::mm::{GuestMemory, GuestRam, MemFlags};
use virtio_core::IommuError;

pub const RAM_BASE: u64 = 0x4000_0000;
pub const RAM_SIZE: u64 = 0x10_0000;
pub const DEVICE_BASE: u64 = 0x0a00_0000;
pub const INTID: u32 = 48;

// Ring placement used by most tests.
pub const DESC: u64 = RAM_BASE + 0x1000;
pub const AVAIL: u64 = RAM_BASE + 0x2000;
pub const USED: u64 = RAM_BASE + 0x3000;
pub const BUFFERS: u64 = RAM_BASE + 0x10000;

pub const ACK: u32 = 1;
pub const DRIVER: u32 = 2;
pub const DRIVER_OK: u32 = 4;
pub const FEATURES_OK: u32 = 8;
pub const NEEDS_RESET: u32 = 64;

pub fn guest_ram() -> Arc<GuestRam> {
    Arc::new(GuestRam::new().with_region(RAM_BASE, RAM_SIZE).unwrap())
}

// ── Interrupt controller ───────────────────────────────────────────

#[derive(Default)]
pub struct RecordingIrq {
    pub asserts: AtomicUsize,
    pub deasserts: AtomicUsize,
}

impl RecordingIrq {
    pub fn asserts(&self) -> usize {
        self.asserts.load(Ordering::SeqCst)
    }

    pub fn deasserts(&self) -> usize {
        self.deasserts.load(Ordering::SeqCst)
    }
}

impl IrqController for RecordingIrq {
    fn assert_irq(&self, intid: u32) {
        assert_eq!(intid, INTID);
        self.asserts.fetch_add(1, Ordering::SeqCst);
    }

    fn deassert_irq(&self, intid: u32) {
        assert_eq!(intid, INTID);
        self.deasserts.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Backend ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    DriverOk { features: u64 },
    Notify(u16),
    Reset,
    Shutdown,
    Attach,
    Detach,
    Map(BufferClass),
    Unmap(BufferClass),
}

#[derive(Default)]
pub struct RecordingBackend {
    pub events: Mutex<Vec<BackendEvent>>,
    pub active: Mutex<Option<ActiveDevice>>,
    pub doorbell: Doorbell,
    pub refuse_attach: AtomicBool,
    pub refuse_map: AtomicBool,
}

impl RecordingBackend {
    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &BackendEvent) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub fn active(&self) -> Option<ActiveDevice> {
        self.active.lock().unwrap().clone()
    }

    fn record(&self, event: BackendEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Backend for RecordingBackend {
    fn attach(&self) -> Result<(), IommuError> {
        if self.refuse_attach.load(Ordering::SeqCst) {
            return Err(IommuError::AttachFailed);
        }
        self.record(BackendEvent::Attach);
        Ok(())
    }

    fn detach(&self) {
        self.record(BackendEvent::Detach);
    }

    fn map(&self, class: BufferClass, mapping: &IoMapping) -> Result<(), IommuError> {
        if self.refuse_map.load(Ordering::SeqCst) {
            return Err(IommuError::MapFailed { iova: mapping.iova, len: mapping.len });
        }
        self.record(BackendEvent::Map(class));
        Ok(())
    }

    fn unmap(&self, class: BufferClass, _mapping: &IoMapping) {
        self.record(BackendEvent::Unmap(class));
    }

    fn driver_ok(&self, device: ActiveDevice) {
        self.record(BackendEvent::DriverOk { features: device.features() });
        *self.active.lock().unwrap() = Some(device);
    }

    fn notify(&self, queue: u16) {
        self.record(BackendEvent::Notify(queue));
        self.doorbell.ring(queue);
    }

    fn device_reset(&self) {
        self.record(BackendEvent::Reset);
        *self.active.lock().unwrap() = None;
    }

    fn shutdown(&self) {
        self.record(BackendEvent::Shutdown);
        self.doorbell.shutdown();
    }
}

// ── IOMMU ──────────────────────────────────────────────────────────

/// IOMMU that maps IOVA `x` to guest-physical `x + offset`.
pub struct OffsetIommu {
    pub offset: u64,
    pub refuse_map: AtomicBool,
    pub refuse_unmap: AtomicBool,
    pub attached: AtomicBool,
}

impl OffsetIommu {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            refuse_map: AtomicBool::new(false),
            refuse_unmap: AtomicBool::new(false),
            attached: AtomicBool::new(false),
        }
    }
}

impl Iommu for OffsetIommu {
    fn attach(&self) -> Result<(), IommuError> {
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    fn map(&self, iova: u64, len: u64, flags: MemFlags) -> Result<IoMapping, IommuError> {
        if self.refuse_map.load(Ordering::SeqCst) {
            return Err(IommuError::MapFailed { iova, len });
        }
        Ok(IoMapping { iova, len, gpa: iova + self.offset, flags })
    }

    fn unmap(&self, mapping: &IoMapping) -> Result<(), IommuError> {
        if self.refuse_unmap.load(Ordering::SeqCst) {
            return Err(IommuError::UnmapFailed { iova: mapping.iova });
        }
        Ok(())
    }
}

// ── Device under test ──────────────────────────────────────────────

pub struct Harness<D: VirtioDevice> {
    pub dev: VirtioMmioDevice<D>,
    pub backend: Arc<RecordingBackend>,
    pub irq: Arc<RecordingIrq>,
    pub ram: Arc<GuestRam>,
}

pub fn blk_with(settings: DeviceSettings) -> Harness<VirtioBlk> {
    let backend = Arc::new(RecordingBackend::default());
    let blk = VirtioBlk::new(BlkConfig::for_disk(1 << 20), BackendPort::new(backend.clone()));
    Harness::new(blk, settings, backend)
}

pub fn blk() -> Harness<VirtioBlk> {
    blk_with(DeviceSettings::new(DEVICE_BASE, INTID))
}

impl<D: VirtioDevice> Harness<D> {
    pub fn new(variant: D, settings: DeviceSettings, backend: Arc<RecordingBackend>) -> Self {
        let irq = Arc::new(RecordingIrq::default());
        let ram = guest_ram();
        let dev = VirtioMmioDevice::new(variant, settings, ram.clone(), irq.clone()).unwrap();
        Self { dev, backend, irq, ram }
    }

    pub fn read(&mut self, offset: u64) -> u32 {
        self.dev.read(offset, 4).unwrap() as u32
    }

    pub fn write(&mut self, offset: u64, value: u32) {
        self.dev.write(offset, value as u64, 4).unwrap();
    }

    pub fn device_features(&mut self) -> u64 {
        self.write(DEVICE_FEATURES_SEL, 0);
        let low = self.read(DEVICE_FEATURES) as u64;
        self.write(DEVICE_FEATURES_SEL, 1);
        let high = self.read(DEVICE_FEATURES) as u64;
        low | (high << 32)
    }

    /// ACK, DRIVER, write `features`, FEATURES_OK.
    pub fn negotiate(&mut self, features: u64) {
        self.write(STATUS, ACK);
        self.write(STATUS, ACK | DRIVER);
        self.write(DRIVER_FEATURES_SEL, 0);
        self.write(DRIVER_FEATURES, features as u32);
        self.write(DRIVER_FEATURES_SEL, 1);
        self.write(DRIVER_FEATURES, (features >> 32) as u32);
        self.write(STATUS, ACK | DRIVER | FEATURES_OK);
    }

    pub fn driver_ok(&mut self) {
        self.write(STATUS, ACK | DRIVER | FEATURES_OK | DRIVER_OK);
    }

    /// Program queue `index` and set QueueReady.
    pub fn setup_queue(&mut self, index: u16, size: u16, desc: u64, avail: u64, used: u64) {
        self.write(QUEUE_SEL, index as u32);
        self.write(QUEUE_NUM, size as u32);
        self.write(QUEUE_DESC_LOW, desc as u32);
        self.write(QUEUE_DESC_HIGH, (desc >> 32) as u32);
        self.write(QUEUE_DRIVER_LOW, avail as u32);
        self.write(QUEUE_DRIVER_HIGH, (avail >> 32) as u32);
        self.write(QUEUE_DEVICE_LOW, used as u32);
        self.write(QUEUE_DEVICE_HIGH, (used >> 32) as u32);
        self.write(QUEUE_READY, 1);
    }

    pub fn queue_ready(&mut self, index: u16) -> u32 {
        self.write(QUEUE_SEL, index as u32);
        self.read(QUEUE_READY)
    }

    /// Full bring-up with one queue of `size` at the default ring placement.
    pub fn bring_up(&mut self, features: u64, size: u16) -> GuestQueue {
        self.negotiate(features);
        self.setup_queue(0, size, DESC, AVAIL, USED);
        self.driver_ok();
        GuestQueue::new(self.ram.clone(), size, DESC, AVAIL, USED)
    }
}

// ── Guest side of a split ring ─────────────────────────────────────

pub struct GuestQueue {
    pub ram: Arc<GuestRam>,
    pub size: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
    next_desc: u16,
    avail_idx: u16,
}

impl GuestQueue {
    pub fn new(ram: Arc<GuestRam>, size: u16, desc: u64, avail: u64, used: u64) -> Self {
        Self { ram, size, desc, avail, used, next_desc: 0, avail_idx: 0 }
    }

    pub fn mem(&self) -> &dyn GuestMemory {
        &*self.ram
    }

    pub fn write_desc(&self, table: u64, index: u16, desc: Descriptor) {
        self.mem().write_obj(table + 16 * index as u64, desc).unwrap();
    }

    /// Put a chain of `(addr, len, device_writable)` buffers in the
    /// descriptor table without publishing it. Returns the head.
    pub fn add_chain(&mut self, buffers: &[(u64, u32, bool)]) -> u16 {
        let head = self.next_desc;
        for (i, &(addr, len, write)) in buffers.iter().enumerate() {
            let index = self.next_desc;
            let mut flags = if write { VIRTQ_DESC_F_WRITE } else { 0 };
            let last = i + 1 == buffers.len();
            if !last {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            let next = if last { 0 } else { (index + 1) % self.size };
            self.write_desc(self.desc, index, Descriptor { addr, len, flags, next });
            self.next_desc = (self.next_desc + 1) % self.size;
        }
        head
    }

    /// A single descriptor pointing at an indirect table of `buffers`
    /// stored at `table`.
    pub fn add_indirect(&mut self, table: u64, buffers: &[(u64, u32, bool)]) -> u16 {
        for (i, &(addr, len, write)) in buffers.iter().enumerate() {
            let mut flags = if write { VIRTQ_DESC_F_WRITE } else { 0 };
            let last = i + 1 == buffers.len();
            if !last {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            let next = if last { 0 } else { i as u16 + 1 };
            self.write_desc(table, i as u16, Descriptor { addr, len, flags, next });
        }
        let head = self.next_desc;
        let len = 16 * buffers.len() as u32;
        self.write_desc(self.desc, head, Descriptor { addr: table, len, flags: VIRTQ_DESC_F_INDIRECT, next: 0 });
        self.next_desc = (self.next_desc + 1) % self.size;
        head
    }

    /// Make `head` available and bump the avail index.
    pub fn publish(&mut self, head: u16) {
        let slot = (self.avail_idx % self.size) as u64;
        self.mem().write_obj::<u16>(self.avail + 4 + 2 * slot, head).unwrap();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.mem().write_obj::<u16>(self.avail + 2, self.avail_idx).unwrap();
    }

    /// Overwrite the avail index without adding entries.
    pub fn set_avail_idx(&mut self, idx: u16) {
        self.avail_idx = idx;
        self.mem().write_obj::<u16>(self.avail + 2, idx).unwrap();
    }

    pub fn set_avail_flags(&self, flags: u16) {
        self.mem().write_obj::<u16>(self.avail, flags).unwrap();
    }

    pub fn used_flags(&self) -> u16 {
        self.mem().read_obj::<u16>(self.used).unwrap()
    }

    pub fn used_idx(&self) -> u16 {
        self.mem().read_obj::<u16>(self.used + 2).unwrap()
    }

    /// `(id, len)` of used element `n`.
    pub fn used_elem(&self, n: u16) -> (u32, u32) {
        let slot = (n % self.size) as u64;
        let id = self.mem().read_obj::<u32>(self.used + 4 + 8 * slot).unwrap();
        let len = self.mem().read_obj::<u32>(self.used + 8 + 8 * slot).unwrap();
        (id, len)
    }
}
