//! A virtio device on the MMIO bus.
//!
//! Glues a [`VirtioDevice`] variant to the transport and runs the event
//! pass after every register access. The pass drains edge flags in a fixed
//! order: queue construction, status change, interrupt acknowledge,
//! doorbells. All of it runs on the trapping vCPU and never blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::backend::ActiveDevice;
use super::config::ConfigState;
use super::mmio::{EventFlags, Transport, CONFIG_SPACE, MMIO_SIZE};
use super::{DeviceStatus, VirtioDevice, MAX_QUEUES, MAX_QUEUE_SIZE, VIRTIO_F_INDIRECT_DESC, VIRTIO_F_VERSION_1};
use crate::devices::MmioDevice;
use crate::error::{AccessError, ConfigError, IommuError};
use crate::iommu::{BufferClass, DmaMappings, DmaSpace, IoMapping, Iommu};
use crate::irq::{InterruptCause, InterruptLine, IrqController};
use crate::mm::{GuestMemory, MemFlags};

/// Kind of register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write(u64),
}

/// Per-instance placement and transport options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    /// MMIO base address
    pub base: u64,
    /// INTID raised for this device
    pub intid: u32,
    /// Upper bound on QueueNumMax, further capped by the variant
    pub max_queue_size: u16,
    /// Offer VIRTIO_F_INDIRECT_DESC
    pub indirect_desc: bool,
}

impl DeviceSettings {
    pub fn new(base: u64, intid: u32) -> Self {
        Self { base, intid, max_queue_size: 256, indirect_desc: false }
    }
}

pub struct VirtioMmioDevice<D: VirtioDevice> {
    base: u64,
    variant: D,
    transport: Transport,
    mem: Arc<dyn GuestMemory>,
    dma: Arc<DmaMappings>,
    irq: Arc<InterruptLine>,
    driver_ok_delivered: bool,
    /// Retirement flag shared with the `ActiveDevice` handed out on DRIVER_OK.
    session: Option<Arc<AtomicBool>>,
}

impl<D: VirtioDevice> VirtioMmioDevice<D> {
    pub fn new(
        variant: D,
        settings: DeviceSettings,
        mem: Arc<dyn GuestMemory>,
        controller: Arc<dyn IrqController>,
    ) -> Result<Self, ConfigError> {
        if settings.base % MMIO_SIZE != 0 {
            return Err(ConfigError::Misaligned(settings.base));
        }
        let num_queues = variant.num_queues();
        if num_queues > MAX_QUEUES {
            return Err(ConfigError::TooManyQueues(num_queues));
        }
        let max_queue_size = settings.max_queue_size.min(variant.max_queue_size());
        if max_queue_size == 0 || !max_queue_size.is_power_of_two() || max_queue_size > MAX_QUEUE_SIZE {
            return Err(ConfigError::QueueSize(max_queue_size));
        }
        let config_space = variant.config_space();
        if config_space.len() as u64 > MMIO_SIZE - CONFIG_SPACE {
            return Err(ConfigError::ConfigTooLarge(config_space.len()));
        }

        let mut features = variant.device_features() | VIRTIO_F_VERSION_1;
        if settings.indirect_desc {
            features |= VIRTIO_F_INDIRECT_DESC;
        }
        let config = ConfigState::new(features, config_space, variant.config_writable());
        let irq = Arc::new(InterruptLine::new(controller, settings.intid));
        let transport = Transport::new(variant.device_id(), max_queue_size, num_queues, config, Arc::clone(&irq));
        debug!(base = settings.base, id = ?variant.device_id(), num_queues, "virtio-mmio device created");

        Ok(Self {
            base: settings.base,
            variant,
            transport,
            mem,
            dma: Arc::new(DmaMappings::new(num_queues)),
            irq,
            driver_ok_delivered: false,
            session: None,
        })
    }

    pub fn variant(&self) -> &D {
        &self.variant
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn interrupt_line(&self) -> &Arc<InterruptLine> {
        &self.irq
    }

    pub fn dma_mappings(&self) -> &Arc<DmaMappings> {
        &self.dma
    }

    /// Register access at `offset` into the window, followed by the event
    /// pass. A rejected access leaves no trace.
    pub fn access(&mut self, access: Access, offset: u64, size: u8) -> Result<u64, AccessError> {
        let result = match access {
            Access::Read => self.transport.read(offset, size),
            Access::Write(value) => self.transport.write(offset, size, value).map(|()| 0),
        };
        self.handle_events();
        result
    }

    /// Drain pending events in order.
    pub fn handle_events(&mut self) {
        let pending = self.transport.take_events();

        if pending.flags.contains(EventFlags::CONSTRUCT_QUEUE) {
            for q in bits(pending.construct) {
                self.construct_queue(q);
            }
        }
        if pending.flags.contains(EventFlags::STATUS_CHANGED) {
            self.status_changed();
        }
        if pending.flags.contains(EventFlags::IRQ_ACK) {
            self.irq.acknowledge(pending.ack);
        }
        if pending.flags.contains(EventFlags::NOTIFY) {
            for q in bits(pending.notify) {
                self.notify(q);
            }
        }
    }

    fn construct_queue(&mut self, index: u16) {
        let status = self.transport.config().status();
        let negotiated = self.transport.config().negotiated();
        let max = self.transport.max_queue_size();
        let space = DmaSpace::new(Arc::clone(&self.mem), Arc::clone(&self.dma), BufferClass(index));
        let irq = Arc::clone(&self.irq);

        let Some(state) = self.transport.queue_mut(index) else {
            return;
        };
        if state.is_constructed() {
            return;
        }
        if status.contains(DeviceStatus::DRIVER_OK) {
            warn!(queue = index, "queue enabled after DRIVER_OK");
            state.clear_ready();
            return;
        }
        let indirect = negotiated & VIRTIO_F_INDIRECT_DESC != 0;
        match state.construct(index, max, space, indirect, irq) {
            Ok(queue) => debug!(queue = index, layout = ?queue.layout(), "queue constructed"),
            Err(err) => {
                warn!(queue = index, %err, "queue configuration rejected");
                state.clear_ready();
            }
        }
    }

    fn status_changed(&mut self) {
        let status = self.transport.config().status();
        if status.is_empty() {
            debug!("device reset by driver");
            self.reset();
            self.variant.reset();
        } else if status.contains(DeviceStatus::DRIVER_OK) && !self.driver_ok_delivered {
            self.driver_ok_delivered = true;
            let features = self.transport.config().negotiated();
            let queues = self.transport.queues().iter().map(|q| q.queue().cloned()).collect();
            let session = Arc::new(AtomicBool::new(false));
            self.session = Some(Arc::clone(&session));
            debug!(features, "driver ok");
            self.variant.driver_ok(ActiveDevice::new(features, queues, Arc::clone(&self.irq), session));
        }
    }

    fn notify(&mut self, index: u16) {
        if !self.transport.config().status().contains(DeviceStatus::DRIVER_OK) {
            warn!(queue = index, "doorbell before DRIVER_OK");
            return;
        }
        match self.transport.queue(index) {
            Some(q) if q.is_constructed() => self.variant.notify(index),
            _ => warn!(queue = index, "doorbell for a queue that is not live"),
        }
    }

    /// Power-on defaults for transport, queues and interrupt state. The
    /// variant is not told.
    fn reset(&mut self) {
        self.retire_session();
        self.transport.reset();
        self.irq.deassert();
        self.driver_ok_delivered = false;
    }

    /// Invalidate the backend's `ActiveDevice`, if one was handed out.
    fn retire_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.store(true, Ordering::Release);
        }
    }

    /// Raise the used-buffer interrupt.
    pub fn assert_irq(&self) {
        self.irq.assert(InterruptCause::VRING);
    }

    pub fn deassert_irq(&self) {
        self.irq.deassert();
    }

    /// Device-side change to the config block.
    pub fn update_config(&mut self, offset: usize, bytes: &[u8]) -> Result<(), ConfigError> {
        if self.transport.config_mut().update(offset, bytes)? {
            debug!(offset, len = bytes.len(), "config changed");
            self.irq.assert(InterruptCause::CONFIG);
        }
        Ok(())
    }

    // ── IOMMU ──────────────────────────────────────────────────────────

    pub fn attach_iommu(&mut self, iommu: Arc<dyn Iommu>) -> Result<(), IommuError> {
        if self.dma.is_attached() {
            return Err(IommuError::AlreadyAttached);
        }
        iommu.attach()?;
        if let Err(err) = self.variant.port().attach() {
            warn!(%err, "backend refused IOMMU attach");
            iommu.detach();
            return Err(err);
        }
        self.dma.set_iommu(Some(iommu));
        debug!("iommu attached");
        Ok(())
    }

    /// Drop every mapping, then the IOMMU itself.
    pub fn detach_iommu(&mut self) -> Result<(), IommuError> {
        let iommu = self.dma.iommu().ok_or(IommuError::NotAttached)?;
        for class in (0..self.dma.class_count()).map(BufferClass) {
            if let Ok(mapping) = self.dma.remove(class) {
                self.variant.port().unmap(class, &mapping);
                if let Err(err) = iommu.unmap(&mapping) {
                    warn!(%class, %err, "unmap during detach failed");
                }
            }
        }
        self.variant.port().detach();
        self.dma.set_iommu(None);
        iommu.detach();
        debug!("iommu detached");
        Ok(())
    }

    /// Install the mapping for `class`. On failure the class stays unmapped.
    pub fn map_buffer_class(&mut self, class: BufferClass, iova: u64, len: u64, flags: MemFlags) -> Result<IoMapping, IommuError> {
        let iommu = self.dma.iommu().ok_or(IommuError::NotAttached)?;
        if class.0 >= self.dma.class_count() {
            return Err(IommuError::UnknownClass(class));
        }
        if self.dma.mapping(class).is_some() {
            return Err(IommuError::AlreadyMapped(class));
        }
        if len == 0 || iova.checked_add(len).is_none() {
            return Err(IommuError::InvalidRange { iova, len });
        }

        let mapping = iommu.map(iova, len, flags).inspect_err(|err| warn!(%class, %err, "iommu map failed"))?;
        if let Err(err) = self.variant.port().map(class, &mapping) {
            warn!(%class, %err, "backend refused mapping");
            if let Err(undo) = iommu.unmap(&mapping) {
                warn!(%class, err = %undo, "rollback unmap failed");
            }
            return Err(err);
        }
        if let Err(err) = self.dma.insert(class, mapping) {
            self.variant.port().unmap(class, &mapping);
            if let Err(undo) = iommu.unmap(&mapping) {
                warn!(%class, err = %undo, "rollback unmap failed");
            }
            return Err(err);
        }
        debug!(%class, iova, len, "buffer class mapped");
        Ok(mapping)
    }

    /// Remove the mapping for `class`. The class is unmapped afterwards
    /// even when the IOMMU reports an error.
    pub fn unmap_buffer_class(&mut self, class: BufferClass) -> Result<(), IommuError> {
        let iommu = self.dma.iommu().ok_or(IommuError::NotAttached)?;
        let mapping = self.dma.remove(class)?;
        self.variant.port().unmap(class, &mapping);
        iommu.unmap(&mapping).inspect_err(|err| warn!(%class, %err, "iommu unmap failed"))?;
        debug!(%class, "buffer class unmapped");
        Ok(())
    }

    /// Tear down: outstanding queue handles stop working and the backend
    /// is released. The register file stays readable.
    pub fn shutdown(&mut self) {
        self.retire_session();
        for q in self.transport.queues().iter().filter_map(|q| q.queue()) {
            q.retire();
        }
        self.variant.shutdown();
    }
}

/// Set bit positions of a queue mask, lowest first.
fn bits(mut mask: u64) -> impl Iterator<Item = u16> {
    core::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let bit = mask.trailing_zeros() as u16;
        mask &= mask - 1;
        Some(bit)
    })
}

impl<D: VirtioDevice> MmioDevice for VirtioMmioDevice<D> {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64, AccessError> {
        self.access(Access::Read, offset, size)
    }

    fn write(&mut self, offset: u64, value: u64, size: u8) -> Result<(), AccessError> {
        self.access(Access::Write(value), offset, size).map(|_| ())
    }

    fn base_address(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        MMIO_SIZE
    }

    fn pending_irq(&self) -> Option<u32> {
        self.irq.is_pending().then_some(self.irq.intid())
    }

    fn ack_irq(&mut self) {
        self.irq.deassert();
    }
}
