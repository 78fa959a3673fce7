//! Backend-facing side of a virtio device.
//!
//! The backend is the out-of-core thread or process doing the actual I/O.
//! It learns about the device through the narrow [`Backend`] callback
//! interface and works the rings through the [`DeviceQueue`] handles it
//! receives on DRIVER_OK.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::queue::DeviceQueue;
use crate::error::IommuError;
use crate::iommu::{BufferClass, IoMapping};
use crate::irq::{InterruptCause, InterruptLine};
use crate::sync::{Cancelled, Semaphore, Wake};

/// Callbacks a device variant forwards to its backend.
///
/// Called from the vCPU trap path, so implementations must not block;
/// `notify` typically just rings a [`Doorbell`].
pub trait Backend: Send + Sync {
    /// An IOMMU is being attached to the device.
    fn attach(&self) -> Result<(), IommuError> {
        Ok(())
    }

    fn detach(&self) {}

    /// A mapping for `class` is about to become active.
    fn map(&self, _class: BufferClass, _mapping: &IoMapping) -> Result<(), IommuError> {
        Ok(())
    }

    fn unmap(&self, _class: BufferClass, _mapping: &IoMapping) {}

    /// The driver finished initialisation.
    fn driver_ok(&self, device: ActiveDevice);

    /// The driver rang the doorbell of `queue`.
    fn notify(&self, queue: u16);

    /// The driver reset the device; drop every queue handle.
    fn device_reset(&self);

    /// Stop for good; release every thread parked on the backend.
    fn shutdown(&self);
}

/// What a backend gets on DRIVER_OK.
///
/// Valid until the driver resets the device or the device shuts down;
/// after that the interrupt calls do nothing and the queues are retired.
#[derive(Clone)]
pub struct ActiveDevice {
    features: u64,
    queues: Vec<Option<Arc<DeviceQueue>>>,
    irq: Arc<InterruptLine>,
    retired: Arc<AtomicBool>,
}

impl ActiveDevice {
    pub(crate) fn new(
        features: u64,
        queues: Vec<Option<Arc<DeviceQueue>>>,
        irq: Arc<InterruptLine>,
        retired: Arc<AtomicBool>,
    ) -> Self {
        Self { features, queues, irq, retired }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Negotiated feature bits.
    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn has_feature(&self, bit: u64) -> bool {
        self.features & bit == bit
    }

    /// Handle for `index`, if the driver constructed that queue.
    pub fn queue(&self, index: u16) -> Option<&Arc<DeviceQueue>> {
        self.queues.get(index as usize).and_then(Option::as_ref)
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn interrupt_line(&self) -> &Arc<InterruptLine> {
        &self.irq
    }

    /// Raise the used-buffer interrupt.
    pub fn assert_irq(&self) {
        if self.is_retired() {
            trace!("interrupt from a retired device handle dropped");
            return;
        }
        self.irq.assert(InterruptCause::VRING);
    }

    pub fn deassert_irq(&self) {
        if !self.is_retired() {
            self.irq.deassert();
        }
    }
}

/// A variant's connection to its backend.
///
/// After [`shutdown`](Self::shutdown) nothing but IOMMU teardown reaches
/// the backend any more.
pub struct BackendPort {
    backend: Arc<dyn Backend>,
    shut_down: AtomicBool,
}

impl BackendPort {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend, shut_down: AtomicBool::new(false) }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn notify(&self, queue: u16) {
        if self.is_shut_down() {
            trace!(queue, "doorbell after shutdown dropped");
            return;
        }
        self.backend.notify(queue);
    }

    pub fn driver_ok(&self, device: ActiveDevice) {
        if self.is_shut_down() {
            return;
        }
        self.backend.driver_ok(device);
    }

    pub fn device_reset(&self) {
        if self.is_shut_down() {
            return;
        }
        self.backend.device_reset();
    }

    /// Forward shutdown once.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            debug!("backend shutdown");
            self.backend.shutdown();
        }
    }

    pub fn attach(&self) -> Result<(), IommuError> {
        if self.is_shut_down() {
            return Err(IommuError::AttachFailed);
        }
        self.backend.attach()
    }

    pub fn detach(&self) {
        self.backend.detach();
    }

    pub fn map(&self, class: BufferClass, mapping: &IoMapping) -> Result<(), IommuError> {
        self.backend.map(class, mapping)
    }

    pub fn unmap(&self, class: BufferClass, mapping: &IoMapping) {
        self.backend.unmap(class, mapping);
    }
}

/// Doorbell a backend embeds to implement [`Backend::notify`].
///
/// Every ring is one semaphore signal, so a backend already busy with a
/// queue still wakes once more and re-polls the ring. The returned bitmap
/// names the queues rung since the last wakeup; it may be empty when
/// several rings were collected by an earlier wakeup.
pub struct Doorbell {
    sem: Semaphore,
    pending: AtomicU64,
}

impl Doorbell {
    pub fn new() -> Self {
        Self { sem: Semaphore::new(), pending: AtomicU64::new(0) }
    }

    pub fn ring(&self, queue: u16) {
        if queue < 64 {
            self.pending.fetch_or(1 << queue, Ordering::AcqRel);
        }
        self.sem.signal();
    }

    /// Block for the next ring; returns the pending queue bitmap.
    pub fn wait(&self) -> Result<u64, Cancelled> {
        self.sem.wait()?;
        Ok(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Bounded [`wait`](Self::wait); `None` on timeout.
    pub fn wait_until(&self, deadline: Instant) -> Result<Option<u64>, Cancelled> {
        match self.sem.wait_until(deadline)? {
            Wake::Signaled => Ok(Some(self.pending.swap(0, Ordering::AcqRel))),
            Wake::TimedOut => Ok(None),
        }
    }

    pub fn shutdown(&self) {
        self.sem.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.sem.is_shut_down()
    }
}

impl Default for Doorbell {
    fn default() -> Self {
        Self::new()
    }
}
