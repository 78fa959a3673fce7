//! Device interrupt line.
//!
//! Tracks the virtio-mmio InterruptStatus causes of one device and drives
//! the interrupt controller on the edges only: the line is raised when the
//! first cause becomes pending and lowered when the last one is cleared.
//! Raising an already-pending cause is invisible to the guest.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;
use tracing::trace;

bitflags! {
    /// InterruptStatus / InterruptACK bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptCause: u32 {
        /// Used buffer notification.
        const VRING = 1 << 0;
        /// Configuration change notification.
        const CONFIG = 1 << 1;
    }
}

/// Interrupt controller as seen by a device.
pub trait IrqController: Send + Sync {
    fn assert_irq(&self, intid: u32);
    fn deassert_irq(&self, intid: u32);
}

/// One device's interrupt line.
pub struct InterruptLine {
    intid: u32,
    status: AtomicU32,
    controller: Arc<dyn IrqController>,
    /// Orders status edges with the controller calls they trigger.
    edge: Mutex<()>,
}

impl InterruptLine {
    pub fn new(controller: Arc<dyn IrqController>, intid: u32) -> Self {
        Self { intid, status: AtomicU32::new(0), controller, edge: Mutex::new(()) }
    }

    pub fn intid(&self) -> u32 {
        self.intid
    }

    /// Pending causes, as read from InterruptStatus.
    pub fn pending(&self) -> InterruptCause {
        InterruptCause::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    pub fn is_pending(&self) -> bool {
        !self.pending().is_empty()
    }

    /// Mark `cause` pending and raise the line if it was idle.
    pub fn assert(&self, cause: InterruptCause) {
        if cause.is_empty() {
            return;
        }
        let _edge = self.edge.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = self.status.fetch_or(cause.bits(), Ordering::AcqRel);
        if prev == 0 {
            trace!(intid = self.intid, ?cause, "raising interrupt");
            self.controller.assert_irq(self.intid);
        }
    }

    /// Clear `cause` and lower the line once nothing is pending.
    pub fn acknowledge(&self, cause: InterruptCause) {
        let _edge = self.edge.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = self.status.fetch_and(!cause.bits(), Ordering::AcqRel);
        if prev != 0 && prev & !cause.bits() == 0 {
            trace!(intid = self.intid, "lowering interrupt");
            self.controller.deassert_irq(self.intid);
        }
    }

    /// Clear every cause.
    pub fn deassert(&self) {
        self.acknowledge(InterruptCause::all());
    }
}
