//! Split virtqueue.
//!
//! [`QueueState`] is the register-side view of a queue: what the driver
//! programmed through QueueNum and the address pairs. Once the driver sets
//! QueueReady and the layout validates, the queue is *constructed* into a
//! [`DeviceQueue`], the handle a backend uses to pop descriptor chains and
//! push used elements.
//!
//! Ring contents are written by an untrusted guest. Every index, length
//! and buffer address is checked before use, and any violation fails the
//! queue until the driver resets the device.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytemuck::{Pod, Zeroable};
use tracing::warn;

use super::MAX_QUEUE_SIZE;
use crate::error::{MemoryError, QueueError};
use crate::iommu::DmaSpace;
use crate::irq::{InterruptCause, InterruptLine};
use crate::mm::{GuestMemory, MemFlags};

/// Descriptor flags
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Driver → device: don't interrupt me.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;
/// Device → driver: don't kick me.
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

pub const DESC_ALIGN: u64 = 16;
pub const AVAIL_ALIGN: u64 = 16;
pub const USED_ALIGN: u64 = 4;

/// A single virtqueue descriptor, as laid out in guest memory.
///
/// Fields are little-endian in memory; values handed out by this module
/// are already in host order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Descriptor {
    /// Guest address of the buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub len: u32,
    pub flags: u16,
    /// Next descriptor in the chain (if NEXT is set)
    pub next: u16,
}

impl Descriptor {
    fn from_le(raw: Descriptor) -> Self {
        Self {
            addr: u64::from_le(raw.addr),
            len: u32::from_le(raw.len),
            flags: u16::from_le(raw.flags),
            next: u16::from_le(raw.next),
        }
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct UsedElem {
    id: u32,
    len: u32,
}

/// A popped descriptor chain: the head index plus its buffers in order,
/// indirect tables already expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    pub head: u16,
    pub descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    /// Device-readable buffers (they always precede the writable ones).
    pub fn readable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| !d.is_write_only())
    }

    pub fn writable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| d.is_write_only())
    }

    pub fn readable_len(&self) -> u64 {
        self.readable().map(|d| d.len as u64).sum()
    }

    pub fn writable_len(&self) -> u64 {
        self.writable().map(|d| d.len as u64).sum()
    }
}

/// Validated placement of the three rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub size: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

impl RingLayout {
    pub fn desc_bytes(size: u16) -> u64 {
        16 * size as u64
    }

    pub fn avail_bytes(size: u16) -> u64 {
        6 + 2 * size as u64
    }

    pub fn used_bytes(size: u16) -> u64 {
        6 + 8 * size as u64
    }

    /// Structural checks that need no guest memory.
    pub fn new(size: u16, max: u16, desc: u64, avail: u64, used: u64) -> Result<Self, QueueError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(QueueError::BadSize(size));
        }
        if size > max {
            return Err(QueueError::TooLarge { size, max });
        }
        for (ring, addr, align) in [("descriptor", desc, DESC_ALIGN), ("available", avail, AVAIL_ALIGN), ("used", used, USED_ALIGN)] {
            if addr % align != 0 {
                return Err(QueueError::Misaligned { ring, addr });
            }
        }

        let rings = [
            ("descriptor", desc, Self::desc_bytes(size)),
            ("available", avail, Self::avail_bytes(size)),
            ("used", used, Self::used_bytes(size)),
        ];
        for (i, &(a, a_addr, a_len)) in rings.iter().enumerate() {
            for &(b, b_addr, b_len) in &rings[i + 1..] {
                if a_addr < b_addr.saturating_add(b_len) && b_addr < a_addr.saturating_add(a_len) {
                    return Err(QueueError::Overlap(a, b));
                }
            }
        }
        Ok(Self { size, desc, avail, used })
    }

    /// Rings must be backed with the access each side needs.
    fn check_backing(&self, mem: &dyn GuestMemory) -> Result<(), QueueError> {
        let rings = [
            ("descriptor", self.desc, Self::desc_bytes(self.size), MemFlags::READ),
            ("available", self.avail, Self::avail_bytes(self.size), MemFlags::READ),
            ("used", self.used, Self::used_bytes(self.size), MemFlags::WRITE),
        ];
        for (ring, addr, len, access) in rings {
            mem.check(addr, len, access).map_err(|source| QueueError::Unbacked { ring, source })?;
        }
        Ok(())
    }
}

/// Which of a queue's three address register pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ring {
    Desc,
    Driver,
    Device,
}

/// Register-side state of one queue.
#[derive(Default)]
pub struct QueueState {
    size: u16,
    ready: bool,
    desc_addr: u64,
    driver_addr: u64,
    device_addr: u64,
    queue: Option<Arc<DeviceQueue>>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_constructed(&self) -> bool {
        self.queue.is_some()
    }

    pub fn queue(&self) -> Option<&Arc<DeviceQueue>> {
        self.queue.as_ref()
    }

    pub fn addr(&self, ring: Ring) -> u64 {
        match ring {
            Ring::Desc => self.desc_addr,
            Ring::Driver => self.driver_addr,
            Ring::Device => self.device_addr,
        }
    }

    /// QueueNum. Values past 16 bits can never validate and become 0.
    pub fn set_size(&mut self, val: u32) {
        if !self.is_constructed() {
            self.size = u16::try_from(val).unwrap_or(0);
        }
    }

    /// One 32-bit half of a ring address.
    pub fn set_addr(&mut self, ring: Ring, high: bool, val: u32) {
        if self.is_constructed() {
            return;
        }
        let addr = match ring {
            Ring::Desc => &mut self.desc_addr,
            Ring::Driver => &mut self.driver_addr,
            Ring::Device => &mut self.device_addr,
        };
        *addr = if high {
            (*addr & 0xFFFF_FFFF) | ((val as u64) << 32)
        } else {
            (*addr & !0xFFFF_FFFF) | val as u64
        };
    }

    pub fn set_ready(&mut self) {
        self.ready = true;
    }

    pub fn clear_ready(&mut self) {
        self.ready = false;
    }

    /// Validate the programmed layout and bring the queue up.
    pub fn construct(
        &mut self,
        index: u16,
        max: u16,
        mem: DmaSpace,
        indirect: bool,
        irq: Arc<InterruptLine>,
    ) -> Result<Arc<DeviceQueue>, QueueError> {
        if let Some(queue) = &self.queue {
            return Ok(Arc::clone(queue));
        }
        let layout = RingLayout::new(self.size, max, self.desc_addr, self.driver_addr, self.device_addr)?;
        layout.check_backing(&mem)?;
        let queue = Arc::new(DeviceQueue::new(index, layout, mem, indirect, irq));
        self.queue = Some(Arc::clone(&queue));
        Ok(queue)
    }

    /// Back to power-on defaults; outstanding handles stop working.
    pub fn reset(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.retire();
        }
        *self = Self::default();
    }
}

/// A constructed queue, shared with the backend.
///
/// The device owns `last_avail` and `next_used`; neither is ever read back
/// from guest memory.
pub struct DeviceQueue {
    index: u16,
    layout: RingLayout,
    mem: DmaSpace,
    indirect: bool,
    irq: Arc<InterruptLine>,
    last_avail: Mutex<u16>,
    next_used: Mutex<u16>,
    failed: AtomicBool,
    retired: AtomicBool,
}

fn lock(cursor: &Mutex<u16>) -> MutexGuard<'_, u16> {
    cursor.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceQueue {
    fn new(index: u16, layout: RingLayout, mem: DmaSpace, indirect: bool, irq: Arc<InterruptLine>) -> Self {
        Self {
            index,
            layout,
            mem,
            indirect,
            irq,
            last_avail: Mutex::new(0),
            next_used: Mutex::new(0),
            failed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> u16 {
        self.layout.size
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn mem(&self) -> &dyn GuestMemory {
        &self.mem
    }

    fn check_live(&self) -> Result<(), QueueError> {
        if self.is_retired() {
            return Err(QueueError::Retired);
        }
        if self.is_failed() {
            return Err(QueueError::Failed);
        }
        Ok(())
    }

    /// Mark the queue failed; the first failure asks the driver for a reset.
    fn fail(&self, err: QueueError) -> QueueError {
        if !self.failed.swap(true, Ordering::AcqRel) {
            warn!(queue = self.index, %err, "queue failed, device needs reset");
            self.irq.assert(InterruptCause::CONFIG);
        }
        err
    }

    fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        self.mem().read_obj::<u16>(addr).map(u16::from_le)
    }

    /// Next available chain, or `None` when the driver has posted nothing new.
    pub fn pop(&self) -> Result<Option<DescriptorChain>, QueueError> {
        self.check_live()?;
        let mut last_avail = lock(&self.last_avail);
        let size = self.layout.size;

        let avail_idx = self.read_u16(self.layout.avail + 2).map_err(|e| self.fail(e.into()))?;
        let pending = avail_idx.wrapping_sub(*last_avail);
        if pending == 0 {
            return Ok(None);
        }
        if pending > size {
            return Err(self.fail(QueueError::AvailOverrun(pending)));
        }
        // Ring entries are only valid once the index update is visible.
        fence(Ordering::Acquire);

        let slot = (*last_avail % size) as u64;
        let head = self.read_u16(self.layout.avail + 4 + 2 * slot).map_err(|e| self.fail(e.into()))?;
        let chain = self.walk(head).map_err(|e| self.fail(e))?;
        *last_avail = last_avail.wrapping_add(1);
        Ok(Some(chain))
    }

    fn read_desc(&self, table: u64, index: u16) -> Result<Descriptor, QueueError> {
        let raw = self.mem().read_obj::<Descriptor>(table + 16 * index as u64)?;
        Ok(Descriptor::from_le(raw))
    }

    fn walk(&self, head: u16) -> Result<DescriptorChain, QueueError> {
        let size = self.layout.size;
        let mut descriptors = Vec::new();
        let mut seen_write = false;
        let mut index = head;
        let mut budget = size;

        loop {
            if index >= size {
                return Err(QueueError::DescriptorIndex { index, size });
            }
            if budget == 0 {
                return Err(QueueError::ChainTooLong(size));
            }
            budget -= 1;

            let desc = self.read_desc(self.layout.desc, index)?;
            if desc.is_indirect() {
                if !self.indirect || desc.has_next() {
                    return Err(QueueError::BadIndirect);
                }
                self.walk_indirect(&desc, &mut descriptors, &mut seen_write)?;
                break;
            }
            self.accept(desc, &mut descriptors, &mut seen_write)?;
            if !desc.has_next() {
                break;
            }
            index = desc.next;
        }
        Ok(DescriptorChain { head, descriptors })
    }

    fn walk_indirect(&self, table: &Descriptor, out: &mut Vec<Descriptor>, seen_write: &mut bool) -> Result<(), QueueError> {
        let len = table.len as u64;
        if len == 0 || len % 16 != 0 || len / 16 > MAX_QUEUE_SIZE as u64 {
            return Err(QueueError::BadIndirect);
        }
        let count = (len / 16) as u16;
        self.mem().check(table.addr, len, MemFlags::READ)?;

        let mut index = 0;
        let mut budget = count;
        loop {
            if index >= count {
                return Err(QueueError::DescriptorIndex { index, size: count });
            }
            if budget == 0 {
                return Err(QueueError::ChainTooLong(count));
            }
            budget -= 1;

            let desc = self.read_desc(table.addr, index)?;
            if desc.is_indirect() {
                return Err(QueueError::BadIndirect);
            }
            self.accept(desc, out, seen_write)?;
            if !desc.has_next() {
                return Ok(());
            }
            index = desc.next;
        }
    }

    fn accept(&self, desc: Descriptor, out: &mut Vec<Descriptor>, seen_write: &mut bool) -> Result<(), QueueError> {
        let access = if desc.is_write_only() {
            *seen_write = true;
            MemFlags::WRITE
        } else if *seen_write {
            return Err(QueueError::OrderViolation);
        } else {
            MemFlags::READ
        };
        self.mem().check(desc.addr, desc.len as u64, access)?;
        out.push(desc);
        Ok(())
    }

    /// Return a chain to the driver with `len` bytes written.
    pub fn push(&self, head: u16, len: u32) -> Result<(), QueueError> {
        self.check_live()?;
        let size = self.layout.size;
        if head >= size {
            return Err(QueueError::DescriptorIndex { index: head, size });
        }
        let mut next_used = lock(&self.next_used);
        let slot = (*next_used % size) as u64;
        let elem = UsedElem { id: (head as u32).to_le(), len: len.to_le() };
        let used = self.layout.used;

        self.mem().write_obj(used + 4 + 8 * slot, elem).map_err(|e| self.fail(e.into()))?;
        // The element must land before the index that publishes it.
        fence(Ordering::Release);
        let idx = next_used.wrapping_add(1);
        self.mem().write_obj(used + 2, idx.to_le()).map_err(|e| self.fail(e.into()))?;
        *next_used = idx;
        Ok(())
    }

    /// Whether the driver wants an interrupt for used buffers.
    pub fn needs_interrupt(&self) -> bool {
        fence(Ordering::SeqCst);
        match self.read_u16(self.layout.avail) {
            Ok(flags) => flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0,
            Err(_) => true,
        }
    }

    /// Ask the driver to (not) ring the doorbell for new buffers.
    pub fn set_notifications(&self, enabled: bool) -> Result<(), QueueError> {
        self.check_live()?;
        let flags = if enabled { 0 } else { VIRTQ_USED_F_NO_NOTIFY };
        self.mem().write_obj(self.layout.used, flags.to_le()).map_err(|e| self.fail(e.into()))?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Gather the chain's readable buffers into `dst`; returns bytes copied.
    pub fn read_chain(&self, chain: &DescriptorChain, dst: &mut [u8]) -> Result<usize, QueueError> {
        self.check_live()?;
        let mut copied = 0;
        for desc in chain.readable() {
            if copied == dst.len() {
                break;
            }
            let n = (desc.len as usize).min(dst.len() - copied);
            self.mem().read_bytes(desc.addr, &mut dst[copied..copied + n]).map_err(|e| self.fail(e.into()))?;
            copied += n;
        }
        Ok(copied)
    }

    /// Scatter `src` across the chain's writable buffers; returns bytes copied.
    pub fn write_chain(&self, chain: &DescriptorChain, src: &[u8]) -> Result<usize, QueueError> {
        self.check_live()?;
        let mut copied = 0;
        for desc in chain.writable() {
            if copied == src.len() {
                break;
            }
            let n = (desc.len as usize).min(src.len() - copied);
            self.mem().write_bytes(desc.addr, &src[copied..copied + n]).map_err(|e| self.fail(e.into()))?;
            copied += n;
        }
        Ok(copied)
    }
}
