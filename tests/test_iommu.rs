//! Devices behind an IOMMU: per-class mappings, translation of ring and
//! buffer addresses, and rollback when a party refuses.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use virtio_core::devices::virtio::blk::VirtioBlk;
use virtio_core::devices::virtio::VIRTIO_F_VERSION_1;
use virtio_core::iommu::{BufferClass, IoMapping};
use virtio_core::mm::MemFlags;
use virtio_core::IommuError;

const CLASS: BufferClass = BufferClass(0);
const RW: MemFlags = MemFlags::RW;

/// IOVA 0 is guest-physical `RAM_BASE`.
fn iova(gpa: u64) -> u64 {
    gpa - RAM_BASE
}

fn attached() -> (Harness<VirtioBlk>, Arc<OffsetIommu>) {
    let mut h = blk();
    let iommu = Arc::new(OffsetIommu::new(RAM_BASE));
    h.dev.attach_iommu(iommu.clone()).unwrap();
    (h, iommu)
}

#[test]
fn test_translated_queue() {
    let (mut h, iommu) = attached();
    assert!(iommu.attached.load(Ordering::SeqCst));
    let mapping = h.dev.map_buffer_class(CLASS, 0, RAM_SIZE, RW).unwrap();
    assert_eq!(mapping, IoMapping { iova: 0, len: RAM_SIZE, gpa: RAM_BASE, flags: RW });
    assert_eq!(h.backend.events(), [BackendEvent::Attach, BackendEvent::Map(CLASS)]);

    h.negotiate(VIRTIO_F_VERSION_1);
    h.setup_queue(0, 8, iova(DESC), iova(AVAIL), iova(USED));
    assert_eq!(h.queue_ready(0), 1);
    h.driver_ok();

    let mut gq = GuestQueue::new(h.ram.clone(), 8, DESC, AVAIL, USED);
    gq.mem().write_bytes(BUFFERS, b"hello").unwrap();
    let head = gq.add_chain(&[(iova(BUFFERS), 5, false), (iova(BUFFERS + 0x100), 5, true)]);
    gq.publish(head);

    let queue = h.backend.active().unwrap().queue(0).unwrap().clone();
    let chain = queue.pop().unwrap().unwrap();
    let mut req = [0u8; 5];
    queue.read_chain(&chain, &mut req).unwrap();
    assert_eq!(&req, b"hello");
    queue.write_chain(&chain, b"world").unwrap();
    queue.push(chain.head, 5).unwrap();

    let mut resp = [0u8; 5];
    gq.mem().read_bytes(BUFFERS + 0x100, &mut resp).unwrap();
    assert_eq!(&resp, b"world");
    assert_eq!(gq.used_idx(), 1);
}

#[test]
fn test_unmapped_class_blocks_queue() {
    let (mut h, _iommu) = attached();
    h.negotiate(VIRTIO_F_VERSION_1);
    // Physical addresses mean nothing once an IOMMU is attached.
    h.setup_queue(0, 8, DESC, AVAIL, USED);
    assert_eq!(h.queue_ready(0), 0);
}

#[test]
fn test_read_only_mapping_rejects_used_ring() {
    let (mut h, _iommu) = attached();
    h.dev.map_buffer_class(CLASS, 0, RAM_SIZE, MemFlags::READ).unwrap();
    h.negotiate(VIRTIO_F_VERSION_1);
    h.setup_queue(0, 8, iova(DESC), iova(AVAIL), iova(USED));
    assert_eq!(h.queue_ready(0), 0);
}

#[test]
fn test_buffer_outside_window() {
    let (mut h, _iommu) = attached();
    h.dev.map_buffer_class(CLASS, 0, 0x8000, RW).unwrap();
    h.negotiate(VIRTIO_F_VERSION_1);
    h.setup_queue(0, 8, iova(DESC), iova(AVAIL), iova(USED));
    h.driver_ok();
    let mut gq = GuestQueue::new(h.ram.clone(), 8, DESC, AVAIL, USED);
    let head = gq.add_chain(&[(iova(BUFFERS), 8, false)]);
    gq.publish(head);

    let queue = h.backend.active().unwrap().queue(0).unwrap().clone();
    assert!(queue.pop().is_err());
    assert!(queue.is_failed());
}

#[test]
fn test_map_failure_leaves_class_unmapped() {
    let (mut h, iommu) = attached();
    iommu.refuse_map.store(true, Ordering::SeqCst);
    assert_eq!(h.dev.map_buffer_class(CLASS, 0, 0x1000, RW), Err(IommuError::MapFailed { iova: 0, len: 0x1000 }));
    assert_eq!(h.dev.dma_mappings().mapping(CLASS), None);
    assert_eq!(h.backend.count(&BackendEvent::Map(CLASS)), 0);

    iommu.refuse_map.store(false, Ordering::SeqCst);
    h.dev.map_buffer_class(CLASS, 0, 0x1000, RW).unwrap();
}

#[test]
fn test_backend_refusal_rolls_back() {
    let (mut h, _iommu) = attached();
    h.backend.refuse_map.store(true, Ordering::SeqCst);
    assert!(matches!(h.dev.map_buffer_class(CLASS, 0, 0x1000, RW), Err(IommuError::MapFailed { .. })));
    assert_eq!(h.dev.dma_mappings().mapping(CLASS), None);
}

#[test]
fn test_rollback_survives_unmap_error() {
    let (mut h, iommu) = attached();
    h.backend.refuse_map.store(true, Ordering::SeqCst);
    iommu.refuse_unmap.store(true, Ordering::SeqCst);
    // The backend's refusal is reported, not the failed undo.
    assert_eq!(h.dev.map_buffer_class(CLASS, 0, 0x1000, RW), Err(IommuError::MapFailed { iova: 0, len: 0x1000 }));
    assert_eq!(h.dev.dma_mappings().mapping(CLASS), None);

    h.backend.refuse_map.store(false, Ordering::SeqCst);
    h.dev.map_buffer_class(CLASS, 0, 0x1000, RW).unwrap();
}

#[test]
fn test_unmap_error_still_removes_entry() {
    let (mut h, iommu) = attached();
    h.dev.map_buffer_class(CLASS, 0, 0x1000, RW).unwrap();
    iommu.refuse_unmap.store(true, Ordering::SeqCst);
    assert_eq!(h.dev.unmap_buffer_class(CLASS), Err(IommuError::UnmapFailed { iova: 0 }));
    assert_eq!(h.dev.dma_mappings().mapping(CLASS), None);
    assert_eq!(h.backend.count(&BackendEvent::Unmap(CLASS)), 1);
    assert_eq!(h.dev.unmap_buffer_class(CLASS), Err(IommuError::NotMapped(CLASS)));
}

#[test]
fn test_mapping_argument_errors() {
    let mut h = blk();
    assert_eq!(h.dev.map_buffer_class(CLASS, 0, 0x1000, RW), Err(IommuError::NotAttached));
    assert_eq!(h.dev.unmap_buffer_class(CLASS), Err(IommuError::NotAttached));
    assert_eq!(h.dev.detach_iommu(), Err(IommuError::NotAttached));

    let iommu = Arc::new(OffsetIommu::new(RAM_BASE));
    h.dev.attach_iommu(iommu.clone()).unwrap();
    assert_eq!(h.dev.attach_iommu(iommu), Err(IommuError::AlreadyAttached));

    // A block device has a single request queue.
    assert_eq!(h.dev.map_buffer_class(BufferClass(1), 0, 0x1000, RW), Err(IommuError::UnknownClass(BufferClass(1))));
    assert_eq!(h.dev.map_buffer_class(CLASS, 0, 0, RW), Err(IommuError::InvalidRange { iova: 0, len: 0 }));
    assert_eq!(
        h.dev.map_buffer_class(CLASS, u64::MAX, 2, RW),
        Err(IommuError::InvalidRange { iova: u64::MAX, len: 2 })
    );
    h.dev.map_buffer_class(CLASS, 0, 0x1000, RW).unwrap();
    assert_eq!(h.dev.map_buffer_class(CLASS, 0x1000, 0x1000, RW), Err(IommuError::AlreadyMapped(CLASS)));
}

#[test]
fn test_detach_drops_mappings() {
    let (mut h, iommu) = attached();
    h.dev.map_buffer_class(CLASS, 0, 0x1000, RW).unwrap();
    h.dev.detach_iommu().unwrap();
    assert!(!iommu.attached.load(Ordering::SeqCst));
    assert!(!h.dev.dma_mappings().is_attached());
    assert_eq!(h.dev.dma_mappings().mapping(CLASS), None);
    assert_eq!(
        h.backend.events(),
        [BackendEvent::Attach, BackendEvent::Map(CLASS), BackendEvent::Unmap(CLASS), BackendEvent::Detach]
    );

    // Direct addressing again.
    h.negotiate(VIRTIO_F_VERSION_1);
    h.setup_queue(0, 8, DESC, AVAIL, USED);
    assert_eq!(h.queue_ready(0), 1);
}

#[test]
fn test_backend_refuses_attach() {
    let mut h = blk();
    h.backend.refuse_attach.store(true, Ordering::SeqCst);
    let iommu = Arc::new(OffsetIommu::new(RAM_BASE));
    assert_eq!(h.dev.attach_iommu(iommu.clone()), Err(IommuError::AttachFailed));
    assert!(!iommu.attached.load(Ordering::SeqCst));
    assert!(!h.dev.dma_mappings().is_attached());
}
