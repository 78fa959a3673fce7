//! Virtio-mmio slot discovery from a flattened device tree.
//!
//! QEMU describes every virtio-mmio window as a `virtio,mmio` node with a
//! `reg` and a three-cell GIC `interrupts` property. When no usable blob
//! is available the board defaults from `platform.rs` are used instead.
//!
//! The `fdt` crate does zero-copy parsing over the caller's buffer.

use fdt::Fdt;
use tracing::{debug, warn};

use crate::error::DtbError;
use crate::platform::{self, MmioSlot, GIC_SPI_BASE};

const VIRTIO_MMIO_COMPATIBLE: &str = "virtio,mmio";

/// GIC interrupt specifier types.
const GIC_SPI: u32 = 0;
const GIC_PPI: u32 = 1;
const GIC_PPI_BASE: u32 = 16;

fn be32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?))
}

/// Decode the first `<type number flags>` specifier to an INTID.
fn gic_intid(interrupts: &[u8]) -> Option<u32> {
    let kind = be32(interrupts)?;
    let number = be32(interrupts.get(4..)?)?;
    be32(interrupts.get(8..)?)?;
    match kind {
        GIC_SPI => number.checked_add(GIC_SPI_BASE),
        GIC_PPI => number.checked_add(GIC_PPI_BASE),
        _ => None,
    }
}

/// All `virtio,mmio` windows in `blob`, lowest address first.
pub fn virtio_mmio_slots(blob: &[u8]) -> Result<Vec<MmioSlot>, DtbError> {
    let fdt = Fdt::new(blob).map_err(|_| DtbError::Invalid)?;
    let mut slots = Vec::new();

    let nodes = fdt
        .all_nodes()
        .filter(|n| n.compatible().is_some_and(|c| c.all().any(|s| s == VIRTIO_MMIO_COMPATIBLE)));
    for node in nodes {
        let reg = node.reg().and_then(|mut r| r.next()).ok_or(DtbError::MissingReg)?;
        let intid = node
            .property("interrupts")
            .and_then(|p| gic_intid(p.value))
            .ok_or(DtbError::MissingInterrupt)?;
        slots.push(MmioSlot {
            base: reg.starting_address as u64,
            size: reg.size.unwrap_or(platform::VIRTIO_MMIO_STRIDE as usize) as u64,
            intid,
        });
    }

    slots.sort_by_key(|s| s.base);
    debug!(count = slots.len(), "virtio-mmio slots from device tree");
    Ok(slots)
}

/// Slots from `blob` if it parses and describes any, board defaults otherwise.
pub fn virtio_slots_or_default(blob: Option<&[u8]>) -> Vec<MmioSlot> {
    match blob.map(virtio_mmio_slots) {
        Some(Ok(slots)) if !slots.is_empty() => slots,
        Some(Err(err)) => {
            warn!(%err, "device tree unusable, using default virtio-mmio slots");
            platform::default_virtio_slots()
        }
        _ => platform::default_virtio_slots(),
    }
}
