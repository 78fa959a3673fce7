//! Platform/Board Constants (QEMU virt machine)
//!
//! All board-specific addresses live here so they can be changed in one
//! place when targeting a different platform. Only the virtio-mmio slot
//! bank is described; `dtb.rs` overrides it at runtime when a device tree
//! is available.

// ── Virtio-MMIO slots ────────────────────────────────────────────────
pub const VIRTIO_MMIO_BASE: u64 = 0x0a00_0000;
pub const VIRTIO_MMIO_STRIDE: u64 = 0x200;
pub const VIRTIO_MMIO_SLOTS: usize = 32;
/// SPI 16 = INTID 48
pub const VIRTIO_MMIO_FIRST_INTID: u32 = 48;

/// First shared peripheral interrupt INTID on a GIC.
pub const GIC_SPI_BASE: u32 = 32;

// ── Guest memory layout ──────────────────────────────────────────────
pub const GUEST_RAM_BASE: u64 = 0x4000_0000;

/// One virtio-mmio register window and its interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioSlot {
    pub base: u64,
    pub size: u64,
    pub intid: u32,
}

/// The `index`th slot of the board's default bank.
pub fn virtio_mmio_slot(index: usize) -> Option<MmioSlot> {
    (index < VIRTIO_MMIO_SLOTS).then(|| MmioSlot {
        base: VIRTIO_MMIO_BASE + index as u64 * VIRTIO_MMIO_STRIDE,
        size: VIRTIO_MMIO_STRIDE,
        intid: VIRTIO_MMIO_FIRST_INTID + index as u32,
    })
}

/// Every slot of the default bank, lowest address first.
pub fn default_virtio_slots() -> Vec<MmioSlot> {
    (0..VIRTIO_MMIO_SLOTS).filter_map(virtio_mmio_slot).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bank() {
        let slots = default_virtio_slots();
        assert_eq!(slots.len(), 32);
        assert_eq!(slots[0], MmioSlot { base: 0x0a00_0000, size: 0x200, intid: 48 });
        assert_eq!(slots[31].base, 0x0a00_3e00);
        assert_eq!(slots[31].intid, 79);
        assert_eq!(virtio_mmio_slot(32), None);
    }
}
