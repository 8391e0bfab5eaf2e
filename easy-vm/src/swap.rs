//! Swap store for evicted anonymous pages
use crate::block_dev::{BlockDevice, BLOCK_SZ};
use crate::config::PAGE_SIZE;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Number of device sectors holding one page
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SZ;

// 位图以 u64 为一组保存，每组 64 bits，分配时以组为单位查找第一个不满的组
/// An in-memory bitmap
pub struct Bitmap {
    groups: Vec<u64>,
    bits: usize,
    used: usize,
}

/// Decompose bits into (bits64_pos, inner_pos)
fn decomposition(bit: usize) -> (usize, usize) {
    (bit / 64, bit % 64)
}

impl Bitmap {
    /// A cleared bitmap of `bits` bits
    pub fn new(bits: usize) -> Self {
        let mut groups = vec![0u64; (bits + 63) / 64];
        // 最后一组中超出范围的位预先置 1，这样 alloc 永远不会分配到它们
        if bits % 64 != 0 {
            if let Some(last) = groups.last_mut() {
                *last = !((1u64 << (bits % 64)) - 1);
            }
        }
        Self {
            groups,
            bits,
            used: 0,
        }
    }
    /// Find the lowest clear bit and set it
    pub fn alloc(&mut self) -> Option<usize> {
        let (bits64_pos, inner_pos) = self
            .groups
            .iter()
            .enumerate()
            .find(|(_, bits64)| **bits64 != u64::MAX)
            .map(|(bits64_pos, bits64)| (bits64_pos, bits64.trailing_ones() as usize))?;
        self.groups[bits64_pos] |= 1u64 << inner_pos;
        self.used += 1;
        Some(bits64_pos * 64 + inner_pos)
    }
    /// Clear a set bit
    pub fn dealloc(&mut self, bit: usize) {
        assert!(bit < self.bits, "bit {} out of range", bit);
        let (bits64_pos, inner_pos) = decomposition(bit);
        assert!(
            self.groups[bits64_pos] & (1u64 << inner_pos) > 0,
            "bit {} has been deallocated!",
            bit
        );
        self.groups[bits64_pos] -= 1u64 << inner_pos;
        self.used -= 1;
    }
    pub fn is_set(&self, bit: usize) -> bool {
        let (bits64_pos, inner_pos) = decomposition(bit);
        bit < self.bits && self.groups[bits64_pos] & (1u64 << inner_pos) > 0
    }
    /// Get the max number of allocatable bits
    pub fn maximum(&self) -> usize {
        self.bits
    }
    /// Number of bits currently set
    pub fn used(&self) -> usize {
        self.used
    }
}

/// The swap area: page-sized slots on a block device, tracked by a bitmap
pub struct SwapStore {
    block_device: Arc<dyn BlockDevice>,
    slots: Mutex<Bitmap>,
}

impl SwapStore {
    /// A swap area covering the first `total_blocks` sectors of the device
    pub fn new(block_device: Arc<dyn BlockDevice>, total_blocks: usize) -> Self {
        let slots = total_blocks / SECTORS_PER_PAGE;
        info!("[swap] {} slots on {} sectors", slots, total_blocks);
        Self {
            block_device,
            slots: Mutex::new(Bitmap::new(slots)),
        }
    }
    /// Store one page in a free slot, returns the slot or `None` when the
    /// swap area is full
    pub fn swap_out(&self, data: &[u8]) -> Option<usize> {
        assert_eq!(data.len(), PAGE_SIZE);
        let slot = self.slots.lock().alloc()?;
        for (i, sector) in data.chunks(BLOCK_SZ).enumerate() {
            self.block_device
                .write_block(slot * SECTORS_PER_PAGE + i, sector);
        }
        debug!("[swap] page out to slot {}", slot);
        Some(slot)
    }
    /// Read a page back and free its slot
    pub fn swap_in(&self, slot: usize, buf: &mut [u8]) {
        self.read_slot(slot, buf);
        self.release(slot);
        debug!("[swap] page in from slot {}", slot);
    }
    /// Read a page without freeing its slot
    pub fn read_slot(&self, slot: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), PAGE_SIZE);
        assert!(self.slots.lock().is_set(slot), "slot {} is not in use", slot);
        for (i, sector) in buf.chunks_mut(BLOCK_SZ).enumerate() {
            self.block_device
                .read_block(slot * SECTORS_PER_PAGE + i, sector);
        }
    }
    pub fn release(&self, slot: usize) {
        self.slots.lock().dealloc(slot);
    }
    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.lock().maximum()
    }
    /// Number of slots holding a page
    pub fn in_use(&self) -> usize {
        self.slots.lock().used()
    }
}
