//! Implementation of [`PageTableEntry`], the [`PageTable`] primitive and a
//! software [`SoftPageTable`].
use crate::address::{PhysPageNum, VirtPageNum};
use alloc::collections::BTreeMap;
use bitflags::*;
use spin::Mutex;

// V(Valid)：仅当位 V 为 1 时，页表项才是合法的；
// R(Read)/W(Write)/X(eXecute)：分别控制索引到这个页表项的对应虚拟页面是否允许读/写/执行；
// U(User)：控制索引到这个页表项的对应虚拟页面是否在 CPU 处于 U 特权级的情况下是否被允许访问；
// A(Accessed)：处理器记录自从页表项上的这一位被清零之后，页表项的对应虚拟页面是否被访问过；
// D(Dirty)：处理器记录自从页表项上的这一位被清零之后，页表项的对应虚拟页面是否被修改过
bitflags! {
    /// page table entry flags
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

#[derive(Copy, Clone)]
#[repr(C)]
/// page table entry structure
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }
    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }
    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }
    pub fn accessed(&self) -> bool {
        self.flags().contains(PTEFlags::A)
    }
    pub fn dirty(&self) -> bool {
        self.flags().contains(PTEFlags::D)
    }
    fn set_flag(&mut self, flag: PTEFlags, on: bool) {
        let mut flags = self.flags();
        flags.set(flag, on);
        *self = PageTableEntry::new(self.ppn(), flags);
    }
}

/// The virtual-to-physical translation primitive of one address space
///
/// The kernel backs this with the hardware page table; the VM core only ever
/// installs, clears and queries single user entries.
pub trait PageTable: Send + Sync {
    /// Install `vpn -> ppn`; fails if `vpn` is already mapped
    fn map(&self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> bool;
    /// Clear the entry of `vpn`, dirty bit included
    fn unmap(&self, vpn: VirtPageNum);
    /// The valid entry of `vpn`, if any
    fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry>;
    fn is_dirty(&self, vpn: VirtPageNum) -> bool;
    fn set_dirty(&self, vpn: VirtPageNum, dirty: bool);
    /// Record a user access the way the MMU does: sets A, and D on writes
    fn touch(&self, vpn: VirtPageNum, write: bool);

    fn is_present(&self, vpn: VirtPageNum) -> bool {
        self.translate(vpn).is_some()
    }
}

/// A page table kept entirely in software
///
/// Only leaf entries are modelled, keyed by virtual page number.
pub struct SoftPageTable {
    entries: Mutex<BTreeMap<VirtPageNum, PageTableEntry>>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
    /// Number of valid entries
    pub fn mapped(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for SoftPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable for SoftPageTable {
    fn map(&self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&vpn) {
            return false;
        }
        let mut flags = PTEFlags::V | PTEFlags::R | PTEFlags::U;
        if writable {
            flags |= PTEFlags::W;
        }
        entries.insert(vpn, PageTableEntry::new(ppn, flags));
        true
    }
    fn unmap(&self, vpn: VirtPageNum) {
        self.entries.lock().remove(&vpn);
    }
    fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.entries.lock().get(&vpn).copied()
    }
    fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.entries
            .lock()
            .get(&vpn)
            .map_or(false, |pte| pte.dirty())
    }
    fn set_dirty(&self, vpn: VirtPageNum, dirty: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&vpn) {
            pte.set_flag(PTEFlags::D, dirty);
        }
    }
    fn touch(&self, vpn: VirtPageNum, write: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&vpn) {
            pte.set_flag(PTEFlags::A, true);
            if write {
                pte.set_flag(PTEFlags::D, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_twice_fails() {
        let pt = SoftPageTable::new();
        assert!(pt.map(VirtPageNum(7), PhysPageNum(0x80400), true));
        assert!(!pt.map(VirtPageNum(7), PhysPageNum(0x80401), true));
        let pte = pt.translate(VirtPageNum(7)).unwrap();
        assert_eq!(pte.ppn(), PhysPageNum(0x80400));
        assert!(pte.is_valid() && pte.writable());
    }

    #[test]
    fn dirty_bit_follows_writes_and_unmap() {
        let pt = SoftPageTable::new();
        pt.map(VirtPageNum(1), PhysPageNum(0x80400), true);
        pt.touch(VirtPageNum(1), false);
        assert!(!pt.is_dirty(VirtPageNum(1)));
        pt.touch(VirtPageNum(1), true);
        assert!(pt.is_dirty(VirtPageNum(1)));
        pt.set_dirty(VirtPageNum(1), false);
        assert!(!pt.is_dirty(VirtPageNum(1)));
        pt.touch(VirtPageNum(1), true);
        pt.unmap(VirtPageNum(1));
        assert!(!pt.is_present(VirtPageNum(1)));
        assert!(!pt.is_dirty(VirtPageNum(1)));
    }
}
