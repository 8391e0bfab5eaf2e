//! Supplemental page table: the per-process set of pages
use crate::address::{VirtAddr, VirtPageNum};
use crate::frame::Vm;
use crate::page::Page;
use crate::page_table::PageTable;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Pages of one address space, keyed by virtual page number
pub struct SupplementalPageTable {
    pages: BTreeMap<VirtPageNum, Arc<Page>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }
    /// Insert a page, fails if its virtual page is already taken
    pub fn insert(&mut self, page: Arc<Page>) -> bool {
        let vpn = page.vpn();
        if self.pages.contains_key(&vpn) {
            return false;
        }
        self.pages.insert(vpn, page);
        true
    }
    /// Find the page containing `va` and stamp it as just used
    pub fn find(&self, va: VirtAddr) -> Option<Arc<Page>> {
        let vpn = va.floor();
        let page = self.pages.get(&vpn)?;
        page.touch();
        trace!("[spt] find {:?}", vpn);
        Some(Arc::clone(page))
    }
    /// Look a page up without counting it as a use
    pub fn get(&self, vpn: VirtPageNum) -> Option<Arc<Page>> {
        self.pages.get(&vpn).cloned()
    }
    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        self.pages.contains_key(&vpn)
    }
    /// Detach the page containing `va` and free everything it holds
    pub fn remove(&mut self, va: VirtAddr, vm: &Vm, page_table: &Arc<dyn PageTable>) -> bool {
        match self.pages.remove(&va.floor()) {
            Some(page) => {
                vm.destroy_page(&page, page_table);
                true
            }
            None => false,
        }
    }
    pub fn iter(&self) -> impl Iterator<Item = (&VirtPageNum, &Arc<Page>)> {
        self.pages.iter()
    }
    pub fn len(&self) -> usize {
        self.pages.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
    /// Destroy every page; the table is empty afterwards
    pub fn kill(&mut self, vm: &Vm, page_table: &Arc<dyn PageTable>) {
        let pages: Vec<Arc<Page>> = core::mem::take(&mut self.pages).into_values().collect();
        for page in pages.iter() {
            vm.destroy_page(page, page_table);
        }
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}
