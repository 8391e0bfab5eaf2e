//! Explicit file mappings: [`MapArea`] records and `mmap`/`munmap`
use crate::address::{VPNRange, VirtAddr, VirtPageNum};
use crate::config::{FD_STDIN, FD_STDOUT, KERN_BASE, PAGE_SIZE};
use crate::file::File;
use crate::memory_set::MemorySet;
use crate::page::{LoadInfo, Page, VmType};
use crate::spt::SupplementalPageTable;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// map area structure, one per successful `mmap`
pub struct MapArea {
    vpn_range: VPNRange,
    // 映射私有的文件句柄，和用户传进来的句柄互不影响
    file: Arc<dyn File>,
    offset: usize,
    length: usize,
    // 实际由文件内容支撑的字节数，超出部分在页内补零且永远不写回
    backed: usize,
}

impl MapArea {
    fn new(start: VirtAddr, length: usize, file: Arc<dyn File>, offset: usize) -> Self {
        let start_vpn: VirtPageNum = start.floor();
        let end_vpn: VirtPageNum = VirtAddr::from(start.0 + length).ceil();
        let backed = length.min(file.size().saturating_sub(offset));
        Self {
            vpn_range: VPNRange::new(start_vpn, end_vpn),
            file,
            offset,
            length,
            backed,
        }
    }
    /// The same mapping with a private handle of its own
    pub fn from_another(another: &MapArea) -> Self {
        Self {
            vpn_range: VPNRange::new(another.vpn_range.get_start(), another.vpn_range.get_end()),
            file: another.file.duplicate(),
            offset: another.offset,
            length: another.length,
            backed: another.backed,
        }
    }
    pub fn start(&self) -> VirtAddr {
        self.vpn_range.get_start().into()
    }
    pub fn length(&self) -> usize {
        self.length
    }
    pub fn page_count(&self) -> usize {
        self.vpn_range.get_end().0 - self.vpn_range.get_start().0
    }
    /// Bytes of the `i`-th page that belong to the file
    fn flush_len(&self, i: usize) -> usize {
        self.backed.saturating_sub(i * PAGE_SIZE).min(PAGE_SIZE)
    }
    fn loader(&self, i: usize) -> LoadInfo {
        let read_bytes = self.flush_len(i);
        LoadInfo::new(
            Arc::clone(&self.file),
            self.offset + i * PAGE_SIZE,
            read_bytes,
            PAGE_SIZE - read_bytes,
        )
    }
}

fn range_is_free(spt: &SupplementalPageTable, range: VPNRange) -> bool {
    range.into_iter().all(|vpn| !spt.contains(vpn))
}

impl MemorySet {
    /// Map `length` bytes of `file` starting at `offset` to `addr`
    ///
    /// Nothing is read until the pages are touched. Returns the start of
    /// the mapping, or `None` (with nothing created) if the request is
    /// invalid.
    pub fn mmap(
        &self,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        fd: usize,
        file: &Arc<dyn File>,
        offset: usize,
    ) -> Option<VirtAddr> {
        if fd == FD_STDIN || fd == FD_STDOUT {
            warn!("[mmap] fd {} is the console", fd);
            return None;
        }
        if addr.0 == 0 || !addr.aligned() || offset % PAGE_SIZE != 0 || length == 0 {
            warn!(
                "[mmap] bad request: addr = {:?}, length = {:#x}, offset = {:#x}",
                addr, length, offset
            );
            return None;
        }
        match addr.0.checked_add(length) {
            Some(end) if end <= KERN_BASE => {}
            _ => {
                warn!("[mmap] {:?} + {:#x} reaches kernel space", addr, length);
                return None;
            }
        }
        if file.size() == 0 {
            warn!("[mmap] fd {} is empty", fd);
            return None;
        }
        let area = MapArea::new(addr, length, file.duplicate(), offset);
        let mut areas = self.areas.lock();
        let mut spt = self.spt.lock();
        if !range_is_free(&spt, area.vpn_range) {
            warn!("[mmap] {:?} overlaps an existing page", addr);
            return None;
        }
        for (i, vpn) in area.vpn_range.into_iter().enumerate() {
            spt.insert(Page::new_uninit(vpn, writable, VmType::File, Some(area.loader(i))));
        }
        info!(
            "[mmap] {:?} -> fd {}, {} pages at offset {:#x}",
            addr,
            fd,
            area.page_count(),
            offset
        );
        areas.push(area);
        Some(addr)
    }

    /// Remove the mapping starting exactly at `addr`
    ///
    /// If any of its pages was written, every resident page goes back to the
    /// file before the pages are destroyed.
    pub fn munmap(&self, addr: VirtAddr) {
        let mut areas = self.areas.lock();
        let area = match areas.iter().position(|area| area.start() == addr) {
            Some(idx) => areas.remove(idx),
            None => return,
        };
        let mut spt = self.spt.lock();
        let pages: Vec<(usize, Arc<Page>)> = area
            .vpn_range
            .into_iter()
            .enumerate()
            .filter_map(|(i, vpn)| spt.get(vpn).map(|page| (i, page)))
            .collect();
        let dirty = pages
            .iter()
            .any(|(_, page)| self.page_table.is_dirty(page.vpn()));
        if dirty {
            for (i, page) in pages.iter() {
                let pos = area.offset + i * PAGE_SIZE;
                if !self
                    .vm
                    .flush_page(page, &self.page_table, &*area.file, pos, area.flush_len(*i))
                {
                    warn!("[munmap] failed to write back {:?} at {:#x}", page.vpn(), pos);
                }
            }
        }
        for (_, page) in pages.iter() {
            spt.remove(page.va(), &self.vm, &self.page_table);
        }
        info!("[munmap] {:?}, {} pages, flushed = {}", addr, pages.len(), dirty);
    }
}
