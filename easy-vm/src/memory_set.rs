//! Implementation of [`MemorySet`], the user address space of one process
use crate::address::VirtAddr;
use crate::config::{PAGE_SIZE, USER_STACK};
use crate::fault::PageFault;
use crate::file::File;
use crate::frame::Vm;
use crate::mmap::MapArea;
use crate::page::{LoadInfo, Page, PageKind, VmType};
use crate::page_table::PageTable;
use crate::spt::SupplementalPageTable;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// address space
pub struct MemorySet {
    pub(crate) vm: Arc<Vm>,
    pub(crate) page_table: Arc<dyn PageTable>,
    pub(crate) spt: Mutex<SupplementalPageTable>,
    pub(crate) areas: Mutex<Vec<MapArea>>,
    // 栈区域当前的最低页地址，只会往下长
    pub(crate) stack_bottom: AtomicUsize,
    pub(crate) user_sp: AtomicUsize,
}

impl MemorySet {
    /// Create an empty address space translating through `page_table`
    pub fn new_bare(vm: Arc<Vm>, page_table: Arc<dyn PageTable>) -> Self {
        Self {
            vm,
            page_table,
            spt: Mutex::new(SupplementalPageTable::new()),
            areas: Mutex::new(Vec::new()),
            stack_bottom: AtomicUsize::new(USER_STACK),
            user_sp: AtomicUsize::new(USER_STACK),
        }
    }
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }
    pub fn page_table(&self) -> &Arc<dyn PageTable> {
        &self.page_table
    }
    /// Create a deferred page at `va` which becomes `ty` when first claimed
    pub fn alloc_page(
        &self,
        ty: VmType,
        va: VirtAddr,
        writable: bool,
        loader: Option<LoadInfo>,
    ) -> bool {
        if ty == VmType::File && loader.is_none() {
            warn!("[vm] file-backed page at {:?} without a loader", va);
            return false;
        }
        let page = Page::new_uninit(va.floor(), writable, ty, loader);
        if !self.spt.lock().insert(page) {
            warn!("[vm] {:?} is already in use", va);
            return false;
        }
        true
    }
    /// Register a segment of an executable image for demand loading
    ///
    /// `read_bytes` bytes at `ofs` in `file` followed by `zero_bytes` zeros
    /// are laid out from `upage`. Each page reads its part of the file once
    /// and is anonymous afterwards.
    pub fn load_segment(
        &self,
        file: &Arc<dyn File>,
        mut ofs: usize,
        upage: VirtAddr,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> bool {
        if (read_bytes + zero_bytes) % PAGE_SIZE != 0 || !upage.aligned() || ofs % PAGE_SIZE != 0
        {
            warn!("[vm] misaligned segment at {:?}", upage);
            return false;
        }
        let mut vpn = upage.floor();
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;
            let loader = LoadInfo::new(Arc::clone(file), ofs, page_read_bytes, page_zero_bytes);
            if !self.alloc_page(VmType::Anon, vpn.into(), writable, Some(loader)) {
                return false;
            }
            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            ofs += page_read_bytes;
            vpn.0 += 1;
        }
        true
    }
    /// Create the first stack page right below [`USER_STACK`] and claim it
    pub fn setup_stack(&self) -> bool {
        let bottom = USER_STACK - PAGE_SIZE;
        if !self.alloc_page(VmType::Anon, bottom.into(), true, None) || !self.claim_page(bottom.into())
        {
            return false;
        }
        self.stack_bottom.store(bottom, Ordering::Relaxed);
        self.user_sp.store(USER_STACK, Ordering::Relaxed);
        true
    }
    /// Claim the page containing `va`
    pub fn claim_page(&self, va: VirtAddr) -> bool {
        let page = match self.spt.lock().find(va) {
            Some(page) => page,
            None => return false,
        };
        self.vm.claim(&page, &self.page_table)
    }
    pub fn find_page(&self, va: VirtAddr) -> Option<Arc<Page>> {
        self.spt.lock().find(va)
    }
    /// Remove and destroy the page containing `va`
    pub fn remove_page(&self, va: VirtAddr) -> bool {
        self.spt.lock().remove(va, &self.vm, &self.page_table)
    }
    /// Whether the page containing `va` currently sits in a frame
    pub fn is_resident(&self, va: VirtAddr) -> bool {
        self.spt
            .lock()
            .get(va.floor())
            .map_or(false, |page| page.is_resident())
    }
    /// Number of pages in the address space
    pub fn page_count(&self) -> usize {
        self.spt.lock().len()
    }
    /// Number of live file mappings
    pub fn map_count(&self) -> usize {
        self.areas.lock().len()
    }
    pub fn stack_bottom(&self) -> usize {
        self.stack_bottom.load(Ordering::Relaxed)
    }
    pub fn user_sp(&self) -> usize {
        self.user_sp.load(Ordering::Relaxed)
    }
    /// Record the user stack pointer as the trap entry would save it
    pub fn set_user_sp(&self, sp: usize) {
        self.user_sp.store(sp, Ordering::Relaxed);
    }

    // 模拟 MMU 逐页访问用户内存：页表项缺失或只读时构造一次缺页异常交给 handle_fault，处理成功后重试这一页
    fn access_user(
        &self,
        va: VirtAddr,
        len: usize,
        write: bool,
        f: &mut dyn FnMut(usize, &mut [u8]),
    ) -> bool {
        let mut done = 0;
        while done < len {
            let addr = VirtAddr::from(va.0 + done);
            let vpn = addr.floor();
            let offset = addr.page_offset();
            let n = (PAGE_SIZE - offset).min(len - done);
            loop {
                let result = self.vm.access(&*self.page_table, vpn, write, &mut |data| {
                    f(done, &mut data[offset..offset + n])
                });
                match result {
                    Ok(()) => break,
                    Err(not_present) => {
                        let fault = PageFault {
                            addr,
                            user: true,
                            write,
                            not_present,
                            sp: self.user_sp(),
                        };
                        if !self.handle_fault(fault) {
                            return false;
                        }
                    }
                }
            }
            done += n;
        }
        true
    }
    /// Read user memory at `va` into `buf`, faulting pages in as needed
    pub fn read_user(&self, va: VirtAddr, buf: &mut [u8]) -> bool {
        let len = buf.len();
        self.access_user(va, len, false, &mut |done, chunk| {
            buf[done..done + chunk.len()].copy_from_slice(chunk)
        })
    }
    /// Write `data` to user memory at `va`; sets the dirty bit of every
    /// page touched
    pub fn write_user(&self, va: VirtAddr, data: &[u8]) -> bool {
        self.access_user(va, data.len(), true, &mut |done, chunk| {
            let n = chunk.len();
            chunk.copy_from_slice(&data[done..done + n])
        })
    }

    /// Duplicate the address space of `src` into a fresh one
    pub fn from_existed_user(src: &MemorySet, page_table: Arc<dyn PageTable>) -> Option<Self> {
        let memory_set = Self::new_bare(Arc::clone(&src.vm), page_table);
        if !copy_table(&memory_set, src) {
            return None;
        }
        Some(memory_set)
    }
    /// Remove all mappings and destroy every page
    ///
    /// Dirty file-backed content is written back and all frames and swap
    /// slots are given back. Calling it again does nothing.
    pub fn recycle_data_pages(&self) {
        let starts: Vec<VirtAddr> = self.areas.lock().iter().map(|area| area.start()).collect();
        for start in starts {
            self.munmap(start);
        }
        let mut spt = self.spt.lock();
        if !spt.is_empty() {
            info!("[vm] destroy {} pages", spt.len());
        }
        spt.kill(&self.vm, &self.page_table);
    }
}

impl Drop for MemorySet {
    fn drop(&mut self) {
        self.recycle_data_pages();
    }
}

enum CopyPlan {
    Uninit(VmType, Option<LoadInfo>),
    Anon,
    File(LoadInfo, bool),
}

/// Copy every page of `src` into `dst`
///
/// Deferred pages stay deferred with a duplicated loader, resident and
/// swapped-out content is copied into freshly claimed frames. File mappings
/// are duplicated with a private file handle.
pub fn copy_table(dst: &MemorySet, src: &MemorySet) -> bool {
    let pages: Vec<Arc<Page>> = src.spt.lock().iter().map(|(_, page)| Arc::clone(page)).collect();
    for page in pages.iter() {
        let vpn = page.vpn();
        let writable = page.writable();
        let plan = {
            let inner = page.inner_exclusive_access();
            match &inner.kind {
                PageKind::Uninit { ty, loader } => {
                    CopyPlan::Uninit(*ty, loader.as_ref().map(LoadInfo::duplicate))
                }
                PageKind::Anon { .. } => CopyPlan::Anon,
                PageKind::File { info } => CopyPlan::File(info.duplicate(), inner.frame.is_some()),
            }
        };
        let copied = match plan {
            CopyPlan::Uninit(ty, loader) => dst.alloc_page(ty, vpn.into(), writable, loader),
            CopyPlan::Anon => {
                let child = Page::new(vpn, writable, PageKind::Anon { slot: None });
                copy_resident(dst, src, page, child)
            }
            CopyPlan::File(info, true) => {
                let dirty = src.page_table.is_dirty(vpn);
                let child = Page::new(vpn, writable, PageKind::File { info });
                let copied = copy_resident(dst, src, page, child);
                if copied && dirty {
                    dst.page_table.set_dirty(vpn, true);
                }
                copied
            }
            CopyPlan::File(info, false) => {
                dst.alloc_page(VmType::File, vpn.into(), writable, Some(info))
            }
        };
        if !copied {
            warn!("[vm] fork failed to copy {:?}", vpn);
            return false;
        }
    }
    let areas: Vec<MapArea> = src.areas.lock().iter().map(MapArea::from_another).collect();
    dst.areas.lock().extend(areas);
    dst.stack_bottom.store(src.stack_bottom(), Ordering::Relaxed);
    dst.user_sp.store(src.user_sp(), Ordering::Relaxed);
    true
}

// 父进程的页可能在内存中也可能在交换区，先拍一份快照，再为子进程的新页 claim 一个帧并把快照拷进去
fn copy_resident(dst: &MemorySet, src: &MemorySet, parent: &Arc<Page>, child: Arc<Page>) -> bool {
    let data = src.vm.snapshot(parent);
    if !dst.spt.lock().insert(Arc::clone(&child)) {
        return false;
    }
    dst.vm.claim_with(&child, &dst.page_table, |_, buf| {
        buf.copy_from_slice(&data);
        true
    })
}
