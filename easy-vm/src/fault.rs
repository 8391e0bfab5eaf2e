//! Page fault handling and stack growth
use crate::address::VirtAddr;
use crate::config::{PAGE_SIZE, STACK_LIMIT, USER_STACK};
use crate::memory_set::MemorySet;
use crate::page::{Page, VmType};
use core::sync::atomic::Ordering;

/// What the trap handler knows about a page fault
#[derive(Clone, Copy, Debug)]
pub struct PageFault {
    /// faulting address
    pub addr: VirtAddr,
    /// raised from user mode
    pub user: bool,
    pub write: bool,
    /// the translation entry was missing, as opposed to a protection fault
    pub not_present: bool,
    /// user stack pointer at the time of the fault
    pub sp: usize,
}

impl MemorySet {
    /// Try to resolve a page fault, returns `false` if the faulting process
    /// has to be killed
    pub fn handle_fault(&self, fault: PageFault) -> bool {
        let addr = fault.addr;
        if addr.is_kernel() {
            warn!("[fault] kernel address {:?}", addr);
            return false;
        }
        let page = self.spt.lock().find(addr);
        let page = match page {
            Some(page) => page,
            None => {
                // 栈指针下方一页以内、且在栈区域上限之内的访问视为栈增长
                if addr.0 < USER_STACK && addr.0 + PAGE_SIZE >= fault.sp {
                    return self.grow_stack(addr);
                }
                warn!(
                    "[fault] unmapped address {:?}, sp = {:#x}, user = {}",
                    addr, fault.sp, fault.user
                );
                return false;
            }
        };
        if fault.write && !fault.not_present {
            warn!("[fault] write to read-only mapping at {:?}", addr);
            return false;
        }
        if fault.write && !page.writable() {
            warn!("[fault] write to read-only page at {:?}", addr);
            return false;
        }
        trace!("[fault] claim {:?}", addr);
        self.vm.claim(&page, &self.page_table)
    }

    /// Extend the stack down to the page containing `addr`
    ///
    /// Pages between the old low-water mark and the new one are created
    /// deferred; only the faulting one is claimed.
    fn grow_stack(&self, addr: VirtAddr) -> bool {
        let new_bottom = VirtAddr::from(addr.floor()).0;
        if USER_STACK - new_bottom >= STACK_LIMIT {
            warn!("[fault] stack overflow at {:?}", addr);
            return false;
        }
        let end = self.stack_bottom().max(new_bottom + PAGE_SIZE);
        let page = {
            let mut spt = self.spt.lock();
            let mut va = new_bottom;
            while va < end {
                let vpn = VirtAddr::from(va).floor();
                if !spt.contains(vpn) {
                    spt.insert(Page::new_uninit(vpn, true, VmType::Anon, None));
                }
                va += PAGE_SIZE;
            }
            match spt.find(new_bottom.into()) {
                Some(page) => page,
                None => return false,
            }
        };
        if !self.vm.claim(&page, &self.page_table) {
            return false;
        }
        debug!("[fault] stack grows to {:#x}", new_bottom);
        self.stack_bottom.fetch_min(new_bottom, Ordering::Relaxed);
        true
    }
}
