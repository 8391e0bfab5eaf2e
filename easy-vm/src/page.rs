//! Implementation of [`Page`] and its three variants
//!
//! A page starts out deferred ([`PageKind::Uninit`]): it only knows which
//! variant it will become and, optionally, where its first content comes from.
//! The first claim turns it into an anonymous or a file-backed page, after
//! which swap in/out dispatch on the variant.
use crate::address::{VirtAddr, VirtPageNum};
use crate::config::PAGE_SIZE;
use crate::file::{File, FILESYS_LOCK};
use crate::frame::FrameId;
use crate::page_table::PageTable;
use crate::swap::SwapStore;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

/// The variant a page is (or will become once claimed)
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmType {
    Anon,
    File,
}

/// Where the content of a page comes from
///
/// `read_bytes` bytes are read from `file` at `offset`, the following
/// `zero_bytes` bytes are zero-filled. The two always add up to one page.
#[derive(Clone)]
pub struct LoadInfo {
    pub file: Arc<dyn File>,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl LoadInfo {
    pub fn new(file: Arc<dyn File>, offset: usize, read_bytes: usize, zero_bytes: usize) -> Self {
        assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes,
        }
    }
    /// Same region through a freshly duplicated file handle
    pub fn duplicate(&self) -> Self {
        Self {
            file: self.file.duplicate(),
            ..*self
        }
    }
    // 读到 0 字节说明文件比预期的短，剩下的部分和 zero_bytes 一起清零即可，不算错误
    /// Fill one page from the file
    pub fn load(&self, buf: &mut [u8]) -> bool {
        let _fs = FILESYS_LOCK.lock();
        self.file.seek(self.offset);
        let mut read = 0;
        while read < self.read_bytes {
            let len = self.file.read(&mut buf[read..self.read_bytes]);
            if len == 0 {
                break;
            }
            read += len;
        }
        buf[read..].fill(0);
        true
    }
    /// Write the file-backed part of a page back, never the zero-filled tail
    pub fn write_back(&self, data: &[u8]) -> bool {
        let _fs = FILESYS_LOCK.lock();
        write_at(&*self.file, self.offset, &data[..self.read_bytes])
    }
}

/// Write all of `data` at `pos`; caller holds [`FILESYS_LOCK`]
pub(crate) fn write_at(file: &dyn File, pos: usize, data: &[u8]) -> bool {
    file.seek(pos);
    let mut written = 0;
    while written < data.len() {
        let len = file.write(&data[written..]);
        if len == 0 {
            warn!("[vm] short write at {:#x}: {} of {} bytes", pos, written, data.len());
            return false;
        }
        written += len;
    }
    true
}

pub(crate) enum PageKind {
    /// Not backed yet
    Uninit {
        ty: VmType,
        loader: Option<LoadInfo>,
    },
    /// Zero-fill or swap backed, `slot` is set while the content sits in swap
    Anon { slot: Option<usize> },
    /// Backed by a region of a file, re-read on every swap in
    File { info: LoadInfo },
}

impl PageKind {
    /// Populate a freshly zeroed frame
    pub fn swap_in(&mut self, buf: &mut [u8], swap: &SwapStore) -> bool {
        if let PageKind::Uninit { .. } = self {
            return self.initialize(buf);
        }
        match self {
            PageKind::Uninit { .. } => unreachable!(),
            PageKind::Anon { slot } => {
                if let Some(slot) = slot.take() {
                    swap.swap_in(slot, buf);
                }
                true
            }
            PageKind::File { info } => info.load(buf),
        }
    }
    // 第一次 claim 时从 Uninit 转成具体的类型：匿名页的 loader 只用这一次，文件页则保留下来供以后每次换入
    fn initialize(&mut self, buf: &mut [u8]) -> bool {
        let (ty, loader) = match core::mem::replace(self, PageKind::Anon { slot: None }) {
            PageKind::Uninit { ty, loader } => (ty, loader),
            other => {
                *self = other;
                return false;
            }
        };
        match (ty, loader) {
            (VmType::Anon, None) => true,
            (VmType::Anon, Some(loader)) => {
                if loader.load(buf) {
                    return true;
                }
                *self = PageKind::Uninit { ty, loader: Some(loader) };
                false
            }
            (VmType::File, Some(info)) => {
                if info.load(buf) {
                    *self = PageKind::File { info };
                    return true;
                }
                *self = PageKind::Uninit { ty, loader: Some(info) };
                false
            }
            (VmType::File, None) => {
                warn!("[vm] file-backed page without a loader");
                // 保持未初始化状态，之后的 claim 会得到同样的结果
                *self = PageKind::Uninit { ty, loader: None };
                false
            }
        }
    }
    /// Persist the content of a frame that is about to be taken away
    pub fn swap_out(
        &mut self,
        data: &[u8],
        swap: &SwapStore,
        page_table: &dyn PageTable,
        vpn: VirtPageNum,
    ) -> bool {
        match self {
            PageKind::Uninit { .. } => {
                warn!("[vm] {:?} is not initialized", vpn);
                false
            }
            PageKind::Anon { slot } => match swap.swap_out(data) {
                Some(s) => {
                    *slot = Some(s);
                    true
                }
                None => {
                    warn!("[vm] swap is full, cannot evict {:?}", vpn);
                    false
                }
            },
            PageKind::File { info } => {
                if page_table.is_dirty(vpn) {
                    if !info.write_back(data) {
                        return false;
                    }
                    page_table.set_dirty(vpn, false);
                }
                true
            }
        }
    }
    /// Release what the variant holds outside of its frame
    pub fn destroy(&mut self, swap: &SwapStore) {
        if let PageKind::Anon { slot } = self {
            if let Some(slot) = slot.take() {
                swap.release(slot);
            }
        }
    }
}

pub(crate) struct PageInner {
    pub kind: PageKind,
    pub frame: Option<FrameId>,
}

static ACCESS_CLOCK: AtomicUsize = AtomicUsize::new(0);

fn next_tick() -> usize {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed) + 1
}

/// One virtual page of a process
pub struct Page {
    vpn: VirtPageNum,
    writable: bool,
    last_access: AtomicUsize,
    inner: Mutex<PageInner>,
}

impl Page {
    /// A deferred page which becomes `ty` on its first claim
    pub fn new_uninit(
        vpn: VirtPageNum,
        writable: bool,
        ty: VmType,
        loader: Option<LoadInfo>,
    ) -> Arc<Self> {
        Self::new(vpn, writable, PageKind::Uninit { ty, loader })
    }
    pub(crate) fn new(vpn: VirtPageNum, writable: bool, kind: PageKind) -> Arc<Self> {
        Arc::new(Self {
            vpn,
            writable,
            last_access: AtomicUsize::new(next_tick()),
            inner: Mutex::new(PageInner { kind, frame: None }),
        })
    }
    pub fn vpn(&self) -> VirtPageNum {
        self.vpn
    }
    pub fn va(&self) -> VirtAddr {
        self.vpn.into()
    }
    pub fn writable(&self) -> bool {
        self.writable
    }
    /// Stamp the page as just used
    pub fn touch(&self) {
        self.last_access.store(next_tick(), Ordering::Relaxed);
    }
    pub fn last_access(&self) -> usize {
        self.last_access.load(Ordering::Relaxed)
    }
    /// The variant of the page, or the one it will become
    pub fn vm_type(&self) -> VmType {
        match &self.inner.lock().kind {
            PageKind::Uninit { ty, .. } => *ty,
            PageKind::Anon { .. } => VmType::Anon,
            PageKind::File { .. } => VmType::File,
        }
    }
    pub fn is_uninit(&self) -> bool {
        matches!(self.inner.lock().kind, PageKind::Uninit { .. })
    }
    pub fn is_resident(&self) -> bool {
        self.inner.lock().frame.is_some()
    }
    /// The swap slot holding the content of an evicted anonymous page
    pub fn swap_slot(&self) -> Option<usize> {
        match self.inner.lock().kind {
            PageKind::Anon { slot } => slot,
            _ => None,
        }
    }
    pub(crate) fn inner_exclusive_access(&self) -> MutexGuard<'_, PageInner> {
        self.inner.lock()
    }
}
