//! Implementation of the user frame pool, the frame table and eviction.
//!
//! Frames live in an arena indexed by [`FrameId`]. A page records the id of
//! its frame, a frame records a weak reference back to its page; both sides
//! are only changed while the frame table lock (the eviction lock) is held.
use crate::address::{PhysPageNum, VirtPageNum};
use crate::block_dev::BlockDevice;
use crate::config::{PAGE_SIZE, USER_POOL_BASE_PPN};
use crate::file::{File, FILESYS_LOCK};
use crate::page::{write_at, Page, PageKind};
use crate::page_table::PageTable;
use crate::swap::SwapStore;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Index of a frame in the user pool
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameId(pub usize);

impl FrameId {
    pub fn ppn(&self) -> PhysPageNum {
        PhysPageNum(USER_POOL_BASE_PPN + self.0)
    }
    fn from_ppn(ppn: PhysPageNum) -> Option<Self> {
        ppn.0.checked_sub(USER_POOL_BASE_PPN).map(FrameId)
    }
}

trait FrameAllocator {
    fn new() -> Self;
    fn alloc(&mut self) -> Option<usize>;
    fn dealloc(&mut self, id: usize);
}

// 栈式分配：[current, end) 是从未分配过的帧，recycled 保存回收后可以再次分配的帧
/// an implementation for frame allocator
pub struct StackFrameAllocator {
    current: usize,
    end: usize,
    recycled: Vec<usize>,
}

impl StackFrameAllocator {
    pub fn init(&mut self, l: usize, r: usize) {
        self.current = l;
        self.end = r;
    }
    pub fn free(&self) -> usize {
        self.end - self.current + self.recycled.len()
    }
}

impl FrameAllocator for StackFrameAllocator {
    fn new() -> Self {
        Self {
            current: 0,
            end: 0,
            recycled: Vec::new(),
        }
    }
    fn alloc(&mut self) -> Option<usize> {
        if let Some(id) = self.recycled.pop() {
            Some(id)
        } else if self.current == self.end {
            None
        } else {
            self.current += 1;
            Some(self.current - 1)
        }
    }
    fn dealloc(&mut self, id: usize) {
        // validity check
        if id >= self.current || self.recycled.iter().any(|&v| v == id) {
            panic!("Frame id={:#x} has not been allocated!", id);
        }
        // recycle
        self.recycled.push(id);
    }
}

/// Who a frame currently belongs to
struct FrameOwner {
    page: Weak<Page>,
    page_table: Arc<dyn PageTable>,
}

struct FrameSlot {
    // None while the frame is pinned for population
    data: Option<Box<[u8]>>,
    owner: Option<FrameOwner>,
}

/// The frame arena together with the registry of bound frames
pub struct FrameTable {
    slots: Vec<FrameSlot>,
    allocator: StackFrameAllocator,
    evictions: usize,
}

impl FrameTable {
    fn new(frames: usize) -> Self {
        let mut allocator = StackFrameAllocator::new();
        allocator.init(0, frames);
        let slots = (0..frames)
            .map(|_| FrameSlot {
                data: Some(vec![0u8; PAGE_SIZE].into_boxed_slice()),
                owner: None,
            })
            .collect();
        Self {
            slots,
            allocator,
            evictions: 0,
        }
    }
    /// A zeroed frame, evicting one if the pool is exhausted
    fn get_frame(&mut self, swap: &SwapStore) -> Option<FrameId> {
        let id = match self.allocator.alloc() {
            Some(id) => FrameId(id),
            None => self.evict_frame(swap)?,
        };
        if let Some(data) = self.slots[id.0].data.as_deref_mut() {
            data.fill(0);
        }
        Some(id)
    }
    // 近似 LRU：线性扫描所有已绑定且未被钉住的帧，选出所属页面最近访问时间戳最小的那个，相同时取先扫描到的
    /// Get the frame that will be evicted
    fn get_victim(&self) -> Option<FrameId> {
        let mut victim: Option<(FrameId, usize)> = None;
        for (id, slot) in self.slots.iter().enumerate() {
            if slot.data.is_none() {
                continue;
            }
            let owner = match &slot.owner {
                Some(owner) => owner,
                None => continue,
            };
            // 页面已经不在了，这个帧可以直接拿来用
            let stamp = owner.page.upgrade().map_or(0, |page| page.last_access());
            if victim.map_or(true, |(_, oldest)| stamp < oldest) {
                victim = Some((FrameId(id), stamp));
            }
        }
        victim.map(|(id, _)| id)
    }
    /// Evict one page and return the corresponding frame.
    fn evict_frame(&mut self, swap: &SwapStore) -> Option<FrameId> {
        let id = match self.get_victim() {
            Some(id) => id,
            None => {
                warn!("[vm] no frame can be evicted");
                return None;
            }
        };
        let owner = self.slots[id.0].owner.take()?;
        if let Some(page) = owner.page.upgrade() {
            let mut inner = page.inner_exclusive_access();
            let data = self.slots[id.0].data.as_deref()?;
            if !inner
                .kind
                .swap_out(data, swap, &*owner.page_table, page.vpn())
            {
                drop(inner);
                self.slots[id.0].owner = Some(owner);
                return None;
            }
            inner.frame = None;
            owner.page_table.unmap(page.vpn());
            debug!("[vm] evict {:?} from frame {}", page.vpn(), id.0);
        }
        self.evictions += 1;
        Some(id)
    }
    /// Bind a frame to a page and take its storage out for population
    fn pin(&mut self, id: FrameId, owner: FrameOwner) -> Option<Box<[u8]>> {
        let slot = &mut self.slots[id.0];
        slot.owner = Some(owner);
        slot.data.take()
    }
    fn unpin(&mut self, id: FrameId, data: Box<[u8]>) {
        self.slots[id.0].data = Some(data);
    }
    /// Unbind a frame and give it back to the pool
    fn release(&mut self, id: FrameId) {
        self.slots[id.0].owner = None;
        self.allocator.dealloc(id.0);
    }
    fn is_pinned(&self, id: FrameId) -> bool {
        self.slots.get(id.0).map_or(false, |slot| slot.data.is_none())
    }
    fn data(&self, id: FrameId) -> Option<&[u8]> {
        self.slots.get(id.0)?.data.as_deref()
    }
    fn data_mut(&mut self, id: FrameId) -> Option<&mut [u8]> {
        self.slots.get_mut(id.0)?.data.as_deref_mut()
    }
}

/// State shared by every address space: the user pool and the swap area
pub struct Vm {
    // 换出/换入物理帧的整个过程都在这把锁（驱逐锁）下完成，保证两个线程不会同时选中并释放同一个帧
    frames: Mutex<FrameTable>,
    swap: SwapStore,
}

impl Vm {
    /// A pool of `frames` frames, swapping to the first `swap_blocks`
    /// sectors of `swap_device`
    pub fn new(frames: usize, swap_device: Arc<dyn BlockDevice>, swap_blocks: usize) -> Arc<Self> {
        info!("[vm] {} user frames", frames);
        Arc::new(Self {
            frames: Mutex::new(FrameTable::new(frames)),
            swap: SwapStore::new(swap_device, swap_blocks),
        })
    }
    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }
    pub fn free_frames(&self) -> usize {
        self.frames.lock().allocator.free()
    }
    pub fn evictions(&self) -> usize {
        self.frames.lock().evictions
    }

    /// Claim the page: bind a frame, populate it and install the mapping
    pub(crate) fn claim(&self, page: &Arc<Page>, page_table: &Arc<dyn PageTable>) -> bool {
        self.claim_with(page, page_table, |kind, buf| kind.swap_in(buf, &self.swap))
    }

    /// Claim the page, populating its frame with `fill` instead of swap in
    ///
    /// The mapping is installed before the frame is populated. Until then the
    /// frame is pinned, so it is neither evicted nor read through the mapping.
    pub(crate) fn claim_with(
        &self,
        page: &Arc<Page>,
        page_table: &Arc<dyn PageTable>,
        fill: impl FnOnce(&mut PageKind, &mut [u8]) -> bool,
    ) -> bool {
        let vpn = page.vpn();
        page.touch();
        let (id, mut data) = {
            let mut table = self.frames.lock();
            if page_table.is_present(vpn) || page.inner_exclusive_access().frame.is_some() {
                warn!("[vm] {:?} is mapped already", vpn);
                return false;
            }
            let id = match table.get_frame(&self.swap) {
                Some(id) => id,
                None => {
                    warn!("[vm] out of frames while claiming {:?}", vpn);
                    return false;
                }
            };
            // 映射失败时页面还没有被动过，交换槽和 loader 都原样保留
            if !page_table.map(vpn, id.ppn(), page.writable()) {
                warn!("[vm] cannot map {:?}", vpn);
                table.release(id);
                return false;
            }
            let owner = FrameOwner {
                page: Arc::downgrade(page),
                page_table: Arc::clone(page_table),
            };
            let data = match table.pin(id, owner) {
                Some(data) => data,
                None => {
                    page_table.unmap(vpn);
                    table.release(id);
                    return false;
                }
            };
            page.inner_exclusive_access().frame = Some(id);
            (id, data)
        };
        // 帧已被钉住，不会被其他线程选为牺牲者，因此可以放开驱逐锁再做可能阻塞的 I/O
        let filled = fill(&mut page.inner_exclusive_access().kind, &mut data);
        let mut table = self.frames.lock();
        table.unpin(id, data);
        let mut inner = page.inner_exclusive_access();
        if inner.frame != Some(id) {
            // 填充期间页面被销毁了，映射已由 destroy_page 清除，帧由这里归还
            drop(inner);
            warn!("[vm] {:?} destroyed while being claimed", vpn);
            table.release(id);
            return false;
        }
        if filled {
            trace!("[vm] claim {:?} -> frame {}", vpn, id.0);
            return true;
        }
        warn!("[vm] failed to populate {:?}", vpn);
        inner.frame = None;
        drop(inner);
        page_table.unmap(vpn);
        table.release(id);
        false
    }

    /// Free everything a page holds; dirty file-backed content is written
    /// back first
    pub(crate) fn destroy_page(&self, page: &Arc<Page>, page_table: &Arc<dyn PageTable>) {
        let vpn = page.vpn();
        let mut table = self.frames.lock();
        let mut inner = page.inner_exclusive_access();
        if let Some(id) = inner.frame.take() {
            if let PageKind::File { info } = &inner.kind {
                if page_table.is_dirty(vpn) {
                    if let Some(data) = table.data(id) {
                        if !info.write_back(data) {
                            warn!("[vm] lost dirty content of {:?} at {:#x}", vpn, info.offset);
                        }
                    }
                }
            }
            page_table.unmap(vpn);
            // 被钉住的帧还在被 claim 填充，由 claim 在发现页面已销毁后归还
            if !table.is_pinned(id) {
                table.release(id);
            }
        }
        inner.kind.destroy(&self.swap);
    }

    /// Write the first `len` bytes of a resident page to `file` at `pos`
    pub(crate) fn flush_page(
        &self,
        page: &Arc<Page>,
        page_table: &Arc<dyn PageTable>,
        file: &dyn File,
        pos: usize,
        len: usize,
    ) -> bool {
        let table = self.frames.lock();
        let inner = page.inner_exclusive_access();
        let data = match inner.frame.and_then(|id| table.data(id)) {
            Some(data) => data,
            None => return true,
        };
        let written = {
            let _fs = FILESYS_LOCK.lock();
            write_at(file, pos, &data[..len])
        };
        if written {
            page_table.set_dirty(page.vpn(), false);
        }
        written
    }

    /// A copy of the current content of a page, wherever it lives
    pub(crate) fn snapshot(&self, page: &Arc<Page>) -> Box<[u8]> {
        let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let table = self.frames.lock();
        let inner = page.inner_exclusive_access();
        if let Some(data) = inner.frame.and_then(|id| table.data(id)) {
            buf.copy_from_slice(data);
            return buf;
        }
        match &inner.kind {
            PageKind::Anon { slot: Some(slot) } => self.swap.read_slot(*slot, &mut buf),
            PageKind::File { info } => {
                info.load(&mut buf);
            }
            PageKind::Uninit {
                loader: Some(loader),
                ..
            } => {
                loader.load(&mut buf);
            }
            _ => {}
        }
        buf
    }

    /// Touch a mapped user page the way the MMU would
    ///
    /// Fails with `true` if `vpn` is not present, with `false` on a write to
    /// a read-only mapping.
    pub(crate) fn access(
        &self,
        page_table: &dyn PageTable,
        vpn: VirtPageNum,
        write: bool,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), bool> {
        loop {
            let mut table = self.frames.lock();
            let pte = page_table.translate(vpn).ok_or(true)?;
            if write && !pte.writable() {
                return Err(false);
            }
            let id = FrameId::from_ppn(pte.ppn()).ok_or(true)?;
            // 映射已建立但帧还在被填充，等 claim 放开再访问
            if table.is_pinned(id) {
                drop(table);
                core::hint::spin_loop();
                continue;
            }
            let data = table.data_mut(id).ok_or(true)?;
            page_table.touch(vpn, write);
            f(data);
            return Ok(());
        }
    }
}
