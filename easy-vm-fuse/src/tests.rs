use crate::logging;
use crate::ram::{RamDisk, RamFile};
use crate::workload::{self, Workload, HEAP_BASE, MMAP_BASE};
use easy_vm::config::{KERN_BASE, PAGE_SIZE, STACK_LIMIT, USER_STACK};
use easy_vm::{
    File, LoadInfo, MemorySet, PageFault, PageTable, PageTableEntry, PhysPageNum, SoftPageTable,
    VirtAddr, VirtPageNum, Vm, VmType, SECTORS_PER_PAGE,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const FD: usize = 3;

fn new_vm(frames: usize, swap_pages: usize) -> Arc<Vm> {
    logging::init();
    let blocks = swap_pages * SECTORS_PER_PAGE;
    Vm::new(frames, RamDisk::new(blocks), blocks)
}

fn new_process(vm: &Arc<Vm>) -> MemorySet {
    let page_table: Arc<dyn PageTable> = Arc::new(SoftPageTable::new());
    MemorySet::new_bare(Arc::clone(vm), page_table)
}

fn va(addr: usize) -> VirtAddr {
    VirtAddr::from(addr)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn alloc_heap(ms: &MemorySet, pages: usize) {
    for i in 0..pages {
        assert!(ms.alloc_page(VmType::Anon, va(HEAP_BASE + i * PAGE_SIZE), true, None));
    }
}

fn read_vec(ms: &MemorySet, addr: usize, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    assert!(ms.read_user(va(addr), &mut buf));
    buf
}

#[test]
fn anon_pages_survive_swap() {
    let vm = new_vm(2, 16);
    let ms = new_process(&vm);
    alloc_heap(&ms, 5);
    for i in 0..5 {
        assert!(ms.write_user(va(HEAP_BASE + i * PAGE_SIZE), &pattern(PAGE_SIZE, i as u8)));
    }
    assert!(vm.evictions() >= 3);
    assert_eq!(vm.swap().in_use(), 3);
    for i in 0..5 {
        assert_eq!(read_vec(&ms, HEAP_BASE + i * PAGE_SIZE, PAGE_SIZE), pattern(PAGE_SIZE, i as u8));
    }
}

#[test]
fn untouched_anon_page_reads_zero() {
    let vm = new_vm(4, 4);
    let ms = new_process(&vm);
    alloc_heap(&ms, 1);
    assert!(ms.find_page(va(HEAP_BASE)).unwrap().is_uninit());
    assert_eq!(read_vec(&ms, HEAP_BASE, PAGE_SIZE), vec![0u8; PAGE_SIZE]);
    let page = ms.find_page(va(HEAP_BASE)).unwrap();
    assert!(!page.is_uninit());
    assert_eq!(page.vm_type(), VmType::Anon);
}

#[test]
fn eviction_picks_least_recently_used() {
    let vm = new_vm(3, 8);
    let ms = new_process(&vm);
    alloc_heap(&ms, 4);
    let addr = |i: usize| va(HEAP_BASE + i * PAGE_SIZE);
    for i in 0..3 {
        assert!(ms.claim_page(addr(i)));
    }
    assert_eq!(vm.free_frames(), 0);
    // page 0 becomes the most recently used one, page 1 the oldest
    ms.find_page(addr(0)).unwrap();
    assert!(ms.claim_page(addr(3)));
    assert_eq!(vm.evictions(), 1);
    assert!(ms.is_resident(addr(0)));
    assert!(!ms.is_resident(addr(1)));
    assert!(ms.is_resident(addr(2)));
    assert!(ms.is_resident(addr(3)));
    assert!(!ms.page_table().is_present(addr(1).floor()));
}

#[test]
fn swap_slots_are_never_shared() {
    let vm = new_vm(1, 8);
    let ms = new_process(&vm);
    alloc_heap(&ms, 6);
    for i in 0..6 {
        assert!(ms.write_user(va(HEAP_BASE + i * PAGE_SIZE), &[i as u8 + 1]));
    }
    let slots: Vec<usize> = (0..6)
        .filter_map(|i| ms.find_page(va(HEAP_BASE + i * PAGE_SIZE)).unwrap().swap_slot())
        .collect();
    assert_eq!(slots.len(), 5);
    assert_eq!(slots.iter().collect::<HashSet<_>>().len(), slots.len());
    assert_eq!(vm.swap().in_use(), slots.len());
    // 换入会释放槽位
    assert_eq!(read_vec(&ms, HEAP_BASE, 1), vec![1]);
    assert_eq!(vm.swap().in_use(), 5);
    assert!(ms.find_page(va(HEAP_BASE)).unwrap().swap_slot().is_none());
}

#[test]
fn eviction_fails_when_swap_is_full() {
    let vm = new_vm(1, 1);
    let ms = new_process(&vm);
    alloc_heap(&ms, 3);
    assert!(ms.write_user(va(HEAP_BASE), &[1]));
    assert!(ms.write_user(va(HEAP_BASE + PAGE_SIZE), &[2]));
    assert!(!ms.write_user(va(HEAP_BASE + 2 * PAGE_SIZE), &[3]));
    // the resident page is untouched by the failed eviction
    assert_eq!(read_vec(&ms, HEAP_BASE + PAGE_SIZE, 1), vec![2]);
}

#[test]
fn munmap_writes_back_only_file_bytes() {
    let vm = new_vm(8, 8);
    let ms = new_process(&vm);
    let len = PAGE_SIZE + 100;
    let original = pattern(len, 7);
    let file = RamFile::new(original.clone());
    let handle: Arc<dyn File> = file.clone();
    assert_eq!(ms.mmap(va(MMAP_BASE), len, true, FD, &handle, 0), Some(va(MMAP_BASE)));
    assert_eq!(ms.page_count(), 2);
    let k = PAGE_SIZE + 50;
    assert!(ms.write_user(va(MMAP_BASE + k), &[0xab]));
    // the zero-filled tail of the last page is writable but never reaches the file
    assert_eq!(read_vec(&ms, MMAP_BASE + len, 16), vec![0u8; 16]);
    assert!(ms.write_user(va(MMAP_BASE + len + 10), &[0xcd]));
    ms.munmap(va(MMAP_BASE));
    assert_eq!(ms.page_count(), 0);
    assert_eq!(ms.map_count(), 0);
    let content = file.content();
    assert_eq!(content.len(), len);
    for (i, byte) in content.iter().enumerate() {
        if i == k {
            assert_eq!(*byte, 0xab);
        } else {
            assert_eq!(*byte, original[i]);
        }
    }
}

#[test]
fn clean_mapping_is_not_written() {
    let vm = new_vm(8, 8);
    let ms = new_process(&vm);
    let original = pattern(2 * PAGE_SIZE, 3);
    let file = RamFile::new(original.clone());
    let handle: Arc<dyn File> = file.clone();
    assert!(ms.mmap(va(MMAP_BASE), 2 * PAGE_SIZE, true, FD, &handle, 0).is_some());
    assert_eq!(read_vec(&ms, MMAP_BASE, 2 * PAGE_SIZE), original);
    ms.munmap(va(MMAP_BASE));
    assert_eq!(file.content(), original);
}

#[test]
fn dirty_file_page_written_back_on_eviction() {
    let vm = new_vm(1, 4);
    let ms = new_process(&vm);
    let original = pattern(2 * PAGE_SIZE, 9);
    let file = RamFile::new(original.clone());
    let handle: Arc<dyn File> = file.clone();
    assert!(ms.mmap(va(MMAP_BASE), 2 * PAGE_SIZE, true, FD, &handle, 0).is_some());
    assert!(ms.write_user(va(MMAP_BASE + 10), b"dirty"));
    // touching the second page evicts the first one
    assert_eq!(read_vec(&ms, MMAP_BASE + PAGE_SIZE, 4), original[PAGE_SIZE..PAGE_SIZE + 4]);
    assert!(!ms.is_resident(va(MMAP_BASE)));
    assert_eq!(vm.swap().in_use(), 0);
    assert_eq!(&file.content()[10..15], b"dirty");
    // and comes back from the file
    assert_eq!(read_vec(&ms, MMAP_BASE + 10, 5), b"dirty".to_vec());
}

#[test]
fn mmap_with_offset_maps_the_right_bytes() {
    let vm = new_vm(4, 4);
    let ms = new_process(&vm);
    let original = pattern(3 * PAGE_SIZE, 1);
    let handle: Arc<dyn File> = RamFile::new(original.clone());
    assert!(ms
        .mmap(va(MMAP_BASE), 2 * PAGE_SIZE, false, FD, &handle, PAGE_SIZE)
        .is_some());
    assert_eq!(ms.page_count(), 2);
    assert_eq!(read_vec(&ms, MMAP_BASE, 2 * PAGE_SIZE), original[PAGE_SIZE..]);
    // the mapping owns its handle
    assert_eq!(handle.tell(), 0);
    assert!(!ms.write_user(va(MMAP_BASE), &[0]));
}

#[test]
fn invalid_mmap_creates_nothing() {
    let vm = new_vm(4, 4);
    let ms = new_process(&vm);
    alloc_heap(&ms, 1);
    let handle: Arc<dyn File> = RamFile::new(pattern(PAGE_SIZE, 0));
    let empty: Arc<dyn File> = RamFile::new(Vec::new());
    let base = va(MMAP_BASE);
    assert!(ms.mmap(base, 0, true, FD, &handle, 0).is_none());
    assert!(ms.mmap(va(MMAP_BASE + 1), PAGE_SIZE, true, FD, &handle, 0).is_none());
    assert!(ms.mmap(base, PAGE_SIZE, true, FD, &handle, 1).is_none());
    assert!(ms.mmap(va(0), PAGE_SIZE, true, FD, &handle, 0).is_none());
    assert!(ms.mmap(base, PAGE_SIZE, true, 0, &handle, 0).is_none());
    assert!(ms.mmap(base, PAGE_SIZE, true, 1, &handle, 0).is_none());
    assert!(ms
        .mmap(va(KERN_BASE - PAGE_SIZE), 2 * PAGE_SIZE, true, FD, &handle, 0)
        .is_none());
    assert!(ms.mmap(base, usize::MAX, true, FD, &handle, 0).is_none());
    assert!(ms.mmap(base, PAGE_SIZE, true, FD, &empty, 0).is_none());
    // overlaps the heap page
    assert!(ms
        .mmap(va(HEAP_BASE - PAGE_SIZE), 2 * PAGE_SIZE, true, FD, &handle, 0)
        .is_none());
    assert_eq!(ms.page_count(), 1);
    assert_eq!(ms.map_count(), 0);
}

#[test]
fn munmap_of_unknown_address_is_a_no_op() {
    let vm = new_vm(4, 4);
    let ms = new_process(&vm);
    let handle: Arc<dyn File> = RamFile::new(pattern(2 * PAGE_SIZE, 0));
    assert!(ms.mmap(va(MMAP_BASE), 2 * PAGE_SIZE, true, FD, &handle, 0).is_some());
    ms.munmap(va(MMAP_BASE + PAGE_SIZE));
    assert_eq!(ms.map_count(), 1);
    assert_eq!(ms.page_count(), 2);
}

#[test]
fn exit_flushes_mappings_and_frees_everything() {
    let vm = new_vm(2, 8);
    let free = vm.free_frames();
    let original = pattern(PAGE_SIZE, 5);
    let file = RamFile::new(original.clone());
    {
        let ms = new_process(&vm);
        let handle: Arc<dyn File> = file.clone();
        assert!(ms.setup_stack());
        alloc_heap(&ms, 3);
        assert!(ms.mmap(va(MMAP_BASE), PAGE_SIZE, true, FD, &handle, 0).is_some());
        assert!(ms.write_user(va(MMAP_BASE), b"bye"));
        for i in 0..3 {
            assert!(ms.write_user(va(HEAP_BASE + i * PAGE_SIZE), &[1]));
        }
        assert!(vm.swap().in_use() > 0);
    }
    assert_eq!(vm.free_frames(), free);
    assert_eq!(vm.swap().in_use(), 0);
    let content = file.content();
    assert_eq!(&content[..3], b"bye");
    assert_eq!(content[3..], original[3..]);
}

#[test]
fn recycle_twice_is_harmless() {
    let vm = new_vm(2, 4);
    let ms = new_process(&vm);
    assert!(ms.setup_stack());
    ms.recycle_data_pages();
    ms.recycle_data_pages();
    assert_eq!(ms.page_count(), 0);
    assert_eq!(vm.free_frames(), 2);
}

#[test]
fn load_segment_reads_lazily_and_zero_fills() {
    let vm = new_vm(4, 4);
    let ms = new_process(&vm);
    let image = pattern(2 * PAGE_SIZE, 11);
    let file = RamFile::new(image.clone());
    let handle: Arc<dyn File> = file.clone();
    let text = 0x40_0000;
    let read_bytes = PAGE_SIZE + 0x800;
    assert!(!ms.load_segment(&handle, 0, va(text + 8), read_bytes, 0x800, false));
    assert!(!ms.load_segment(&handle, 0, va(text), read_bytes, 0x100, false));
    assert!(ms.load_segment(&handle, 0, va(text), read_bytes, 0x800, false));
    assert_eq!(ms.page_count(), 2);
    assert!(!ms.is_resident(va(text)));
    let content = read_vec(&ms, text, 2 * PAGE_SIZE);
    assert_eq!(content[..read_bytes], image[..read_bytes]);
    assert!(content[read_bytes..].iter().all(|b| *b == 0));
    // read-only text rejects writes
    assert!(!ms.write_user(va(text), &[0]));
    assert!(!ms.write_user(va(text + PAGE_SIZE + 1), &[0]));
    assert_eq!(file.content(), image);
}

#[test]
fn writable_segment_never_goes_back_to_the_file() {
    let vm = new_vm(1, 4);
    let ms = new_process(&vm);
    let image = pattern(PAGE_SIZE, 2);
    let file = RamFile::new(image.clone());
    let handle: Arc<dyn File> = file.clone();
    let data = 0x60_0000;
    assert!(ms.load_segment(&handle, 0, va(data), PAGE_SIZE, 0, true));
    alloc_heap(&ms, 1);
    assert!(ms.write_user(va(data), b"data"));
    assert!(ms.write_user(va(HEAP_BASE), &[1]));
    assert_eq!(ms.find_page(va(data)).unwrap().vm_type(), VmType::Anon);
    assert_eq!(vm.swap().in_use(), 1);
    assert_eq!(read_vec(&ms, data, 4), b"data".to_vec());
    drop(ms);
    assert_eq!(file.content(), image);
}

#[test]
fn bad_faults_are_rejected() {
    let vm = new_vm(4, 4);
    let ms = new_process(&vm);
    assert!(ms.setup_stack());
    let fault = |addr: usize, write: bool| PageFault {
        addr: va(addr),
        user: true,
        write,
        not_present: true,
        sp: USER_STACK - 16,
    };
    assert!(!ms.handle_fault(fault(KERN_BASE, false)));
    assert!(!ms.handle_fault(fault(HEAP_BASE, false)));
    // far below the stack pointer is not stack growth
    assert!(!ms.handle_fault(fault(USER_STACK - 4 * PAGE_SIZE, true)));
    assert_eq!(ms.stack_bottom(), USER_STACK - PAGE_SIZE);
    assert!(!ms.handle_fault(PageFault {
        not_present: false,
        ..fault(USER_STACK - 8, true)
    }));
}

#[test]
fn stack_grows_down_to_the_limit() {
    let vm = new_vm(4, 512);
    let ms = new_process(&vm);
    assert!(ms.setup_stack());
    let mut sp = USER_STACK;
    while USER_STACK - (sp - PAGE_SIZE) < STACK_LIMIT {
        sp -= PAGE_SIZE;
        ms.set_user_sp(sp);
        assert!(ms.write_user(va(sp), &[0x5a]));
        assert_eq!(ms.stack_bottom(), sp);
    }
    assert_eq!(ms.stack_bottom(), USER_STACK - STACK_LIMIT + PAGE_SIZE);
    let bottom = ms.stack_bottom();
    for _ in 0..3 {
        sp -= PAGE_SIZE;
        ms.set_user_sp(sp);
        assert!(!ms.write_user(va(sp), &[0x5a]));
        assert_eq!(ms.stack_bottom(), bottom);
    }
}

#[test]
fn stack_growth_fills_the_gap_lazily() {
    let vm = new_vm(4, 4);
    let ms = new_process(&vm);
    assert!(ms.setup_stack());
    let sp = USER_STACK - 5 * PAGE_SIZE;
    ms.set_user_sp(sp);
    assert!(ms.write_user(va(sp), &[1]));
    assert_eq!(ms.stack_bottom(), sp);
    assert_eq!(ms.page_count(), 5);
    assert!(!ms.is_resident(va(sp + PAGE_SIZE)));
    assert!(ms.is_resident(va(sp)));
    assert_eq!(read_vec(&ms, sp + PAGE_SIZE, 8), vec![0u8; 8]);
}

#[test]
fn fork_copies_are_isolated() {
    let vm = new_vm(2, 16);
    let parent = new_process(&vm);
    alloc_heap(&parent, 3);
    for i in 0..3 {
        assert!(parent.write_user(va(HEAP_BASE + i * PAGE_SIZE), &[b'p'; 8]));
    }
    // one parent page sits in swap while it gets copied
    assert!(vm.swap().in_use() > 0);
    let child = MemorySet::from_existed_user(&parent, Arc::new(SoftPageTable::new())).unwrap();
    assert_eq!(child.page_count(), 3);
    for i in 0..3 {
        assert_eq!(read_vec(&child, HEAP_BASE + i * PAGE_SIZE, 8), vec![b'p'; 8]);
    }
    assert!(child.write_user(va(HEAP_BASE), &[b'c'; 8]));
    assert_eq!(read_vec(&parent, HEAP_BASE, 8), vec![b'p'; 8]);
    assert!(parent.write_user(va(HEAP_BASE + PAGE_SIZE), &[b'q'; 8]));
    assert_eq!(read_vec(&child, HEAP_BASE + PAGE_SIZE, 8), vec![b'p'; 8]);
    assert_eq!(read_vec(&child, HEAP_BASE, 8), vec![b'c'; 8]);
    drop(child);
    assert_eq!(read_vec(&parent, HEAP_BASE + PAGE_SIZE, 8), vec![b'q'; 8]);
}

#[test]
fn fork_duplicates_mappings_and_deferred_pages() {
    let vm = new_vm(8, 16);
    let parent = new_process(&vm);
    assert!(parent.setup_stack());
    let original = pattern(2 * PAGE_SIZE, 4);
    let file = RamFile::new(original.clone());
    let handle: Arc<dyn File> = file.clone();
    assert!(parent.mmap(va(MMAP_BASE), 2 * PAGE_SIZE, true, FD, &handle, 0).is_some());
    assert!(parent.write_user(va(MMAP_BASE), b"parent"));
    parent.set_user_sp(USER_STACK - 64);
    let child = MemorySet::from_existed_user(&parent, Arc::new(SoftPageTable::new())).unwrap();
    assert_eq!(child.map_count(), 1);
    assert_eq!(child.user_sp(), USER_STACK - 64);
    assert_eq!(child.stack_bottom(), parent.stack_bottom());
    // the resident page keeps the parent's bytes, the deferred one loads from the file
    assert!(child.find_page(va(MMAP_BASE + PAGE_SIZE)).unwrap().is_uninit());
    assert_eq!(read_vec(&child, MMAP_BASE, 6), b"parent".to_vec());
    assert_eq!(
        read_vec(&child, MMAP_BASE + PAGE_SIZE, PAGE_SIZE),
        original[PAGE_SIZE..]
    );
    drop(parent);
    assert_eq!(&file.content()[..6], b"parent");
    assert!(child.write_user(va(MMAP_BASE + PAGE_SIZE), b"child"));
    drop(child);
    assert_eq!(&file.content()[PAGE_SIZE..PAGE_SIZE + 5], b"child");
    assert_eq!(vm.free_frames(), 8);
}

#[test]
fn alloc_page_rejects_duplicates_and_file_without_loader() {
    let vm = new_vm(2, 2);
    let ms = new_process(&vm);
    assert!(ms.alloc_page(VmType::Anon, va(HEAP_BASE), true, None));
    assert!(!ms.alloc_page(VmType::Anon, va(HEAP_BASE + 8), true, None));
    assert!(!ms.alloc_page(VmType::File, va(HEAP_BASE + PAGE_SIZE), true, None));
    assert!(ms.claim_page(va(HEAP_BASE)));
    assert!(!ms.claim_page(va(HEAP_BASE)));
    assert!(!ms.claim_page(va(HEAP_BASE + PAGE_SIZE)));
    assert!(ms.remove_page(va(HEAP_BASE)));
    assert!(!ms.remove_page(va(HEAP_BASE)));
    assert_eq!(vm.free_frames(), 2);
}

#[test]
fn concurrent_processes_keep_their_memory() {
    let vm = new_vm(12, 512);
    let source: Arc<dyn File> = RamFile::new(pattern(3 * PAGE_SIZE + 123, 8));
    let report = workload::run(
        &vm,
        Some(source),
        &Workload {
            processes: 2,
            rounds: 100,
            seed: 2024,
        },
    )
    .unwrap();
    assert!(report.reads > 0 && report.writes > 0);
    assert!(vm.evictions() > 0);
}

/// A page table whose next `map` can be made to fail
struct FlakyPageTable {
    table: SoftPageTable,
    fail_next: AtomicBool,
}

impl PageTable for FlakyPageTable {
    fn map(&self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> bool {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.table.map(vpn, ppn, writable)
    }
    fn unmap(&self, vpn: VirtPageNum) {
        self.table.unmap(vpn)
    }
    fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.table.translate(vpn)
    }
    fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.table.is_dirty(vpn)
    }
    fn set_dirty(&self, vpn: VirtPageNum, dirty: bool) {
        self.table.set_dirty(vpn, dirty)
    }
    fn touch(&self, vpn: VirtPageNum, write: bool) {
        self.table.touch(vpn, write)
    }
}

#[test]
fn failed_mapping_keeps_the_swapped_copy() {
    let vm = new_vm(1, 4);
    let table = Arc::new(FlakyPageTable {
        table: SoftPageTable::new(),
        fail_next: AtomicBool::new(false),
    });
    let page_table: Arc<dyn PageTable> = table.clone();
    let ms = MemorySet::new_bare(Arc::clone(&vm), page_table);
    alloc_heap(&ms, 2);
    assert!(ms.write_user(va(HEAP_BASE), &[0x42; 8]));
    assert!(ms.write_user(va(HEAP_BASE + PAGE_SIZE), &[0x17; 8]));
    let page = ms.find_page(va(HEAP_BASE)).unwrap();
    let slot = page.swap_slot();
    assert!(slot.is_some());
    table.fail_next.store(true, Ordering::SeqCst);
    assert!(!ms.claim_page(va(HEAP_BASE)));
    assert!(!page.is_resident());
    assert_eq!(page.swap_slot(), slot);
    assert_eq!(vm.free_frames(), 1);
    assert_eq!(read_vec(&ms, HEAP_BASE, 8), vec![0x42; 8]);
    assert_eq!(read_vec(&ms, HEAP_BASE + PAGE_SIZE, 8), vec![0x17; 8]);
}

/// A file whose first read blocks until the test lets it go
struct GatedFile {
    file: Arc<RamFile>,
    entered: Mutex<Option<Sender<()>>>,
    gate: Mutex<Receiver<()>>,
}

impl File for GatedFile {
    fn seek(&self, pos: usize) {
        self.file.seek(pos)
    }
    fn tell(&self) -> usize {
        self.file.tell()
    }
    fn read(&self, buf: &mut [u8]) -> usize {
        if let Some(entered) = self.entered.lock().unwrap().take() {
            entered.send(()).unwrap();
            self.gate.lock().unwrap().recv().unwrap();
        }
        self.file.read(buf)
    }
    fn write(&self, buf: &[u8]) -> usize {
        self.file.write(buf)
    }
    fn size(&self) -> usize {
        self.file.size()
    }
    fn duplicate(&self) -> Arc<dyn File> {
        self.file.duplicate()
    }
}

#[test]
fn page_removed_while_loading_gives_its_frame_back() {
    let vm = new_vm(2, 2);
    let ms = new_process(&vm);
    let (entered_tx, entered_rx) = mpsc::channel();
    let (open_tx, open_rx) = mpsc::channel();
    let file: Arc<dyn File> = Arc::new(GatedFile {
        file: RamFile::new(pattern(PAGE_SIZE, 5)),
        entered: Mutex::new(Some(entered_tx)),
        gate: Mutex::new(open_rx),
    });
    let loader = LoadInfo::new(file, 0, PAGE_SIZE, 0);
    assert!(ms.alloc_page(VmType::File, va(MMAP_BASE), false, Some(loader)));
    thread::scope(|s| {
        let claimer = s.spawn(|| ms.claim_page(va(MMAP_BASE)));
        entered_rx.recv().unwrap();
        let remover = s.spawn(|| ms.remove_page(va(MMAP_BASE)));
        // 让 remove_page 先等在页面锁上，再放行读取
        thread::sleep(Duration::from_millis(50));
        open_tx.send(()).unwrap();
        claimer.join().unwrap();
        assert!(remover.join().unwrap());
    });
    assert_eq!(ms.page_count(), 0);
    assert!(!ms.page_table().is_present(va(MMAP_BASE).floor()));
    assert_eq!(vm.free_frames(), 2);
    // the freed frame is usable again
    alloc_heap(&ms, 2);
    assert!(ms.write_user(va(HEAP_BASE), &[1; 8]));
    assert!(ms.write_user(va(HEAP_BASE + PAGE_SIZE), &[2; 8]));
    assert_eq!(read_vec(&ms, HEAP_BASE, 8), vec![1; 8]);
}

/// A file that refuses every write
struct ReadOnlyFile(Arc<dyn File>);

impl File for ReadOnlyFile {
    fn seek(&self, pos: usize) {
        self.0.seek(pos)
    }
    fn tell(&self) -> usize {
        self.0.tell()
    }
    fn read(&self, buf: &mut [u8]) -> usize {
        self.0.read(buf)
    }
    fn write(&self, _buf: &[u8]) -> usize {
        0
    }
    fn size(&self) -> usize {
        self.0.size()
    }
    fn duplicate(&self) -> Arc<dyn File> {
        Arc::new(ReadOnlyFile(self.0.duplicate()))
    }
}

#[test]
fn munmap_completes_when_write_back_fails() {
    let vm = new_vm(4, 4);
    let ms = new_process(&vm);
    let original = pattern(2 * PAGE_SIZE, 9);
    let file = RamFile::new(original.clone());
    let handle: Arc<dyn File> = Arc::new(ReadOnlyFile(file.clone()));
    assert!(ms.mmap(va(MMAP_BASE), 2 * PAGE_SIZE, true, FD, &handle, 0).is_some());
    assert!(ms.write_user(va(MMAP_BASE), &[0xee; 4]));
    assert!(ms.write_user(va(MMAP_BASE + PAGE_SIZE), &[0xdd; 4]));
    ms.munmap(va(MMAP_BASE));
    assert_eq!(ms.page_count(), 0);
    assert_eq!(ms.map_count(), 0);
    assert_eq!(vm.free_frames(), 4);
    assert_eq!(file.content(), original);
}
