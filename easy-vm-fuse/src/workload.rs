//! A random multi-process workload checked against a shadow copy of memory
use easy_vm::config::{PAGE_SIZE, USER_STACK};
use easy_vm::{File, MemorySet, PageTable, SoftPageTable, VirtAddr, Vm, VmType, FILESYS_LOCK};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;

pub const HEAP_BASE: usize = 0x1000_0000;
pub const HEAP_PAGES: usize = 16;
pub const MMAP_BASE: usize = 0x2000_0000;
/// How deep a process pushes its stack
pub const STACK_PAGES: usize = 8;

pub struct Workload {
    pub processes: usize,
    pub rounds: usize,
    pub seed: u64,
}

#[derive(Default, Debug)]
pub struct Report {
    pub reads: usize,
    pub writes: usize,
    pub forks: usize,
}

impl Report {
    fn merge(&mut self, other: &Report) {
        self.reads += other.reads;
        self.writes += other.writes;
        self.forks += other.forks;
    }
}

fn read_all(file: &Arc<dyn File>) -> Vec<u8> {
    let file = file.duplicate();
    let _fs = FILESYS_LOCK.lock();
    let mut content = vec![0u8; file.size()];
    let mut read = 0;
    while read < content.len() {
        let len = file.read(&mut content[read..]);
        if len == 0 {
            break;
        }
        read += len;
    }
    content.truncate(read);
    content
}

/// Run `workload.processes` processes in parallel over the same VM core
///
/// `source`, if given, is mapped read-only into every process. All frames
/// and swap slots must be free again once every process has exited.
pub fn run(vm: &Arc<Vm>, source: Option<Arc<dyn File>>, workload: &Workload) -> Result<Report, String> {
    let free_before = vm.free_frames();
    let expected = source.as_ref().map(read_all);
    let results: Vec<Result<Report, String>> = thread::scope(|s| {
        let handles: Vec<_> = (0..workload.processes)
            .map(|pid| {
                let source = source.clone();
                let expected = expected.as_deref();
                s.spawn(move || {
                    let seed = workload.seed.wrapping_add(pid as u64);
                    process(pid, vm, source, expected, workload.rounds, seed)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(String::from("process panicked")))
            })
            .collect()
    });
    let mut report = Report::default();
    for result in results {
        report.merge(&result?);
    }
    if vm.free_frames() != free_before {
        return Err(format!(
            "frames leaked: {} free before, {} after",
            free_before,
            vm.free_frames()
        ));
    }
    if vm.swap().in_use() != 0 {
        return Err(format!("{} swap slots leaked", vm.swap().in_use()));
    }
    Ok(report)
}

struct Process {
    pid: usize,
    memory_set: MemorySet,
    heap: Vec<u8>,
}

impl Process {
    fn new(pid: usize, vm: &Arc<Vm>) -> Result<Self, String> {
        let page_table: Arc<dyn PageTable> = Arc::new(SoftPageTable::new());
        let memory_set = MemorySet::new_bare(Arc::clone(vm), page_table);
        if !memory_set.setup_stack() {
            return Err(format!("[{}] cannot set up the stack", pid));
        }
        for i in 0..HEAP_PAGES {
            let va = VirtAddr::from(HEAP_BASE + i * PAGE_SIZE);
            if !memory_set.alloc_page(VmType::Anon, va, true, None) {
                return Err(format!("[{}] cannot allocate {:?}", pid, va));
            }
        }
        Ok(Self {
            pid,
            memory_set,
            heap: vec![0u8; HEAP_PAGES * PAGE_SIZE],
        })
    }
    fn write_heap(&mut self, rng: &mut StdRng) -> Result<(), String> {
        let mut bytes = [0u8; 64];
        rng.fill(&mut bytes[..]);
        let offset = rng.gen_range(0..self.heap.len() - bytes.len());
        if !self.memory_set.write_user(VirtAddr::from(HEAP_BASE + offset), &bytes) {
            return Err(format!("[{}] write to heap +{:#x} failed", self.pid, offset));
        }
        self.heap[offset..offset + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }
    fn check_heap(&self, rng: &mut StdRng) -> Result<(), String> {
        let len = rng.gen_range(1..2 * PAGE_SIZE);
        let offset = rng.gen_range(0..self.heap.len() - len);
        let mut buf = vec![0u8; len];
        if !self.memory_set.read_user(VirtAddr::from(HEAP_BASE + offset), &mut buf) {
            return Err(format!("[{}] read from heap +{:#x} failed", self.pid, offset));
        }
        if buf[..] != self.heap[offset..offset + len] {
            return Err(format!("[{}] heap mismatch at +{:#x}", self.pid, offset));
        }
        Ok(())
    }
    // 压栈：把栈指针往下挪若干页再写，超出已有栈区域时走栈增长
    fn push_stack(&self, rng: &mut StdRng) -> Result<(), String> {
        let sp = USER_STACK - rng.gen_range(1..STACK_PAGES * PAGE_SIZE);
        self.memory_set.set_user_sp(sp);
        let value = (self.pid as u64).to_le_bytes();
        let va = VirtAddr::from(sp);
        let mut back = [0u8; 8];
        if !self.memory_set.write_user(va, &value) || !self.memory_set.read_user(va, &mut back) {
            return Err(format!("[{}] stack access at {:#x} failed", self.pid, sp));
        }
        if back != value {
            return Err(format!("[{}] stack mismatch at {:#x}", self.pid, sp));
        }
        Ok(())
    }
    fn check_mapping(&self, rng: &mut StdRng, expected: &[u8]) -> Result<(), String> {
        let len = rng.gen_range(1..=expected.len().min(PAGE_SIZE));
        let offset = rng.gen_range(0..=expected.len() - len);
        let mut buf = vec![0u8; len];
        if !self.memory_set.read_user(VirtAddr::from(MMAP_BASE + offset), &mut buf) {
            return Err(format!("[{}] read from mapping +{:#x} failed", self.pid, offset));
        }
        if buf[..] != expected[offset..offset + len] {
            return Err(format!("[{}] mapping mismatch at +{:#x}", self.pid, offset));
        }
        Ok(())
    }
    // fork 出一个子进程，比较子进程和影子内存，随后子进程退出
    fn fork_and_check(&self) -> Result<(), String> {
        let page_table: Arc<dyn PageTable> = Arc::new(SoftPageTable::new());
        let child = MemorySet::from_existed_user(&self.memory_set, page_table)
            .ok_or_else(|| format!("[{}] fork failed", self.pid))?;
        let mut buf = vec![0u8; self.heap.len()];
        if !child.read_user(VirtAddr::from(HEAP_BASE), &mut buf) || buf != self.heap {
            return Err(format!("[{}] child heap differs from parent", self.pid));
        }
        Ok(())
    }
}

fn process(
    pid: usize,
    vm: &Arc<Vm>,
    source: Option<Arc<dyn File>>,
    expected: Option<&[u8]>,
    rounds: usize,
    seed: u64,
) -> Result<Report, String> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut proc = Process::new(pid, vm)?;
    if let (Some(file), Some(expected)) = (source.as_ref(), expected) {
        let addr = VirtAddr::from(MMAP_BASE);
        if proc.memory_set.mmap(addr, expected.len(), false, 3, file, 0) != Some(addr) {
            return Err(format!("[{}] mmap failed", pid));
        }
    }
    let mut report = Report::default();
    for _ in 0..rounds {
        match rng.gen_range(0..10) {
            0..=3 => {
                proc.write_heap(&mut rng)?;
                report.writes += 1;
            }
            4..=6 => {
                proc.check_heap(&mut rng)?;
                report.reads += 1;
            }
            7 => {
                proc.push_stack(&mut rng)?;
                report.writes += 1;
            }
            8 => {
                if let Some(expected) = expected.filter(|expected| !expected.is_empty()) {
                    proc.check_mapping(&mut rng, expected)?;
                    report.reads += 1;
                }
            }
            _ => {
                proc.fork_and_check()?;
                report.forks += 1;
            }
        }
    }
    debug!("[{}] exits after {:?}", pid, report);
    Ok(report)
}
