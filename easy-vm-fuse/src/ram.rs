//! In-memory collaborators
use easy_vm::{BlockDevice, File, BLOCK_SZ};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A block device kept in memory
pub struct RamDisk(Mutex<Vec<u8>>);

impl RamDisk {
    pub fn new(blocks: usize) -> Arc<Self> {
        Arc::new(Self(Mutex::new(vec![0u8; blocks * BLOCK_SZ])))
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let disk = self.0.lock().unwrap();
        buf.copy_from_slice(&disk[block_id * BLOCK_SZ..(block_id + 1) * BLOCK_SZ]);
    }
    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut disk = self.0.lock().unwrap();
        disk[block_id * BLOCK_SZ..(block_id + 1) * BLOCK_SZ].copy_from_slice(buf);
    }
}

/// A file kept in memory; writes past the end extend it
pub struct RamFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: AtomicUsize,
}

impl RamFile {
    pub fn new(content: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(content)),
            pos: AtomicUsize::new(0),
        })
    }
    /// Snapshot of the whole file
    pub fn content(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl File for RamFile {
    fn seek(&self, pos: usize) {
        self.pos.store(pos, Ordering::Relaxed);
    }
    fn tell(&self) -> usize {
        self.pos.load(Ordering::Relaxed)
    }
    fn read(&self, buf: &mut [u8]) -> usize {
        let data = self.data.lock().unwrap();
        let pos = self.tell().min(data.len());
        let len = buf.len().min(data.len() - pos);
        buf[..len].copy_from_slice(&data[pos..pos + len]);
        self.pos.fetch_add(len, Ordering::Relaxed);
        len
    }
    fn write(&self, buf: &[u8]) -> usize {
        let mut data = self.data.lock().unwrap();
        let pos = self.tell();
        if data.len() < pos + buf.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        self.pos.fetch_add(buf.len(), Ordering::Relaxed);
        buf.len()
    }
    fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }
    fn duplicate(&self) -> Arc<dyn File> {
        Arc::new(Self {
            data: Arc::clone(&self.data),
            pos: AtomicUsize::new(0),
        })
    }
}
