//! Collaborators backed by host files
use easy_vm::{BlockDevice, File, BLOCK_SZ};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A swap disk image on the host
pub struct BlockFile(pub Mutex<fs::File>);

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SZ) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.read(buf).unwrap(), BLOCK_SZ, "Not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SZ) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.write(buf).unwrap(), BLOCK_SZ, "Not a complete block!");
    }
}

/// An open handle to a host file with a position of its own
pub struct HostFile {
    inner: Arc<Mutex<fs::File>>,
    pos: AtomicUsize,
}

impl HostFile {
    pub fn open(path: &str) -> std::io::Result<Arc<Self>> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Arc::new(Self {
            inner: Arc::new(Mutex::new(file)),
            pos: AtomicUsize::new(0),
        }))
    }
}

impl File for HostFile {
    fn seek(&self, pos: usize) {
        self.pos.store(pos, Ordering::Relaxed);
    }
    fn tell(&self) -> usize {
        self.pos.load(Ordering::Relaxed)
    }
    fn read(&self, buf: &mut [u8]) -> usize {
        let mut file = self.inner.lock().unwrap();
        if file.seek(SeekFrom::Start(self.tell() as u64)).is_err() {
            return 0;
        }
        let len = file.read(buf).unwrap_or(0);
        self.pos.fetch_add(len, Ordering::Relaxed);
        len
    }
    fn write(&self, buf: &[u8]) -> usize {
        let mut file = self.inner.lock().unwrap();
        if file.seek(SeekFrom::Start(self.tell() as u64)).is_err() {
            return 0;
        }
        let len = file.write(buf).unwrap_or(0);
        self.pos.fetch_add(len, Ordering::Relaxed);
        len
    }
    fn size(&self) -> usize {
        let file = self.inner.lock().unwrap();
        file.metadata().map_or(0, |meta| meta.len() as usize)
    }
    fn duplicate(&self) -> Arc<dyn File> {
        Arc::new(Self {
            inner: Arc::clone(&self.inner),
            pos: AtomicUsize::new(0),
        })
    }
}
