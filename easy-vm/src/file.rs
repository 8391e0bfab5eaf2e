//! The byte-addressed file abstraction consumed by file-backed pages
use alloc::sync::Arc;
use lazy_static::*;
use spin::Mutex;

/// An open file handle
///
/// A handle carries its own position. [`File::duplicate`] returns a new
/// handle to the same underlying file whose position moves independently;
/// closing a handle is dropping its last `Arc`.
pub trait File: Send + Sync {
    /// Move the position to `pos`
    fn seek(&self, pos: usize);
    /// Current position
    fn tell(&self) -> usize;
    /// Read at the current position, returns the number of bytes read
    fn read(&self, buf: &mut [u8]) -> usize;
    /// Write at the current position, returns the number of bytes written
    fn write(&self, buf: &[u8]) -> usize;
    /// Length of the file in bytes
    fn size(&self) -> usize;
    /// A new handle to the same file with an independent position
    fn duplicate(&self) -> Arc<dyn File>;
}

// 文件对象本身不是线程安全的，所有通过它的读写（包括普通的 sys_read/sys_write）都要先拿到这把全局锁
lazy_static! {
    /// Serializes every access to the filesystem
    pub static ref FILESYS_LOCK: Mutex<()> = Mutex::new(());
}
