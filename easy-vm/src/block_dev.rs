use core::any::Any;

/// Size of a device sector in bytes
pub const BLOCK_SZ: usize = 512;

/// Trait for block devices
/// which reads and writes data in the unit of blocks
// 交换区只依赖这两个按扇区读写的接口，既可以是 virtio 块设备，也可以是宿主机上的镜像文件
pub trait BlockDevice: Send + Sync + Any {
    ///Read data form block to buffer
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    ///Write data from buffer to block
    fn write_block(&self, block_id: usize, buf: &[u8]);
}
