//! Constants used in the virtual memory core

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;

/// Top of the user stack; the stack grows down from here
pub const USER_STACK: usize = 0x4748_0000;
/// The stack region must stay strictly smaller than this
pub const STACK_LIMIT: usize = 1 << 20;

/// Everything at or above this address belongs to the kernel
pub const KERN_BASE: usize = 0x80_0400_0000;

/// Physical page number of the first frame in the user pool
pub const USER_POOL_BASE_PPN: usize = 0x80400;

pub const FD_STDIN: usize = 0;
pub const FD_STDOUT: usize = 1;
