//! A demand-paging virtual memory core
//!
//! Every process owns a [`MemorySet`]: a supplemental page table describing
//! what each user page should contain, the list of explicit file mappings,
//! and the translation table the pages get installed into. All processes
//! share one [`Vm`], which owns the physical frame pool, the frame table used
//! for eviction and the swap store.
//!
//! Pages are loaded lazily on the first fault and evicted to swap (anonymous
//! memory) or back to their file (file-backed memory) when the pool runs dry.
#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

mod address;
mod block_dev;
pub mod config;
mod fault;
mod file;
mod frame;
mod memory_set;
mod mmap;
mod page;
mod page_table;
mod spt;
mod swap;

pub use address::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
pub use block_dev::{BlockDevice, BLOCK_SZ};
pub use fault::PageFault;
pub use file::{File, FILESYS_LOCK};
pub use frame::{FrameId, Vm};
pub use memory_set::{copy_table, MemorySet};
pub use mmap::MapArea;
pub use page::{LoadInfo, Page, VmType};
pub use page_table::{PTEFlags, PageTable, PageTableEntry, SoftPageTable};
pub use spt::SupplementalPageTable;
pub use swap::{Bitmap, SwapStore, SECTORS_PER_PAGE};
