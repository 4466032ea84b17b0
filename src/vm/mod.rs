//! 虚拟内存: 按需调页, 全局 LRU 页面置换, 交换区, 以及 LRU 替换的 TLB
//!
//! 缺页时由 [`VirtualMemoryManager::handle_page_fault`] 找到一个物理页框
//! (有空闲页框就直接使用, 否则淘汰全局最久未使用的页框), 再从交换区或可执行文件中载入页面.
//! 所有页框, 交换区与 TLB 的状态都属于同一个 [`VirtualMemoryManager`] 实例, 没有全局变量.

mod addrspace;
mod lru;
mod manager;
mod noff;
mod swap;
mod tlb;

use crate::fs::SECTOR_SIZE;

/// 页大小与扇区大小相同, 一个页面恰好对应可执行文件中的一个扇区
pub const PAGE_SIZE: usize = SECTOR_SIZE;

/// 虚拟内存的几何参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// 物理页框数
    pub num_phys_pages: usize,
    /// TLB 表项数
    pub tlb_size: usize,
    /// 交换区预先分配的槽位数, 交换区本身可以继续增长
    pub swap_slots: usize,
    /// 每个地址空间在代码与数据之后追加的栈大小 (字节)
    pub user_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            num_phys_pages: 32,
            tlb_size: 4,
            swap_slots: 64,
            user_stack_size: 1024,
        }
    }
}

pub use addrspace::{AddressSpace, PageTableEntry};
pub use lru::RecencyList;
pub use manager::{Statistics, VirtualMemoryManager};
pub use noff::{NoffHeader, Segment, NOFF_HEADER_SIZE, NOFF_MAGIC};
pub use swap::{SwapArea, SwapSlot};
pub use tlb::{Tlb, TlbEntry};
