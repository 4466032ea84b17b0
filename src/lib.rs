//! 一个 Nachos 风格教学内核的存储与内存子系统:
//!
//! - [`fs`]: 以扇区为单位的索引分配文件系统 (空闲扇区位图, 文件头, 目录, 名字文件)
//! - [`vm`]: 按需调页的虚拟内存 (页表, LRU 置换, 交换区, TLB)
//!
//! 两者共享同一个 [`fs::SynchDisk`]: 可执行文件通过文件系统打开, 脏页经由文件头写回它自己的扇区.

pub mod device;
pub mod error;
pub mod fs;
pub mod logging;
pub mod vm;

#[cfg(test)]
mod test;

pub use error::{KernelError, Result};
