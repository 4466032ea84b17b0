//! 扇区设备接口. 模拟磁盘的扇区固定为 [`SECTOR_SIZE`](super::SECTOR_SIZE) 字节,
//! 块缓存层是它唯一的直接使用者: 位图, 文件头, 目录和文件内容的读写最终都落到这里.

use std::any::Any;

pub trait BlockDevice: Send + Sync + Any {
    /// 把第 sector 个扇区读入 buf, buf 至少一个扇区长
    fn read_block(&self, sector: usize, buf: &mut [u8]);

    /// 把 buf 的前一个扇区写到第 sector 个扇区
    fn write_block(&self, sector: usize, buf: &[u8]);

    /// 设备的扇区总数
    fn num_sectors(&self) -> usize;
}
