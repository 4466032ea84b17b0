//! 打开的文件: 文件头的内存副本 + 读写位置
//!
//! 读写都以文件头为索引, 通过 [`FileHeader::byte_to_sector`] 找到每个字节所在的扇区,
//! 再经过块缓存完成实际的数据搬运. 这一层不负责扩充文件, 写入超出文件长度的部分会被截断;
//! 需要扩充时由 [`super::FileSystem::write`] 先通过空闲扇区表扩充文件头.

use std::sync::Arc;

use log::trace;

use super::{FileHeader, SynchDisk, SECTOR_SIZE};
use crate::error::Result;

/// 作为一个文件而言, 它的内容在文件系统看来只是一个字节序列
type DataBlock = [u8; SECTOR_SIZE];

pub struct OpenFile {
    /// 文件头所在扇区
    sector: u32,
    hdr: FileHeader,
    /// 顺序读写的当前位置
    position: usize,
    disk: Arc<SynchDisk>,
}

impl OpenFile {
    /// 读入 sector 上的文件头并登记一个打开句柄, 句柄被 drop 时自动注销
    pub fn open(sector: u32, disk: &Arc<SynchDisk>) -> Result<Self> {
        let hdr = FileHeader::fetch_from(sector, disk)?;
        disk.inc_open(sector);
        trace!("open file at sector {}", sector);
        Ok(Self {
            sector,
            hdr,
            position: 0,
            disk: Arc::clone(disk),
        })
    }

    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn length(&self) -> usize {
        self.hdr.file_length()
    }

    pub fn header(&self) -> &FileHeader {
        &self.hdr
    }

    pub(crate) fn header_mut(&mut self) -> &mut FileHeader {
        &mut self.hdr
    }

    /// 重新读入磁盘上的文件头. 同一文件的其他句柄可能已经扩充并写回了文件头
    pub(crate) fn refresh_header(&mut self) -> Result<()> {
        self.hdr = FileHeader::fetch_from(self.sector, &self.disk)?;
        Ok(())
    }

    /// 把内存中的文件头写回它所在的扇区
    pub fn write_back_header(&self) {
        self.hdr.write_back(self.sector, &self.disk);
    }

    pub fn disk(&self) -> &Arc<SynchDisk> {
        &self.disk
    }

    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// 从当前位置顺序读取, 并把位置向后推进实际读到的字节数
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.read_at(buf, self.position);
        self.position += n;
        n
    }

    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.write_at(buf, self.position);
        self.position += n;
        n
    }

    /// 从 position 开始读取, 超出文件长度的部分不读, 返回读到的字节数
    pub fn read_at(&self, buf: &mut [u8], position: usize) -> usize {
        let mut start = position;
        // 如果文件剩下的内容还足够多, 那么缓冲区会被填满; 否则文件剩下的全部内容都会被读到缓冲区中
        let end = (position + buf.len()).min(self.length());
        if start >= end {
            return 0;
        }
        let mut read_size = 0usize;
        // 遍历位于字节区间 [start, end) 中间的那些扇区
        while start < end {
            let end_current_sector = ((start / SECTOR_SIZE + 1) * SECTOR_SIZE).min(end);
            let sector_read_size = end_current_sector - start;
            let sector = match self.hdr.byte_to_sector(start, &self.disk) {
                Ok(sector) => sector,
                Err(_) => break,
            };
            let dst = &mut buf[read_size..read_size + sector_read_size];
            self.disk
                .get_block_cache(sector as usize)
                .lock()
                .read(0, |data: &DataBlock| {
                    let src = &data[start % SECTOR_SIZE..start % SECTOR_SIZE + sector_read_size];
                    dst.copy_from_slice(src);
                });
            read_size += sector_read_size;
            start = end_current_sector;
        }
        read_size
    }

    /// 从 position 开始写入, 写入范围同样被截断在文件长度之内
    pub fn write_at(&self, buf: &[u8], position: usize) -> usize {
        let mut start = position;
        let end = (position + buf.len()).min(self.length());
        if start >= end {
            return 0;
        }
        let mut write_size = 0usize;
        while start < end {
            let end_current_sector = ((start / SECTOR_SIZE + 1) * SECTOR_SIZE).min(end);
            let sector_write_size = end_current_sector - start;
            let sector = match self.hdr.byte_to_sector(start, &self.disk) {
                Ok(sector) => sector,
                Err(_) => break,
            };
            let src = &buf[write_size..write_size + sector_write_size];
            // 只修改扇区中被覆盖的部分, 其余字节保持原样
            self.disk
                .get_block_cache(sector as usize)
                .lock()
                .modify(0, |data: &mut DataBlock| {
                    let dst =
                        &mut data[start % SECTOR_SIZE..start % SECTOR_SIZE + sector_write_size];
                    dst.copy_from_slice(src);
                });
            write_size += sector_write_size;
            start = end_current_sector;
        }
        write_size
    }

    /// 读出整个文件
    pub fn read_all(&self) -> Vec<u8> {
        let mut v = vec![0u8; self.length()];
        let n = self.read_at(&mut v, 0);
        v.truncate(n);
        v
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.disk.dec_open(self.sector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDisk;
    use crate::fs::{BitMap, FileType, NUM_DIRECT, NUM_SECTORS};

    fn file_of(size: usize) -> (Arc<SynchDisk>, OpenFile) {
        let disk = SynchDisk::new(Arc::new(MemoryDisk::new(NUM_SECTORS)));
        let mut map = BitMap::new(NUM_SECTORS);
        map.mark(0);
        let mut hdr = FileHeader::new(FileType::Unknown);
        hdr.allocate(&mut map, size, &disk).unwrap();
        hdr.write_back(0, &disk);
        let file = OpenFile::open(0, &disk).unwrap();
        (disk, file)
    }

    #[test]
    fn write_then_read_across_sectors() {
        let size = (NUM_DIRECT + 5) * SECTOR_SIZE;
        let (_disk, file) = file_of(size);
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write_at(&data, 0), size);
        let mut buf = vec![0u8; 300];
        assert_eq!(file.read_at(&mut buf, NUM_DIRECT * SECTOR_SIZE - 100), 300);
        let at = NUM_DIRECT * SECTOR_SIZE - 100;
        assert_eq!(&buf[..], &data[at..at + 300]);
    }

    #[test]
    fn access_is_clipped_to_length() {
        let (_disk, mut file) = file_of(200);
        assert_eq!(file.write_at(&[7u8; 100], 150), 50);
        let mut buf = [0u8; 64];
        assert_eq!(file.read_at(&mut buf, 190), 10);
        assert_eq!(&buf[..10], &[7u8; 10]);
        assert_eq!(file.read_at(&mut buf, 200), 0);
        file.seek(180);
        assert_eq!(file.read(&mut buf), 20);
        assert_eq!(file.position(), 200);
    }

    #[test]
    fn open_count_follows_handles() {
        let (disk, file) = file_of(10);
        assert_eq!(disk.open_count(0), 1);
        let second = OpenFile::open(0, &disk).unwrap();
        assert_eq!(disk.open_count(0), 2);
        drop(file);
        drop(second);
        assert_eq!(disk.open_count(0), 0);
    }
}
