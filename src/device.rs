use crate::fs::{BlockDevice, SECTOR_SIZE};
use spin::Mutex;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

/// 以宿主文件为后端的模拟磁盘
pub struct BlockFile {
    file: Mutex<File>,
    num_sectors: usize,
}

// 宿主机上的磁盘镜像, 第 n 个扇区位于文件偏移 n * SECTOR_SIZE 处.
// 每次读写先 seek 到扇区开头.

impl BlockFile {
    /// 打开 (不存在时创建) 磁盘镜像, 并把它的长度设为 num_sectors 个扇区
    pub fn open<P: AsRef<Path>>(path: P, num_sectors: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len((num_sectors * SECTOR_SIZE) as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            num_sectors,
        })
    }
}

impl BlockDevice for BlockFile {
    /// 从文件读取一个扇区
    fn read_block(&self, sector: usize, buf: &mut [u8]) {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
            .expect("seek in disk image failed");
        file.read_exact(&mut buf[..SECTOR_SIZE])
            .expect("short sector transfer on disk image");
    }

    /// 写一个扇区到文件
    fn write_block(&self, sector: usize, buf: &[u8]) {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
            .expect("seek in disk image failed");
        file.write_all(&buf[..SECTOR_SIZE])
            .expect("short sector transfer on disk image");
    }

    fn num_sectors(&self) -> usize {
        self.num_sectors
    }
}

/// 内存中的磁盘, 测试时使用, 不接触宿主文件系统
pub struct MemoryDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemoryDisk {
    pub fn new(num_sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; num_sectors]),
        }
    }
}

impl BlockDevice for MemoryDisk {
    fn read_block(&self, sector: usize, buf: &mut [u8]) {
        buf[..SECTOR_SIZE].copy_from_slice(&self.sectors.lock()[sector]);
    }

    fn write_block(&self, sector: usize, buf: &[u8]) {
        self.sectors.lock()[sector].copy_from_slice(&buf[..SECTOR_SIZE]);
    }

    fn num_sectors(&self) -> usize {
        self.sectors.lock().len()
    }
}
