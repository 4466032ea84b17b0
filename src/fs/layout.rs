//! 磁盘数据结构层: 文件头 [`FileHeader`] (相当于 UNIX 中的 i-node)
//!
//! 每个文件头恰好占据一个扇区, 它在内存中的布局就是在磁盘上的布局.
//!
//! 文件的数据扇区按逻辑编号从小到大依次落在三个区域:
//!
//! - 直接索引 `direct`, 共 [`NUM_DIRECT`] 个
//! - 索引扇区 A `indirect_a`, 它指向一个索引扇区, 其中存放 [`NUM_INDIRECT`] 个数据扇区号
//! - 索引扇区 B `indirect_b`, 同上
//!
//! 因此单个文件最多 `NUM_DIRECT + 2 * NUM_INDIRECT` 个扇区, 超出时分配直接失败.

use std::fmt::{Debug, Formatter};

use chrono::{TimeZone, Utc};
use log::{debug, error, warn};

use super::{
    BitMap, SynchDisk, DIRECT_BOUND, FILE_HEADER_MAGIC, INDIRECT_A_BOUND, INDIRECT_B_BOUND,
    NUM_DIRECT, NUM_INDIRECT, SECTOR_SIZE,
};
use crate::error::{KernelError, Resource, Result};

/// 索引扇区 IndirectBlock 实质上是一个 u32 数组, 每个都指向一个数据扇区
type IndirectBlock = [u32; NUM_INDIRECT]; // size = 128B / 4B(u32) = 32

// 作为一个文件而言, 它的内容在文件系统看来没有任何既定的格式, 都只是
// 一个 (u8) 字节序列, 因此每个保存内容的扇区都只是一个字节数组
type DataBlock = [u8; SECTOR_SIZE];

/// 文件类型标签, 创建时根据文件名后缀得到
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum FileType {
    Unknown = 0,
    Text = 1,
    Source = 2,
    Executable = 3,
    Directory = 4,
}

impl FileType {
    pub fn from_name(name: &str) -> Self {
        match name.rsplit_once('.').map(|(_, suffix)| suffix) {
            Some("txt") => FileType::Text,
            Some("c") | Some("h") | Some("s") => FileType::Source,
            Some("noff") | Some("coff") => FileType::Executable,
            _ => FileType::Unknown,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => FileType::Text,
            2 => FileType::Source,
            3 => FileType::Executable,
            4 => FileType::Directory,
            _ => FileType::Unknown,
        }
    }
}

/// 文件头, 大小为 (8 + 22 + 2) * 4 = 128 B, 恰好一个扇区
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// 用于合法性验证的魔数
    magic: u32,
    /// 文件内容的字节数
    num_bytes: u32,
    /// 数据扇区数, 恒等于 ceil(num_bytes / SECTOR_SIZE)
    num_sectors: u32,
    /// 文件头自身所在的扇区. 对于当前目录锚点, 它记录当前目录的文件头扇区
    self_sector: u32,
    file_type: u32,
    created: u32,
    modified: u32,
    accessed: u32,
    /// 直接索引
    direct: [u32; NUM_DIRECT],
    /// 第一个索引扇区, 数据扇区数超过 NUM_DIRECT 时使用
    indirect_a: u32,
    /// 第二个索引扇区, 数据扇区数超过 NUM_DIRECT + NUM_INDIRECT 时使用
    indirect_b: u32,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == SECTOR_SIZE);

impl Debug for FileHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHeader")
            .field("num_bytes", &self.num_bytes)
            .field("num_sectors", &self.num_sectors)
            .field("self_sector", &self.self_sector)
            .field("file_type", &self.file_type())
            .field("direct", &&self.direct[..(self.num_sectors as usize).min(NUM_DIRECT)])
            .field("indirect_a", &self.indirect_a)
            .field("indirect_b", &self.indirect_b)
            .finish()
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new(FileType::Unknown)
    }
}

impl FileHeader {
    /// 一个尚未分配任何扇区的文件头
    pub fn new(file_type: FileType) -> Self {
        Self {
            magic: FILE_HEADER_MAGIC,
            num_bytes: 0,
            num_sectors: 0,
            self_sector: 0,
            file_type: file_type as u32,
            created: 0,
            modified: 0,
            accessed: 0,
            direct: [0; NUM_DIRECT],
            indirect_a: 0,
            indirect_b: 0,
        }
    }

    /// 用 size 除以每个扇区的大小并向上取整
    pub fn sectors_for(size: usize) -> usize {
        (size + SECTOR_SIZE - 1) / SECTOR_SIZE
    }

    /// 容纳 data_sectors 个数据扇区需要的总扇区数 (数据扇区 + 索引扇区)
    pub fn total_sectors(data_sectors: usize) -> usize {
        let mut total = data_sectors;
        if data_sectors > DIRECT_BOUND {
            total += 1;
        }
        if data_sectors > INDIRECT_A_BOUND {
            total += 1;
        }
        total
    }

    /// 为新创建的文件分配 file_size 字节的数据扇区.
    ///
    /// 空闲扇区不足 (含索引扇区) 或超出文件大小上限时返回错误, 此时 map 没有被修改.
    pub fn allocate(&mut self, map: &mut BitMap, file_size: usize, disk: &SynchDisk) -> Result<()> {
        let num_sectors = Self::sectors_for(file_size);
        if num_sectors > INDIRECT_B_BOUND {
            warn!("allocate: {} bytes exceeds the file size ceiling", file_size);
            return Err(KernelError::ExhaustedResource(Resource::FileTooLarge));
        }
        if map.num_clear() < Self::total_sectors(num_sectors) {
            debug!(
                "allocate: need {} sectors, {} free",
                Self::total_sectors(num_sectors),
                map.num_clear()
            );
            return Err(KernelError::ExhaustedResource(Resource::Sectors));
        }
        self.num_bytes = 0;
        self.num_sectors = 0;
        self.direct = [0; NUM_DIRECT];
        self.indirect_a = 0;
        self.indirect_b = 0;
        self.grow(map, num_sectors, disk)?;
        self.num_bytes = file_size as u32;
        Ok(())
    }

    /// 在文件末尾追加 extra 字节.
    ///
    /// 扇区数不变时只更新字节数; 否则只为新增的扇区检查空闲空间, 失败时文件头与 map 都保持原样.
    pub fn extend(&mut self, map: &mut BitMap, extra: usize, disk: &SynchDisk) -> Result<()> {
        let new_bytes = self.num_bytes as usize + extra;
        let old_sectors = self.num_sectors as usize;
        let new_sectors = Self::sectors_for(new_bytes);
        if new_sectors == old_sectors {
            self.num_bytes = new_bytes as u32;
            return Ok(());
        }
        if new_sectors > INDIRECT_B_BOUND {
            warn!("extend: {} bytes exceeds the file size ceiling", new_bytes);
            return Err(KernelError::ExhaustedResource(Resource::FileTooLarge));
        }
        let needed = Self::total_sectors(new_sectors) - Self::total_sectors(old_sectors);
        if map.num_clear() < needed {
            debug!("extend: need {} sectors, {} free", needed, map.num_clear());
            return Err(KernelError::ExhaustedResource(Resource::Sectors));
        }
        self.grow(map, new_sectors, disk)?;
        self.num_bytes = new_bytes as u32;
        Ok(())
    }

    /// 把数据扇区数从 num_sectors 扩充到 target.
    ///
    /// 先填满直接索引, 再依次进入两个索引扇区. 索引扇区第一次被跨越时才分配,
    /// 已经存在的索引扇区在原地从第一个空位继续填写.
    fn grow(&mut self, map: &mut BitMap, target: usize, disk: &SynchDisk) -> Result<()> {
        let mut current = self.num_sectors as usize;

        // 填充直接索引
        while current < target.min(DIRECT_BOUND) {
            self.direct[current] = claim(map)?;
            current += 1;
        }

        // 填充索引扇区 A
        if target > DIRECT_BOUND {
            grow_indirect(
                &mut self.indirect_a,
                DIRECT_BOUND,
                INDIRECT_A_BOUND,
                &mut current,
                target,
                map,
                disk,
            )?;
        }

        // 填充索引扇区 B
        if target > INDIRECT_A_BOUND {
            grow_indirect(
                &mut self.indirect_b,
                INDIRECT_A_BOUND,
                INDIRECT_B_BOUND,
                &mut current,
                target,
                map,
                disk,
            )?;
        }

        self.num_sectors = current as u32;
        Ok(())
    }

    /// 回收文件的所有数据扇区与索引扇区, 结构与 allocate/extend 建立的完全对应
    pub fn deallocate(&mut self, map: &mut BitMap, disk: &SynchDisk) {
        let num_sectors = self.num_sectors as usize;

        // 回收直接索引
        for sector in self.direct.iter().take(num_sectors.min(DIRECT_BOUND)) {
            map.clear(*sector);
        }

        // 回收索引扇区 A 中列出的数据扇区, 再回收索引扇区本身
        if num_sectors > DIRECT_BOUND {
            let count = num_sectors.min(INDIRECT_A_BOUND) - DIRECT_BOUND;
            release_indirect(self.indirect_a, count, map, disk);
            map.clear(self.indirect_a);
        }

        // 回收索引扇区 B
        if num_sectors > INDIRECT_A_BOUND {
            let count = num_sectors - INDIRECT_A_BOUND;
            release_indirect(self.indirect_b, count, map, disk);
            map.clear(self.indirect_b);
        }

        self.num_bytes = 0;
        self.num_sectors = 0;
        self.direct = [0; NUM_DIRECT];
        self.indirect_a = 0;
        self.indirect_b = 0;
    }

    /// 文件内偏移 offset 所在的扇区号
    pub fn byte_to_sector(&self, offset: usize, disk: &SynchDisk) -> Result<u32> {
        let index = offset / SECTOR_SIZE;
        if index < DIRECT_BOUND {
            Ok(self.direct[index])
        } else if index < INDIRECT_A_BOUND {
            Ok(read_indirect(self.indirect_a, index - DIRECT_BOUND, disk))
        } else if index < INDIRECT_B_BOUND {
            Ok(read_indirect(self.indirect_b, index - INDIRECT_A_BOUND, disk))
        } else {
            Err(KernelError::ExhaustedResource(Resource::FileTooLarge))
        }
    }

    /// 从扇区 sector 读出文件头, 魔数不对说明读到的不是文件头
    pub fn fetch_from(sector: u32, disk: &SynchDisk) -> Result<Self> {
        let header = disk
            .get_block_cache(sector as usize)
            .lock()
            .read(0, |header: &FileHeader| *header);
        if header.magic != FILE_HEADER_MAGIC {
            error!(
                "corrupt file header at sector {}: magic {:#x}",
                sector, header.magic
            );
            return Err(KernelError::CorruptHeader {
                sector,
                magic: header.magic,
            });
        }
        Ok(header)
    }

    pub fn write_back(&self, sector: u32, disk: &SynchDisk) {
        disk.get_block_cache(sector as usize)
            .lock()
            .modify(0, |header: &mut FileHeader| *header = *self);
    }

    /// 按逻辑顺序列出所有数据扇区
    pub fn data_sectors(&self, disk: &SynchDisk) -> Vec<u32> {
        let num_sectors = self.num_sectors as usize;
        let mut v: Vec<u32> = self.direct[..num_sectors.min(DIRECT_BOUND)].to_vec();
        if num_sectors > DIRECT_BOUND {
            let count = num_sectors.min(INDIRECT_A_BOUND) - DIRECT_BOUND;
            disk.get_block_cache(self.indirect_a as usize)
                .lock()
                .read(0, |block: &IndirectBlock| v.extend_from_slice(&block[..count]));
        }
        if num_sectors > INDIRECT_A_BOUND {
            let count = num_sectors - INDIRECT_A_BOUND;
            disk.get_block_cache(self.indirect_b as usize)
                .lock()
                .read(0, |block: &IndirectBlock| v.extend_from_slice(&block[..count]));
        }
        v
    }

    /// 正在使用的索引扇区
    pub fn index_sectors(&self) -> Vec<u32> {
        let num_sectors = self.num_sectors as usize;
        let mut v = Vec::new();
        if num_sectors > DIRECT_BOUND {
            v.push(self.indirect_a);
        }
        if num_sectors > INDIRECT_A_BOUND {
            v.push(self.indirect_b);
        }
        v
    }

    pub fn file_length(&self) -> usize {
        self.num_bytes as usize
    }

    pub fn num_sectors(&self) -> usize {
        self.num_sectors as usize
    }

    pub fn self_sector(&self) -> u32 {
        self.self_sector
    }

    pub fn set_self_sector(&mut self, sector: u32) {
        self.self_sector = sector;
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_raw(self.file_type)
    }

    pub fn set_file_type(&mut self, file_type: FileType) {
        self.file_type = file_type as u32;
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// 新建文件时把三个时间戳都设为 now
    pub fn stamp(&mut self, now: u32) {
        self.created = now;
        self.modified = now;
        self.accessed = now;
    }

    pub fn touch_modified(&mut self, now: u32) {
        self.modified = now;
        self.accessed = now;
    }

    pub fn touch_accessed(&mut self, now: u32) {
        self.accessed = now;
    }

    /// (created, modified, accessed)
    pub fn times(&self) -> (u32, u32, u32) {
        (self.created, self.modified, self.accessed)
    }

    /// 打印文件头以及文件的全部内容, 不可打印字符以 \xx 形式输出
    pub fn print(&self, disk: &SynchDisk) {
        let sectors = self.data_sectors(disk);
        let list: Vec<String> = sectors.iter().map(|s| s.to_string()).collect();
        println!(
            "FileHeader contents.  File size: {}.  File blocks: {}",
            self.num_bytes,
            list.join(" ")
        );
        println!("File Type: {:?}", self.file_type());
        println!(
            "Created: {}  Modified: {}  Accessed: {}",
            format_time(self.created),
            format_time(self.modified),
            format_time(self.accessed)
        );
        println!("File contents:");
        let mut remaining = self.num_bytes as usize;
        for sector in sectors {
            let line = disk
                .get_block_cache(sector as usize)
                .lock()
                .read(0, |data: &DataBlock| {
                    data.iter()
                        .take(remaining.min(SECTOR_SIZE))
                        .map(|b| {
                            if (0x20..=0x7e).contains(b) {
                                (*b as char).to_string()
                            } else {
                                format!("\\{:x}", b)
                            }
                        })
                        .collect::<String>()
                });
            remaining = remaining.saturating_sub(SECTOR_SIZE);
            println!("{}", line);
        }
    }
}

fn format_time(secs: u32) -> String {
    match Utc.timestamp_opt(secs as i64, 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::from("-"),
    }
}

/// 从空闲表中取一个扇区
fn claim(map: &mut BitMap) -> Result<u32> {
    map.find()
        .ok_or(KernelError::ExhaustedResource(Resource::Sectors))
}

/// 把 [base, bound) 这一段逻辑扇区填到索引扇区 index_sector 中, 直到 target 或 bound.
///
/// current == base 说明这个索引扇区还没有分配, 需要先申请并清零.
fn grow_indirect(
    index_sector: &mut u32,
    base: usize,
    bound: usize,
    current: &mut usize,
    target: usize,
    map: &mut BitMap,
    disk: &SynchDisk,
) -> Result<()> {
    let end = target.min(bound);
    if *current >= end {
        return Ok(());
    }
    if *current == base {
        *index_sector = claim(map)?;
        disk.get_block_cache(*index_sector as usize)
            .lock()
            .modify(0, |block: &mut IndirectBlock| block.fill(0));
    }
    let mut claimed = Vec::with_capacity(end - *current);
    for _ in *current..end {
        claimed.push(claim(map)?);
    }
    let start = *current - base;
    disk.get_block_cache(*index_sector as usize)
        .lock()
        .modify(0, |block: &mut IndirectBlock| {
            block[start..start + claimed.len()].copy_from_slice(&claimed);
        });
    *current = end;
    Ok(())
}

fn read_indirect(index_sector: u32, slot: usize, disk: &SynchDisk) -> u32 {
    disk.get_block_cache(index_sector as usize)
        .lock()
        .read(0, |block: &IndirectBlock| block[slot])
}

fn release_indirect(index_sector: u32, count: usize, map: &mut BitMap, disk: &SynchDisk) {
    disk.get_block_cache(index_sector as usize)
        .lock()
        .read(0, |block: &IndirectBlock| {
            for sector in &block[..count] {
                map.clear(*sector);
            }
        });
}
