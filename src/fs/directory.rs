//! 目录: 固定大小的目录项表, 整体从目录文件读入, 整体写回
//!
//! 目录项中不直接保存文件名. 所有文件名都追加写入同一个名字文件 [`NameBlob`]
//! (文件头位于 2 号扇区), 目录项只记录名字在其中的偏移与长度.
//! 名字文件只增不减, 删除目录项时不回收名字占用的空间.
//!
//! 每张目录表的第 0 项保留给目录自身: 它的 sector 指向父目录 (根目录指向自己),
//! 它的名字是这个目录的完整路径.

use std::sync::Arc;

use log::{debug, trace};

use super::{BitMap, FileHeader, OpenFile, SynchDisk, DIRENT_SIZE, NAME_SECTOR, NUM_DIR_ENTRIES};
use crate::error::{KernelError, Resource, Result};

/// 目录项, 大小为 16 B
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    in_use: u8,
    is_dir: u8,
    _pad: [u8; 2],
    /// 文件头所在扇区
    sector: u32,
    /// 名字在名字文件中的偏移
    name_offset: u32,
    name_len: u32,
}

const _: () = assert!(std::mem::size_of::<DirectoryEntry>() == DIRENT_SIZE);

impl DirectoryEntry {
    pub fn new(sector: u32, is_dir: bool, name_offset: u32, name_len: u32) -> Self {
        Self {
            in_use: 1,
            is_dir: is_dir as u8,
            _pad: [0; 2],
            sector,
            name_offset,
            name_len,
        }
    }

    // 目录项需要转化为字节切片的形式, 才能交给 OpenFile 的 read_at / write_at

    /// 序列化目录项
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const Self as usize as *const u8, DIRENT_SIZE)
        }
    }

    /// 序列化目录项
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self as *mut Self as usize as *mut u8, DIRENT_SIZE)
        }
    }

    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn name(&self, names: &NameBlob) -> String {
        names.read(self.name_offset, self.name_len)
    }
}

/// 名字文件: 所有目录共享的只增不减的字符串池
pub struct NameBlob {
    file: OpenFile,
}

impl NameBlob {
    pub fn open(disk: &Arc<SynchDisk>) -> Result<Self> {
        Ok(Self {
            file: OpenFile::open(NAME_SECTOR, disk)?,
        })
    }

    /// 在文件末尾追加 name, 返回 (offset, len).
    ///
    /// 先通过 map 扩充文件头, 扩充失败时什么都不写. 扩充后的文件头只保存在内存中,
    /// 由调用者在整个操作成功后调用 [`NameBlob::write_back`] 落盘.
    pub fn append(&mut self, name: &str, map: &mut BitMap) -> Result<(u32, u32)> {
        let offset = self.file.length();
        let disk = Arc::clone(self.file.disk());
        self.file.header_mut().extend(map, name.len(), &disk)?;
        let written = self.file.write_at(name.as_bytes(), offset);
        debug_assert_eq!(written, name.len());
        trace!("name blob: {:?} at {}", name, offset);
        Ok((offset as u32, name.len() as u32))
    }

    pub fn read(&self, offset: u32, len: u32) -> String {
        let mut buf = vec![0u8; len as usize];
        let n = self.file.read_at(&mut buf, offset as usize);
        buf.truncate(n);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// 名字文件当前的字节数
    pub fn len(&self) -> usize {
        self.file.length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_back(&self) {
        self.file.write_back_header();
    }
}

/// 内存中的目录表
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directory {
    table: Vec<DirectoryEntry>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    /// 全部表项都未使用的目录表
    pub fn new() -> Self {
        Self {
            table: vec![DirectoryEntry::default(); NUM_DIR_ENTRIES],
        }
    }

    /// 从目录文件中整体读入
    pub fn fetch_from(&mut self, file: &OpenFile) {
        for (i, entry) in self.table.iter_mut().enumerate() {
            file.read_at(entry.as_bytes_mut(), i * DIRENT_SIZE);
        }
    }

    /// 整体写回目录文件
    pub fn write_back(&self, file: &OpenFile) {
        for (i, entry) in self.table.iter().enumerate() {
            file.write_at(entry.as_bytes(), i * DIRENT_SIZE);
        }
    }

    /// 填写第 0 项: 父目录扇区与本目录的完整路径
    pub fn init_self(
        &mut self,
        parent: u32,
        path: &str,
        names: &mut NameBlob,
        map: &mut BitMap,
    ) -> Result<()> {
        let (offset, len) = names.append(path, map)?;
        self.table[0] = DirectoryEntry::new(parent, true, offset, len);
        Ok(())
    }

    /// 父目录的文件头扇区, 根目录返回自己
    pub fn parent(&self) -> u32 {
        self.table[0].sector
    }

    /// 本目录的完整路径
    pub fn path(&self, names: &NameBlob) -> String {
        self.table[0].name(names)
    }

    fn find_index(&self, name: &str, names: &NameBlob) -> Option<usize> {
        self.table
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, entry)| {
                entry.in_use() && entry.name_len as usize == name.len() && entry.name(names) == name
            })
            .map(|(i, _)| i)
    }

    /// 名为 name 的表项
    pub fn entry(&self, name: &str, names: &NameBlob) -> Option<DirectoryEntry> {
        self.find_index(name, names).map(|i| self.table[i])
    }

    /// 名为 name 的文件的文件头扇区
    pub fn find(&self, name: &str, names: &NameBlob) -> Option<u32> {
        self.entry(name, names).map(|entry| entry.sector)
    }

    /// 文件头位于 sector 的表项的名字
    pub fn name_of(&self, sector: u32, names: &NameBlob) -> Option<String> {
        self.table
            .iter()
            .skip(1)
            .find(|entry| entry.in_use() && entry.sector == sector)
            .map(|entry| entry.name(names))
    }

    pub fn has_free_slot(&self) -> bool {
        self.table.iter().skip(1).any(|entry| !entry.in_use())
    }

    /// 除第 0 项外没有任何表项在使用
    pub fn is_empty(&self) -> bool {
        self.table.iter().skip(1).all(|entry| !entry.in_use())
    }

    /// 添加一个表项. 重名或表满时失败, 此时不会向名字文件写入任何内容
    pub fn add(
        &mut self,
        name: &str,
        sector: u32,
        is_dir: bool,
        names: &mut NameBlob,
        map: &mut BitMap,
    ) -> Result<()> {
        if self.find_index(name, names).is_some() {
            return Err(KernelError::DuplicateName(name.to_string()));
        }
        let slot = self
            .table
            .iter()
            .skip(1)
            .position(|entry| !entry.in_use())
            .map(|i| i + 1)
            .ok_or(KernelError::ExhaustedResource(Resource::DirectorySlots))?;
        let (offset, len) = names.append(name, map)?;
        self.table[slot] = DirectoryEntry::new(sector, is_dir, offset, len);
        debug!("directory: add {:?} -> sector {} (slot {})", name, sector, slot);
        Ok(())
    }

    /// 只把表项标记为未使用, 名字文件中的内容保持不变
    pub fn remove(&mut self, name: &str, names: &NameBlob) -> Result<()> {
        let i = self
            .find_index(name, names)
            .ok_or_else(|| KernelError::NotFound(name.to_string()))?;
        self.table[i].in_use = 0;
        Ok(())
    }

    /// 所有在用表项的名字
    pub fn list(&self, names: &NameBlob) -> Vec<String> {
        self.table
            .iter()
            .skip(1)
            .filter(|entry| entry.in_use())
            .map(|entry| entry.name(names))
            .collect()
    }

    pub fn print(&self, names: &NameBlob, disk: &SynchDisk) {
        println!("Directory {}:", self.path(names));
        for entry in self.table.iter().skip(1).filter(|entry| entry.in_use()) {
            println!(
                "Name: {}, Sector: {}{}",
                entry.name(names),
                entry.sector,
                if entry.is_dir() { " (directory)" } else { "" }
            );
            match FileHeader::fetch_from(entry.sector, disk) {
                Ok(hdr) => hdr.print(disk),
                Err(e) => println!("  {}", e),
            }
        }
        println!();
    }
}
