//! 文件系统: 把空闲扇区表, 文件头和目录组合起来, 实现创建/打开/删除/切换目录
//!
//! 磁盘上有四个固定位置的文件头, 挂载时通过它们找到整个文件系统:
//!
//! - 0 号扇区: 空闲扇区位图文件
//! - 1 号扇区: 根目录文件
//! - 2 号扇区: 名字文件
//! - 3 号扇区: 当前目录锚点, 它的 self_sector 字段记录当前目录的文件头扇区
//!
//! 所有修改型操作都遵循同一个模式: 先把位图和目录读入内存, 在内存中修改,
//! 全部步骤成功后才依次写回文件头, 目录, 名字文件和位图. 中途失败时内存中的副本直接丢弃.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};

use super::{
    BitMap, Directory, FileHeader, FileType, NameBlob, OpenFile, SynchDisk, CUR_DIR_SECTOR,
    DIRECTORY_FILE_SIZE, DIRECTORY_SECTOR, FREE_MAP_FILE_SIZE, FREE_MAP_SECTOR, NAME_SECTOR,
    NUM_SECTORS,
};
use crate::error::{KernelError, Resource, Result};

/// 根目录的路径
const ROOT_PATH: &str = "root";

pub struct FileSystem {
    disk: Arc<SynchDisk>,
    /// 空闲扇区位图文件, 在文件系统的整个生命周期内保持打开
    free_map_file: OpenFile,
    /// 当前目录的文件头扇区
    cwd: u32,
}

/// 当前时间, 以秒为单位
fn now() -> u32 {
    Utc::now().timestamp() as u32
}

impl FileSystem {
    /// 在磁盘上建立一个全新的文件系统, 只包含空的根目录
    pub fn format(disk: Arc<SynchDisk>) -> Result<Self> {
        info!("formatting disk ({} sectors)", disk.num_sectors());
        let mut map = BitMap::new(NUM_SECTORS);
        for sector in [FREE_MAP_SECTOR, DIRECTORY_SECTOR, NAME_SECTOR, CUR_DIR_SECTOR] {
            map.mark(sector);
        }

        let time = now();
        let mut map_hdr = FileHeader::new(FileType::Unknown);
        map_hdr.allocate(&mut map, FREE_MAP_FILE_SIZE, &disk)?;
        let mut dir_hdr = FileHeader::new(FileType::Directory);
        dir_hdr.allocate(&mut map, DIRECTORY_FILE_SIZE, &disk)?;
        let mut name_hdr = FileHeader::new(FileType::Text);
        name_hdr.allocate(&mut map, 0, &disk)?;
        // 锚点本身没有数据, self_sector 指向当前目录
        let mut anchor = FileHeader::new(FileType::Unknown);
        anchor.allocate(&mut map, 0, &disk)?;
        anchor.set_self_sector(DIRECTORY_SECTOR);

        for (sector, hdr) in [
            (FREE_MAP_SECTOR, &mut map_hdr),
            (DIRECTORY_SECTOR, &mut dir_hdr),
            (NAME_SECTOR, &mut name_hdr),
        ] {
            hdr.set_self_sector(sector);
            hdr.stamp(time);
            hdr.write_back(sector, &disk);
        }
        anchor.stamp(time);
        anchor.write_back(CUR_DIR_SECTOR, &disk);

        let free_map_file = OpenFile::open(FREE_MAP_SECTOR, &disk)?;
        let dir_file = OpenFile::open(DIRECTORY_SECTOR, &disk)?;
        let mut names = NameBlob::open(&disk)?;
        let mut root = Directory::new();
        root.init_self(DIRECTORY_SECTOR, ROOT_PATH, &mut names, &mut map)?;

        root.write_back(&dir_file);
        names.write_back();
        map.write_back(&free_map_file);
        drop(dir_file);
        disk.sync_all();
        debug!("format done, {} sectors free", map.num_clear());

        Ok(Self {
            disk,
            free_map_file,
            cwd: DIRECTORY_SECTOR,
        })
    }

    /// 挂载一个已经格式化过的磁盘, 当前目录从锚点恢复
    pub fn mount(disk: Arc<SynchDisk>) -> Result<Self> {
        let free_map_file = OpenFile::open(FREE_MAP_SECTOR, &disk)?;
        let anchor = FileHeader::fetch_from(CUR_DIR_SECTOR, &disk)?;
        let cwd = anchor.self_sector();
        // 锚点指向的必须是一个合法的目录文件头
        let cwd_hdr = FileHeader::fetch_from(cwd, &disk)?;
        if !cwd_hdr.is_dir() {
            warn!("anchor points at non-directory sector {}", cwd);
            return Err(KernelError::NotADirectory(format!("sector {}", cwd)));
        }
        info!("mounted disk, current directory at sector {}", cwd);
        Ok(Self {
            disk,
            free_map_file,
            cwd,
        })
    }

    pub fn disk(&self) -> &Arc<SynchDisk> {
        &self.disk
    }

    /// 当前目录的文件头扇区
    pub fn cwd(&self) -> u32 {
        self.cwd
    }

    fn load_map(&self) -> BitMap {
        let mut map = BitMap::new(NUM_SECTORS);
        map.fetch_from(&self.free_map_file);
        map
    }

    fn load_dir(&self, sector: u32) -> Result<(OpenFile, Directory)> {
        let file = OpenFile::open(sector, &self.disk)?;
        let mut dir = Directory::new();
        dir.fetch_from(&file);
        Ok((file, dir))
    }

    pub fn create(&mut self, name: &str, size: usize) -> Result<()> {
        self.create_node(name, size, false)
    }

    /// 创建子目录. 目录文件至少要能放下一整张目录表
    pub fn create_dir(&mut self, name: &str, size: usize) -> Result<()> {
        self.create_node(name, size.max(DIRECTORY_FILE_SIZE), true)
    }

    fn create_node(&mut self, name: &str, size: usize, is_dir: bool) -> Result<()> {
        let (dir_file, mut dir) = self.load_dir(self.cwd)?;
        let mut names = NameBlob::open(&self.disk)?;

        // 依次检查: 重名, 文件头扇区, 目录表项, 数据扇区
        if dir.find(name, &names).is_some() {
            debug!("create {:?}: duplicate name", name);
            return Err(KernelError::DuplicateName(name.to_string()));
        }
        let mut map = self.load_map();
        let sector = map
            .find()
            .ok_or(KernelError::ExhaustedResource(Resource::Sectors))?;
        if !dir.has_free_slot() {
            debug!("create {:?}: directory full", name);
            return Err(KernelError::ExhaustedResource(Resource::DirectorySlots));
        }
        let file_type = if is_dir {
            FileType::Directory
        } else {
            FileType::from_name(name)
        };
        let mut hdr = FileHeader::new(file_type);
        hdr.allocate(&mut map, size, &self.disk)?;
        hdr.set_self_sector(sector);
        hdr.stamp(now());
        dir.add(name, sector, is_dir, &mut names, &mut map)?;

        // 子目录还需要一张新的目录表, 第 0 项记录父目录与完整路径
        let sub = if is_dir {
            let path = format!("{}/{}", dir.path(&names), name);
            let mut sub = Directory::new();
            sub.init_self(self.cwd, &path, &mut names, &mut map)?;
            Some(sub)
        } else {
            None
        };

        // 全部成功, 开始写回
        hdr.write_back(sector, &self.disk);
        if let Some(sub) = sub {
            let sub_file = OpenFile::open(sector, &self.disk)?;
            sub.write_back(&sub_file);
        }
        dir.write_back(&dir_file);
        names.write_back();
        map.write_back(&self.free_map_file);
        self.disk.sync_all();
        info!(
            "created {} {:?} at sector {} ({} bytes)",
            if is_dir { "directory" } else { "file" },
            name,
            sector,
            size
        );
        Ok(())
    }

    /// 在当前目录中查找并打开文件, 不修改任何状态
    pub fn open(&self, name: &str) -> Result<OpenFile> {
        let (_, dir) = self.load_dir(self.cwd)?;
        let names = NameBlob::open(&self.disk)?;
        let sector = dir
            .find(name, &names)
            .ok_or_else(|| KernelError::NotFound(name.to_string()))?;
        OpenFile::open(sector, &self.disk)
    }

    /// 删除当前目录中的文件或空目录. 文件仍被打开时拒绝删除
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let (dir_file, mut dir) = self.load_dir(self.cwd)?;
        let names = NameBlob::open(&self.disk)?;
        let entry = dir
            .entry(name, &names)
            .ok_or_else(|| KernelError::NotFound(name.to_string()))?;
        let sector = entry.sector();

        let open = self.disk.open_count(sector);
        if open > 0 {
            warn!("remove {:?}: {} open handle(s)", name, open);
            return Err(KernelError::Busy { sector, open });
        }
        if entry.is_dir() {
            let (_, sub) = self.load_dir(sector)?;
            if !sub.is_empty() {
                return Err(KernelError::DirectoryNotEmpty(name.to_string()));
            }
        }

        let mut hdr = FileHeader::fetch_from(sector, &self.disk)?;
        let mut map = self.load_map();
        hdr.deallocate(&mut map, &self.disk);
        map.clear(sector);
        dir.remove(name, &names)?;

        dir.write_back(&dir_file);
        map.write_back(&self.free_map_file);
        self.disk.sync_all();
        info!("removed {:?} (sector {})", name, sector);
        Ok(())
    }

    /// 切换当前目录, ".." 回到父目录. 新的当前目录写入锚点, 重新挂载后仍然有效
    pub fn change(&mut self, name: &str) -> Result<()> {
        let (_, dir) = self.load_dir(self.cwd)?;
        let names = NameBlob::open(&self.disk)?;
        let target = if name == ".." {
            dir.parent()
        } else {
            let entry = dir
                .entry(name, &names)
                .ok_or_else(|| KernelError::NotFound(name.to_string()))?;
            if !entry.is_dir() {
                return Err(KernelError::NotADirectory(name.to_string()));
            }
            entry.sector()
        };

        let mut anchor = FileHeader::fetch_from(CUR_DIR_SECTOR, &self.disk)?;
        anchor.set_self_sector(target);
        anchor.touch_modified(now());
        anchor.write_back(CUR_DIR_SECTOR, &self.disk);
        self.disk.sync_all();
        debug!("change directory: sector {} -> {}", self.cwd, target);
        self.cwd = target;
        Ok(())
    }

    /// 当前目录下所有文件名
    pub fn list(&self) -> Result<Vec<String>> {
        let (_, dir) = self.load_dir(self.cwd)?;
        let names = NameBlob::open(&self.disk)?;
        Ok(dir.list(&names))
    }

    /// 当前目录的完整路径
    pub fn current_path(&self) -> Result<String> {
        let (_, dir) = self.load_dir(self.cwd)?;
        let names = NameBlob::open(&self.disk)?;
        Ok(dir.path(&names))
    }

    /// 从当前位置写入, 超出文件末尾时先通过空闲扇区表扩充文件
    pub fn write(&self, file: &mut OpenFile, buf: &[u8]) -> Result<usize> {
        // 扩充必须基于磁盘上最新的文件头, 否则会覆盖其他句柄的扩充
        file.refresh_header()?;
        let end = file.position() + buf.len();
        if end > file.length() {
            let mut map = self.load_map();
            let extra = end - file.length();
            let disk = Arc::clone(file.disk());
            file.header_mut().extend(&mut map, extra, &disk)?;
            map.write_back(&self.free_map_file);
        }
        file.header_mut().touch_modified(now());
        file.write_back_header();
        let n = file.write(buf);
        self.disk.sync_all();
        Ok(n)
    }

    pub fn num_free_sectors(&self) -> usize {
        self.load_map().num_clear()
    }

    /// 打印位图, 当前目录以及其中每个文件的内容
    pub fn print(&self) -> Result<()> {
        println!("Bit map file header:");
        self.free_map_file.header().print(&self.disk);
        println!("Directory file header:");
        let (dir_file, dir) = self.load_dir(self.cwd)?;
        dir_file.header().print(&self.disk);
        self.load_map().print();
        let names = NameBlob::open(&self.disk)?;
        dir.print(&names, &self.disk);
        Ok(())
    }
}
