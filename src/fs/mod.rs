mod bitmap;
mod block_cache;
mod block_dev;
mod directory;
#[allow(clippy::module_inception)]
mod fs;
mod layout;
mod open_file;

extern crate log;

/// Use a sector size of 128 bytes
pub const SECTOR_SIZE: usize = 128;
/// 磁盘总扇区数 (32 磁道 * 32 扇区)
pub const NUM_SECTORS: usize = 1024;
/// 为了避免在块缓存上浪费过多内存，我们希望内存中同时只能驻留有限个扇区的缓冲区
pub const BLOCK_CACHE_SIZE: usize = 16;
/// Magic number for file header sanity check
pub const FILE_HEADER_MAGIC: u32 = 0x4e41_4348;
/// 文件头中直接索引的个数, 使 FileHeader 恰好占满一个扇区
pub const NUM_DIRECT: usize = 22;
/// 一个索引扇区能容纳的扇区号个数
pub const NUM_INDIRECT: usize = SECTOR_SIZE / 4;
/// The upper bound of direct sector index
pub const DIRECT_BOUND: usize = NUM_DIRECT;
/// The upper bound of indirect block A sector index
pub const INDIRECT_A_BOUND: usize = DIRECT_BOUND + NUM_INDIRECT;
/// The upper bound of indirect block B sector index, 也就是单个文件的扇区上限
pub const INDIRECT_B_BOUND: usize = INDIRECT_A_BOUND + NUM_INDIRECT;
/// 单个文件的最大字节数
pub const MAX_FILE_SIZE: usize = INDIRECT_B_BOUND * SECTOR_SIZE;
/// 每个目录表的表项数目 (第 0 项保留给目录自身)
pub const NUM_DIR_ENTRIES: usize = 10;
/// 目录项的大小
pub const DIRENT_SIZE: usize = 16;
/// 目录文件的大小
pub const DIRECTORY_FILE_SIZE: usize = NUM_DIR_ENTRIES * DIRENT_SIZE;
/// 空闲扇区位图文件的大小
pub const FREE_MAP_FILE_SIZE: usize = NUM_SECTORS / 8;

// 磁盘上的几个固定位置, 启动时通过它们找到整个文件系统
/// 空闲扇区位图的文件头
pub const FREE_MAP_SECTOR: u32 = 0;
/// 根目录的文件头
pub const DIRECTORY_SECTOR: u32 = 1;
/// 文件名文件的文件头
pub const NAME_SECTOR: u32 = 2;
/// 当前目录锚点的文件头
pub const CUR_DIR_SECTOR: u32 = 3;

pub use bitmap::BitMap;
pub use block_cache::{BlockCache, SynchDisk};
pub use block_dev::BlockDevice;
pub use directory::{DirectoryEntry, Directory, NameBlob};
pub use fs::FileSystem;
pub use layout::{FileHeader, FileType};
pub use open_file::OpenFile;
