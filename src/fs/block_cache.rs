//! 块缓存层: 在内存中缓存扇区的数据, 避免频繁读写磁盘
//!
//! 先通过 read_block 将一个扇区上的数据从磁盘读到内存中的一个缓冲区 [`BlockCache`] 中,
//! 后续对这个扇区的大部分访问就可以在内存中完成了.
//! 如果缓冲区中的内容被修改了, 那么后续还需要通过 write_block 将缓冲区中的内容写回到扇区中.
//!
//! 缓冲区统一由 [`BlockCacheManager`] 管理. 与全局单例不同, 这里每个 [`SynchDisk`]
//! 持有自己的管理器, 因此同时挂载多个设备时不会因为扇区号相同而互相串扰.
//!
//! [`SynchDisk`] 同时记录每个扇区上打开的文件句柄个数, 删除文件时以此判断文件是否仍在使用.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use log::trace;
use spin::Mutex;

use super::{BlockDevice, BLOCK_CACHE_SIZE, SECTOR_SIZE};

/// 缓冲区按 8 字节对齐, 使得磁盘上数据结构 (u32/u64 数组) 可以直接在缓冲区上解析
#[repr(C, align(8))]
struct SectorBuf([u8; SECTOR_SIZE]);

/// 一个扇区在内存中的副本
pub struct BlockCache {
    cache: SectorBuf,
    sector: usize,
    device: Arc<dyn BlockDevice>,
    /// 载入之后是否被改写过, 决定回收时要不要写回
    dirty: bool,
}

impl BlockCache {
    /// 从设备读入扇区 sector
    pub fn new(sector: usize, device: Arc<dyn BlockDevice>) -> Self {
        let mut cache = SectorBuf([0u8; SECTOR_SIZE]);
        device.read_block(sector, &mut cache.0);
        Self {
            cache,
            sector,
            device,
            dirty: false,
        }
    }

    /// 扇区内 offset 处的地址, T 必须整个落在扇区内并且满足对齐
    fn checked_ptr<T: Sized>(&self, offset: usize) -> *const u8 {
        assert!(
            offset + std::mem::size_of::<T>() <= SECTOR_SIZE,
            "sector {}: {} bytes at offset {} overflow",
            self.sector,
            std::mem::size_of::<T>(),
            offset
        );
        let ptr = self.cache.0[offset..].as_ptr();
        assert_eq!(ptr as usize % std::mem::align_of::<T>(), 0, "misaligned on-disk structure");
        ptr
    }

    /// 把 offset 处的字节解释为磁盘上的结构 T
    pub fn get_ref<T: Sized>(&self, offset: usize) -> &T {
        let ptr = self.checked_ptr::<T>(offset);
        unsafe { &*(ptr as *const T) }
    }

    /// 可变版本, 同时把缓冲区标记为脏
    pub fn get_mut<T: Sized>(&mut self, offset: usize) -> &mut T {
        let ptr = self.checked_ptr::<T>(offset) as *mut u8;
        self.dirty = true;
        unsafe { &mut *(ptr as *mut T) }
    }

    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    /// 脏缓冲区写回设备
    pub fn sync(&mut self) {
        if self.dirty {
            trace!("block cache: write back sector {}", self.sector);
            self.device.write_block(self.sector, &self.cache.0);
            self.dirty = false;
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.sync();
    }
}

/// 至多缓存 [`BLOCK_CACHE_SIZE`] 个扇区, 按载入顺序 (FIFO) 替换.
/// 仍被外部持有的缓冲区不会被替换.
pub struct BlockCacheManager {
    /// (扇区号, 缓冲区), 最早载入的在队头
    queue: VecDeque<(usize, Arc<Mutex<BlockCache>>)>,
}

impl BlockCacheManager {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// 命中直接返回, 否则从设备读入, 队列满时先替换
    pub fn get_block_cache(
        &mut self,
        sector: usize,
        device: &Arc<dyn BlockDevice>,
    ) -> Arc<Mutex<BlockCache>> {
        if let Some((_, cache)) = self.queue.iter().find(|(s, _)| *s == sector) {
            return Arc::clone(cache);
        }
        if self.queue.len() == BLOCK_CACHE_SIZE {
            // 强引用计数为 1 说明只有队列本身持有
            let victim = self
                .queue
                .iter()
                .position(|(_, cache)| Arc::strong_count(cache) == 1);
            match victim {
                Some(idx) => {
                    // 被移出队列的缓冲区在 drop 时写回
                    self.queue.remove(idx);
                }
                None => panic!("all {} cached sectors are in use", BLOCK_CACHE_SIZE),
            }
        }
        let cache = Arc::new(Mutex::new(BlockCache::new(sector, Arc::clone(device))));
        self.queue.push_back((sector, Arc::clone(&cache)));
        cache
    }

    pub fn sync_all(&self) {
        self.queue.iter().for_each(|(_, cache)| cache.lock().sync());
    }
}

impl Default for BlockCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 同步磁盘: 块设备 + 块缓存 + 打开计数
///
/// 上层的所有数据结构 (位图, 文件头, 目录, 文件内容) 都通过它访问扇区.
pub struct SynchDisk {
    block_device: Arc<dyn BlockDevice>,
    cache_manager: Mutex<BlockCacheManager>,
    /// 每个文件头扇区上仍然打开着的句柄数
    open_count: Mutex<BTreeMap<u32, usize>>,
}

impl SynchDisk {
    pub fn new(block_device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            block_device,
            cache_manager: Mutex::new(BlockCacheManager::new()),
            open_count: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn num_sectors(&self) -> usize {
        self.block_device.num_sectors()
    }

    /// 调用者需要通过 .lock() 获取里层互斥锁才能对 BlockCache 进行操作.
    ///
    /// 注意: 持有某个块缓存的锁时不要调用 [`SynchDisk::sync_all`].
    pub fn get_block_cache(&self, sector: usize) -> Arc<Mutex<BlockCache>> {
        assert!(
            sector < self.num_sectors(),
            "sector {} out of range",
            sector
        );
        self.cache_manager
            .lock()
            .get_block_cache(sector, &self.block_device)
    }

    /// 整扇区读取
    pub fn read_sector(&self, sector: u32, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        self.get_block_cache(sector as usize)
            .lock()
            .read(0, |data: &[u8; SECTOR_SIZE]| buf.copy_from_slice(data));
    }

    /// 整扇区写入 (写到缓存中, 之后由替换或 sync_all 落盘)
    pub fn write_sector(&self, sector: u32, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        self.get_block_cache(sector as usize)
            .lock()
            .modify(0, |data: &mut [u8; SECTOR_SIZE]| data.copy_from_slice(buf));
    }

    pub fn sync_all(&self) {
        self.cache_manager.lock().sync_all();
    }

    pub(crate) fn inc_open(&self, sector: u32) {
        *self.open_count.lock().entry(sector).or_insert(0) += 1;
    }

    pub(crate) fn dec_open(&self, sector: u32) {
        let mut counts = self.open_count.lock();
        if let Some(count) = counts.get_mut(&sector) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&sector);
            }
        }
    }

    /// 扇区 sector 上打开的句柄数
    pub fn open_count(&self, sector: u32) -> usize {
        self.open_count.lock().get(&sector).copied().unwrap_or(0)
    }
}
