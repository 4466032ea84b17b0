//! 固定容量的 TLB, 按 LRU 替换
//!
//! TLB 中只保存当前地址空间的表项, 切换地址空间时整体清空.
//! 表项上的 use/dirty 位只在 TLB 中更新, 表项被替换, 失效或清空时由调用者合并回页表.

use log::trace;

use super::RecencyList;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    pub virtual_page: usize,
    pub physical_frame: usize,
    pub dirty: bool,
    pub use_: bool,
    pub read_only: bool,
}

pub struct Tlb {
    entries: Vec<TlbEntry>,
    capacity: usize,
    recency: RecencyList<usize>,
}

impl Tlb {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "TLB needs at least one entry");
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            recency: RecencyList::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 命中时把表项标记为最近使用
    pub fn lookup(&mut self, vpn: usize) -> Option<&mut TlbEntry> {
        let entry = self.entries.iter_mut().find(|e| e.virtual_page == vpn)?;
        self.recency.touch(vpn);
        Some(entry)
    }

    /// 不影响替换顺序的查询
    pub fn get(&self, vpn: usize) -> Option<&TlbEntry> {
        self.entries.iter().find(|e| e.virtual_page == vpn)
    }

    /// 装入一个表项. TLB 已满时替换最久未使用的表项并将其返回
    pub fn insert(&mut self, entry: TlbEntry) -> Option<TlbEntry> {
        let evicted = if self.get(entry.virtual_page).is_some() {
            self.invalidate(entry.virtual_page)
        } else if self.entries.len() == self.capacity {
            match self.recency.least_recent() {
                Some(victim) => {
                    trace!("tlb: replace vpn {} with vpn {}", victim, entry.virtual_page);
                    self.invalidate(victim)
                }
                None => None,
            }
        } else {
            None
        };
        self.entries.push(entry);
        self.recency.touch(entry.virtual_page);
        evicted
    }

    /// 使 vpn 的表项失效, 返回被移除的表项以便合并 use/dirty 位
    pub fn invalidate(&mut self, vpn: usize) -> Option<TlbEntry> {
        let i = self.entries.iter().position(|e| e.virtual_page == vpn)?;
        self.recency.remove(vpn);
        Some(self.entries.swap_remove(i))
    }

    /// 清空 TLB, 返回所有表项
    pub fn flush(&mut self) -> Vec<TlbEntry> {
        self.recency.clear();
        std::mem::take(&mut self.entries)
    }

    /// 按最久未使用到最近使用的顺序列出虚页号
    pub fn lru_order(&self) -> Vec<usize> {
        self.recency.iter().copied().collect()
    }
}
