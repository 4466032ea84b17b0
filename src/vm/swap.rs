//! 交换区: 保存被淘汰页面的内容, 以 (线程, 虚页号) 为键
//!
//! 同一个键最多对应一个槽位. 页面被重新载入后槽位仍然保留, 直到所属线程退出时
//! 才由 [`SwapArea::release`] 统一回收, 回收后剩余槽位保持原有顺序且没有空洞.
//!
//! 交换区没有容量上限, 因此任何被占用的页框总能被淘汰, 缺页不会因为交换区满而失败.

use log::{debug, trace};

use super::PAGE_SIZE;
use crate::error::ThreadId;

#[derive(Clone)]
pub struct SwapSlot {
    pub owner: ThreadId,
    pub vpn: usize,
    pub page: [u8; PAGE_SIZE],
}

pub struct SwapArea {
    slots: Vec<SwapSlot>,
}

impl SwapArea {
    /// reserve 只是预先分配的槽位数, 超过后继续增长
    pub fn new(reserve: usize) -> Self {
        Self {
            slots: Vec::with_capacity(reserve),
        }
    }

    /// 写入 (owner, vpn) 的页面内容: 已有槽位就覆盖, 否则追加一个新槽位
    pub fn stage(&mut self, owner: ThreadId, vpn: usize, page: &[u8]) {
        assert_eq!(page.len(), PAGE_SIZE);
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.owner == owner && slot.vpn == vpn)
        {
            trace!("swap: overwrite slot of thread {} vpn {}", owner, vpn);
            slot.page.copy_from_slice(page);
            return;
        }
        let mut slot = SwapSlot {
            owner,
            vpn,
            page: [0; PAGE_SIZE],
        };
        slot.page.copy_from_slice(page);
        self.slots.push(slot);
        trace!("swap: new slot {} for thread {} vpn {}", self.slots.len() - 1, owner, vpn);
    }

    pub fn find(&self, owner: ThreadId, vpn: usize) -> Option<&SwapSlot> {
        self.slots
            .iter()
            .find(|slot| slot.owner == owner && slot.vpn == vpn)
    }

    /// 回收 owner 的所有槽位, 返回回收的个数
    pub fn release(&mut self, owner: ThreadId) -> usize {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.owner != owner);
        let released = before - self.slots.len();
        debug!("swap: released {} slot(s) of thread {}", released, owner);
        released
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[SwapSlot] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_reuses_slot_for_same_key() {
        let mut swap = SwapArea::new(4);
        swap.stage(1, 3, &[1u8; PAGE_SIZE]);
        swap.stage(1, 3, &[2u8; PAGE_SIZE]);
        assert_eq!(swap.len(), 1);
        assert_eq!(swap.find(1, 3).unwrap().page, [2u8; PAGE_SIZE]);
        assert!(swap.find(2, 3).is_none());
    }

    #[test]
    fn release_compacts_in_order() {
        let mut swap = SwapArea::new(8);
        for (owner, vpn) in [(1, 0), (2, 0), (1, 1), (3, 5), (1, 2), (2, 4)] {
            swap.stage(owner, vpn, &[vpn as u8; PAGE_SIZE]);
        }
        assert_eq!(swap.release(1), 3);
        let keys: Vec<_> = swap.slots().iter().map(|s| (s.owner, s.vpn)).collect();
        assert_eq!(keys, vec![(2, 0), (3, 5), (2, 4)]);
    }

    #[test]
    fn grows_past_reserve() {
        let mut swap = SwapArea::new(1);
        for vpn in 0..5 {
            swap.stage(1, vpn, &[vpn as u8; PAGE_SIZE]);
        }
        assert_eq!(swap.len(), 5);
        assert_eq!(swap.find(1, 4).unwrap().page, [4u8; PAGE_SIZE]);
    }
}
