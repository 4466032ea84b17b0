//! 最近使用顺序表: 队头是最久未使用的元素, 队尾是最近使用的元素
//!
//! 物理页框的全局置换和 TLB 的表项替换都用它来选出牺牲者.

use std::collections::VecDeque;

#[derive(Clone, Debug, Default)]
pub struct RecencyList<T> {
    order: VecDeque<T>,
}

impl<T: PartialEq + Copy> RecencyList<T> {
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
        }
    }

    /// 把 key 移到队尾 (最近使用), 不在表中时直接加入
    pub fn touch(&mut self, key: T) {
        self.remove(key);
        self.order.push_back(key);
    }

    pub fn remove(&mut self, key: T) -> bool {
        match self.order.iter().position(|k| *k == key) {
            Some(i) => {
                self.order.remove(i);
                true
            }
            None => false,
        }
    }

    /// 最久未使用的元素
    pub fn least_recent(&self) -> Option<T> {
        self.order.front().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }

    /// 从最久未使用到最近使用
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_moves_to_back() {
        let mut list = RecencyList::new();
        for k in 0..4 {
            list.touch(k);
        }
        assert_eq!(list.least_recent(), Some(0));
        list.touch(0);
        assert_eq!(list.least_recent(), Some(1));
        assert!(list.remove(1));
        assert!(!list.remove(1));
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![2, 3, 0]);
        assert_eq!(list.len(), 3);
    }
}
