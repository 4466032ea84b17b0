//! 位图: 每个 bit 代表一个扇区 (或一个物理页框) 的分配状态,
//! 0 意味着未分配, 而 1 则意味着已经分配出去
//!
//! 位图所要做的事情是通过基于 bit 为单位的分配(寻找一个为 0 的 bit 位并设置为 1)
//! 和回收(将bit位清零)来进行扇区/页框的分配和回收.
//!
//! 作为空闲扇区表时, 位图本身作为一个普通文件保存在磁盘上 (文件头位于 0 号扇区),
//! 通过 [`BitMap::fetch_from`] / [`BitMap::write_back`] 整体读写.

use log::trace;

use super::OpenFile;

/// 每 64 bits 构成一组, 以组为单位查找空闲位
type BitGroup = u64;

const GROUP_BITS: usize = BitGroup::BITS as usize;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BitMap {
    map: Vec<BitGroup>,
    num_bits: usize,
}

impl BitMap {
    /// 创建一个全部空闲的位图
    pub fn new(num_bits: usize) -> Self {
        Self {
            map: vec![0; (num_bits + GROUP_BITS - 1) / GROUP_BITS],
            num_bits,
        }
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// 分配一个 bit
    ///
    /// 以 bit 组为单位进行遍历, 找到一个尚未被全部分配出去的组,
    /// 再通过 u64::trailing_ones 找到最低的一个 0 的位置.
    /// 因此总是返回编号最小的空闲位 (first-fit).
    ///
    /// 如果所有bit均已经被分配出去了, 则返回 None .
    pub fn find(&mut self) -> Option<u32> {
        let (group_pos, inner_pos) = self
            .map
            .iter()
            .enumerate()
            .find(|(_, group)| **group != BitGroup::MAX)
            .map(|(group_pos, group)| (group_pos, group.trailing_ones() as usize))?;
        let bit = group_pos * GROUP_BITS + inner_pos;
        // 最后一组中超出 num_bits 的部分不可分配
        if bit >= self.num_bits {
            return None;
        }
        self.map[group_pos] |= 1 << inner_pos;
        trace!("bitmap: find -> {}", bit);
        Some(bit as u32)
    }

    pub fn mark(&mut self, bit: u32) {
        let (group_pos, inner_pos) = self.decomposition(bit);
        self.map[group_pos] |= 1 << inner_pos;
    }

    /// 回收一个 bit, 回收未分配的 bit 说明上层的数据结构已经损坏
    pub fn clear(&mut self, bit: u32) {
        let (group_pos, inner_pos) = self.decomposition(bit);
        assert!(
            self.map[group_pos] & (1 << inner_pos) != 0,
            "bit {} is already clear",
            bit
        );
        self.map[group_pos] &= !(1 << inner_pos);
    }

    pub fn test(&self, bit: u32) -> bool {
        let (group_pos, inner_pos) = self.decomposition(bit);
        self.map[group_pos] & (1 << inner_pos) != 0
    }

    pub fn num_clear(&self) -> usize {
        let used: usize = self.map.iter().map(|group| group.count_ones() as usize).sum();
        self.num_bits - used
    }

    /// 从位图文件中整体读入
    pub fn fetch_from(&mut self, file: &OpenFile) {
        let mut bytes = vec![0u8; self.num_bytes()];
        file.read_at(&mut bytes, 0);
        for (group, chunk) in self.map.iter_mut().zip(bytes.chunks(8)) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            *group = BitGroup::from_le_bytes(word);
        }
    }

    /// 整体写回位图文件. bit i 落在第 i / 8 个字节的第 i % 8 位
    pub fn write_back(&self, file: &OpenFile) {
        let mut bytes: Vec<u8> = self
            .map
            .iter()
            .flat_map(|group| group.to_le_bytes())
            .collect();
        bytes.truncate(self.num_bytes());
        file.write_at(&bytes, 0);
    }

    /// 打印所有已分配的 bit
    pub fn print(&self) {
        let used: Vec<String> = (0..self.num_bits as u32)
            .filter(|bit| self.test(*bit))
            .map(|bit| bit.to_string())
            .collect();
        println!("Bitmap set:\n{}", used.join(", "));
    }

    fn num_bytes(&self) -> usize {
        (self.num_bits + 7) / 8
    }

    /// 将 bit 编号分解为组编号 group_pos 以及组内编号 inner_pos
    fn decomposition(&self, bit: u32) -> (usize, usize) {
        let bit = bit as usize;
        assert!(bit < self.num_bits, "bit {} out of range", bit);
        (bit / GROUP_BITS, bit % GROUP_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_is_first_fit() {
        let mut map = BitMap::new(100);
        assert_eq!(map.find(), Some(0));
        assert_eq!(map.find(), Some(1));
        map.mark(2);
        assert_eq!(map.find(), Some(3));
        map.clear(1);
        assert_eq!(map.find(), Some(1));
        assert_eq!(map.num_clear(), 96);
    }

    #[test]
    fn find_stops_at_num_bits() {
        let mut map = BitMap::new(70);
        for expect in 0..70 {
            assert_eq!(map.find(), Some(expect));
        }
        assert_eq!(map.find(), None);
        assert_eq!(map.num_clear(), 0);
    }

    #[test]
    #[should_panic]
    fn clear_twice_panics() {
        let mut map = BitMap::new(8);
        map.mark(3);
        map.clear(3);
        map.clear(3);
    }
}
