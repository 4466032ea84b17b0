//! 虚拟内存管理器: 物理内存, 页框分配, 页面置换, 交换区与 TLB 的唯一拥有者
//!
//! 访存流程: 先查 TLB; 未命中时查当前地址空间的页表, 页面未映射则缺页,
//! 由 [`VirtualMemoryManager::handle_page_fault`] 载入后再填入 TLB.
//!
//! 缺页处理:
//!
//! 1. 有空闲页框时直接取编号最小的一个
//! 2. 否则淘汰全局最久未使用的页框: 解除其所有者的映射 (同时使 TLB 表项失效),
//!    脏页写回所有者的可执行文件, 页面内容存入交换区
//! 3. 交换区中有当前线程该虚页的槽位就从槽位复制, 否则从可执行文件读入
//! 4. 填写页表项, 记录页框的所有者

use std::collections::HashMap;

use log::{debug, info, trace};

use super::{AddressSpace, RecencyList, SwapArea, Tlb, TlbEntry, VmConfig, PAGE_SIZE};
use crate::error::{KernelError, Resource, Result, ThreadId};
use crate::fs::{BitMap, FileSystem, OpenFile};

/// 运行统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub page_faults: u64,
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    /// 被淘汰的页面数
    pub evictions: u64,
    /// 写回可执行文件的脏页数
    pub dirty_writebacks: u64,
    /// 从交换区恢复的页面数
    pub swap_ins: u64,
}

pub struct VirtualMemoryManager {
    config: VmConfig,
    main_memory: Vec<u8>,
    /// 全局页框分配表
    frame_map: BitMap,
    /// 每个页框属于哪个线程
    frame_owner: Vec<Option<ThreadId>>,
    /// 页框的使用顺序, 淘汰时选队头
    frame_recency: RecencyList<usize>,
    swap: SwapArea,
    tlb: Tlb,
    spaces: HashMap<ThreadId, AddressSpace>,
    current: Option<ThreadId>,
    stats: Statistics,
}

impl VirtualMemoryManager {
    pub fn new(config: VmConfig) -> Self {
        info!(
            "vm: {} frames, {} tlb entries, {} swap slots reserved",
            config.num_phys_pages, config.tlb_size, config.swap_slots
        );
        Self {
            config,
            main_memory: vec![0; config.num_phys_pages * PAGE_SIZE],
            frame_map: BitMap::new(config.num_phys_pages),
            frame_owner: vec![None; config.num_phys_pages],
            frame_recency: RecencyList::new(),
            swap: SwapArea::new(config.swap_slots),
            tlb: Tlb::new(config.tlb_size),
            spaces: HashMap::new(),
            current: None,
            stats: Statistics::default(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// 为线程 tid 建立地址空间. tid 已有地址空间时先释放旧的
    pub fn spawn(&mut self, tid: ThreadId, name: &str, executable: OpenFile) -> Result<()> {
        let space = AddressSpace::new(tid, name, executable, &self.config)?;
        if self.spaces.contains_key(&tid) {
            self.clear_map(tid)?;
        }
        self.spaces.insert(tid, space);
        Ok(())
    }

    /// 打开可执行文件 name, 为 tid 建立地址空间并切换过去
    pub fn exec(&mut self, fs: &FileSystem, tid: ThreadId, name: &str) -> Result<()> {
        let executable = fs.open(name)?;
        self.spawn(tid, name, executable)?;
        self.switch_to(tid)
    }

    /// 切换当前地址空间, TLB 清空前把 use/dirty 位合并回原来的页表
    pub fn switch_to(&mut self, tid: ThreadId) -> Result<()> {
        if !self.spaces.contains_key(&tid) {
            return Err(KernelError::NoAddressSpace(tid));
        }
        if self.current == Some(tid) {
            return Ok(());
        }
        self.flush_tlb();
        trace!("vm: switch to thread {}", tid);
        self.current = Some(tid);
        Ok(())
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    fn flush_tlb(&mut self) {
        let entries = self.tlb.flush();
        if let Some(space) = self.current.and_then(|tid| self.spaces.get_mut(&tid)) {
            for entry in entries.iter() {
                space.merge_tlb(entry);
            }
        }
    }

    /// 把虚拟地址翻译为物理地址, 必要时填充 TLB 或处理缺页.
    ///
    /// size 为访问宽度, 地址必须按 size 对齐.
    pub fn translate(&mut self, vaddr: u32, size: usize, writing: bool) -> Result<usize> {
        let tid = self.current.ok_or(KernelError::NoActiveSpace)?;
        if size == 0 || vaddr as usize % size != 0 {
            return Err(KernelError::AddressError(vaddr));
        }
        let vpn = vaddr as usize / PAGE_SIZE;
        let offset = vaddr as usize % PAGE_SIZE;
        let num_pages = self
            .spaces
            .get(&tid)
            .ok_or(KernelError::NoAddressSpace(tid))?
            .num_pages();
        if vpn >= num_pages {
            debug!("vm: thread {} address {:#x} out of range", tid, vaddr);
            return Err(KernelError::AddressError(vaddr));
        }

        if self.tlb.get(vpn).is_some() {
            self.stats.tlb_hits += 1;
        } else {
            self.stats.tlb_misses += 1;
            self.refill_tlb(tid, vpn)?;
        }
        let entry = self
            .tlb
            .lookup(vpn)
            .ok_or(KernelError::AddressError(vaddr))?;
        if writing && entry.read_only {
            return Err(KernelError::ReadOnly(vaddr));
        }
        entry.use_ = true;
        if writing {
            entry.dirty = true;
        }
        let frame = entry.physical_frame;
        self.frame_recency.touch(frame);
        Ok(frame * PAGE_SIZE + offset)
    }

    /// TLB 未命中: 查页表, 页面未映射时先缺页, 再装入 TLB
    fn refill_tlb(&mut self, tid: ThreadId, vpn: usize) -> Result<()> {
        let mapped = self
            .spaces
            .get(&tid)
            .map_or(false, |space| space.pte(vpn).valid);
        if !mapped {
            self.handle_page_fault(vpn)?;
        }
        let space = self
            .spaces
            .get_mut(&tid)
            .ok_or(KernelError::NoAddressSpace(tid))?;
        let entry: TlbEntry = space
            .tlb_entry(vpn)
            .ok_or(KernelError::ExhaustedResource(Resource::Frames))?;
        if let Some(evicted) = self.tlb.insert(entry) {
            space.merge_tlb(&evicted);
        }
        Ok(())
    }

    /// 读取 1, 2 或 4 字节 (小端序)
    pub fn read_mem(&mut self, vaddr: u32, size: usize) -> Result<u32> {
        if !matches!(size, 1 | 2 | 4) {
            return Err(KernelError::AddressError(vaddr));
        }
        let pa = self.translate(vaddr, size, false)?;
        let mut word = [0u8; 4];
        word[..size].copy_from_slice(&self.main_memory[pa..pa + size]);
        Ok(u32::from_le_bytes(word))
    }

    /// 写入 1, 2 或 4 字节 (小端序)
    pub fn write_mem(&mut self, vaddr: u32, size: usize, value: u32) -> Result<()> {
        if !matches!(size, 1 | 2 | 4) {
            return Err(KernelError::AddressError(vaddr));
        }
        let pa = self.translate(vaddr, size, true)?;
        self.main_memory[pa..pa + size].copy_from_slice(&value.to_le_bytes()[..size]);
        Ok(())
    }

    /// 为当前线程的虚页 vpn 处理缺页. 页面已经映射时什么都不做
    pub fn handle_page_fault(&mut self, vpn: usize) -> Result<()> {
        let tid = self.current.ok_or(KernelError::NoActiveSpace)?;
        {
            let space = self
                .spaces
                .get(&tid)
                .ok_or(KernelError::NoAddressSpace(tid))?;
            if vpn >= space.num_pages() {
                return Err(KernelError::AddressError((vpn * PAGE_SIZE) as u32));
            }
            if space.pte(vpn).valid {
                return Ok(());
            }
        }
        self.stats.page_faults += 1;

        let frame = match self.frame_map.find() {
            Some(frame) => {
                trace!("vm: free frame {} for thread {} vpn {}", frame, tid, vpn);
                frame as usize
            }
            None => self.evict()?,
        };

        let space = self
            .spaces
            .get_mut(&tid)
            .ok_or(KernelError::NoAddressSpace(tid))?;
        let page = &mut self.main_memory[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE];
        match self.swap.find(tid, vpn) {
            Some(slot) => {
                page.copy_from_slice(&slot.page);
                self.stats.swap_ins += 1;
                trace!("vm: thread {} vpn {} restored from swap", tid, vpn);
            }
            None => space.load_page(vpn, page),
        }
        space.install(vpn, frame);
        self.frame_owner[frame] = Some(tid);
        self.frame_recency.touch(frame);
        debug!("vm: thread {} vpn {} -> frame {}", tid, vpn, frame);
        Ok(())
    }

    /// 淘汰最久未使用的页框, 返回腾出的页框 (仍然保持已分配状态)
    fn evict(&mut self) -> Result<usize> {
        let frame = self
            .frame_recency
            .least_recent()
            .ok_or(KernelError::ExhaustedResource(Resource::Frames))?;
        let owner = self.frame_owner[frame].ok_or(KernelError::ExhaustedResource(Resource::Frames))?;
        let space = self
            .spaces
            .get_mut(&owner)
            .ok_or(KernelError::NoAddressSpace(owner))?;
        let vpn = space
            .mapped_vpn(frame)
            .ok_or(KernelError::ExhaustedResource(Resource::Frames))?;

        // TLB 中只有当前线程的表项
        if self.current == Some(owner) {
            if let Some(entry) = self.tlb.invalidate(vpn) {
                space.merge_tlb(&entry);
            }
        }

        let page = &self.main_memory[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE];
        self.swap.stage(owner, vpn, page);
        if space.pte(vpn).dirty {
            space.write_back_page(vpn, page)?;
            self.stats.dirty_writebacks += 1;
        }
        space.unmap(vpn);
        self.frame_owner[frame] = None;
        self.frame_recency.remove(frame);
        self.stats.evictions += 1;
        debug!(
            "vm: evicted thread {} vpn {} from frame {}",
            owner, vpn, frame
        );
        Ok(frame)
    }

    /// 线程退出: 释放它的所有页框和交换区槽位, 关闭可执行文件
    pub fn clear_map(&mut self, tid: ThreadId) -> Result<()> {
        if self.current == Some(tid) {
            self.tlb.flush();
            self.current = None;
        }
        let space = self
            .spaces
            .remove(&tid)
            .ok_or(KernelError::NoAddressSpace(tid))?;
        let mut released = 0;
        for frame in 0..self.config.num_phys_pages {
            if space.owned_frames().test(frame as u32) {
                self.frame_map.clear(frame as u32);
                self.frame_owner[frame] = None;
                self.frame_recency.remove(frame);
                released += 1;
            }
        }
        let slots = self.swap.release(tid);
        info!(
            "vm: thread {} exit, released {} frame(s) and {} swap slot(s)",
            tid, released, slots
        );
        Ok(())
    }

    pub fn frame_owner(&self, frame: usize) -> Option<ThreadId> {
        self.frame_owner[frame]
    }

    /// 物理页框的内容
    pub fn frame(&self, frame: usize) -> &[u8] {
        &self.main_memory[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE]
    }

    pub fn num_free_frames(&self) -> usize {
        self.frame_map.num_clear()
    }

    pub fn space(&self, tid: ThreadId) -> Option<&AddressSpace> {
        self.spaces.get(&tid)
    }

    pub fn swap(&self) -> &SwapArea {
        &self.swap
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    pub fn stats(&self) -> Statistics {
        self.stats
    }

    pub fn print_stats(&self) {
        let s = &self.stats;
        println!(
            "Paging: faults {}, evictions {}, writebacks {}, swap-ins {}",
            s.page_faults, s.evictions, s.dirty_writebacks, s.swap_ins
        );
        println!("TLB: hits {}, misses {}", s.tlb_hits, s.tlb_misses);
    }
}
