//! 地址空间: 每个线程一张页表, 以及它当前占用的物理页框
//!
//! 创建时不分配任何物理页框, 所有页面都处于未映射状态, 第一次访问时缺页载入.
//! 地址空间在整个生命周期内保持可执行文件打开, 因此进程运行期间可执行文件不能被删除.

use log::{debug, trace};

use super::{NoffHeader, TlbEntry, VmConfig, PAGE_SIZE};
use crate::error::{Result, ThreadId};
use crate::fs::{BitMap, OpenFile};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageTableEntry {
    pub virtual_page: usize,
    /// 未映射时为 None
    pub physical_frame: Option<usize>,
    pub valid: bool,
    pub dirty: bool,
    pub use_: bool,
    pub read_only: bool,
}

pub struct AddressSpace {
    tid: ThreadId,
    page_table: Vec<PageTableEntry>,
    num_pages: usize,
    /// 本地址空间占用的物理页框
    owned_frames: BitMap,
    executable: OpenFile,
    backing_name: String,
    noff: NoffHeader,
}

impl AddressSpace {
    /// 地址空间大小 = 代码段 + 数据段 + 栈, 向上取整到页
    pub fn new(tid: ThreadId, name: &str, executable: OpenFile, config: &VmConfig) -> Result<Self> {
        let noff = NoffHeader::read_from(&executable)?;
        let size = noff.image_size(config.user_stack_size)?;
        let num_pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let page_table = (0..num_pages)
            .map(|vpn| PageTableEntry {
                virtual_page: vpn,
                ..Default::default()
            })
            .collect();
        debug!(
            "address space for thread {} ({}): {} pages, {} bytes",
            tid,
            name,
            num_pages,
            num_pages * PAGE_SIZE
        );
        Ok(Self {
            tid,
            page_table,
            num_pages,
            owned_frames: BitMap::new(config.num_phys_pages),
            executable,
            backing_name: name.to_string(),
            noff,
        })
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn backing_name(&self) -> &str {
        &self.backing_name
    }

    pub fn noff(&self) -> &NoffHeader {
        &self.noff
    }

    pub fn owned_frames(&self) -> &BitMap {
        &self.owned_frames
    }

    pub fn executable(&self) -> &OpenFile {
        &self.executable
    }

    pub fn pte(&self, vpn: usize) -> &PageTableEntry {
        &self.page_table[vpn]
    }

    pub fn page_table(&self) -> &[PageTableEntry] {
        &self.page_table
    }

    /// 当前映射到 frame 上的虚页
    pub fn mapped_vpn(&self, frame: usize) -> Option<usize> {
        self.page_table
            .iter()
            .find(|pte| pte.valid && pte.physical_frame == Some(frame))
            .map(|pte| pte.virtual_page)
    }

    /// 虚页 vpn 在可执行文件中的位置
    pub fn file_offset(&self, vpn: usize) -> usize {
        self.noff.code.in_file_addr as usize + vpn * PAGE_SIZE
    }

    /// 从可执行文件读入页面, 文件中没有的部分 (未初始化数据与栈) 为 0
    pub fn load_page(&self, vpn: usize, page: &mut [u8]) {
        page.fill(0);
        let n = self.executable.read_at(page, self.file_offset(vpn));
        trace!("thread {}: load vpn {} from file ({} bytes)", self.tid, vpn, n);
    }

    /// 把脏页写回可执行文件中对应的位置, 超出文件长度的部分丢弃.
    /// 文件可能在进程运行期间被扩充过, 写回前先刷新文件头
    pub fn write_back_page(&mut self, vpn: usize, page: &[u8]) -> Result<()> {
        self.executable.refresh_header()?;
        let n = self.executable.write_at(page, self.file_offset(vpn));
        trace!("thread {}: write back vpn {} ({} bytes)", self.tid, vpn, n);
        Ok(())
    }

    /// 把 vpn 映射到 frame, 各标志位清零
    pub fn install(&mut self, vpn: usize, frame: usize) {
        self.page_table[vpn] = PageTableEntry {
            virtual_page: vpn,
            physical_frame: Some(frame),
            valid: true,
            dirty: false,
            use_: false,
            read_only: false,
        };
        self.owned_frames.mark(frame as u32);
    }

    /// 解除 vpn 的映射, 返回解除前的页表项
    pub fn unmap(&mut self, vpn: usize) -> PageTableEntry {
        let old = self.page_table[vpn];
        if let Some(frame) = old.physical_frame {
            self.owned_frames.clear(frame as u32);
        }
        let pte = &mut self.page_table[vpn];
        pte.valid = false;
        pte.physical_frame = None;
        old
    }

    /// 把 TLB 表项上的 use/dirty 位合并回页表
    pub fn merge_tlb(&mut self, entry: &TlbEntry) {
        let pte = &mut self.page_table[entry.virtual_page];
        if pte.valid && pte.physical_frame == Some(entry.physical_frame) {
            pte.use_ |= entry.use_;
            pte.dirty |= entry.dirty;
        }
    }

    /// 由页表项生成 TLB 表项
    pub fn tlb_entry(&self, vpn: usize) -> Option<TlbEntry> {
        let pte = &self.page_table[vpn];
        Some(TlbEntry {
            virtual_page: vpn,
            physical_frame: pte.physical_frame.filter(|_| pte.valid)?,
            dirty: pte.dirty,
            use_: pte.use_,
            read_only: pte.read_only,
        })
    }
}
