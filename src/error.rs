use std::fmt;

use thiserror::Error;

/// 线程 (进程) 编号
pub type ThreadId = u32;

/// 被耗尽的资源种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// 空闲扇区
    Sectors,
    /// 目录表项
    DirectorySlots,
    /// 文件超过直接索引 + 两个索引扇区能表示的上限
    FileTooLarge,
    /// 物理页框
    Frames,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Sectors => "free sectors",
            Resource::DirectorySlots => "directory slots",
            Resource::FileTooLarge => "file size ceiling",
            Resource::Frames => "physical frames",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("exhausted resource: {0}")]
    ExhaustedResource(Resource),
    #[error("name already exists: {0}")]
    DuplicateName(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("sector {sector} is busy: {open} open file(s)")]
    Busy { sector: u32, open: usize },
    #[error("corrupt file header at sector {sector} (magic {magic:#x})")]
    CorruptHeader { sector: u32, magic: u32 },
    #[error("bad executable: {0}")]
    BadExecutable(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("address error at {0:#x}")]
    AddressError(u32),
    #[error("write to read-only page at {0:#x}")]
    ReadOnly(u32),
    #[error("thread {0} has no address space")]
    NoAddressSpace(ThreadId),
    #[error("no address space is active")]
    NoActiveSpace,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;
