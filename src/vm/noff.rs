//! NOFF 可执行文件头
//!
//! 文件开头是 40 字节的头部: 魔数, 然后是代码段, 已初始化数据段与未初始化数据段,
//! 每段三个字 {virtual_addr, in_file_addr, size}. 字按小端序存放; 如果按小端序读出的
//! 魔数不对, 但字节反转后正确, 就把整个头部按大端序重新解释.

use log::{error, trace};

use crate::error::{KernelError, Result};
use crate::fs::OpenFile;

pub const NOFF_MAGIC: u32 = 0x00ba_dfad;

/// 头部字节数
pub const NOFF_HEADER_SIZE: usize = 40;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    /// 段在虚拟地址空间中的起始地址
    pub virtual_addr: u32,
    /// 段在可执行文件中的偏移
    pub in_file_addr: u32,
    pub size: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoffHeader {
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

impl NoffHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NOFF_HEADER_SIZE {
            error!("noff: truncated header ({} bytes)", bytes.len());
            return Err(KernelError::BadExecutable(format!(
                "truncated header ({} bytes)",
                bytes.len()
            )));
        }
        let mut words = [0u32; NOFF_HEADER_SIZE / 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        if words[0] != NOFF_MAGIC && words[0].swap_bytes() == NOFF_MAGIC {
            trace!("noff: byte-swapped header");
            for word in words.iter_mut() {
                *word = word.swap_bytes();
            }
        }
        if words[0] != NOFF_MAGIC {
            error!("noff: bad magic {:#x}", words[0]);
            return Err(KernelError::BadExecutable(format!("bad magic {:#x}", words[0])));
        }
        let segment = |i: usize| Segment {
            virtual_addr: words[i],
            in_file_addr: words[i + 1],
            size: words[i + 2],
        };
        Ok(Self {
            code: segment(1),
            init_data: segment(4),
            uninit_data: segment(7),
        })
    }

    /// 从打开的可执行文件开头读出头部
    pub fn read_from(file: &OpenFile) -> Result<Self> {
        let mut buf = [0u8; NOFF_HEADER_SIZE];
        let n = file.read_at(&mut buf, 0);
        Self::parse(&buf[..n])
    }

    /// 小端序编码, 用于构造可执行文件
    pub fn to_bytes(&self) -> [u8; NOFF_HEADER_SIZE] {
        let words = [
            NOFF_MAGIC,
            self.code.virtual_addr,
            self.code.in_file_addr,
            self.code.size,
            self.init_data.virtual_addr,
            self.init_data.in_file_addr,
            self.init_data.size,
            self.uninit_data.virtual_addr,
            self.uninit_data.in_file_addr,
            self.uninit_data.size,
        ];
        let mut bytes = [0u8; NOFF_HEADER_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// 代码段 + 数据段 + 栈 的总字节数. 虚拟地址只有 32 位, 超出时视为非法的可执行文件
    pub fn image_size(&self, user_stack_size: usize) -> Result<usize> {
        let total = u32::try_from(user_stack_size).ok().and_then(|stack| {
            [self.code.size, self.init_data.size, self.uninit_data.size]
                .into_iter()
                .try_fold(stack, u32::checked_add)
        });
        match total {
            Some(size) => Ok(size as usize),
            None => {
                error!("noff: segment sizes {:?} overflow the address space", self);
                Err(KernelError::BadExecutable(
                    "segment sizes overflow the address space".to_string(),
                ))
            }
        }
    }
}
