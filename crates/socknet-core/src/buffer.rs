//! 宿主提供的收发缓冲区。
//!
//! 宿主以裸指针 + 长度的形式交出缓冲区，并保证在请求完成（或所属连接关闭）之前不释放、不读写
//! 它；这一约定无法由类型系统表达，因此构造 [`RequestBuffer`] 是 `unsafe` 的，之后的所有访问
//! 都限制在本模块内部。

use std::ops::Range;

/// 缓冲区所在的内存类型，数值与宿主的指针类型标签一致。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryType {
    Host,
    Cuda,
}

impl MemoryType {
    /// 由宿主的类型标签解析；未知标签返回 `None`。
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            crate::device::PTR_HOST => Some(MemoryType::Host),
            crate::device::PTR_CUDA => Some(MemoryType::Cuda),
            _ => None,
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            MemoryType::Host => crate::device::PTR_HOST,
            MemoryType::Cuda => crate::device::PTR_CUDA,
        }
    }
}

/// 一次收发请求引用的外部缓冲区。
#[derive(Debug)]
pub struct RequestBuffer {
    ptr: *mut u8,
    len: usize,
    memory: MemoryType,
}

// SAFETY: 缓冲区的独占访问权在请求存活期间由宿主让渡给引擎，引擎只在持有表锁时访问它。
unsafe impl Send for RequestBuffer {}

impl RequestBuffer {
    /// 包装宿主缓冲区。
    ///
    /// # Safety
    ///
    /// - `len > 0` 时 `ptr` 必须指向至少 `len` 字节、对读写均有效的内存；
    /// - 在持有该缓冲区的请求被 `test` 报告完成、或所属连接被关闭之前，调用方不得释放或并发
    ///   访问这段内存；
    /// - `len == 0` 时 `ptr` 可以为空。
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize, memory: MemoryType) -> Self {
        Self { ptr, len, memory }
    }

    /// 包装只读的发送缓冲区。
    ///
    /// # Safety
    ///
    /// 同 [`RequestBuffer::from_raw_parts`]；引擎不会写入由发送请求持有的缓冲区。
    pub unsafe fn from_const_parts(ptr: *const u8, len: usize, memory: MemoryType) -> Self {
        Self {
            ptr: ptr.cast_mut(),
            len,
            memory,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory(&self) -> MemoryType {
        self.memory
    }

    pub(crate) fn bytes(&self, range: Range<usize>) -> &[u8] {
        if self.len == 0 || range.is_empty() {
            return &[];
        }
        debug_assert!(range.end <= self.len);
        // SAFETY: `from_raw_parts` 的调用方保证 `ptr..ptr+len` 有效，`range` 不越界。
        unsafe { std::slice::from_raw_parts(self.ptr.add(range.start), range.len()) }
    }

    pub(crate) fn bytes_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        if self.len == 0 || range.is_empty() {
            return &mut [];
        }
        debug_assert!(range.end <= self.len);
        // SAFETY: 同上，且接收请求独占该缓冲区。
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(range.start), range.len()) }
    }
}
