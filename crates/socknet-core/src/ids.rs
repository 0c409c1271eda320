//! 引擎私有的不透明标识。
//!
//! 所有种类的 id 共享同一个单调计数器：从 1 开始、永不复用。因此监听、发送、接收通信器与
//! 请求的 id 在数值上也互不重叠，宿主把一种句柄误传给另一种入口时只会得到“未知 id”。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            /// 由原始数值还原 id（例如从 ABI 的不透明指针解码）。
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// 原始数值。
            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// 被动打开（监听）条目的 id。
    ListenId,
    "listen"
);
define_id!(
    /// 主动建立的发送侧连接 id。
    SendCommId,
    "send"
);
define_id!(
    /// 接受得到的接收侧连接 id。
    RecvCommId,
    "recv"
);
define_id!(
    /// 在途请求 id。
    RequestId,
    "request"
);

/// 单调 id 分配器。
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ids_start_at_one_and_never_repeat() {
        let alloc = IdAllocator::new();
        assert_eq!(alloc.next_raw(), 1);
        assert_eq!(alloc.next_raw(), 2);
        assert_eq!(ListenId::from_raw(3).to_string(), "listen#3");
        assert_eq!(RequestId::from_raw(9).as_raw(), 9);
    }

    #[test]
    fn concurrent_allocation_is_unique() {
        let alloc = Arc::new(IdAllocator::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || (0..1000).map(|_| alloc.next_raw()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.join().expect("allocator thread") {
                assert!(seen.insert(id), "id {id} allocated twice");
            }
        }
        assert_eq!(seen.len(), 4000);
        assert!(!seen.contains(&0));
    }
}
