//! 监听句柄编解码的性质测试。
//!
//! - **核心目标 (Why)**：句柄来自远端进程，经宿主的带外通道原样转交；解码器面对任意字节都必须
//!   给出确定的结果（成功或 `InvalidArgument`），绝不能越界或 panic；
//! - **性质 (What)**：
//!   1. 任意长度、任意内容的输入解码都不会 panic，失败时错误分类恒为 `InvalidArgument`；
//!   2. 任意合法地址编码后再解码得到同一地址，且保留字段写零；
//!   3. 保留区内容不影响解码结果。

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use proptest::prelude::*;
use socknet_core::{ErrorKind, HANDLE_SIZE, ListenHandle};

fn any_socket_addr() -> impl Strategy<Value = SocketAddr> {
    prop_oneof![
        (any::<u32>(), any::<u16>())
            .prop_map(|(ip, port)| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port))),
        (any::<u128>(), any::<u16>(), any::<u32>(), any::<u32>()).prop_map(
            |(ip, port, flowinfo, scope)| {
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, flowinfo, scope))
            }
        ),
    ]
}

proptest! {
    #[test]
    fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..(HANDLE_SIZE * 2))) {
        if let Err(err) = ListenHandle::decode(&bytes) {
            prop_assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn prop_valid_addresses_survive_the_wire(addr in any_socket_addr()) {
        let encoded = ListenHandle::new(addr).encode();
        prop_assert!(encoded[32..].iter().all(|byte| *byte == 0));
        let decoded = ListenHandle::decode(&encoded).expect("合法句柄必须可以解码");
        prop_assert_eq!(decoded.addr(), addr);
    }

    #[test]
    fn prop_reserved_tail_is_ignored(
        addr in any_socket_addr(),
        tail in proptest::collection::vec(any::<u8>(), 32),
    ) {
        let mut encoded = ListenHandle::new(addr).encode();
        encoded[32..].copy_from_slice(&tail);
        let decoded = ListenHandle::decode(&encoded).expect("保留区不参与校验");
        prop_assert_eq!(decoded.addr(), addr);
    }
}
