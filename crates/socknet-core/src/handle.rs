//! # handle 模块说明
//!
//! ## 意图（Why）
//! - `listen` 产生的句柄要经由宿主自己的带外通道发给远端，宿主只把它当作固定长度的字节块；
//!   因此编码必须自描述（魔数 + 版本 + 地址族），让不同版本的进程在交换句柄时能识别彼此；
//!
//! ## 布局（What）
//!
//! | 偏移 | 长度 | 字段 |
//! |---|---|---|
//! | 0 | 4 | 魔数 `SKNT` |
//! | 4 | 1 | 版本，当前为 1 |
//! | 5 | 1 | 地址族标签，4 或 6 |
//! | 6 | 2 | 端口（大端） |
//! | 8 | 16 | IP 地址，IPv4 只占前 4 字节 |
//! | 24 | 4 | IPv6 flowinfo |
//! | 28 | 4 | IPv6 scope id |
//! | 32 | 32 | 保留，写零，解码时忽略 |

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{self, NetError, Result};

/// 句柄的固定字节长度，等于宿主允许的最大句柄长度。
pub const HANDLE_SIZE: usize = 64;

const MAGIC: [u8; 4] = *b"SKNT";
const VERSION: u8 = 1;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// 被动打开的连接句柄，内含远端可连接的套接字地址。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ListenHandle {
    addr: SocketAddr,
}

impl ListenHandle {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// 句柄指向的地址。
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 编码为定长字节块。
    pub fn encode(&self) -> [u8; HANDLE_SIZE] {
        let mut out = [0u8; HANDLE_SIZE];
        out[0..4].copy_from_slice(&MAGIC);
        out[4] = VERSION;
        out[6..8].copy_from_slice(&self.addr.port().to_be_bytes());
        match self.addr {
            SocketAddr::V4(v4) => {
                out[5] = FAMILY_V4;
                out[8..12].copy_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                out[5] = FAMILY_V6;
                out[8..24].copy_from_slice(&v6.ip().octets());
                out[24..28].copy_from_slice(&v6.flowinfo().to_be_bytes());
                out[28..32].copy_from_slice(&v6.scope_id().to_be_bytes());
            }
        }
        out
    }

    /// 将编码写入调用方提供的缓冲区，缓冲区至少需要 [`HANDLE_SIZE`] 字节。
    pub fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        let len = out.len();
        let target = out.get_mut(..HANDLE_SIZE).ok_or_else(|| {
            NetError::invalid_argument(
                error::BAD_HANDLE,
                format!("handle buffer holds {len} bytes, need {HANDLE_SIZE}"),
            )
        })?;
        target.copy_from_slice(&self.encode());
        Ok(())
    }

    /// 从字节块解码；只读取前 [`HANDLE_SIZE`] 字节。
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes = bytes.get(..HANDLE_SIZE).ok_or_else(|| {
            NetError::invalid_argument(
                error::BAD_HANDLE,
                format!("handle is {} bytes, need {HANDLE_SIZE}", bytes.len()),
            )
        })?;
        if bytes[0..4] != MAGIC {
            return Err(NetError::invalid_argument(
                error::BAD_HANDLE,
                "handle magic mismatch",
            ));
        }
        if bytes[4] != VERSION {
            return Err(NetError::invalid_argument(
                error::BAD_HANDLE,
                format!("unsupported handle version {}", bytes[4]),
            ));
        }
        let port = u16::from_be_bytes([bytes[6], bytes[7]]);
        let addr = match bytes[5] {
            FAMILY_V4 => {
                let ip = Ipv4Addr::new(bytes[8], bytes[9], bytes[10], bytes[11]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            }
            FAMILY_V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[8..24]);
                let flowinfo = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
                let scope_id = u32::from_be_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]);
                SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                ))
            }
            other => {
                return Err(NetError::invalid_argument(
                    error::BAD_HANDLE,
                    format!("unknown address family tag {other}"),
                ));
            }
        };
        Ok(Self { addr })
    }
}
