#![doc = r#"
# socknet-core

## 设计动机（Why）
- **定位**：为集合通信库提供一个基于普通 TCP 套接字的网络传输引擎，使其在没有 RDMA
  等专用网卡的节点上也能完成点对点字节流传输。
- **架构角色**：作为叶子 crate，对上只暴露 [`Transport`] 契约与其套接字实现
  [`SocketTransport`]；C ABI 的导出表由 `socknet-plugin` 负责翻译。
- **设计理念**：宿主以轮询驱动一切。引擎不创建线程，也不在任何调用中阻塞等待网络；
  所有数据推进都发生在宿主调用 `test` 时。

## 核心契约（What）
- **设备**：首次访问时按 [`NetConfig`] 枚举网卡（可注入固定列表），之后以下标引用；
- **建连**：`listen` 产出 64 字节的 [`ListenHandle`]，经带外通道交给对端 `connect`，
  本端 `accept` 恰好成功一次；
- **传输**：`isend`/`irecv` 只登记请求，`test` 按提交顺序推进同一连接上的请求，
  接收请求恰好收满缓冲区长度才算完成；
- **错误**：统一为 [`NetError`]，附带稳定错误码与 [`ErrorKind`]；“尚未就绪”不是错误。

## 实现策略（How）
- 套接字经 `socket2` 创建为非阻塞模式，读写遇到 `WouldBlock` 即返回；
- 监听条目、连接与请求三张表位于一把 `parking_lot::Mutex` 之后；
- 生命周期事件以 `tracing` 输出结构化日志，订阅者由宿主侧安装。

## 风险与考量（Trade-offs）
- 不支持 GPU 显存直传，设备只声明主机内存；
- 连接一旦出错即永久失效，引擎内不做重试或重连。
"#]

mod buffer;
mod comm;
pub mod config;
pub mod device;
mod error;
mod handle;
mod ids;
mod request;
mod socket;
mod transport;

pub use buffer::{MemoryType, RequestBuffer};
pub use config::{AddrFamily, ConfigError, NetConfig};
pub use device::{NetProperties, PTR_CUDA, PTR_HOST, SocketDevice};
pub use error::{ErrorKind, NetError, Result};
pub use handle::{HANDLE_SIZE, ListenHandle};
pub use ids::{ListenId, RecvCommId, RequestId, SendCommId};
pub use request::{Direction, TestResult};
pub use transport::{SocketTransport, Transport};

/// 稳定错误码，供调用方与测试按码匹配失败原因。
pub mod codes {
    pub use crate::error::{
        ALREADY_ACCEPTED, BAD_HANDLE, COMM_FAILED, PEER_CLOSED, SHUT_DOWN, TOO_MANY_COMMS,
        UNKNOWN_DEVICE, UNKNOWN_ID, UNSUPPORTED_MEMORY,
    };
}
