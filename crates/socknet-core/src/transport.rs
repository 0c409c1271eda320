//! # transport 模块说明
//!
//! ## 角色定位（Why）
//! - 定义宿主无关的传输契约 [`Transport`]，插件适配层只面向该 trait 做 ABI 翻译；
//! - 提供基于 TCP 套接字的实现 [`SocketTransport`]：没有后台线程，所有操作在调用方线程上以
//!   非阻塞方式完成，数据推进全部发生在 `test` 轮询中。
//!
//! ## 并发模型（What）
//! - 设备列表存放在 `OnceLock` 中，首次访问时发现，之后只读；
//! - 监听条目、连接与请求三张表位于同一把 `parking_lot::Mutex` 之后，任何操作都在持锁期间
//!   完成，因而不存在跨表的不一致窗口；
//! - 所有 id 取自同一个单调计数器，关闭后永不复用。
//!
//! ## 风险提示（Trade-offs）
//! - 单锁意味着不同连接上的 `test` 也会串行执行；每次推进只做非阻塞读写，持锁时间受套接字
//!   缓冲区大小约束；
//! - 不支持取消：关闭连接会直接丢弃其未完成请求，宿主缓冲区随即可以回收。

use std::collections::HashMap;
use std::sync::OnceLock;
use std::task::Poll;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::{MemoryType, RequestBuffer};
use crate::comm::{Connection, ListenEntry, ListenState};
use crate::config::{ConfigError, NetConfig};
use crate::device::{self, NetProperties, SocketDevice};
use crate::error::{self, NetError, Result, map_io_error};
use crate::handle::ListenHandle;
use crate::ids::{IdAllocator, ListenId, RecvCommId, RequestId, SendCommId};
use crate::request::{Direction, Request, TestResult};
use crate::socket::{self, SocketOptions};

/// 宿主可见的传输契约。
///
/// # 教案式说明
/// - **意图 (Why)**：把“设备、被动/主动打开、异步收发、轮询完成”这一组原语收敛为对象安全的
///   trait，适配层持有 `Box<dyn Transport>`，测试可以直接驱动实现而无需经过 C ABI；
/// - **契约 (What)**：
///   - 所有方法都不会阻塞在网络 IO 上；
///   - `accept` 以 [`Poll::Pending`] 表示“暂无连接”，`test` 以 `done == false` 表示“尚未完成”，
///     二者都不是错误；
///   - 未知、越界或已关闭的 id 一律返回 [`crate::ErrorKind::InvalidArgument`]；
/// - **前置条件**：`isend`/`irecv` 交出的缓冲区在请求完成或连接关闭前必须保持有效，
///   见 [`RequestBuffer::from_raw_parts`]。
pub trait Transport: Send + Sync {
    /// 可用设备数量；首次调用触发设备发现。
    fn devices(&self) -> usize;

    /// 读取设备属性；`dev` 越界时返回错误。
    fn get_properties(&self, dev: usize) -> Result<NetProperties>;

    /// 在设备上创建被动打开条目，返回可交给对端的句柄。
    fn listen(&self, dev: usize) -> Result<(ListenHandle, ListenId)>;

    /// 向句柄描述的地址发起主动打开；握手可能尚未完成。
    fn connect(&self, dev: usize, handle: &ListenHandle) -> Result<SendCommId>;

    /// 轮询被动打开条目；每个条目只能成功接受一次。
    fn accept(&self, listen: ListenId) -> Result<Poll<RecvCommId>>;

    /// 提交发送请求；提交时不做任何 IO。
    fn isend(&self, comm: SendCommId, buffer: RequestBuffer) -> Result<RequestId>;

    /// 提交接收请求；恰好收满 `buffer.len()` 字节才算完成。
    fn irecv(&self, comm: RecvCommId, buffer: RequestBuffer) -> Result<RequestId>;

    /// 使已完成的接收对调用方可见。
    fn flush(&self, comm: RecvCommId, buffer: &RequestBuffer) -> Result<()>;

    /// 推进并查询请求；完成后该请求 id 失效。
    fn test(&self, request: RequestId) -> Result<TestResult>;

    fn close_send(&self, comm: SendCommId) -> Result<()>;

    fn close_recv(&self, comm: RecvCommId) -> Result<()>;

    fn close_listen(&self, listen: ListenId) -> Result<()>;

    /// 释放全部套接字与簿记；之后的操作返回 `Internal` 错误。
    fn shutdown(&self);
}

#[derive(Debug, Default)]
struct Tables {
    listens: HashMap<ListenId, ListenEntry>,
    sends: HashMap<SendCommId, Connection>,
    recvs: HashMap<RecvCommId, Connection>,
    requests: HashMap<RequestId, Request>,
    shut_down: bool,
}

impl Tables {
    fn live_comms(&self, dev: usize) -> usize {
        self.sends.values().filter(|conn| conn.dev == dev).count()
            + self.recvs.values().filter(|conn| conn.dev == dev).count()
    }

    /// 丢弃属于某条连接的全部未完成请求，返回丢弃数量。
    fn drop_requests_of(&mut self, comm: u64) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, request| request.comm != comm);
        before - self.requests.len()
    }
}

/// 基于 TCP 套接字的传输引擎。
///
/// # 教案式说明
/// - **意图 (Why)**：作为显式的上下文对象存在，测试可以在同一进程内创建多个互不干扰的实例；
///   只有 C ABI 适配层出于导出表的限制才把它放进进程级单例；
/// - **契约 (What)**：`Send + Sync`；每个表条目独占自己的套接字，条目移除即关闭套接字；
/// - **构造 (How)**：[`SocketTransport::new`] 延迟发现设备，[`SocketTransport::with_devices`]
///   注入固定设备列表。
#[derive(Debug)]
pub struct SocketTransport {
    config: NetConfig,
    options: SocketOptions,
    devices: OnceLock<Vec<SocketDevice>>,
    ids: IdAllocator,
    tables: Mutex<Tables>,
}

impl SocketTransport {
    /// 以给定配置创建引擎，设备在首次使用时发现。
    pub fn new(config: NetConfig) -> Self {
        Self {
            options: SocketOptions::from_config(&config),
            config,
            devices: OnceLock::new(),
            ids: IdAllocator::new(),
            tables: Mutex::new(Tables::default()),
        }
    }

    /// 从环境变量（以及 `SOCKNET_CONFIG` 指向的 TOML 文件）加载配置后创建引擎。
    pub fn from_env() -> core::result::Result<Self, ConfigError> {
        NetConfig::from_env().map(Self::new)
    }

    /// 使用固定设备列表创建引擎，跳过系统网卡发现。
    pub fn with_devices(config: NetConfig, devices: Vec<SocketDevice>) -> Self {
        let transport = Self::new(config);
        let _ = transport.devices.set(devices);
        transport
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    fn device_list(&self) -> &[SocketDevice] {
        self.devices.get_or_init(|| device::discover(&self.config))
    }

    fn device(&self, dev: usize) -> Result<&SocketDevice> {
        let devices = self.device_list();
        devices.get(dev).ok_or_else(|| {
            NetError::invalid_argument(
                error::UNKNOWN_DEVICE,
                format!("device {dev} out of range (ndev = {})", devices.len()),
            )
        })
    }

    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, Tables>> {
        let tables = self.tables.lock();
        if tables.shut_down {
            return Err(NetError::internal(error::SHUT_DOWN, "transport has been shut down"));
        }
        Ok(tables)
    }

    fn ensure_comm_capacity(
        &self,
        tables: &Tables,
        device: &SocketDevice,
        index: usize,
    ) -> Result<()> {
        let limit = device.properties().max_comms.max(0) as usize;
        if tables.live_comms(index) >= limit {
            return Err(NetError::resource(
                error::TOO_MANY_COMMS,
                format!("device {index} already has {limit} live connections"),
            ));
        }
        Ok(())
    }
}

fn host_only(buffer: &RequestBuffer) -> Result<()> {
    match buffer.memory() {
        MemoryType::Host => Ok(()),
        other => Err(NetError::invalid_argument(
            error::UNSUPPORTED_MEMORY,
            format!("memory type {other:?} is not supported by socket devices"),
        )),
    }
}

fn unknown(what: impl std::fmt::Display) -> NetError {
    NetError::invalid_argument(error::UNKNOWN_ID, format!("{what} is not registered"))
}

impl Transport for SocketTransport {
    fn devices(&self) -> usize {
        self.device_list().len()
    }

    fn get_properties(&self, dev: usize) -> Result<NetProperties> {
        self.device(dev).map(SocketDevice::properties)
    }

    fn listen(&self, dev: usize) -> Result<(ListenHandle, ListenId)> {
        let device = self.device(dev)?;
        let mut tables = self.lock()?;
        let listener = socket::bind_listener(device.addr(), self.config.listen_backlog)?;
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(error::LISTEN, err))?;
        let id = ListenId::from_raw(self.ids.next_raw());
        tables.listens.insert(
            id,
            ListenEntry {
                dev,
                local,
                state: ListenState::Listening(listener),
            },
        );
        debug!(dev, listen = %id, addr = %local, "listening");
        Ok((ListenHandle::new(local), id))
    }

    fn connect(&self, dev: usize, handle: &ListenHandle) -> Result<SendCommId> {
        let device = self.device(dev)?;
        let mut tables = self.lock()?;
        self.ensure_comm_capacity(&tables, device, dev)?;
        let peer = handle.addr();
        let (stream, established) = socket::start_connect(peer)?;
        self.options.apply(&stream)?;
        let conn = if established {
            Connection::open(dev, Direction::Send, peer, stream)
        } else {
            Connection::connecting(dev, peer, stream)
        };
        let id = SendCommId::from_raw(self.ids.next_raw());
        tables.sends.insert(id, conn);
        debug!(dev, comm = %id, %peer, established, "connect issued");
        Ok(id)
    }

    fn accept(&self, listen: ListenId) -> Result<Poll<RecvCommId>> {
        let mut guard = self.lock()?;
        let tables = &mut *guard;
        let entry = tables.listens.get(&listen).ok_or_else(|| unknown(listen))?;
        let dev = entry.dev;
        let local = entry.local;
        let accepted = match &entry.state {
            ListenState::Accepted => {
                return Err(NetError::invalid_argument(
                    error::ALREADY_ACCEPTED,
                    format!("{listen} has already accepted its connection"),
                ));
            }
            ListenState::Listening(listener) => {
                // 容量不足时连接必须留在 backlog 中，名额释放后仍可接受。
                self.ensure_comm_capacity(tables, self.device(dev)?, dev)?;
                socket::try_accept(listener)?
            }
        };
        let Some((stream, peer)) = accepted else {
            trace!(listen = %listen, "no pending connection");
            return Ok(Poll::Pending);
        };
        self.options.apply(&stream)?;

        if let Some(entry) = tables.listens.get_mut(&listen) {
            entry.state = ListenState::Accepted;
        }
        let id = RecvCommId::from_raw(self.ids.next_raw());
        tables
            .recvs
            .insert(id, Connection::open(dev, Direction::Recv, peer, stream));
        debug!(dev, listen = %listen, comm = %id, %peer, %local, "connection accepted");
        Ok(Poll::Ready(id))
    }

    fn isend(&self, comm: SendCommId, buffer: RequestBuffer) -> Result<RequestId> {
        host_only(&buffer)?;
        let mut guard = self.lock()?;
        let tables = &mut *guard;
        let conn = tables.sends.get_mut(&comm).ok_or_else(|| unknown(comm))?;
        conn.ensure_healthy()?;
        let id = RequestId::from_raw(self.ids.next_raw());
        let size = buffer.len();
        conn.enqueue(id);
        tables
            .requests
            .insert(id, Request::new(comm.as_raw(), Direction::Send, buffer));
        trace!(comm = %comm, request = %id, size, "send issued");
        Ok(id)
    }

    fn irecv(&self, comm: RecvCommId, buffer: RequestBuffer) -> Result<RequestId> {
        host_only(&buffer)?;
        let mut guard = self.lock()?;
        let tables = &mut *guard;
        let conn = tables.recvs.get_mut(&comm).ok_or_else(|| unknown(comm))?;
        conn.ensure_healthy()?;
        let id = RequestId::from_raw(self.ids.next_raw());
        let size = buffer.len();
        conn.enqueue(id);
        tables
            .requests
            .insert(id, Request::new(comm.as_raw(), Direction::Recv, buffer));
        trace!(comm = %comm, request = %id, size, "recv issued");
        Ok(id)
    }

    fn flush(&self, comm: RecvCommId, buffer: &RequestBuffer) -> Result<()> {
        host_only(buffer)?;
        let tables = self.lock()?;
        let conn = tables.recvs.get(&comm).ok_or_else(|| unknown(comm))?;
        conn.ensure_healthy()
    }

    fn test(&self, request: RequestId) -> Result<TestResult> {
        let mut guard = self.lock()?;
        let Tables {
            sends,
            recvs,
            requests,
            ..
        } = &mut *guard;
        let entry = requests.get(&request).ok_or_else(|| unknown(request))?;
        if entry.is_complete() {
            let bytes = entry.transferred();
            requests.remove(&request);
            trace!(request = %request, bytes, "request retired");
            return Ok(TestResult::done(bytes));
        }

        let comm = entry.comm;
        let conn = match entry.direction {
            Direction::Send => sends.get_mut(&SendCommId::from_raw(comm)),
            Direction::Recv => recvs.get_mut(&RecvCommId::from_raw(comm)),
        };
        let Some(conn) = conn else {
            requests.remove(&request);
            return Err(NetError::internal(
                error::UNKNOWN_ID,
                format!("{request} refers to a connection that no longer exists"),
            ));
        };

        match conn.drive(requests, request) {
            Ok(result) => {
                if result.done {
                    requests.remove(&request);
                    trace!(request = %request, bytes = result.bytes, "request retired");
                }
                Ok(result)
            }
            Err(err) => {
                requests.remove(&request);
                debug!(request = %request, code = err.code(), "request retired with error");
                Err(err)
            }
        }
    }

    fn close_send(&self, comm: SendCommId) -> Result<()> {
        let mut tables = self.lock()?;
        let conn = tables.sends.remove(&comm).ok_or_else(|| unknown(comm))?;
        let dropped = tables.drop_requests_of(comm.as_raw());
        debug!(
            dev = conn.dev,
            comm = %comm,
            role = ?conn.role,
            peer = %conn.peer,
            bytes = conn.transferred(),
            dropped,
            "send comm closed"
        );
        Ok(())
    }

    fn close_recv(&self, comm: RecvCommId) -> Result<()> {
        let mut tables = self.lock()?;
        let conn = tables.recvs.remove(&comm).ok_or_else(|| unknown(comm))?;
        let dropped = tables.drop_requests_of(comm.as_raw());
        debug!(
            dev = conn.dev,
            comm = %comm,
            role = ?conn.role,
            peer = %conn.peer,
            bytes = conn.transferred(),
            dropped,
            "recv comm closed"
        );
        Ok(())
    }

    fn close_listen(&self, listen: ListenId) -> Result<()> {
        let mut tables = self.lock()?;
        let entry = tables
            .listens
            .remove(&listen)
            .ok_or_else(|| unknown(listen))?;
        debug!(dev = entry.dev, listen = %listen, addr = %entry.local, "listen closed");
        Ok(())
    }

    fn shutdown(&self) {
        let mut tables = self.tables.lock();
        if tables.shut_down {
            return;
        }
        let released = std::mem::take(&mut *tables);
        tables.shut_down = true;
        debug!(
            listens = released.listens.len(),
            sends = released.sends.len(),
            recvs = released.recvs.len(),
            requests = released.requests.len(),
            "transport shut down"
        );
    }
}
