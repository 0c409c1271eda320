//! # adapter 模块说明
//!
//! ## 意图（Why）
//! - 把宿主的 C ABI 调用翻译为 [`Transport`] 方法调用：解码裸指针与整数参数、调用引擎、
//!   编码输出参数，并把所有失败折叠为宿主可以理解的 `InternalError`；
//! - 宿主通过一张静态函数表调用插件，无法携带上下文对象，因此适配器以进程级单例存在。
//!
//! ## 契约（What）
//! - 单例在第一次调用任一入口时创建，之后始终是同一实例；进程退出时经 `atexit` 关闭一次；
//! - 交给宿主的不透明指针就是引擎 id 的数值，插件从不解引用它们；id 从 1 开始，所以合法句柄
//!   永远不是空指针；
//! - `accept` 尚无连接时写出空指针并返回成功；
//! - 任何错误都先以 `warn!` 记录其错误码，再返回 `InternalError`。

use std::collections::HashMap;
use std::ffi::{CString, c_int, c_void};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;

use parking_lot::Mutex;
use socknet_core::{
    HANDLE_SIZE, ListenHandle, ListenId, MemoryType, NetError, NetProperties, RecvCommId,
    RequestBuffer, RequestId, SendCommId, SocketTransport, Transport,
};
use tracing::{debug, warn};

use crate::ffi::{NcclNetProperties, NcclResult};

/// 插件层自身的错误码。
pub const NULL_POINTER: &str = "socknet.plugin.null_pointer";
pub const NEGATIVE_ARGUMENT: &str = "socknet.plugin.negative_argument";
pub const BAD_MEMORY_TYPE: &str = "socknet.plugin.bad_memory_type";

type Outcome<T = ()> = Result<T, NetError>;

/// 属性字符串缓存：指针交给宿主后在适配器生命周期内保持有效。
struct PropertyStrings {
    name: CString,
    pci_path: CString,
}

/// 包装一个 [`Transport`] 的 ABI 适配器。
///
/// 不实现 `Clone`，构造函数私有；唯一实例保存在 [`adapter`] 返回的静态单例中。
pub struct Adapter {
    transport: Box<dyn Transport>,
    properties: Mutex<HashMap<usize, PropertyStrings>>,
    closed: AtomicBool,
}

static ADAPTER: OnceLock<Adapter> = OnceLock::new();

/// 进程级单例；首次调用时按环境配置创建引擎并注册退出钩子。
pub fn adapter() -> &'static Adapter {
    ADAPTER.get_or_init(|| {
        let adapter = Adapter::new(Box::new(load_transport()));
        // SAFETY: `teardown` 是无参数、不展开 panic 的 extern "C" 函数。
        if unsafe { libc::atexit(teardown) } != 0 {
            warn!("atexit registration failed; transport will not be shut down at exit");
        }
        adapter
    })
}

fn load_transport() -> SocketTransport {
    match SocketTransport::from_env() {
        Ok(transport) => transport,
        Err(err) => {
            warn!(error = %err, "invalid socknet configuration; falling back to defaults");
            SocketTransport::new(Default::default())
        }
    }
}

extern "C" fn teardown() {
    crate::log::detach();
    if let Some(adapter) = ADAPTER.get() {
        adapter.shutdown();
    }
}

fn null(what: &str) -> NetError {
    NetError::invalid_argument(NULL_POINTER, format!("{what} must not be null"))
}

fn non_negative(what: &str, value: c_int) -> Outcome<usize> {
    usize::try_from(value).map_err(|_| {
        NetError::invalid_argument(NEGATIVE_ARGUMENT, format!("{what} must be >= 0, got {value}"))
    })
}

fn memory_type(tag: c_int) -> Outcome<MemoryType> {
    MemoryType::from_tag(tag).ok_or_else(|| {
        NetError::invalid_argument(BAD_MEMORY_TYPE, format!("unknown memory type tag {tag}"))
    })
}

/// 引擎 id 编码为宿主可见的不透明指针。
fn to_opaque(raw: u64) -> *mut c_void {
    std::ptr::without_provenance_mut(raw as usize)
}

fn from_opaque(ptr: *mut c_void, what: &str) -> Outcome<u64> {
    if ptr.is_null() {
        return Err(null(what));
    }
    Ok(ptr.addr() as u64)
}

/// 把宿主的 `(data, size)` 解码为切片长度；`size > 0` 时数据指针不可为空。
fn checked_len(data: *mut c_void, size: c_int) -> Outcome<usize> {
    let len = non_negative("size", size)?;
    if len > 0 && data.is_null() {
        return Err(null("data"));
    }
    Ok(len)
}

/// 写出一个输出参数。
///
/// # Safety
/// `out` 非空时必须指向可写的 `T`。
unsafe fn write_out<T>(out: *mut T, value: T, what: &str) -> Outcome {
    if out.is_null() {
        return Err(null(what));
    }
    // SAFETY: 非空且由调用方保证可写。
    unsafe { out.write(value) };
    Ok(())
}

impl Adapter {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            properties: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// 把一次调用的结果翻译为 ABI 返回码。
    pub fn finish(&self, op: &'static str, outcome: Outcome) -> NcclResult {
        match outcome {
            Ok(()) => NcclResult::Success,
            Err(err) => {
                warn!(
                    op,
                    code = err.code(),
                    kind = err.kind().as_str(),
                    error = %err,
                    "socknet operation failed"
                );
                NcclResult::InternalError
            }
        }
    }

    /// 关闭底层引擎；只执行一次。
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("socknet adapter shutting down");
            self.transport.shutdown();
        }
    }

    pub fn init(&self) -> Outcome {
        let ndev = self.transport.devices();
        debug!(ndev, "socknet initialized");
        Ok(())
    }

    /// # Safety
    /// `ndev` 非空时必须可写。
    pub unsafe fn devices(&self, ndev: *mut c_int) -> Outcome {
        let count = c_int::try_from(self.transport.devices()).unwrap_or(c_int::MAX);
        unsafe { write_out(ndev, count, "ndev") }
    }

    /// # Safety
    /// `props` 非空时必须指向可写的属性结构。
    pub unsafe fn get_properties(&self, dev: c_int, props: *mut NcclNetProperties) -> Outcome {
        let dev = non_negative("dev", dev)?;
        if props.is_null() {
            return Err(null("props"));
        }
        let properties = self.transport.get_properties(dev)?;
        let projected = self.project(dev, &properties);
        unsafe { write_out(props, projected, "props") }
    }

    fn project(&self, dev: usize, properties: &NetProperties) -> NcclNetProperties {
        let mut cache = self.properties.lock();
        let strings = cache.entry(dev).or_insert_with(|| PropertyStrings {
            name: c_string_lossy(&properties.name),
            pci_path: c_string_lossy(&properties.pci_path),
        });
        NcclNetProperties {
            name: strings.name.as_ptr().cast_mut(),
            pci_path: strings.pci_path.as_ptr().cast_mut(),
            guid: properties.guid,
            ptr_support: properties.ptr_support,
            speed: properties.speed,
            port: properties.port,
            max_comms: properties.max_comms,
        }
    }

    /// # Safety
    /// `handle` 必须指向至少 [`HANDLE_SIZE`] 字节的可写内存；`listen_comm` 必须可写。
    pub unsafe fn listen(
        &self,
        dev: c_int,
        handle: *mut c_void,
        listen_comm: *mut *mut c_void,
    ) -> Outcome {
        let dev = non_negative("dev", dev)?;
        if handle.is_null() {
            return Err(null("handle"));
        }
        if listen_comm.is_null() {
            return Err(null("listen_comm"));
        }
        let (encoded, id) = self.transport.listen(dev)?;
        // SAFETY: 宿主保证句柄缓冲区至少有 HANDLE_SIZE 字节。
        let out = unsafe { std::slice::from_raw_parts_mut(handle.cast::<u8>(), HANDLE_SIZE) };
        encoded.encode_into(out)?;
        unsafe { write_out(listen_comm, to_opaque(id.as_raw()), "listen_comm") }
    }

    /// # Safety
    /// `handle` 必须指向至少 [`HANDLE_SIZE`] 字节的可读内存；`send_comm` 必须可写。
    pub unsafe fn connect(
        &self,
        dev: c_int,
        handle: *mut c_void,
        send_comm: *mut *mut c_void,
    ) -> Outcome {
        let dev = non_negative("dev", dev)?;
        if handle.is_null() {
            return Err(null("handle"));
        }
        if send_comm.is_null() {
            return Err(null("send_comm"));
        }
        // SAFETY: 同上。
        let bytes = unsafe { std::slice::from_raw_parts(handle.cast::<u8>(), HANDLE_SIZE) };
        let remote = ListenHandle::decode(bytes)?;
        let id = self.transport.connect(dev, &remote)?;
        unsafe { write_out(send_comm, to_opaque(id.as_raw()), "send_comm") }
    }

    /// # Safety
    /// `recv_comm` 必须可写。
    pub unsafe fn accept(&self, listen_comm: *mut c_void, recv_comm: *mut *mut c_void) -> Outcome {
        let listen = ListenId::from_raw(from_opaque(listen_comm, "listen_comm")?);
        if recv_comm.is_null() {
            return Err(null("recv_comm"));
        }
        let opaque = match self.transport.accept(listen)? {
            Poll::Ready(id) => to_opaque(id.as_raw()),
            Poll::Pending => std::ptr::null_mut(),
        };
        unsafe { write_out(recv_comm, opaque, "recv_comm") }
    }

    /// # Safety
    /// `data` 必须指向至少 `size` 字节的可读内存，并保持有效直到请求完成或连接关闭；
    /// `request` 必须可写。
    pub unsafe fn isend(
        &self,
        send_comm: *mut c_void,
        data: *mut c_void,
        size: c_int,
        kind: c_int,
        request: *mut *mut c_void,
    ) -> Outcome {
        let comm = SendCommId::from_raw(from_opaque(send_comm, "send_comm")?);
        let len = checked_len(data, size)?;
        let memory = memory_type(kind)?;
        if request.is_null() {
            return Err(null("request"));
        }
        // SAFETY: 长度与生命周期约定由宿主保证。
        let buffer = unsafe { RequestBuffer::from_const_parts(data.cast::<u8>(), len, memory) };
        let id = self.transport.isend(comm, buffer)?;
        unsafe { write_out(request, to_opaque(id.as_raw()), "request") }
    }

    /// # Safety
    /// `data` 必须指向至少 `size` 字节的可写内存，并保持有效直到请求完成或连接关闭；
    /// `request` 必须可写。
    pub unsafe fn irecv(
        &self,
        recv_comm: *mut c_void,
        data: *mut c_void,
        size: c_int,
        kind: c_int,
        request: *mut *mut c_void,
    ) -> Outcome {
        let comm = RecvCommId::from_raw(from_opaque(recv_comm, "recv_comm")?);
        let len = checked_len(data, size)?;
        let memory = memory_type(kind)?;
        if request.is_null() {
            return Err(null("request"));
        }
        // SAFETY: 同上。
        let buffer = unsafe { RequestBuffer::from_raw_parts(data.cast::<u8>(), len, memory) };
        let id = self.transport.irecv(comm, buffer)?;
        unsafe { write_out(request, to_opaque(id.as_raw()), "request") }
    }

    /// # Safety
    /// 参数约定同 [`Adapter::irecv`]；本调用不访问 `data`。
    pub unsafe fn flush(&self, recv_comm: *mut c_void, data: *mut c_void, size: c_int) -> Outcome {
        let comm = RecvCommId::from_raw(from_opaque(recv_comm, "recv_comm")?);
        let len = checked_len(data, size)?;
        // 宿主的 flush 不携带内存类型，只有主机内存会走到这里。
        let buffer =
            unsafe { RequestBuffer::from_raw_parts(data.cast::<u8>(), len, MemoryType::Host) };
        self.transport.flush(comm, &buffer)
    }

    /// # Safety
    /// `done` 必须可写；`size` 可以为空，非空时必须可写。
    pub unsafe fn test(&self, request: *mut c_void, done: *mut c_int, size: *mut c_int) -> Outcome {
        let id = RequestId::from_raw(from_opaque(request, "request")?);
        if done.is_null() {
            return Err(null("done"));
        }
        let result = self.transport.test(id)?;
        unsafe { write_out(done, c_int::from(result.done), "done")? };
        if !size.is_null() {
            let bytes = c_int::try_from(result.bytes).unwrap_or(c_int::MAX);
            unsafe { write_out(size, bytes, "size")? };
        }
        Ok(())
    }

    pub fn close_send(&self, send_comm: *mut c_void) -> Outcome {
        let comm = SendCommId::from_raw(from_opaque(send_comm, "send_comm")?);
        self.transport.close_send(comm)
    }

    pub fn close_recv(&self, recv_comm: *mut c_void) -> Outcome {
        let comm = RecvCommId::from_raw(from_opaque(recv_comm, "recv_comm")?);
        self.transport.close_recv(comm)
    }

    pub fn close_listen(&self, listen_comm: *mut c_void) -> Outcome {
        let listen = ListenId::from_raw(from_opaque(listen_comm, "listen_comm")?);
        self.transport.close_listen(listen)
    }
}

fn c_string_lossy(text: &str) -> CString {
    CString::new(text.replace('\0', "")).unwrap_or_default()
}
