#![doc = r#"
# socknet-plugin

## 设计动机（Why）
- **定位**：把 `socknet-core` 的套接字传输引擎包装成集合通信库可以 `dlopen` 的网络插件，
  宿主通过导出的函数表 `ncclNetPlugin` 发现并调用它。
- **架构角色**：纯翻译层。所有传输语义都在核心里，本 crate 只负责 ABI 参数的解码、返回码的
  折叠以及把 `tracing` 日志转交宿主。

## 核心契约（What）
- 函数表中的每个入口都返回 `ncclResult_t`：成功为 `Success`，任何失败为 `InternalError`，
  失败细节写入日志而不是返回值；
- `init` 可重复调用，日志桥与引擎单例都只创建一次；
- 插件导出给宿主的指针都是不透明 id，宿主只能原样传回。

## 实现策略（How）
- `adapter` 模块持有进程级单例并实现参数翻译；
- `log` 模块提供 `HostLogLayer`，把事件转成宿主 printf 风格的日志调用；
- `ffi` 模块只声明 C 布局。

## 风险与考量（Trade-offs）
- 进程退出时的关闭是尽力而为的，仍在途的数据不会被冲刷；
- 宿主与插件之间不做版本协商，函数表布局固定为当前这一版。
"#]

pub mod adapter;
pub mod ffi;
pub mod log;

use std::ffi::{c_int, c_void};

use tracing::debug;

use crate::adapter::adapter;
use crate::ffi::{NcclDebugLogger, NcclNet, NcclNetProperties, NcclResult};

pub use crate::log::HostLogLayer;

unsafe extern "C" fn socknet_init(logger: NcclDebugLogger) -> NcclResult {
    if let Err(err) = log::install(logger) {
        debug!(error = %err, "host log bridge not installed");
    }
    let adapter = adapter();
    adapter.finish("init", adapter.init())
}

unsafe extern "C" fn socknet_devices(ndev: *mut c_int) -> NcclResult {
    let adapter = adapter();
    adapter.finish("devices", unsafe { adapter.devices(ndev) })
}

unsafe extern "C" fn socknet_get_properties(
    dev: c_int,
    props: *mut NcclNetProperties,
) -> NcclResult {
    let adapter = adapter();
    adapter.finish("get_properties", unsafe { adapter.get_properties(dev, props) })
}

unsafe extern "C" fn socknet_listen(
    dev: c_int,
    handle: *mut c_void,
    listen_comm: *mut *mut c_void,
) -> NcclResult {
    let adapter = adapter();
    adapter.finish("listen", unsafe { adapter.listen(dev, handle, listen_comm) })
}

unsafe extern "C" fn socknet_connect(
    dev: c_int,
    handle: *mut c_void,
    send_comm: *mut *mut c_void,
) -> NcclResult {
    let adapter = adapter();
    adapter.finish("connect", unsafe { adapter.connect(dev, handle, send_comm) })
}

unsafe extern "C" fn socknet_accept(
    listen_comm: *mut c_void,
    recv_comm: *mut *mut c_void,
) -> NcclResult {
    let adapter = adapter();
    adapter.finish("accept", unsafe { adapter.accept(listen_comm, recv_comm) })
}

unsafe extern "C" fn socknet_isend(
    send_comm: *mut c_void,
    data: *mut c_void,
    size: c_int,
    kind: c_int,
    request: *mut *mut c_void,
) -> NcclResult {
    let adapter = adapter();
    adapter.finish("isend", unsafe {
        adapter.isend(send_comm, data, size, kind, request)
    })
}

unsafe extern "C" fn socknet_irecv(
    recv_comm: *mut c_void,
    data: *mut c_void,
    size: c_int,
    kind: c_int,
    request: *mut *mut c_void,
) -> NcclResult {
    let adapter = adapter();
    adapter.finish("irecv", unsafe {
        adapter.irecv(recv_comm, data, size, kind, request)
    })
}

unsafe extern "C" fn socknet_flush(
    recv_comm: *mut c_void,
    data: *mut c_void,
    size: c_int,
) -> NcclResult {
    let adapter = adapter();
    adapter.finish("flush", unsafe { adapter.flush(recv_comm, data, size) })
}

unsafe extern "C" fn socknet_test(
    request: *mut c_void,
    done: *mut c_int,
    size: *mut c_int,
) -> NcclResult {
    let adapter = adapter();
    adapter.finish("test", unsafe { adapter.test(request, done, size) })
}

unsafe extern "C" fn socknet_close_send(send_comm: *mut c_void) -> NcclResult {
    let adapter = adapter();
    adapter.finish("close_send", adapter.close_send(send_comm))
}

unsafe extern "C" fn socknet_close_recv(recv_comm: *mut c_void) -> NcclResult {
    let adapter = adapter();
    adapter.finish("close_recv", adapter.close_recv(recv_comm))
}

unsafe extern "C" fn socknet_close_listen(listen_comm: *mut c_void) -> NcclResult {
    let adapter = adapter();
    adapter.finish("close_listen", adapter.close_listen(listen_comm))
}

/// 宿主通过符号名查找的插件函数表。
///
/// 布局对应网络插件 ABI 的 v1 版本：`isend`/`irecv` 携带内存类型标签，`flush` 只有三个参数，
/// 没有 `regMr`/`deregMr` 内存注册入口。要求版本化符号名的宿主需要另行导出别名。
#[allow(non_upper_case_globals)]
#[unsafe(no_mangle)]
pub static ncclNetPlugin: NcclNet = NcclNet {
    name: c"Socknet".as_ptr(),
    init: socknet_init,
    devices: socknet_devices,
    get_properties: socknet_get_properties,
    listen: socknet_listen,
    connect: socknet_connect,
    accept: socknet_accept,
    isend: socknet_isend,
    irecv: socknet_irecv,
    flush: socknet_flush,
    test: socknet_test,
    close_send: socknet_close_send,
    close_recv: socknet_close_recv,
    close_listen: socknet_close_listen,
};
