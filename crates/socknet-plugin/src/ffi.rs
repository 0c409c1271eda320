//! 宿主网络插件 ABI 的 C 布局定义。
//!
//! 布局、枚举取值与函数签名必须与宿主头文件逐字段一致；这里只做类型声明，不含任何逻辑。

use std::ffi::{c_char, c_int, c_ulong, c_void};

/// 宿主的返回码。
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NcclResult {
    Success = 0,
    UnhandledCudaError = 1,
    SystemError = 2,
    InternalError = 3,
    InvalidArgument = 4,
    InvalidUsage = 5,
    RemoteError = 6,
    InProgress = 7,
}

/// 宿主日志级别。
pub const LOG_NONE: c_int = 0;
pub const LOG_VERSION: c_int = 1;
pub const LOG_WARN: c_int = 2;
pub const LOG_INFO: c_int = 3;
pub const LOG_ABORT: c_int = 4;
pub const LOG_TRACE: c_int = 5;

/// 宿主日志子系统位：网络。
pub const SUBSYS_NET: c_ulong = 0x10;

/// 宿主提供的日志回调，`fmt` 为 printf 风格格式串。
pub type NcclDebugLogger = Option<
    unsafe extern "C" fn(
        level: c_int,
        flags: c_ulong,
        file: *const c_char,
        line: c_int,
        fmt: *const c_char,
        ...
    ),
>;

/// 设备属性；字符串指针由插件持有，在插件生命周期内有效。
#[repr(C)]
#[derive(Debug)]
pub struct NcclNetProperties {
    pub name: *mut c_char,
    pub pci_path: *mut c_char,
    pub guid: u64,
    pub ptr_support: c_int,
    pub speed: c_int,
    pub port: c_int,
    pub max_comms: c_int,
}

impl Default for NcclNetProperties {
    fn default() -> Self {
        Self {
            name: std::ptr::null_mut(),
            pci_path: std::ptr::null_mut(),
            guid: 0,
            ptr_support: 0,
            speed: 0,
            port: 0,
            max_comms: 0,
        }
    }
}

/// 导出的函数表。
#[repr(C)]
pub struct NcclNet {
    pub name: *const c_char,
    pub init: unsafe extern "C" fn(logger: NcclDebugLogger) -> NcclResult,
    pub devices: unsafe extern "C" fn(ndev: *mut c_int) -> NcclResult,
    pub get_properties:
        unsafe extern "C" fn(dev: c_int, props: *mut NcclNetProperties) -> NcclResult,
    pub listen: unsafe extern "C" fn(
        dev: c_int,
        handle: *mut c_void,
        listen_comm: *mut *mut c_void,
    ) -> NcclResult,
    pub connect: unsafe extern "C" fn(
        dev: c_int,
        handle: *mut c_void,
        send_comm: *mut *mut c_void,
    ) -> NcclResult,
    pub accept:
        unsafe extern "C" fn(listen_comm: *mut c_void, recv_comm: *mut *mut c_void) -> NcclResult,
    pub isend: unsafe extern "C" fn(
        send_comm: *mut c_void,
        data: *mut c_void,
        size: c_int,
        kind: c_int,
        request: *mut *mut c_void,
    ) -> NcclResult,
    pub irecv: unsafe extern "C" fn(
        recv_comm: *mut c_void,
        data: *mut c_void,
        size: c_int,
        kind: c_int,
        request: *mut *mut c_void,
    ) -> NcclResult,
    pub flush:
        unsafe extern "C" fn(recv_comm: *mut c_void, data: *mut c_void, size: c_int) -> NcclResult,
    pub test:
        unsafe extern "C" fn(request: *mut c_void, done: *mut c_int, size: *mut c_int) -> NcclResult,
    pub close_send: unsafe extern "C" fn(send_comm: *mut c_void) -> NcclResult,
    pub close_recv: unsafe extern "C" fn(recv_comm: *mut c_void) -> NcclResult,
    pub close_listen: unsafe extern "C" fn(listen_comm: *mut c_void) -> NcclResult,
}

// SAFETY: 表中只有指向静态 C 字符串的指针与函数指针，全部只读。
unsafe impl Sync for NcclNet {}
