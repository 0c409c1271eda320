//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为传输核心的全部失败路径提供唯一的错误类型 [`NetError`]，携带稳定错误码与粗粒度分类
//!   [`ErrorKind`]，插件适配层据此统一折叠为宿主 ABI 的 `InternalError`；
//! - 每一种底层套接字操作对应一个 [`OperationKind`]，IO 错误经 [`map_io_error`] 归类后
//!   进入错误链，保证日志中的错误码可以直接定位到发生失败的系统调用。
//!
//! ## 契约（What）
//! - `NotReady` 不是错误：`accept` 以 [`core::task::Poll::Pending`] 表达，`test` 以
//!   `done == false` 表达，二者都不会构造 [`NetError`]；
//! - 连接级错误具有“粘滞”语义，由 `comm` 模块负责记录，本模块只负责构造。

use std::borrow::Cow;
use std::io;

use thiserror::Error;

/// 传输核心统一的返回别名。
pub type Result<T, E = NetError> = core::result::Result<T, E>;

/// 错误的粗粒度分类。
///
/// - `InvalidArgument`：未知/越界/已关闭的 id，或格式错误的句柄；
/// - `Resource`：套接字创建、绑定、监听失败或通信器数量超限；
/// - `Connection`：对端不可达、拒绝、重置或提前关闭；
/// - `Internal`：兜底分类，例如引擎已关闭。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    Resource,
    Connection,
    Internal,
}

impl ErrorKind {
    /// 返回用于日志字段的稳定名称。
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Resource => "resource",
            ErrorKind::Connection => "connection",
            ErrorKind::Internal => "internal",
        }
    }
}

/// 传输核心错误。
///
/// # 教案式说明
/// - **意图 (Why)**：以“稳定错误码 + 人类可读消息”作为
///   最小诊断单元，同时附带 [`ErrorKind`] 让适配层和测试无需解析字符串即可判断类别；
/// - **契约 (What)**：`code` 遵循 `socknet.core.<语义>` 命名，进程生命周期内不变；`message`
///   只用于诊断输出，不承诺格式稳定；
/// - **权衡 (Trade-offs)**：消息以 `Cow<'static, str>` 保存，静态文案零分配，IO 错误的动态
///   描述付出一次堆分配。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("[{code}] {message}")]
pub struct NetError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
}

impl NetError {
    /// 以分类、错误码与消息构造错误。
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::InvalidArgument, code, message)
    }

    pub fn resource(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Resource, code, message)
    }

    pub fn connection(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Connection, code, message)
    }

    pub fn internal(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, code, message)
    }

    /// 错误分类。
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 诊断消息。
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const SOCKET: OperationKind = OperationKind {
    code: "socknet.core.socket_failed",
    message: "tcp socket",
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: "socknet.core.bind_failed",
    message: "tcp bind",
};
pub(crate) const LISTEN: OperationKind = OperationKind {
    code: "socknet.core.listen_failed",
    message: "tcp listen",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "socknet.core.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "socknet.core.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "socknet.core.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "socknet.core.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "socknet.core.configure_failed",
    message: "tcp configure",
};

pub const UNKNOWN_DEVICE: &str = "socknet.core.unknown_device";
pub const UNKNOWN_ID: &str = "socknet.core.unknown_id";
pub const ALREADY_ACCEPTED: &str = "socknet.core.already_accepted";
pub const BAD_HANDLE: &str = "socknet.core.bad_handle";
pub const UNSUPPORTED_MEMORY: &str = "socknet.core.unsupported_memory";
pub const TOO_MANY_COMMS: &str = "socknet.core.too_many_comms";
pub const PEER_CLOSED: &str = "socknet.core.peer_closed";
pub const COMM_FAILED: &str = "socknet.core.comm_failed";
pub const SHUT_DOWN: &str = "socknet.core.shut_down";

/// 将 IO 错误映射为传输核心错误，并附带错误分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> NetError {
    NetError::new(
        categorize_io_error(&error),
        kind.code,
        Cow::Owned(format!("{}: {}", kind.message, error)),
    )
}

fn categorize_io_error(error: &io::Error) -> ErrorKind {
    use io::ErrorKind as Io;
    match error.kind() {
        Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe
        | Io::UnexpectedEof
        | Io::WriteZero
        | Io::TimedOut
        | Io::HostUnreachable
        | Io::NetworkUnreachable => ErrorKind::Connection,
        Io::AddrInUse | Io::AddrNotAvailable | Io::PermissionDenied | Io::OutOfMemory => {
            ErrorKind::Resource
        }
        _ => match error.raw_os_error() {
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS) => ErrorKind::Resource,
            _ => ErrorKind::Internal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_categorized_by_cause() {
        let refused = map_io_error(CONNECT, io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.kind(), ErrorKind::Connection);
        assert_eq!(refused.code(), CONNECT.code);
        assert!(refused.message().starts_with("tcp connect"));

        let in_use = map_io_error(BIND, io::Error::from(io::ErrorKind::AddrInUse));
        assert_eq!(in_use.kind(), ErrorKind::Resource);

        let fd_limit = map_io_error(SOCKET, io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(fd_limit.kind(), ErrorKind::Resource);

        let other = map_io_error(READ, io::Error::other("boom"));
        assert_eq!(other.kind(), ErrorKind::Internal);
    }

    #[test]
    fn display_carries_code_and_message() {
        let err = NetError::invalid_argument(UNKNOWN_ID, "send comm 7 is not registered");
        assert_eq!(
            err.to_string(),
            "[socknet.core.unknown_id] send comm 7 is not registered"
        );
    }
}
