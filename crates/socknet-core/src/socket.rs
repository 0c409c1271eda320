use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::config::NetConfig;
use crate::error::{self, Result, map_io_error};

/// 应用到每条已建立连接上的套接字选项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 集合通信的消息多为小块控制数据与大块张量交替出现，关闭 Nagle 能避免小块数据被合并延迟；
/// - `SO_LINGER` 决定进程退出时仍在发送缓冲区中的数据如何处理，交由部署方按需配置。
///
/// ## 契约（What）
/// - `apply`：对一个已创建的 `TcpStream` 写入选项；失败时返回 `socknet.core.configure_failed`；
/// - `linger = None` 表示沿用内核默认策略。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct SocketOptions {
    nodelay: bool,
    linger: Option<Duration>,
}

impl SocketOptions {
    pub(crate) fn from_config(config: &NetConfig) -> Self {
        Self {
            nodelay: config.nodelay,
            linger: config.linger(),
        }
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> Result<()> {
        stream
            .set_nodelay(self.nodelay)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        if self.linger.is_some() {
            SockRef::from(stream)
                .set_linger(self.linger)
                .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        }
        Ok(())
    }
}

/// 在 `addr`（端口通常为 0）上创建非阻塞监听套接字。
pub(crate) fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| map_io_error(error::SOCKET, err))?;
    socket
        .set_reuse_address(true)
        .map_err(|err| map_io_error(error::CONFIGURE, err))?;
    socket
        .bind(&addr.into())
        .map_err(|err| map_io_error(error::BIND, err))?;
    socket
        .listen(backlog)
        .map_err(|err| map_io_error(error::LISTEN, err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| map_io_error(error::CONFIGURE, err))?;
    Ok(socket.into())
}

/// 非阻塞地接受一个连接；没有待接受的连接时返回 `Ok(None)`。
pub(crate) fn try_accept(listener: &TcpListener) -> Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream
                    .set_nonblocking(true)
                    .map_err(|err| map_io_error(error::CONFIGURE, err))?;
                return Ok(Some((stream, peer)));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(map_io_error(error::ACCEPT, err)),
        }
    }
}

/// 发起非阻塞建连。返回的布尔值表示握手是否已经同步完成。
pub(crate) fn start_connect(addr: SocketAddr) -> Result<(TcpStream, bool)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| map_io_error(error::SOCKET, err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| map_io_error(error::CONFIGURE, err))?;
    let established = match socket.connect(&addr.into()) {
        Ok(()) => true,
        Err(err) if connect_in_progress(&err) => false,
        Err(err) => return Err(map_io_error(error::CONNECT, err)),
    };
    Ok((socket.into(), established))
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || matches!(err.raw_os_error(), Some(libc::EINPROGRESS | libc::EINTR))
}

/// 查询非阻塞建连的进度：`Ok(true)` 表示已建立，`Ok(false)` 表示握手仍在进行。
pub(crate) fn connect_status(stream: &TcpStream) -> Result<bool> {
    if let Some(err) = stream
        .take_error()
        .map_err(|err| map_io_error(error::CONNECT, err))?
    {
        return Err(map_io_error(error::CONNECT, err));
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(err) => Err(map_io_error(error::CONNECT, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn listener_gets_ephemeral_port_and_accept_is_non_blocking() {
        let listener = bind_listener("127.0.0.1:0".parse().expect("addr"), 16).expect("bind");
        let local = listener.local_addr().expect("local addr");
        assert_ne!(local.port(), 0);
        assert!(try_accept(&listener).expect("poll accept").is_none());

        let (stream, _) = start_connect(local).expect("connect");
        let mut accepted = None;
        for _ in 0..10_000 {
            if let Some(pair) = try_accept(&listener).expect("accept") {
                accepted = Some(pair);
                break;
            }
            thread::yield_now();
        }
        assert!(accepted.is_some(), "loopback connect must be accepted");

        let mut ready = false;
        for _ in 0..10_000 {
            if connect_status(&stream).expect("status") {
                ready = true;
                break;
            }
            thread::yield_now();
        }
        assert!(ready);
    }

    #[test]
    fn options_are_written_to_the_socket() {
        let listener = bind_listener("127.0.0.1:0".parse().expect("addr"), 4).expect("bind");
        let (stream, _) = start_connect(listener.local_addr().expect("addr")).expect("connect");
        let options = SocketOptions {
            nodelay: true,
            linger: Some(Duration::from_secs(1)),
        };
        options.apply(&stream).expect("apply");
        assert!(stream.nodelay().expect("nodelay"));
        assert_eq!(
            SockRef::from(&stream).linger().expect("linger"),
            Some(Duration::from_secs(1))
        );
    }
}
