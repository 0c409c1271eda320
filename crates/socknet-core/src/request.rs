//! 在途请求与单步推进逻辑。

use std::io::{self, Read};
use std::net::TcpStream;

use socket2::SockRef;

use crate::buffer::RequestBuffer;
use crate::error::{self, NetError, Result, map_io_error};

/// 请求方向。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Send,
    Recv,
}

/// `test` 的结果：是否完成以及迄今传输的字节数。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TestResult {
    pub done: bool,
    pub bytes: usize,
}

impl TestResult {
    pub fn pending(bytes: usize) -> Self {
        Self { done: false, bytes }
    }

    pub fn done(bytes: usize) -> Self {
        Self { done: true, bytes }
    }
}

/// 一次推进尝试的结果。
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Step {
    /// 请求所需字节已全部传输。
    Complete,
    /// 套接字暂时不可读写，需等待下一次 `test`。
    Blocked,
}

#[derive(Debug)]
pub(crate) struct Request {
    pub comm: u64,
    pub direction: Direction,
    buffer: RequestBuffer,
    transferred: usize,
    complete: bool,
}

impl Request {
    pub(crate) fn new(comm: u64, direction: Direction, buffer: RequestBuffer) -> Self {
        Self {
            comm,
            direction,
            buffer,
            transferred: 0,
            complete: false,
        }
    }

    pub(crate) fn transferred(&self) -> usize {
        self.transferred
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn size(&self) -> usize {
        self.buffer.len()
    }

    /// 对套接字做非阻塞读写，直到请求完成或套接字返回 `WouldBlock`。
    ///
    /// 返回值的第二项为本次推进新传输的字节数。
    pub(crate) fn advance(&mut self, stream: &mut TcpStream) -> Result<(Step, usize)> {
        let start = self.transferred;
        let size = self.buffer.len();
        while self.transferred < size {
            let range = self.transferred..size;
            let attempt = match self.direction {
                // MSG_NOSIGNAL：对端已关闭时以 EPIPE 报错，而不是向宿主进程投递 SIGPIPE。
                Direction::Send => SockRef::from(&*stream)
                    .send_with_flags(self.buffer.bytes(range), libc::MSG_NOSIGNAL),
                Direction::Recv => stream.read(self.buffer.bytes_mut(range)),
            };
            match attempt {
                Ok(0) => return Err(self.zero_progress_error()),
                Ok(n) => self.transferred += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((Step::Blocked, self.transferred - start));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let op = match self.direction {
                        Direction::Send => error::WRITE,
                        Direction::Recv => error::READ,
                    };
                    return Err(map_io_error(op, err));
                }
            }
        }
        self.complete = true;
        Ok((Step::Complete, self.transferred - start))
    }

    fn zero_progress_error(&self) -> NetError {
        match self.direction {
            Direction::Recv => NetError::connection(
                error::PEER_CLOSED,
                format!(
                    "peer closed the connection after {} of {} bytes",
                    self.transferred,
                    self.buffer.len()
                ),
            ),
            Direction::Send => map_io_error(error::WRITE, io::Error::from(io::ErrorKind::WriteZero)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryType;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        client.set_nonblocking(true).expect("nonblocking");
        server.set_nonblocking(true).expect("nonblocking");
        (client, server)
    }

    #[test]
    fn short_reads_accumulate_until_the_buffer_is_full() {
        let (mut client, mut server) = pair();
        let mut payload = *b"ab";
        let mut sink = [0u8; 4];
        let mut send = Request::new(1, Direction::Send, unsafe {
            RequestBuffer::from_raw_parts(payload.as_mut_ptr(), payload.len(), MemoryType::Host)
        });
        let mut recv = Request::new(2, Direction::Recv, unsafe {
            RequestBuffer::from_raw_parts(sink.as_mut_ptr(), sink.len(), MemoryType::Host)
        });

        assert_eq!(send.advance(&mut client).expect("send"), (Step::Complete, 2));
        let mut received = 0;
        for _ in 0..10_000 {
            let (step, moved) = recv.advance(&mut server).expect("recv");
            received += moved;
            assert_eq!(step, Step::Blocked);
            if received == 2 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(recv.transferred(), 2);
        assert!(!recv.is_complete());
        drop(send);
        drop(recv);
        assert_eq!(&sink[..2], b"ab");
    }

    #[test]
    fn eof_before_completion_is_a_connection_error() {
        let (client, mut server) = pair();
        drop(client);
        let mut sink = [0u8; 8];
        let mut recv = Request::new(1, Direction::Recv, unsafe {
            RequestBuffer::from_raw_parts(sink.as_mut_ptr(), sink.len(), MemoryType::Host)
        });
        let mut outcome = None;
        for _ in 0..10_000 {
            match recv.advance(&mut server) {
                Ok((Step::Blocked, _)) => std::thread::yield_now(),
                other => {
                    outcome = Some(other);
                    break;
                }
            }
        }
        let err = outcome.expect("eof observed").expect_err("peer closed");
        assert_eq!(err.code(), error::PEER_CLOSED);
        assert_eq!(err.kind(), crate::ErrorKind::Connection);
    }
}
