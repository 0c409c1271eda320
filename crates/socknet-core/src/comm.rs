//! # comm 模块说明
//!
//! ## 意图（Why）
//! - 每条连接独占一个套接字，并按提交顺序维护自己的在途请求队列；`test` 推进某个请求时必须先
//!   推进排在它前面的请求，否则字节流会错位；
//! - 连接出现套接字错误后进入粘滞的 `Failed` 状态，之后的操作直接返回同一个错误，不会再尝试
//!   该套接字。
//!
//! ## 状态机（What）
//! - 发送侧：`Connecting → Open`，任一阶段都可能转入 `Failed`；
//! - 接收侧：由 `accept` 直接以 `Open` 创建；
//! - 关闭即从引擎表中移除，不存在显式的 `Closed` 值。

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener, TcpStream};

use tracing::{trace, warn};

use crate::error::{self, NetError, Result};
use crate::ids::RequestId;
use crate::request::{Direction, Request, Step, TestResult};
use crate::socket;

#[derive(Debug)]
pub(crate) enum CommState {
    Connecting,
    Open,
    Failed(NetError),
}

/// 一条已建立（或正在建立）的连接。
#[derive(Debug)]
pub(crate) struct Connection {
    pub dev: usize,
    pub role: Direction,
    pub peer: SocketAddr,
    stream: TcpStream,
    state: CommState,
    queue: VecDeque<RequestId>,
    transferred: u64,
}

impl Connection {
    pub(crate) fn connecting(dev: usize, peer: SocketAddr, stream: TcpStream) -> Self {
        Self::with_state(dev, Direction::Send, peer, stream, CommState::Connecting)
    }

    pub(crate) fn open(dev: usize, role: Direction, peer: SocketAddr, stream: TcpStream) -> Self {
        Self::with_state(dev, role, peer, stream, CommState::Open)
    }

    fn with_state(
        dev: usize,
        role: Direction,
        peer: SocketAddr,
        stream: TcpStream,
        state: CommState,
    ) -> Self {
        Self {
            dev,
            role,
            peer,
            stream,
            state,
            queue: VecDeque::new(),
            transferred: 0,
        }
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred
    }

    pub(crate) fn is_connecting(&self) -> bool {
        matches!(self.state, CommState::Connecting)
    }

    /// 连接已失败时返回粘滞错误。
    pub(crate) fn ensure_healthy(&self) -> Result<()> {
        match &self.state {
            CommState::Failed(err) => Err(sticky(err)),
            _ => Ok(()),
        }
    }

    pub(crate) fn enqueue(&mut self, request: RequestId) {
        self.queue.push_back(request);
    }

    /// 推进本连接的请求队列，直到 `target` 完成或套接字不可继续读写。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - 队首请求依次推进；排在 `target` 之前的请求完成后被标记完成并出队，但仍保留在请求表中，
    ///   等待宿主对它们调用 `test` 时再退役；
    /// - 返回 `target` 当前的进度；是否退役由调用方依据 `done` 决定；
    /// - 套接字错误会把连接置为 `Failed` 并返回该错误。
    ///
    /// ## 逻辑（How）
    /// 1. 建连中的连接先检查握手进度，尚未完成则直接返回未完成；
    /// 2. 循环推进队首，遇到 `WouldBlock` 即停止，不在本次调用中等待。
    pub(crate) fn drive(
        &mut self,
        requests: &mut HashMap<RequestId, Request>,
        target: RequestId,
    ) -> Result<TestResult> {
        self.ensure_healthy()?;

        if self.is_connecting() {
            match socket::connect_status(&self.stream) {
                Ok(true) => {
                    trace!(peer = %self.peer, "connection established");
                    self.state = CommState::Open;
                }
                Ok(false) => return Ok(progress_of(requests, target)),
                Err(err) => return Err(self.fail(err)),
            }
        }

        while let Some(&head) = self.queue.front() {
            let Some(request) = requests.get_mut(&head) else {
                self.queue.pop_front();
                continue;
            };
            match request.advance(&mut self.stream) {
                Ok((step, moved)) => {
                    self.transferred += moved as u64;
                    if moved > 0 {
                        trace!(
                            request = %head,
                            bytes = request.transferred(),
                            size = request.size(),
                            "request progressed"
                        );
                    }
                    match step {
                        Step::Complete => {
                            self.queue.pop_front();
                            if head == target {
                                break;
                            }
                        }
                        Step::Blocked => break,
                    }
                }
                Err(err) => return Err(self.fail(err)),
            }
        }

        Ok(progress_of(requests, target))
    }

    fn fail(&mut self, err: NetError) -> NetError {
        warn!(
            peer = %self.peer,
            code = err.code(),
            error = %err,
            "connection failed; further operations will report this error"
        );
        self.state = CommState::Failed(err.clone());
        err
    }
}

fn sticky(err: &NetError) -> NetError {
    NetError::new(
        err.kind(),
        error::COMM_FAILED,
        format!("connection previously failed: {err}"),
    )
}

fn progress_of(requests: &HashMap<RequestId, Request>, target: RequestId) -> TestResult {
    match requests.get(&target) {
        Some(request) if request.is_complete() => TestResult::done(request.transferred()),
        Some(request) => TestResult::pending(request.transferred()),
        None => TestResult::pending(0),
    }
}

/// 被动打开条目。
#[derive(Debug)]
pub(crate) enum ListenState {
    Listening(TcpListener),
    Accepted,
}

#[derive(Debug)]
pub(crate) struct ListenEntry {
    pub dev: usize,
    pub local: SocketAddr,
    pub state: ListenState,
}
