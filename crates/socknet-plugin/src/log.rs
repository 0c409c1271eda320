//! # log 模块说明
//!
//! ## 意图（Why）
//! - 传输核心只通过 `tracing` 宏输出结构化事件；宿主则提供一个 printf 风格的日志回调。本模块
//!   用一个 `tracing-subscriber` 的 [`Layer`] 把两者接起来，使插件日志与宿主自身日志出现在同一
//!   输出流里，并受宿主的级别/子系统过滤控制；
//!
//! ## 契约（What）
//! - 级别映射：`ERROR`/`WARN` → 宿主 WARN，`INFO` → INFO，`DEBUG`/`TRACE` → TRACE；
//! - 子系统位固定为 NET，格式串固定为 `"%s"`，消息中的 `%` 因此不会被宿主再次解释；
//! - 宿主传入空回调时事件被丢弃；
//! - 进程退出阶段调用 [`detach`] 之后，事件不再转交宿主，宿主日志设施此时可能已被销毁；
//! - 过滤表达式取自 `SOCKNET_LOG`，缺省为 `info`。
//!
//! ## 风险提示（Trade-offs）
//! - 全局 subscriber 只能设置一次；若宿主进程里已有其它 Rust 组件先行安装，本层不会生效，
//!   插件事件改由那个 subscriber 处理。

use std::ffi::{CString, c_int};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber, dispatcher};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::{EnvFilter, Registry};

use crate::ffi::{LOG_INFO, LOG_TRACE, LOG_WARN, NcclDebugLogger, SUBSYS_NET};

/// 日志过滤表达式所在的环境变量。
pub const ENV_LOG_FILTER: &str = "SOCKNET_LOG";

static DETACHED: AtomicBool = AtomicBool::new(false);

/// 切断日志桥：之后的事件一律丢弃，不再调用宿主回调。
pub fn detach() {
    DETACHED.store(true, Ordering::Release);
}

pub fn is_detached() -> bool {
    DETACHED.load(Ordering::Acquire)
}

/// 安装日志桥失败的原因。
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("a global tracing subscriber has already been set")]
    SubscriberAlreadySet,
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 把 `tracing` 事件转发给宿主日志回调的 Layer。
#[derive(Clone, Copy)]
pub struct HostLogLayer {
    logger: NcclDebugLogger,
}

impl HostLogLayer {
    pub fn new(logger: NcclDebugLogger) -> Self {
        Self { logger }
    }
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(logger) = self.logger else {
            return;
        };
        if is_detached() {
            return;
        }
        let metadata = event.metadata();
        let text = c_string(render_event(event));
        let file = c_string(metadata.file().unwrap_or_default().to_owned());
        let line = metadata
            .line()
            .and_then(|line| c_int::try_from(line).ok())
            .unwrap_or(0);
        // SAFETY: 回调由宿主在 init 时提供；所有指针在调用期间有效且以 NUL 结尾。
        unsafe {
            logger(
                host_level(*metadata.level()),
                SUBSYS_NET,
                file.as_ptr(),
                line,
                c"%s".as_ptr(),
                text.as_ptr(),
            );
        }
    }
}

/// `tracing` 级别到宿主级别的映射。
pub fn host_level(level: Level) -> c_int {
    match level {
        Level::ERROR | Level::WARN => LOG_WARN,
        Level::INFO => LOG_INFO,
        _ => LOG_TRACE,
    }
}

/// 把事件渲染为单行文本：`消息 key=value ...`，并附带模块路径前缀。
pub fn render_event(event: &Event<'_>) -> String {
    let mut visitor = MessageVisitor::default();
    event.record(&mut visitor);
    format!("socknet {}: {}", event.metadata().target(), visitor.finish())
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_owned()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

fn c_string(text: String) -> CString {
    CString::new(text).unwrap_or_else(|err| {
        let mut bytes = err.into_vec();
        bytes.retain(|byte| *byte != 0);
        CString::new(bytes).unwrap_or_default()
    })
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG_FILTER).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局 subscriber：`EnvFilter` + [`HostLogLayer`]。
///
/// # 教案式说明
/// - **意图（Why）**：插件被 `dlopen` 进宿主进程，没有自己的 `main`，只能在宿主第一次调用
///   `init` 时安装日志桥；
/// - **契约（What）**：已有全局 subscriber 时返回 [`InstallError::SubscriberAlreadySet`]，调用方
///   应视为非致命；成功后本模块的事件全部经由宿主回调输出。
pub fn install(logger: NcclDebugLogger) -> Result<(), InstallError> {
    if dispatcher::has_been_set() {
        return Err(InstallError::SubscriberAlreadySet);
    }
    let subscriber = Registry::default()
        .with(build_env_filter())
        .with(HostLogLayer::new(logger));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Capture {
        lines: Arc<Mutex<Vec<(c_int, String)>>>,
    }

    impl<S: Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            self.lines
                .lock()
                .push((host_level(*event.metadata().level()), render_event(event)));
        }
    }

    #[test]
    fn levels_collapse_onto_host_levels() {
        assert_eq!(host_level(Level::ERROR), LOG_WARN);
        assert_eq!(host_level(Level::WARN), LOG_WARN);
        assert_eq!(host_level(Level::INFO), LOG_INFO);
        assert_eq!(host_level(Level::DEBUG), LOG_TRACE);
        assert_eq!(host_level(Level::TRACE), LOG_TRACE);
    }

    #[test]
    fn events_render_message_then_fields() {
        let capture = Capture::default();
        let subscriber = Registry::default().with(capture.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(code = "socknet.core.unknown_id", dev = 3, "operation failed");
            tracing::debug!(bytes = 42);
        });

        let lines = capture.lines.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, LOG_WARN);
        assert!(
            lines[0]
                .1
                .ends_with("operation failed code=socknet.core.unknown_id dev=3"),
            "unexpected rendering: {}",
            lines[0].1
        );
        assert_eq!(lines[1].0, LOG_TRACE);
        assert!(lines[1].1.ends_with(": bytes=42"));
    }

    #[test]
    fn null_logger_drops_events() {
        let subscriber = Registry::default().with(HostLogLayer::new(None));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("nobody is listening");
        });
    }

    #[test]
    fn interior_nul_bytes_are_stripped() {
        assert_eq!(c_string("a\0b".to_owned()).as_bytes(), b"ab");
    }
}
