//! 关闭处理
//!
//! Ctrl+C / SIGTERM 或致命错误触发后取消 token，TCP accept 循环、会话清理任务与 HTTP 服务随之退出。
//! 不做排空：队列中尚未发出的广播行在进程退出时直接丢弃。

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserInitiated => write!(f, "interrupted"),
            ShutdownReason::Signal => write!(f, "terminated by signal"),
            ShutdownReason::FatalError(e) => write!(f, "fatal error: {}", e),
        }
    }
}

/// 关闭信号管理器；克隆后共享同一个 token
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    /// 只记录第一次触发的原因
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 传给各个后台循环的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；只有第一次调用生效，返回是否由本次调用触发
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return false;
            }
            tracing::info!("shutting down: {}", reason);
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理器
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let manager = self.clone();
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        if sigterm.recv().await.is_some() {
                            manager.shutdown(ShutdownReason::Signal);
                        }
                    }
                    Err(e) => tracing::warn!("cannot install SIGTERM handler: {}", e),
                }
            });
        }
    }
}
