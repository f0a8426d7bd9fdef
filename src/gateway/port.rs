//! HTTP 端口选择
//!
//! 按顺序尝试候选端口，直接保留第一个绑定成功的监听器。

use std::sync::RwLock;

use serde::Serialize;
use tokio::net::TcpListener;

use crate::core::ConsoleError;

/// 端口状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Connecting,
    Connected,
    Failed,
}

impl PortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Connecting => "connecting",
            PortStatus::Connected => "connected",
            PortStatus::Failed => "failed",
        }
    }
}

#[derive(Debug)]
struct PortState {
    current: Option<u16>,
    status: PortStatus,
}

/// 端口管理器
#[derive(Debug)]
pub struct PortManager {
    host: String,
    candidates: Vec<u16>,
    state: RwLock<PortState>,
}

impl PortManager {
    pub fn new(host: impl Into<String>, candidates: Vec<u16>) -> Self {
        Self {
            host: host.into(),
            candidates,
            state: RwLock::new(PortState {
                current: None,
                status: PortStatus::Connecting,
            }),
        }
    }

    /// 依次尝试候选端口；全部失败时状态置为 failed 并返回错误
    pub async fn bind_first_available(&self) -> Result<TcpListener, ConsoleError> {
        self.set_status(PortStatus::Connecting);

        for &port in &self.candidates {
            let addr = format!("{}:{}", self.host, port);
            tracing::info!("Trying port {}", port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    // 候选端口为 0 时以实际分配的端口为准
                    let bound = listener.local_addr()?.port();
                    {
                        let mut state = self.write();
                        state.current = Some(bound);
                        state.status = PortStatus::Connected;
                    }
                    tracing::info!("Successfully bound to port {}", bound);
                    return Ok(listener);
                }
                Err(e) => {
                    tracing::warn!("Port {} unavailable: {}", port, e);
                }
            }
        }

        self.set_status(PortStatus::Failed);
        Err(ConsoleError::NoAvailablePort(self.candidates.clone()))
    }

    /// 当前使用的端口；尚未绑定成功时为 None
    pub fn current_port(&self) -> Option<u16> {
        self.read().current
    }

    pub fn status(&self) -> PortStatus {
        self.read().status
    }

    pub fn set_status(&self, status: PortStatus) {
        self.write().status = status;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PortState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PortState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
