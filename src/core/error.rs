//! 控制台错误类型
//!
//! 端点内部的传输错误不会上抛（由端点自身的读写任务就地处理），这里只覆盖启动期错误与 Hub 通道关闭。

use thiserror::Error;

/// 启动与运行期的顶层错误（绑定端口、加载配置等）
#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("No available port among {0:?}")]
    NoAvailablePort(Vec<u16>),

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Hub 控制循环相关错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// 控制循环已退出，无法再提交操作
    #[error("Hub control loop is closed")]
    Closed,
}

/// 单个端点的传输错误；只终结该端点，不影响 Hub 与其它端点
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Deadline exceeded after {0:?}")]
    Deadline(std::time::Duration),
}
