//! 核心层：错误类型与关闭信号

pub mod error;
pub mod shutdown;

pub use error::{ConsoleError, HubError, TransportError};
pub use shutdown::{ShutdownManager, ShutdownReason};
