//! 脚本执行（命令中继的外部协作方）
//!
//! `ScriptExecutor` 是执行边界：TCP 的 `EXEC:` 命令与 HTTP `/execute` 都经由 `ScriptRunner`
//! 调用它，Runner 负责超时与审计日志。

pub mod executor;
pub mod script;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use executor::ScriptRunner;
pub use script::LuaEngine;

/// 脚本执行错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("script timed out after {0:?}")]
    Timeout(Duration),
}

/// 脚本执行器 trait
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// 执行器名称（用于审计日志）
    fn name(&self) -> &str;

    /// 执行脚本，返回结果文本
    async fn execute(&self, script: &str) -> Result<String, ScriptError>;
}
