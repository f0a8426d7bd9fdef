//! Hive - 多协议实时控制台
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与关闭处理
//! - **gateway**: 连接中枢（Hub）、WebSocket / TCP 接入、HTTP 接口、会话门禁
//! - **observability**: 日志初始化
//! - **tools**: 脚本执行器与内置 Lua 引擎

pub mod config;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod tools;
