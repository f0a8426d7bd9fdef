//! Hive - 多协议实时控制台
//!
//! 入口：初始化日志、加载配置、启动控制台，并等待关闭信号。
//! 可选参数：配置文件路径（覆盖 config/default.toml 中的键）。

use std::path::PathBuf;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{ShutdownManager, ShutdownReason};
use hive::gateway::Console;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let console = Console::start(&config, shutdown.token())
        .await
        .context("Failed to start console")?;
    tracing::info!(
        "hive console ready: http={} tcp={}",
        console.http_addr,
        console.tcp_addr
    );

    // HTTP 服务只会在 token 取消或出错时退出
    let result = console.join().await;
    if let Err(ref e) = result {
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
    }
    if !shutdown.is_shutdown() {
        tracing::warn!("HTTP server exited without a shutdown request");
    }
    if let Some(reason) = shutdown.reason() {
        tracing::info!("exit: {}", reason);
    }
    result.context("Console stopped with error")?;

    Ok(())
}
