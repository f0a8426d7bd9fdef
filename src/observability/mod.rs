//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 未设置 RUST_LOG 时的默认过滤
const DEFAULT_DIRECTIVE: &str = "hive=info,tower_http=info";

/// 初始化日志：默认 `hive=info`，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
