//! 脚本执行 Runner
//!
//! 持有执行器与全局超时，run(script) 在超时内调用执行器；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use super::{ScriptError, ScriptExecutor};

/// 对每次执行施加超时并记录审计日志
pub struct ScriptRunner {
    executor: Arc<dyn ScriptExecutor>,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(executor: Arc<dyn ScriptExecutor>, timeout_secs: u64) -> Self {
        Self::with_timeout(executor, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(executor: Arc<dyn ScriptExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// 执行脚本；超时返回 ScriptError::Timeout
    pub async fn run(&self, script: &str) -> Result<String, ScriptError> {
        let start = Instant::now();
        let result = timeout(self.timeout, self.executor.execute(script)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "script_audit",
            "executor": self.executor.name(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "script_preview": preview(script),
        });
        tracing::info!(audit = %audit.to_string(), "script");

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ScriptError::Timeout(self.timeout)),
        }
    }
}

fn preview(script: &str) -> String {
    if script.chars().count() > 200 {
        format!("{}...", script.chars().take(200).collect::<String>())
    } else {
        script.to_string()
    }
}
