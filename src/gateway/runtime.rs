//! 控制台运行时
//!
//! 把各部件装配起来：绑定 HTTP 与 TCP 端口、启动 Hub 控制循环、预置 Token、
//! 启动 TCP accept 循环与 HTTP 服务。所有后台任务共享同一个关闭 token。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::http::{router, AppState};
use super::hub::{Hub, HubConfig, HubHandle};
use super::port::{PortManager, PortStatus};
use super::session::MemorySessionGate;
use super::tcp::{self, TcpSettings};
use super::ws::WsSettings;
use crate::config::AppConfig;
use crate::core::ConsoleError;
use crate::tools::{LuaEngine, ScriptRunner};

/// 过期会话清理间隔
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// 运行中的控制台
pub struct RunningConsole {
    pub http_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    pub hub: HubHandle,
    pub gate: Arc<MemorySessionGate>,
    pub ports: Arc<PortManager>,
    shutdown: CancellationToken,
    http: JoinHandle<std::io::Result<()>>,
    background: Vec<JoinHandle<()>>,
}

/// 控制台入口
pub struct Console;

impl Console {
    /// 绑定端口并启动所有任务；任一端口绑定失败即返回错误
    pub async fn start(
        config: &AppConfig,
        shutdown: CancellationToken,
    ) -> Result<RunningConsole, ConsoleError> {
        config.validate()?;

        let ports = Arc::new(PortManager::new(
            config.server.host.clone(),
            config.server.http_ports.clone(),
        ));
        let http_listener = ports.bind_first_available().await?;
        let http_addr = http_listener.local_addr()?;

        let tcp_listener = match TcpListener::bind((config.server.host.as_str(), config.server.tcp_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                ports.set_status(PortStatus::Failed);
                tracing::error!("Error starting TCP server: {}", e);
                return Err(e.into());
            }
        };
        let tcp_addr = tcp_listener.local_addr()?;

        let (hub, hub_task) = Hub::spawn(HubConfig {
            queue_capacity: config.hub.queue_capacity,
            port_label: http_addr.port().to_string(),
        });

        let gate = Arc::new(MemorySessionGate::new(config.auth.token_ttl_secs));
        for entry in &config.auth.tokens {
            gate.insert(&entry.token, &entry.user).await;
        }
        tracing::info!("{} pre-provisioned token(s) loaded", config.auth.tokens.len());

        let runner = Arc::new(ScriptRunner::new(
            Arc::new(LuaEngine::new(hub.clone(), config.script.timeout())),
            config.script.timeout_secs,
        ));

        let mut background = vec![hub_task];
        background.push(tokio::spawn(cleanup_sessions(Arc::clone(&gate), shutdown.clone())));
        background.push(tokio::spawn(tcp::serve(
            tcp_listener,
            hub.clone(),
            Arc::clone(&runner),
            TcpSettings::from(&config.tcp),
            shutdown.clone(),
        )));
        tracing::info!("TCP server listening on {}", tcp_addr);
        hub.broadcast(format!("[System] TCP server started on port {}", tcp_addr.port()));

        let app = router(AppState {
            hub: hub.clone(),
            gate: gate.clone(),
            runner,
            ports: Arc::clone(&ports),
            ws: WsSettings::from(&config.websocket),
            tcp_port: tcp_addr.port(),
        });

        let graceful = shutdown.clone();
        let http = tokio::spawn(async move {
            axum::serve(
                http_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await
        });
        tracing::info!("HTTP server listening on {}", http_addr);
        hub.broadcast(format!("[System] HTTP server started on port {}", http_addr.port()));

        Ok(RunningConsole {
            http_addr,
            tcp_addr,
            hub,
            gate,
            ports,
            shutdown,
            http,
            background,
        })
    }
}

impl RunningConsole {
    /// 触发关闭（等价于取消外部传入的 token）
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// 等待 HTTP 服务退出，随后停止其余后台任务
    pub async fn join(self) -> Result<(), ConsoleError> {
        let result = match self.http.await {
            Ok(result) => result.map_err(ConsoleError::from),
            Err(e) => Err(ConsoleError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("HTTP server task failed: {}", e),
            ))),
        };
        if result.is_err() {
            self.ports.set_status(PortStatus::Failed);
        }

        self.shutdown.cancel();
        for task in self.background {
            task.abort();
        }
        tracing::info!("console stopped");
        result
    }
}

/// 定期清理过期会话
async fn cleanup_sessions(gate: Arc<MemorySessionGate>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let removed = gate.cleanup_expired().await;
                if removed > 0 {
                    tracing::info!("removed {} expired session(s)", removed);
                }
            }
        }
    }
}
