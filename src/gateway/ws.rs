//! WebSocket 接入
//!
//! `GET /ws` 完成协议升级后创建端点并注册到 Hub；升级失败时由 axum 直接返回 4xx，不创建任何端点。
//! 此通道对客户端只出不进：入站的应用数据一律丢弃，只用来刷新活性截止时间。

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;

use super::endpoint::{run_writer, Endpoint, Lifecycle, LineSink, Transport, WriterSettings};
use super::http::AppState;
use super::hub::HubHandle;
use crate::config::WebSocketSection;
use crate::core::TransportError;

/// WebSocket 端点参数
#[derive(Debug, Clone, Copy)]
pub struct WsSettings {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
}

impl From<&WebSocketSection> for WsSettings {
    fn from(section: &WebSocketSection) -> Self {
        Self {
            ping_interval: section.ping_interval(),
            read_timeout: section.read_timeout(),
            write_timeout: section.write_timeout(),
            max_message_bytes: section.max_message_bytes,
        }
    }
}

impl Default for WsSettings {
    fn default() -> Self {
        Self::from(&WebSocketSection::default())
    }
}

/// 升级处理：不校验 Origin
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let settings = state.ws;
    let hub = state.hub.clone();
    ws.max_message_size(settings.max_message_bytes)
        .on_failed_upgrade(move |e| {
            tracing::warn!(peer = %peer, "Error upgrading connection: {}", e);
        })
        .on_upgrade(move |socket| serve_socket(socket, peer, hub, settings))
}

/// 升级完成后的连接处理：读任务在当前任务中运行，写任务单独 spawn
async fn serve_socket(socket: WebSocket, peer: SocketAddr, hub: HubHandle, settings: WsSettings) {
    let Endpoint { lifecycle, outbound } = match Endpoint::register(&hub, Transport::WebSocket, peer) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::warn!(peer = %peer, "cannot register websocket client: {}", e);
            return;
        }
    };

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(run_writer(
        WsSink { sink },
        outbound,
        lifecycle.clone(),
        WriterSettings {
            keepalive_interval: settings.ping_interval,
            write_timeout: settings.write_timeout,
        },
    ));

    let reason = read_loop(stream, &lifecycle, settings.read_timeout).await;
    lifecycle.teardown(reason);
    let _ = writer.await;
}

/// 读任务：每次成功读取（包括 pong）都刷新截止时间
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    lifecycle: &Lifecycle,
    read_timeout: Duration,
) -> &'static str {
    loop {
        let next = tokio::select! {
            _ = lifecycle.cancelled() => return "closed by writer or hub",
            next = timeout(read_timeout, stream.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::info!(peer = %lifecycle.peer(), "read deadline exceeded");
                return "read deadline exceeded";
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return "remote closed",
            Ok(Some(Err(e))) => {
                tracing::warn!(peer = %lifecycle.peer(), "Error reading message: {}", e);
                return "read error";
            }
            Ok(Some(Ok(_))) => lifecycle.touch(),
        }
    }
}

/// WebSocket 写端：多行合并为一个文本帧，以换行分隔
struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl LineSink for WsSink {
    async fn send_lines(&mut self, lines: &[String]) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(lines.join("\n")))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn probe(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}
