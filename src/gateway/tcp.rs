//! TCP 接入
//!
//! 纯文本行协议。每个连接注册为一个 TCP 端点（连接即收到横幅与状态行，之后同样接收所有广播），
//! 同时运行命令读取：
//! - 每行去除首尾空白后原样广播为 `[TCP] <line>`；
//! - 带命令前缀的行交给脚本执行器，结果回给发送方（`Success:` / `Error:`）并广播；
//! - 其余行只回显给发送方（`Echo:`）。
//!
//! 所有回给发送方的行也经由 Hub 投递，Hub 始终是发送队列唯一的生产者。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::command::{echo_reply, error_reply, parse_line, success_reply, TcpCommand};
use super::endpoint::{run_writer, Endpoint, Lifecycle, LineSink, Transport, WriterSettings};
use super::hub::HubHandle;
use crate::config::TcpSection;
use crate::core::TransportError;
use crate::tools::ScriptRunner;

/// TCP 端点参数
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub keepalive_interval: Duration,
    pub command_prefix: String,
    pub max_line_bytes: usize,
}

impl From<&TcpSection> for TcpSettings {
    fn from(section: &TcpSection) -> Self {
        Self {
            idle_timeout: section.idle_timeout(),
            write_timeout: section.write_timeout(),
            keepalive_interval: section.keepalive_interval(),
            command_prefix: section.command_prefix.clone(),
            max_line_bytes: section.max_line_bytes,
        }
    }
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self::from(&TcpSection::default())
    }
}

/// accept 循环：每个连接一个短任务完成注册，之后由读写任务接管
pub async fn serve(
    listener: TcpListener,
    hub: HubHandle,
    runner: Arc<ScriptRunner>,
    settings: TcpSettings,
    shutdown: CancellationToken,
) {
    let settings = Arc::new(settings);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        hub.clone(),
                        Arc::clone(&runner),
                        Arc::clone(&settings),
                    ));
                }
                Err(e) => {
                    tracing::error!("Error accepting TCP connection: {}", e);
                }
            }
        }
    }
    tracing::info!("TCP server stopped");
}

/// 读任务结束的原因
enum ReadEnd {
    Eof,
    Idle,
    Error(std::io::Error),
    /// 写任务失败或被 Hub 驱逐
    Closed,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: HubHandle,
    runner: Arc<ScriptRunner>,
    settings: Arc<TcpSettings>,
) {
    tracing::info!("TCP client connected: {}", peer);
    hub.broadcast(format!("[System] TCP client connected: {}", peer));

    let Endpoint { lifecycle, outbound } = match Endpoint::register(&hub, Transport::Tcp, peer) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::warn!(peer = %peer, "cannot register TCP client: {}", e);
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(run_writer(
        TcpSink {
            writer: BufWriter::new(write_half),
        },
        outbound,
        lifecycle.clone(),
        WriterSettings {
            keepalive_interval: settings.keepalive_interval,
            write_timeout: settings.write_timeout,
        },
    ));

    let session = CommandSession {
        hub: &hub,
        runner: &runner,
        lifecycle: &lifecycle,
        settings: &settings,
    };
    let end = session.read_commands(read_half).await;

    let reason = match &end {
        ReadEnd::Eof => "remote closed",
        ReadEnd::Idle => "idle timeout",
        ReadEnd::Error(_) => "read error",
        ReadEnd::Closed => "closed by writer or hub",
    };
    lifecycle.teardown(reason);

    match end {
        ReadEnd::Eof | ReadEnd::Idle | ReadEnd::Closed => {
            tracing::info!("TCP client disconnected: {} ({})", peer, reason);
            hub.broadcast(format!("[System] TCP client disconnected: {}", peer));
        }
        ReadEnd::Error(e) => {
            tracing::warn!("Error reading from TCP client {}: {}", peer, e);
            hub.broadcast(format!("[Error] TCP read error: {}", e));
        }
    }

    let _ = writer.await;
}

/// 单个 TCP 连接的命令处理上下文
struct CommandSession<'a> {
    hub: &'a HubHandle,
    runner: &'a ScriptRunner,
    lifecycle: &'a Lifecycle,
    settings: &'a TcpSettings,
}

impl CommandSession<'_> {
    /// 读任务：按行读取，带空闲截止时间；每读到一行刷新
    async fn read_commands(&self, read_half: OwnedReadHalf) -> ReadEnd {
        let mut lines = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(self.settings.max_line_bytes),
        );

        // 解码出错后 FramedRead 先产出一次 None，再次轮询即可继续读取
        let mut resuming = false;

        loop {
            let next = tokio::select! {
                _ = self.lifecycle.cancelled() => return ReadEnd::Closed,
                next = timeout(self.settings.idle_timeout, lines.next()) => next,
            };

            match next {
                Err(_) => return ReadEnd::Idle,
                Ok(None) if resuming => resuming = false,
                Ok(None) => return ReadEnd::Eof,
                Ok(Some(Ok(line))) => {
                    resuming = false;
                    self.lifecycle.touch();
                    self.handle_line(&line).await;
                }
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    resuming = true;
                    self.lifecycle.touch();
                    self.hub.send_to(
                        self.lifecycle.id(),
                        error_reply(&format!(
                            "line exceeds {} bytes",
                            self.settings.max_line_bytes
                        )),
                    );
                }
                Ok(Some(Err(LinesCodecError::Io(e)))) => return ReadEnd::Error(e),
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let data = line.trim();
        let id = self.lifecycle.id();
        tracing::debug!(peer = %self.lifecycle.peer(), "Received from TCP client: {}", data);
        self.hub.broadcast(format!("[TCP] {}", data));

        match parse_line(data, &self.settings.command_prefix) {
            TcpCommand::Exec(script) => match self.runner.run(script).await {
                Ok(output) => {
                    self.hub.send_to(id, success_reply(&output));
                    self.hub.broadcast(format!("[Execution] {}", output));
                }
                Err(e) => {
                    let message = e.to_string();
                    self.hub.send_to(id, error_reply(&message));
                    self.hub.broadcast(format!("[Error] {}", message));
                }
            },
            TcpCommand::Echo(text) => self.hub.send_to(id, echo_reply(text)),
        }
    }
}

/// TCP 写端：每行以换行结尾，一批写完后统一 flush
struct TcpSink {
    writer: BufWriter<OwnedWriteHalf>,
}

#[async_trait]
impl LineSink for TcpSink {
    async fn send_lines(&mut self, lines: &[String]) -> Result<(), TransportError> {
        for line in lines {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// 没有协议级 ping：flush 后检查套接字上挂起的错误
    async fn probe(&mut self) -> Result<(), TransportError> {
        self.writer.flush().await?;
        let stream: &TcpStream = self.writer.get_ref().as_ref();
        match stream.take_error()? {
            Some(e) => Err(TransportError::Io(e)),
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;
    use crate::gateway::hub::{Hub, HubConfig};
    use crate::tools::LuaEngine;

    async fn spawn_server(settings: TcpSettings) -> (SocketAddr, HubHandle, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (hub, _task) = Hub::spawn(HubConfig {
            queue_capacity: 64,
            port_label: "8080".to_string(),
        });
        let engine = LuaEngine::new(hub.clone(), Duration::from_secs(5));
        let runner = Arc::new(ScriptRunner::new(Arc::new(engine), 5));
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, hub.clone(), runner, settings, shutdown.clone()));
        (addr, hub, shutdown)
    }

    async fn read_until(
        lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
        pred: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let line = timeout(Duration::from_secs(5), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let hit = pred(&line);
            seen.push(line);
            if hit {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_banner_echo_and_exec() {
        let (addr, hub, shutdown) = spawn_server(TcpSettings::default()).await;
        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(read_half).lines();

        let greeting = read_until(&mut lines, |l| l.starts_with("[System] Connected on port:")).await;
        assert_eq!(greeting, vec![
            "Connected to hive console TCP server".to_string(),
            "[System] Connected on port: 8080".to_string(),
        ]);
        assert_eq!(hub.client_count().await.unwrap(), 1);

        write_half.write_all(b"  hello  \n").await.unwrap();
        let seen = read_until(&mut lines, |l| l.starts_with("Echo:")).await;
        assert_eq!(seen, vec!["[TCP] hello".to_string(), "Echo: hello".to_string()]);

        write_half.write_all(b"EXEC:2*21\n").await.unwrap();
        let seen = read_until(&mut lines, |l| l.starts_with("[Execution]")).await;
        assert_eq!(seen, vec![
            "[TCP] EXEC:2*21".to_string(),
            "Success: 42".to_string(),
            "[Execution] 42".to_string(),
        ]);

        write_half.write_all(b"EXEC:print('hi', 1 + 1)\n").await.unwrap();
        let seen = read_until(&mut lines, |l| l.starts_with("[Execution]")).await;
        assert_eq!(seen, vec![
            "[TCP] EXEC:print('hi', 1 + 1)".to_string(),
            "hi".to_string(),
            "2".to_string(),
            "Success: Script executed successfully".to_string(),
            "[Execution] Script executed successfully".to_string(),
        ]);

        write_half.write_all(b"EXEC:error('bad')\n").await.unwrap();
        let seen = read_until(&mut lines, |l| l.starts_with("[Error]")).await;
        assert!(seen[1].starts_with("Error: runtime error: "), "{}", seen[1]);
        assert!(seen[1].contains("bad"), "{}", seen[1]);
        assert_eq!(hub.client_count().await.unwrap(), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_overlong_line_reported_and_session_survives() {
        let settings = TcpSettings {
            max_line_bytes: 16,
            ..TcpSettings::default()
        };
        let (addr, hub, shutdown) = spawn_server(settings).await;
        let (read_half, mut write_half) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(read_half).lines();
        read_until(&mut lines, |l| l.starts_with("[System] Connected on port:")).await;

        let mut long = "x".repeat(40);
        long.push('\n');
        write_half.write_all(long.as_bytes()).await.unwrap();
        let seen = read_until(&mut lines, |l| l.starts_with("Error:")).await;
        assert_eq!(seen.last().unwrap(), "Error: line exceeds 16 bytes");

        write_half.write_all(b"again\n").await.unwrap();
        read_until(&mut lines, |l| l == "Echo: again").await;
        assert_eq!(hub.client_count().await.unwrap(), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_idle_client_is_dropped_and_announced() {
        let settings = TcpSettings {
            idle_timeout: Duration::from_millis(200),
            ..TcpSettings::default()
        };
        let (addr, hub, shutdown) = spawn_server(settings).await;
        let watcher_peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let Endpoint { mut outbound, .. } =
            Endpoint::register(&hub, Transport::WebSocket, watcher_peer).unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let client_addr = stream.local_addr().unwrap();
        // 保持写端打开：连接只能因空闲超时而结束
        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        read_until(&mut lines, |l| l.starts_with("[System] Connected on port:")).await;

        let expected = format!("[System] TCP client disconnected: {}", client_addr);
        let mut seen = Vec::new();
        loop {
            let line = timeout(Duration::from_secs(5), outbound.recv())
                .await
                .unwrap()
                .unwrap();
            let done = line == expected;
            seen.push(line);
            if done {
                break;
            }
        }
        assert!(seen.contains(&format!("[System] TCP client connected: {}", client_addr)));
        assert_eq!(hub.client_count().await.unwrap(), 1);

        // 服务端关闭连接后客户端读到 EOF
        let rest = timeout(Duration::from_secs(5), lines.next_line()).await.unwrap();
        assert!(matches!(rest, Ok(None) | Err(_)));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (addr, hub, shutdown) = spawn_server(TcpSettings::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        read_until(&mut lines, |l| l.starts_with("[System] Connected on port:")).await;
        assert_eq!(hub.client_count().await.unwrap(), 1);

        drop(write_half);
        drop(lines);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hub.client_count().await.unwrap() != 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
    }
}
