//! 客户端端点（Client Endpoint）
//!
//! 每个连接（WebSocket 或 TCP）对应一个端点，由两个协作任务驱动：
//! - **读任务**：等待入站数据，带活性截止时间；读错误或超时即发起拆除；
//! - **写任务**：按顺序排空发送队列，并定时发送保活探测；每次发送都有写截止时间。
//!
//! 状态机：`Created → Registered → (Active)* → Unregistering → Closed`。
//! 无论由读任务、写任务还是 Hub 驱逐触发，拆除只执行一次。

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::hub::{EndpointId, HubHandle};
use crate::core::{HubError, TransportError};

/// 单次写入合并的最大行数
const MAX_BATCH: usize = 256;

/// 传输类型；对 Hub 而言两者能力等价（能收一行、能被关闭）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    WebSocket,
    Tcp,
}

impl Transport {
    /// 注册时推送的第一行
    pub fn greeting(&self) -> &'static str {
        match self {
            Transport::WebSocket => "[System] Connected to hive console",
            Transport::Tcp => "Connected to hive console TCP server",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::WebSocket => write!(f, "websocket"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// 端点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Registered,
    Active,
    Unregistering,
    Closed,
}

/// 端点生命周期：读写任务共享，私有锁保护状态
pub struct Lifecycle {
    id: EndpointId,
    transport: Transport,
    peer: SocketAddr,
    state: Mutex<EndpointState>,
    hub: HubHandle,
    cancel: CancellationToken,
}

impl Lifecycle {
    fn new(id: EndpointId, transport: Transport, peer: SocketAddr, hub: HubHandle) -> Self {
        Self {
            id,
            transport,
            peer,
            state: Mutex::new(EndpointState::Created),
            hub,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> EndpointState {
        *self.lock()
    }

    /// alive 标志：未到 Closed 即视为存活
    pub fn is_alive(&self) -> bool {
        self.state() != EndpointState::Closed
    }

    fn mark_registered(&self) {
        let mut state = self.lock();
        if *state == EndpointState::Created {
            *state = EndpointState::Registered;
        }
    }

    /// 一次成功的 I/O 后重新进入 Active
    pub fn touch(&self) {
        let mut state = self.lock();
        if matches!(*state, EndpointState::Registered | EndpointState::Active) {
            *state = EndpointState::Active;
        }
    }

    /// 拆除：请求 Hub 注销、通知两个任务关闭传输、标记 Closed
    ///
    /// 只有第一个调用者真正执行，返回 true；之后的调用均为空操作。
    pub fn teardown(&self, reason: &str) -> bool {
        {
            let mut state = self.lock();
            if matches!(*state, EndpointState::Unregistering | EndpointState::Closed) {
                return false;
            }
            *state = EndpointState::Unregistering;
        }

        self.hub.unregister(self.id);
        self.cancel.cancel();
        *self.lock() = EndpointState::Closed;

        tracing::debug!(
            endpoint = self.id,
            transport = %self.transport,
            peer = %self.peer,
            reason,
            "endpoint closed"
        );
        true
    }

    /// 拆除开始后完成的 future，读写任务在 select 中等待它
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 已注册的端点：生命周期 + 发送队列的消费端
pub struct Endpoint {
    pub lifecycle: Arc<Lifecycle>,
    pub outbound: mpsc::Receiver<String>,
}

impl Endpoint {
    /// 握手成功后调用：创建端点并立即向 Hub 注册
    pub fn register(hub: &HubHandle, transport: Transport, peer: SocketAddr) -> Result<Self, HubError> {
        let (handle, outbound) = hub.open_endpoint(transport, peer);
        let lifecycle = Arc::new(Lifecycle::new(handle.id, transport, peer, hub.clone()));
        hub.register(handle)?;
        lifecycle.mark_registered();
        Ok(Self { lifecycle, outbound })
    }
}

/// 写任务的传输侧抽象：WebSocket 与 TCP 各自实现
#[async_trait]
pub trait LineSink: Send {
    /// 发送一批行（保持顺序，可合并为一个传输单元）
    async fn send_lines(&mut self, lines: &[String]) -> Result<(), TransportError>;

    /// 保活探测
    async fn probe(&mut self) -> Result<(), TransportError>;

    /// 发送关闭通知
    async fn close(&mut self) -> Result<(), TransportError>;
}

const MIN_KEEPALIVE: Duration = Duration::from_millis(10);

/// 写任务参数
#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
}

/// 写任务：等待「下一条待发送行」或「保活定时器」，先到先处理
pub async fn run_writer<S: LineSink>(
    mut sink: S,
    mut outbound: mpsc::Receiver<String>,
    lifecycle: Arc<Lifecycle>,
    settings: WriterSettings,
) {
    // interval 不接受 0
    let period = settings.keepalive_interval.max(MIN_KEEPALIVE);
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = lifecycle.cancelled() => {
                let _ = timeout(settings.write_timeout, sink.close()).await;
                break "cancelled";
            }
            item = outbound.recv() => {
                let Some(first) = item else {
                    // 队列已被 Hub 关闭（驱逐或注销）
                    let _ = timeout(settings.write_timeout, sink.close()).await;
                    break "outbound queue closed";
                };
                let batch = drain_ready(first, &mut outbound);
                if let Err(e) = bounded(settings.write_timeout, sink.send_lines(&batch)).await {
                    tracing::warn!(endpoint = lifecycle.id(), peer = %lifecycle.peer(), "write failed: {}", e);
                    break "write failed";
                }
                lifecycle.touch();
            }
            _ = keepalive.tick() => {
                if let Err(e) = bounded(settings.write_timeout, sink.probe()).await {
                    tracing::warn!(endpoint = lifecycle.id(), peer = %lifecycle.peer(), "keepalive failed: {}", e);
                    break "keepalive failed";
                }
            }
        }
    };

    lifecycle.teardown(reason);
}

/// 取出第一条之后已经在队列里的行，合并为一批
pub(crate) fn drain_ready(first: String, outbound: &mut mpsc::Receiver<String>) -> Vec<String> {
    let mut batch = vec![first];
    while batch.len() < MAX_BATCH {
        match outbound.try_recv() {
            Ok(line) => batch.push(line),
            Err(_) => break,
        }
    }
    batch
}

/// 为一次发送施加截止时间；超时视为发送失败
async fn bounded<F>(deadline: Duration, fut: F) -> Result<(), TransportError>
where
    F: std::future::Future<Output = Result<(), TransportError>>,
{
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Deadline(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::hub::{Hub, HubConfig};

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Vec<String>>>>,
        probes: Arc<Mutex<usize>>,
        closed: Arc<Mutex<bool>>,
        fail_probe: bool,
        hang_on_send: bool,
    }

    #[async_trait]
    impl LineSink for RecordingSink {
        async fn send_lines(&mut self, lines: &[String]) -> Result<(), TransportError> {
            if self.hang_on_send {
                std::future::pending::<()>().await;
            }
            self.frames.lock().unwrap().push(lines.to_vec());
            Ok(())
        }

        async fn probe(&mut self) -> Result<(), TransportError> {
            *self.probes.lock().unwrap() += 1;
            if self.fail_probe {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "gone",
                )));
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn settings(keepalive_ms: u64, write_ms: u64) -> WriterSettings {
        WriterSettings {
            keepalive_interval: Duration::from_millis(keepalive_ms),
            write_timeout: Duration::from_millis(write_ms),
        }
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let endpoint = Endpoint::register(&hub, Transport::Tcp, peer()).unwrap();
        let lifecycle = endpoint.lifecycle.clone();
        assert_eq!(lifecycle.state(), EndpointState::Registered);
        lifecycle.touch();
        assert_eq!(lifecycle.state(), EndpointState::Active);
        assert_eq!(hub.client_count().await.unwrap(), 1);

        assert!(lifecycle.teardown("reader"));
        assert!(!lifecycle.teardown("writer"));
        assert!(!lifecycle.is_alive());
        lifecycle.touch();
        assert_eq!(lifecycle.state(), EndpointState::Closed);
        assert_eq!(hub.client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writer_coalesces_in_order_and_closes_on_eviction() {
        let (hub, _task) = Hub::spawn(HubConfig {
            queue_capacity: 64,
            port_label: "9".to_string(),
        });
        let Endpoint { lifecycle, outbound } =
            Endpoint::register(&hub, Transport::WebSocket, peer()).unwrap();
        for i in 0..5 {
            hub.broadcast(format!("l{}", i));
        }
        hub.unregister(lifecycle.id());
        assert_eq!(hub.client_count().await.unwrap(), 0);

        let sink = RecordingSink::default();
        run_writer(sink.clone(), outbound, lifecycle.clone(), settings(60_000, 1_000)).await;

        let lines: Vec<String> = sink.frames.lock().unwrap().iter().flatten().cloned().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(&lines[2..], &["l0", "l1", "l2", "l3", "l4"]);
        // 队列在写任务启动前已全部就绪，应合并成一帧
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
        assert!(*sink.closed.lock().unwrap());
        assert_eq!(lifecycle.state(), EndpointState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_tears_down() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let Endpoint { lifecycle, outbound } =
            Endpoint::register(&hub, Transport::Tcp, peer()).unwrap();
        let sink = RecordingSink {
            fail_probe: true,
            ..Default::default()
        };

        run_writer(sink.clone(), outbound, lifecycle.clone(), settings(20, 1_000)).await;

        assert_eq!(*sink.probes.lock().unwrap(), 1);
        assert!(!lifecycle.is_alive());
        assert_eq!(hub.client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_keepalive_still_runs_writer() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let Endpoint { lifecycle, outbound } =
            Endpoint::register(&hub, Transport::WebSocket, peer()).unwrap();
        let sink = RecordingSink {
            fail_probe: true,
            ..Default::default()
        };

        run_writer(sink.clone(), outbound, lifecycle.clone(), settings(0, 1_000)).await;

        assert_eq!(*sink.probes.lock().unwrap(), 1);
        assert!(!lifecycle.is_alive());
        assert_eq!(hub.client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_deadline_tears_down() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let Endpoint { lifecycle, outbound } =
            Endpoint::register(&hub, Transport::WebSocket, peer()).unwrap();
        let sink = RecordingSink {
            hang_on_send: true,
            ..Default::default()
        };

        run_writer(sink, outbound, lifecycle.clone(), settings(60_000, 50)).await;

        assert!(!lifecycle.is_alive());
        assert_eq!(hub.client_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writer_stops_when_reader_tears_down() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let Endpoint { lifecycle, outbound } =
            Endpoint::register(&hub, Transport::Tcp, peer()).unwrap();
        let sink = RecordingSink::default();
        let writer = tokio::spawn(run_writer(
            sink.clone(),
            outbound,
            lifecycle.clone(),
            settings(60_000, 1_000),
        ));

        assert!(lifecycle.teardown("reader"));
        writer.await.unwrap();
        assert!(*sink.closed.lock().unwrap());
        assert_eq!(hub.client_count().await.unwrap(), 0);
    }
}
