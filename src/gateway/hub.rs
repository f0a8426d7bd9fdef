//! Hub（轮毂/中枢）- 连接中枢
//!
//! 唯一持有在线端点集合的地方。所有注册、注销、广播请求都经由同一个控制通道进入，
//! 由一个专用控制循环按到达顺序逐条处理，因此：
//! - 端点集合只在控制循环内被修改，广播遍历时不存在并发修改；
//! - 所有操作处于同一个全序中，先广播的行在每个端点上都先于后广播的行到达；
//! - 发送队列写满的端点（慢消费者）直接被驱逐，不会阻塞其它端点，也不会把错误返回给广播方。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::endpoint::Transport;
use crate::core::HubError;

/// 端点标识（按身份区分端点，不按内容）
pub type EndpointId = u64;

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 每个端点发送队列的容量
    pub queue_capacity: usize,
    /// 注册时状态行中报告的端口
    pub port_label: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            port_label: String::new(),
        }
    }
}

/// Hub 一侧持有的端点：发送队列的唯一生产端
///
/// 不实现 Clone：Hub 丢弃它即关闭该端点的发送队列，写任务随之退出。
#[derive(Debug)]
pub struct EndpointHandle {
    pub id: EndpointId,
    pub transport: Transport,
    pub peer: SocketAddr,
    tx: mpsc::Sender<String>,
}

/// 控制操作
#[derive(Debug)]
enum Control {
    Register(EndpointHandle),
    Unregister(EndpointId),
    Broadcast(String),
    SendTo(EndpointId, String),
    ClientCount(oneshot::Sender<usize>),
}

/// Hub 句柄：可克隆，传给接入层和所有需要广播的组件
#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::UnboundedSender<Control>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl HubHandle {
    /// 为新连接分配标识和有界发送队列，返回 Hub 侧句柄与写任务侧接收端
    pub fn open_endpoint(
        &self,
        transport: Transport,
        peer: SocketAddr,
    ) -> (EndpointHandle, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity.max(1));
        (
            EndpointHandle {
                id,
                transport,
                peer,
                tx,
            },
            rx,
        )
    }

    /// 注册端点；注册后立即收到问候行与状态行
    pub fn register(&self, endpoint: EndpointHandle) -> Result<(), HubError> {
        self.submit(Control::Register(endpoint))
    }

    /// 注销端点（幂等：重复注销或注销未知端点均无副作用）
    pub fn unregister(&self, id: EndpointId) {
        if self.submit(Control::Unregister(id)).is_err() {
            tracing::debug!(endpoint = id, "unregister after hub closed");
        }
    }

    /// 向所有在线端点广播一行；只负责把行交给控制通道，不等待投递
    pub fn broadcast(&self, line: impl Into<String>) {
        if self.submit(Control::Broadcast(line.into())).is_err() {
            tracing::debug!("broadcast dropped: hub closed");
        }
    }

    /// 仅向指定端点投递一行（同样受慢消费者策略约束）
    pub fn send_to(&self, id: EndpointId, line: impl Into<String>) {
        if self.submit(Control::SendTo(id, line.into())).is_err() {
            tracing::debug!(endpoint = id, "direct send dropped: hub closed");
        }
    }

    /// 当前在线端点数；经由控制循环应答，结果与操作全序一致
    pub async fn client_count(&self) -> Result<usize, HubError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Control::ClientCount(tx))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    fn submit(&self, op: Control) -> Result<(), HubError> {
        self.control.send(op).map_err(|_| HubError::Closed)
    }
}

/// Hub 控制循环
pub struct Hub {
    clients: HashMap<EndpointId, EndpointHandle>,
    port_label: String,
}

impl Hub {
    /// 创建 Hub 并启动控制循环；所有句柄被丢弃后循环退出
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let hub = Hub {
            clients: HashMap::new(),
            port_label: config.port_label,
        };
        let task = tokio::spawn(hub.run(control_rx));
        let handle = HubHandle {
            control: control_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: config.queue_capacity,
        };
        (handle, task)
    }

    async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<Control>) {
        while let Some(op) = control_rx.recv().await {
            self.apply(op);
        }
        tracing::debug!(remaining = self.clients.len(), "hub control loop stopped");
    }

    fn apply(&mut self, op: Control) {
        match op {
            Control::Register(endpoint) => self.register(endpoint),
            Control::Unregister(id) => self.unregister(id),
            Control::Broadcast(line) => self.broadcast(line),
            Control::SendTo(id, line) => {
                self.deliver(id, line);
            }
            Control::ClientCount(reply) => {
                let _ = reply.send(self.clients.len());
            }
        }
    }

    fn register(&mut self, endpoint: EndpointHandle) {
        let id = endpoint.id;
        if self.clients.contains_key(&id) {
            tracing::warn!(endpoint = id, "endpoint registered twice, ignoring");
            return;
        }
        tracing::info!(
            endpoint = id,
            transport = %endpoint.transport,
            "Client connected: {}",
            endpoint.peer
        );
        let greeting = endpoint.transport.greeting().to_string();
        self.clients.insert(id, endpoint);

        if self.deliver(id, greeting) {
            let status = format!("[System] Connected on port: {}", self.port_label);
            self.deliver(id, status);
        }
    }

    fn unregister(&mut self, id: EndpointId) {
        // 移除即丢弃发送端，队列关闭
        if let Some(endpoint) = self.clients.remove(&id) {
            tracing::info!(
                endpoint = id,
                transport = %endpoint.transport,
                "Client disconnected: {}",
                endpoint.peer
            );
        }
    }

    fn broadcast(&mut self, line: String) {
        self.clients.retain(|id, endpoint| match endpoint.tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(endpoint = *id, peer = %endpoint.peer, "slow consumer evicted");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(endpoint = *id, peer = %endpoint.peer, "writer gone, endpoint dropped");
                false
            }
        });
    }

    /// 向单个端点投递；失败即驱逐。返回端点是否仍在线
    fn deliver(&mut self, id: EndpointId, line: String) -> bool {
        let Some(endpoint) = self.clients.get(&id) else {
            return false;
        };
        match endpoint.tx.try_send(line) {
            Ok(()) => true,
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "slow consumer evicted",
                    TrySendError::Closed(_) => "writer gone, endpoint dropped",
                };
                tracing::debug!(endpoint = id, peer = %endpoint.peer, "{}", reason);
                self.clients.remove(&id);
                false
            }
        }
    }
}
