//! 轮毂式（Hub-and-Spoke）连接网关
//!
//! ## Hub（轮毂/中枢）
//!
//! 唯一持有在线端点集合的控制循环。注册、注销、广播与定向投递都经由同一个控制通道，
//! 按到达顺序逐条处理，发送队列写满的端点直接被驱逐。
//!
//! ## Spoke（辐条/端点）
//!
//! - **WebSocket**：`GET /ws` 升级后注册，只接收广播（浏览器控制台）
//! - **TCP**：纯文本行协议，接收广播的同时可发送 `EXEC:` 命令
//!
//! ## 外围协作方
//!
//! - HTTP 接入层（`/execute`、`/port-status`），由会话门禁校验 Bearer Token
//! - 脚本执行器：`print` 经由 Hub 广播
//!
//! 任何想发布事件的组件都调用 `HubHandle::broadcast`，这是唯一的扇出入口。

mod command;
mod endpoint;
mod http;
mod hub;
mod port;
mod runtime;
mod session;
mod tcp;
mod ws;

pub use command::{echo_reply, error_reply, parse_line, success_reply, TcpCommand};
pub use endpoint::{
    run_writer, Endpoint, EndpointState, Lifecycle, LineSink, Transport, WriterSettings,
};
pub use http::{router, AppState, ExecuteRequest, ExecuteResponse, PortStatusResponse};
pub use hub::{EndpointHandle, EndpointId, Hub, HubConfig, HubHandle};
pub use port::{PortManager, PortStatus};
pub use runtime::{Console, RunningConsole};
pub use session::{Identity, MemorySessionGate, Session, SessionGate};
pub use tcp::TcpSettings;
pub use ws::WsSettings;
