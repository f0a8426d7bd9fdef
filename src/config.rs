//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SERVER__TCP_PORT=9100`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub tcp: TcpSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub script: ScriptSection,
}

/// [server] 段：监听地址与端口
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP 候选端口，按顺序尝试，取第一个可绑定的
    #[serde(default = "default_http_ports")]
    pub http_ports: Vec<u16>,
    /// TCP 命令端口
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_ports() -> Vec<u16> {
    vec![8080, 8081, 8082, 8083, 8084]
}

fn default_tcp_port() -> u16 {
    9000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_ports: default_http_ports(),
            tcp_port: default_tcp_port(),
        }
    }
}

/// [hub] 段
#[derive(Debug, Clone, Deserialize)]
pub struct HubSection {
    /// 每个端点的发送队列容量；写满即视为慢消费者并被驱逐
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// [websocket] 段：心跳与读写超时（秒）
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketSection {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// 读超时；每次读到数据（含 pong）后刷新
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// 入站单帧大小上限（字节）
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_max_message_bytes() -> usize {
    512 * 1024
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

/// [tcp] 段：命令会话超时与命令前缀
#[derive(Debug, Clone, Deserialize)]
pub struct TcpSection {
    /// 空闲读超时，命令会话可长时间保持
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// 单行输入上限（字节），超出的行只向发送方报错
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_idle_timeout_secs() -> u64 {
    3600
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_command_prefix() -> String {
    "EXEC:".to_string()
}

fn default_max_line_bytes() -> usize {
    64 * 1024
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            command_prefix: default_command_prefix(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// [auth] 段：启动时预置的 Bearer Token
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

/// 预置 Token：token 值与其对应的用户标识
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user: String,
}

fn default_token_ttl_secs() -> u64 {
    24 * 3600
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

/// [script] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptSection {
    #[serde(default = "default_script_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_script_timeout_secs() -> u64 {
    5
}

impl Default for ScriptSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_script_timeout_secs(),
        }
    }
}

impl WebSocketSection {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl TcpSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl ScriptSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// 拒绝为 0 的间隔、超时与容量（0 间隔会让定时器 panic）
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.server.http_ports.is_empty() {
            return Err(config::ConfigError::Message(
                "server.http_ports must not be empty".to_string(),
            ));
        }

        let positive = [
            ("hub.queue_capacity", self.hub.queue_capacity as u64),
            ("websocket.ping_interval_secs", self.websocket.ping_interval_secs),
            ("websocket.read_timeout_secs", self.websocket.read_timeout_secs),
            ("websocket.write_timeout_secs", self.websocket.write_timeout_secs),
            ("websocket.max_message_bytes", self.websocket.max_message_bytes as u64),
            ("tcp.idle_timeout_secs", self.tcp.idle_timeout_secs),
            ("tcp.write_timeout_secs", self.tcp.write_timeout_secs),
            ("tcp.keepalive_interval_secs", self.tcp.keepalive_interval_secs),
            ("tcp.max_line_bytes", self.tcp.max_line_bytes as u64),
            ("auth.token_ttl_secs", self.auth.token_ttl_secs),
            ("script.timeout_secs", self.script.timeout_secs),
        ];
        match positive.iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(config::ConfigError::Message(format!(
                "{} must be greater than 0",
                key
            ))),
            None => Ok(()),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
/// 4. 反序列化后做取值校验
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
