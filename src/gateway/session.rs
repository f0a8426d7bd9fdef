//! 会话门禁（Session Gate）
//!
//! 把不透明的 Bearer Token 映射到用户身份与过期时间。HTTP 层在触达 Hub 之前先经过这里。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// 用户身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

/// 单个会话
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub identity: Identity,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Token 校验接口
#[async_trait]
pub trait SessionGate: Send + Sync {
    /// Token 存在且未过期
    async fn validate(&self, token: &str) -> bool;

    /// 解析出身份；无效或过期时为 None
    async fn resolve(&self, token: &str) -> Option<Identity>;
}

/// 内存实现：token -> Session
pub struct MemorySessionGate {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl MemorySessionGate {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// 为用户签发新 Token
    pub async fn issue(&self, user_id: &str) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.insert(&token, user_id).await;
        token
    }

    /// 以给定 Token 登记会话（启动时预置的 Token 走这里）
    pub async fn insert(&self, token: &str, user_id: &str) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        let session = Session {
            token: token.to_string(),
            identity: Identity {
                user_id: user_id.to_string(),
            },
            created_at: now,
            expires_at: now + ttl,
        };
        self.sessions.write().await.insert(token.to_string(), session);
    }

    /// 撤销 Token；返回是否存在
    pub async fn revoke(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }

    /// 清理过期会话，返回清理数量
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        before - sessions.len()
    }

    /// 获取活跃会话数
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn lookup(&self, token: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .get(token)
            .filter(|s| !s.is_expired(Utc::now()))
            .cloned()
    }
}

#[async_trait]
impl SessionGate for MemorySessionGate {
    async fn validate(&self, token: &str) -> bool {
        self.lookup(token).await.is_some()
    }

    async fn resolve(&self, token: &str) -> Option<Identity> {
        self.lookup(token).await.map(|s| s.identity)
    }
}

impl Default for MemorySessionGate {
    fn default() -> Self {
        Self::new(24 * 3600)
    }
}
