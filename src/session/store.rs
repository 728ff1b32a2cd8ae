//! 会话存储
//!
//! 注入式的并发键值存储（不使用全局静态）。约定：get 返回快照；update 为整体覆盖（最后写入者胜），update_existing 不会
//! 重新插入已删除的会话；
//! 不同 id 的操作互不阻塞；remove_expired 按会话开始时间清理。

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::session::OrchestrationContext;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 新建会话（分配 session_<uuid>）并保存
    async fn create(&self, request: &str) -> OrchestrationContext;

    async fn get(&self, session_id: &str) -> Option<OrchestrationContext>;

    /// 写回会话（不存在则插入）
    async fn update(&self, context: OrchestrationContext);

    /// 仅当会话仍在存储中时写回；已被删除（remove / 过期清理）时返回 false
    async fn update_existing(&self, context: OrchestrationContext) -> bool;

    async fn remove(&self, session_id: &str) -> Option<OrchestrationContext>;

    /// 删除开始时间早于 max_age 之前的会话，返回删除数量
    async fn remove_expired(&self, max_age: Duration) -> usize;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// 内存会话存储（DashMap，按 key 分片加锁）
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, OrchestrationContext>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn new_session_id() -> String {
    format!("session_{}", uuid::Uuid::new_v4())
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, request: &str) -> OrchestrationContext {
        let context = OrchestrationContext::new(new_session_id(), request);
        self.sessions
            .insert(context.session_id.clone(), context.clone());
        tracing::debug!(session = %context.session_id, "Session created");
        context
    }

    async fn get(&self, session_id: &str) -> Option<OrchestrationContext> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    async fn update(&self, context: OrchestrationContext) {
        self.sessions.insert(context.session_id.clone(), context);
    }

    async fn update_existing(&self, context: OrchestrationContext) -> bool {
        match self.sessions.get_mut(&context.session_id) {
            Some(mut entry) => {
                *entry = context;
                true
            }
            None => false,
        }
    }

    async fn remove(&self, session_id: &str) -> Option<OrchestrationContext> {
        self.sessions.remove(session_id).map(|(_, context)| context)
    }

    async fn remove_expired(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let before = self.sessions.len();
        self.sessions.retain(|_, context| context.started_at >= cutoff);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::info!(removed, "Expired sessions removed");
        }
        removed
    }

    async fn len(&self) -> usize {
        self.sessions.len()
    }
}
