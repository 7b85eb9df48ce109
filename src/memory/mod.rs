//! 记忆存储：会话轮次日志 + 跨会话事实存储
//!
//! - **session**: 每会话 append-only 的 Turn 日志与会话变量（短期）
//! - **facts**: 按 owner scope 命名空间的持久事实，乐观版本并发控制（长期）
//!
//! 两者共同构成 Memory Store；配置 persist_root 后所有写入在返回前同步落盘。

pub mod facts;
pub mod session;

use std::path::Path;

use crate::core::OrchestrateError;

pub use facts::{FactStore, MemoryFact, OwnerScope};
pub use session::{SessionMeta, SessionStore, ToolCallRecord, Turn, TurnDraft, TurnRole};

/// Memory Store 门面：会话日志与事实存储的组合
pub struct MemoryStore {
    pub sessions: SessionStore,
    pub facts: FactStore,
}

impl MemoryStore {
    /// 纯内存存储（测试与无盘运行）
    pub fn in_memory() -> Self {
        Self {
            sessions: SessionStore::in_memory(),
            facts: FactStore::in_memory(),
        }
    }

    /// 带持久化根目录的存储：turns 落 root/sessions/<id>.jsonl，facts 落 root/facts.json
    pub fn with_persistence(root: impl AsRef<Path>) -> Result<Self, OrchestrateError> {
        let root = root.as_ref();
        Ok(Self {
            sessions: SessionStore::with_persistence(root.join("sessions")),
            facts: FactStore::with_persistence(root.join("facts.json"))?,
        })
    }
}
