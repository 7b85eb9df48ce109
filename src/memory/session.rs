//! 会话轮次日志
//!
//! 每个会话持有一条 append-only 的 Turn 序列：索引严格递增、无空洞、追加后不可变。
//! 追加在写锁内原子完成；已归档会话拒绝写入（InvalidState）。
//! 配置持久化目录后，每条 Turn 以 JSONL 追加写入并在返回前落盘。

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::OrchestrateError;

/// Turn 的产出方
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Agent(String),
    Tool(String),
}

/// 嵌入 Turn 的工具调用记录（不单独持久化）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args: serde_json::Value,
    pub ok: bool,
    pub output: String,
}

/// 追加前的 Turn 草稿（索引与时间戳由存储分配）
#[derive(Clone, Debug)]
pub struct TurnDraft {
    pub role: TurnRole,
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl TurnDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn agent(agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Agent(agent_id.into()),
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCallRecord>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// 已落日志的不可变 Turn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub index: u64,
    pub role: TurnRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    pub at: DateTime<Utc>,
}

/// 会话元信息快照
#[derive(Clone, Debug)]
pub struct SessionMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub turn_count: u64,
}

struct SessionState {
    turns: Vec<Turn>,
    vars: HashMap<String, String>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    archived: bool,
}

impl SessionState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            turns: Vec::new(),
            vars: HashMap::new(),
            created_at: now,
            last_active: now,
            archived: false,
        }
    }

    fn meta(&self, id: &str) -> SessionMeta {
        SessionMeta {
            id: id.to_string(),
            created_at: self.created_at,
            last_active: self.last_active,
            turn_count: self.turns.len() as u64,
        }
    }
}

/// 会话存储：session_id -> append-only Turn 日志
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionState>>,
    persist_root: Option<PathBuf>,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persist_root: None,
        }
    }

    pub fn with_persistence(root: impl AsRef<Path>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persist_root: Some(root.as_ref().to_path_buf()),
        }
    }

    fn session_path(&self, id: &str) -> Option<PathBuf> {
        self.persist_root.as_ref().map(|r| r.join(format!("{}.jsonl", id)))
    }

    /// 打开会话：首次引用即创建；若配置了持久化且磁盘上有日志则先回放
    pub async fn open_session(&self, id: &str) -> SessionMeta {
        let mut sessions = self.sessions.write().await;
        if let Some(state) = sessions.get_mut(id) {
            state.last_active = Utc::now();
            return state.meta(id);
        }

        let mut state = SessionState::new();
        if let Some(path) = self.session_path(id) {
            if let Ok(data) = std::fs::read_to_string(&path) {
                // 遇到损坏行即停：跳过会在回放中留下索引空洞，并让后续追加撞上重复索引
                for (lineno, line) in data.lines().enumerate() {
                    match serde_json::from_str::<Turn>(line) {
                        Ok(turn) => state.turns.push(turn),
                        Err(e) => {
                            tracing::warn!(
                                session = id,
                                line = lineno + 1,
                                "corrupt turn log entry, truncating replay here: {}",
                                e
                            );
                            break;
                        }
                    }
                }
            }
        }
        let meta = state.meta(id);
        sessions.insert(id.to_string(), state);
        meta
    }

    /// 严格模式打开：会话不存在时返回 SessionNotFound
    pub async fn open_session_strict(&self, id: &str) -> Result<SessionMeta, OrchestrateError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|s| s.meta(id))
            .ok_or_else(|| OrchestrateError::SessionNotFound(id.to_string()))
    }

    /// 原子追加一条 Turn：索引在写锁内分配，持久化完成后才返回
    pub async fn append_turn(
        &self,
        session_id: &str,
        draft: TurnDraft,
    ) -> Result<Turn, OrchestrateError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestrateError::SessionNotFound(session_id.to_string()))?;
        if state.archived {
            return Err(OrchestrateError::InvalidState(format!(
                "session {} is archived",
                session_id
            )));
        }

        let turn = Turn {
            index: state.turns.last().map(|t| t.index + 1).unwrap_or(0),
            role: draft.role,
            content: draft.content,
            tool_calls: draft.tool_calls,
            at: Utc::now(),
        };

        if let Some(path) = self.session_path(session_id) {
            persist_turn(&path, &turn)
                .map_err(|e| OrchestrateError::InvalidState(format!("persist failed: {}", e)))?;
        }

        state.turns.push(turn.clone());
        state.last_active = Utc::now();
        Ok(turn)
    }

    /// 当前全部 Turn 的快照（回放用）
    pub async fn turns(&self, session_id: &str) -> Vec<Turn> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.turns.clone())
            .unwrap_or_default()
    }

    /// 归档会话：此后 append_turn 返回 InvalidState
    pub async fn archive_session(&self, session_id: &str) -> Result<(), OrchestrateError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestrateError::SessionNotFound(session_id.to_string()))?;
        state.archived = true;
        Ok(())
    }

    /// 设置会话变量（请求间的轻量 scratch 状态）
    pub async fn set_var(&self, session_id: &str, key: &str, value: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(state) = sessions.get_mut(session_id) {
            state.vars.insert(key.to_string(), value.to_string());
        }
    }

    pub async fn get_var(&self, session_id: &str, key: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).and_then(|s| s.vars.get(key).cloned())
    }
}

/// 以 JSONL 追加写入一条 Turn；父目录不存在时自动创建
fn persist_turn(path: &Path, turn: &Turn) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", serde_json::to_string(turn)?)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_turn_indices_are_gap_free() {
        let store = SessionStore::in_memory();
        store.open_session("s1").await;
        for i in 0..5 {
            let turn = store
                .append_turn("s1", TurnDraft::user(format!("msg {}", i)))
                .await
                .unwrap();
            assert_eq!(turn.index, i);
        }
        let turns = store.turns("s1").await;
        for (i, t) in turns.iter().enumerate() {
            assert_eq!(t.index, i as u64);
        }
    }

    #[tokio::test]
    async fn test_append_to_archived_session_fails() {
        let store = SessionStore::in_memory();
        store.open_session("s1").await;
        store.archive_session("s1").await.unwrap();
        let err = store
            .append_turn("s1", TurnDraft::user("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_strict_open_requires_existence() {
        let store = SessionStore::in_memory();
        assert!(store.open_session_strict("nope").await.is_err());
        store.open_session("yes").await;
        assert!(store.open_session_strict("yes").await.is_ok());
    }

    #[tokio::test]
    async fn test_replay_truncates_at_corrupt_line_and_stays_gap_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        {
            let store = SessionStore::with_persistence(dir.path());
            store.open_session("s1").await;
            for i in 0..3 {
                store
                    .append_turn("s1", TurnDraft::user(format!("msg {}", i)))
                    .await
                    .unwrap();
            }
        }
        // 损坏第二行
        let data = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = data.lines().collect();
        lines[1] = "{not json";
        std::fs::write(&path, lines.join("\n")).unwrap();

        let store = SessionStore::with_persistence(dir.path());
        let meta = store.open_session("s1").await;
        assert_eq!(meta.turn_count, 1);

        // 后续追加从最后一条回放索引续排，不出现空洞或重复
        let turn = store.append_turn("s1", TurnDraft::user("next")).await.unwrap();
        assert_eq!(turn.index, 1);
        let turns = store.turns("s1").await;
        for (i, t) in turns.iter().enumerate() {
            assert_eq!(t.index, i as u64);
        }
    }

    #[tokio::test]
    async fn test_persisted_turns_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::with_persistence(dir.path());
            store.open_session("s1").await;
            store.append_turn("s1", TurnDraft::user("hello")).await.unwrap();
            store
                .append_turn("s1", TurnDraft::agent("ceo", "hi"))
                .await
                .unwrap();
        }
        let store = SessionStore::with_persistence(dir.path());
        let meta = store.open_session("s1").await;
        assert_eq!(meta.turn_count, 2);
        let turns = store.turns("s1").await;
        assert_eq!(turns[1].role, TurnRole::Agent("ceo".to_string()));
    }
}
