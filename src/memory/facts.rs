//! 跨会话事实存储
//!
//! MemoryFact 按 (owner scope, key) 命名空间存放，写入走乐观版本比较：
//! 持有过期版本的写入返回 VersionConflict，调用方重读后重试。
//! 这是并发专家间唯一共享的可变状态，保证同 key 并发写不会互相覆盖。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::OrchestrateError;

/// 事实的归属命名空间
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum OwnerScope {
    Global,
    User(String),
    Agent(String),
}

/// 一条持久事实：值 + 最后写入者 + 单调版本号
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryFact {
    pub scope: OwnerScope,
    pub key: String,
    pub value: String,
    pub last_writer: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// 事实存储：写锁内完成版本比较与替换；配置持久化路径后每次接受的写入同步落盘
#[derive(Debug)]
pub struct FactStore {
    inner: RwLock<HashMap<OwnerScope, HashMap<String, MemoryFact>>>,
    persist_path: Option<PathBuf>,
}

impl FactStore {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            persist_path: None,
        }
    }

    /// 带持久化的存储；快照损坏或不可读时拒绝启动，绝不静默清空已落盘的事实
    pub fn with_persistence(path: impl AsRef<Path>) -> Result<Self, OrchestrateError> {
        let path = path.as_ref().to_path_buf();
        let initial = load_snapshot(&path).map_err(|e| {
            OrchestrateError::InvalidState(format!("fact snapshot load failed: {}", e))
        })?;
        Ok(Self {
            inner: RwLock::new(initial),
            persist_path: Some(path),
        })
    }

    /// 快照读：返回请求 key 中存在的事实，不持有锁超出本次调用
    pub async fn read_facts(
        &self,
        scope: &OwnerScope,
        keys: &[&str],
    ) -> HashMap<String, MemoryFact> {
        let inner = self.inner.read().await;
        let Some(ns) = inner.get(scope) else {
            return HashMap::new();
        };
        keys.iter()
            .filter_map(|k| ns.get(*k).map(|f| (k.to_string(), f.clone())))
            .collect()
    }

    /// 某 scope 下全部事实（按 key 排序，供提示上下文拼接）
    pub async fn facts_for(&self, scope: &OwnerScope) -> Vec<MemoryFact> {
        let inner = self.inner.read().await;
        let mut facts: Vec<MemoryFact> = inner
            .get(scope)
            .map(|ns| ns.values().cloned().collect())
            .unwrap_or_default();
        facts.sort_by(|a, b| a.key.cmp(&b.key));
        facts
    }

    /// 乐观并发写：expected_version 为 0 表示「尚不存在」；
    /// 与存储版本不符则拒绝并返回 VersionConflict，成功时版本 +1 且在返回前落盘
    pub async fn write_fact(
        &self,
        scope: &OwnerScope,
        key: &str,
        value: &str,
        expected_version: u64,
        writer: &str,
    ) -> Result<MemoryFact, OrchestrateError> {
        let mut inner = self.inner.write().await;
        let ns = inner.entry(scope.clone()).or_default();
        let stored_version = ns.get(key).map(|f| f.version).unwrap_or(0);
        if stored_version != expected_version {
            return Err(OrchestrateError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                stored: stored_version,
            });
        }

        let fact = MemoryFact {
            scope: scope.clone(),
            key: key.to_string(),
            value: value.to_string(),
            last_writer: writer.to_string(),
            version: stored_version + 1,
            updated_at: Utc::now(),
        };
        ns.insert(key.to_string(), fact.clone());

        if let Some(path) = &self.persist_path {
            save_snapshot(path, &inner)
                .map_err(|e| OrchestrateError::InvalidState(format!("persist failed: {}", e)))?;
        }
        Ok(fact)
    }

    /// 带重试的写入：冲突时重读当前值并用 compute 重新计算，最多 max_retries 次
    pub async fn write_fact_retry<F>(
        &self,
        scope: &OwnerScope,
        key: &str,
        writer: &str,
        max_retries: usize,
        compute: F,
    ) -> Result<MemoryFact, OrchestrateError>
    where
        F: Fn(Option<&MemoryFact>) -> String,
    {
        let mut attempt = 0;
        loop {
            let current = self.read_facts(scope, &[key]).await;
            let current = current.get(key);
            let value = compute(current);
            let expected = current.map(|f| f.version).unwrap_or(0);
            match self.write_fact(scope, key, &value, expected, writer).await {
                Ok(fact) => return Ok(fact),
                Err(e @ OrchestrateError::VersionConflict { .. }) => {
                    if attempt >= max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

type FactMap = HashMap<OwnerScope, HashMap<String, MemoryFact>>;

fn load_snapshot(path: &Path) -> anyhow::Result<FactMap> {
    if !path.exists() {
        return Ok(FactMap::default());
    }
    let data = std::fs::read_to_string(path)?;
    let facts: Vec<MemoryFact> = serde_json::from_str(&data)?;
    let mut map = FactMap::default();
    for f in facts {
        map.entry(f.scope.clone()).or_default().insert(f.key.clone(), f);
    }
    Ok(map)
}

/// 全量快照写盘：flat JSON 数组，写入后 sync
fn save_snapshot(path: &Path, map: &FactMap) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let facts: Vec<&MemoryFact> = map.values().flat_map(|ns| ns.values()).collect();
    std::fs::write(path, serde_json::to_string_pretty(&facts)?)?;
    Ok(())
}
