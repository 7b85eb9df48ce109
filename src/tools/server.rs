//! 工具服务器抽象
//!
//! 每个工具服务器暴露能力目录（discovery）与带类型的调用（invoke），
//! 对应 MCP 风格的外部协作方；具体线上编码由实现决定，核心只依赖本 trait。
//! 失败分为 Transient（可重试）与 Permanent（立即上抛）两类。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 能力目录中的一条工具签名
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSignature {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    #[serde(default)]
    pub parameters: Value,
}

/// 一次工具调用请求（简化 JSON：{"tool": "crm_lookup", "args": {...}}）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 一次工具调用的成功结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool: String,
    pub payload: String,
}

/// 工具层失败分类：Transient 在网关预算内重试，Permanent 立即上抛
#[derive(Clone, Debug, thiserror::Error)]
pub enum ToolError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

/// 工具服务器 trait：能力发现 + 调用
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// 服务器标识（网关内唯一）
    fn id(&self) -> &str;

    /// 拉取能力目录
    async fn list_tools(&self) -> Result<Vec<ToolSignature>, ToolError>;

    /// 执行一次调用，返回结果 payload
    async fn call(&self, request: &ToolCallRequest) -> Result<String, ToolError>;
}
