//! 编排错误分类
//!
//! Router 以下各层的失败一律转为带类型的 OrchestrateError，绝不以不透明 panic 上抛；
//! 只有 Router 有权以 Failed 终结一次请求。kind() 给出面向用户的分类名。

use thiserror::Error;

/// 编排过程中可能出现的错误（工具、记忆、生成、取消等）
#[derive(Error, Debug, Clone)]
pub enum OrchestrateError {
    /// 瞬态工具失败（超时 / 5xx 等价），由 Tool Gateway 在预算内重试
    #[error("Transient tool error: {0}")]
    TransientTool(String),

    /// 永久工具失败（参数错误 / 未授权），立即上抛，不重试
    #[error("Permanent tool error: {0}")]
    PermanentTool(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown tool server: {0}")]
    UnknownToolServer(String),

    /// 智能体请求了不在其技能范围内的工具
    #[error("Tool {tool} not allowed for agent {agent}")]
    ToolNotAllowed { tool: String, agent: String },

    /// 单次智能体调用内工具往返超过上限
    #[error("Tool loop exceeded after {0} rounds")]
    ToolLoopExceeded(usize),

    /// 乐观并发写失败：持有的版本已过期，调用方须重读后重试
    #[error("Version conflict on key {key}: expected {expected}, stored {stored}")]
    VersionConflict {
        key: String,
        expected: u64,
        stored: u64,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 会话已归档等非法状态下的写入
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// 单个专家失败（隔离在本专家内，不向兄弟专家传播）
    #[error("Specialist {agent} failed: {reason}")]
    SpecialistFailure { agent: String, reason: String },

    /// 所有目标均无可用产出，请求级失败
    #[error("Aggregation failed: {0}")]
    AggregationFailure(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// 非领导者智能体输出了委派请求
    #[error("Delegation not permitted for agent {0}")]
    DelegationNotPermitted(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl OrchestrateError {
    /// 面向用户的分类名（随最终失败原因一起返回）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientTool(_) => "transient_tool_error",
            Self::PermanentTool(_) => "permanent_tool_error",
            Self::ToolTimeout(_) => "tool_timeout",
            Self::UnknownTool(_) => "unknown_tool",
            Self::UnknownToolServer(_) => "unknown_tool_server",
            Self::ToolNotAllowed { .. } => "tool_not_allowed",
            Self::ToolLoopExceeded(_) => "tool_loop_exceeded",
            Self::VersionConflict { .. } => "version_conflict",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::SpecialistFailure { .. } => "specialist_failure",
            Self::AggregationFailure(_) => "aggregation_failure",
            Self::GenerationFailed(_) => "generation_failed",
            Self::DelegationNotPermitted(_) => "delegation_not_permitted",
            Self::Cancelled => "cancelled",
            Self::ConfigError(_) => "config_error",
        }
    }

    /// 是否值得在调用预算内重试（仅瞬态工具失败与超时）
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientTool(_) | Self::ToolTimeout(_))
    }
}
