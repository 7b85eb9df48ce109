//! Quorum - 多智能体请求编排核心
//!
//! 一条用户消息进入后由领导者（Leader）智能体分类并委派给若干专家（Specialist）智能体，
//! 各专家可调用各自的工具服务器，领导者最终聚合所有产出为一条回复；
//! 全程以事件流可观测，并落入会话日志与跨会话事实记忆。
//!
//! 模块划分：
//! - **agents**: AgentProfile 注册表与单智能体运行时（invoke-with-context 循环）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类（Transient / Permanent / Conflict / Cancelled 等）
//! - **events**: 会话级事件总线（单调序号，可从任意序号重订阅）
//! - **llm**: 文本生成能力抽象（OpenAI 兼容 / Mock）与结构化输出解析
//! - **memory**: 会话轮次日志（append-only）与跨会话事实存储（乐观并发）
//! - **orchestrator**: 对外入口（submit_request / subscribe_events）
//! - **router**: 委派路由器（分类策略、DelegationPlan、扇出/扇入状态机）
//! - **tools**: 工具网关（能力目录缓存、超时重试、故障域隔离）

pub mod agents;
pub mod config;
pub mod core;
pub mod events;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod router;
pub mod tools;

pub use crate::core::OrchestrateError;
pub use orchestrator::{Orchestrator, RequestHandle, RequestOutcome};
