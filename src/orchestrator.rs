//! 编排器：对外入口
//!
//! submit_request 为每条请求 spawn 一个逻辑任务并立即返回 RequestHandle
//! （可取消、可等待产出）；subscribe_events 按会话订阅事件流，支持从
//! 已观测序号重订阅。生成后端按配置装配，缺少 API Key 时自动降级为 Mock。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::{AgentRegistry, AgentRuntime};
use crate::config::{AppConfig, LlmSection};
use crate::core::OrchestrateError;
use crate::events::{EventBus, EventSubscription};
use crate::llm::{MockGenerator, OpenAiGenerator, TextGenerator};
use crate::memory::MemoryStore;
use crate::router::{ClassificationPolicy, DelegationRouter, KeywordPolicy};
use crate::tools::ToolGateway;

pub use crate::router::RequestOutcome;

/// 一条在途请求的句柄：取消令牌 + 任务句柄
pub struct RequestHandle {
    pub request_id: String,
    pub session_id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<RequestOutcome, OrchestrateError>>,
}

impl RequestHandle {
    /// 请求取消：任务尽快停止，取消后到达的迟到结果被丢弃
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 等待请求落定
    pub async fn await_outcome(self) -> Result<RequestOutcome, OrchestrateError> {
        self.task
            .await
            .map_err(|e| OrchestrateError::InvalidState(format!("request task failed: {}", e)))?
    }
}

/// 编排器：注册表 + 路由器 + 记忆 + 事件总线的装配与门面
pub struct Orchestrator {
    memory: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    router: Arc<DelegationRouter>,
}

impl Orchestrator {
    /// 按配置装配：生成后端来自 [llm] 段，分类策略为默认关键词策略
    pub fn new(
        config: AppConfig,
        registry: AgentRegistry,
        gateway: ToolGateway,
    ) -> Result<Self, OrchestrateError> {
        let generator = generator_from_config(&config.llm);
        Self::with_parts(config, registry, gateway, generator, Arc::new(KeywordPolicy))
    }

    /// 显式注入生成后端与分类策略（测试与嵌入场景）
    pub fn with_parts(
        config: AppConfig,
        registry: AgentRegistry,
        gateway: ToolGateway,
        generator: Arc<dyn TextGenerator>,
        policy: Arc<dyn ClassificationPolicy>,
    ) -> Result<Self, OrchestrateError> {
        let memory = Arc::new(match config.app.persist_root {
            Some(ref root) => MemoryStore::with_persistence(root)?,
            None => MemoryStore::in_memory(),
        });
        let bus = Arc::new(EventBus::new(config.app.event_window));
        let runtime = Arc::new(AgentRuntime::new(
            generator,
            Arc::new(gateway),
            Arc::clone(&memory),
            config.router.max_tool_rounds,
        ));
        let router = Arc::new(DelegationRouter::new(
            Arc::new(registry),
            runtime,
            Arc::clone(&memory),
            Arc::clone(&bus),
            policy,
            config.router,
        ));
        Ok(Self { memory, bus, router })
    }

    /// 提交一条请求：立即返回句柄，处理在后台任务中进行
    pub fn submit_request(&self, session_id: &str, message: &str) -> RequestHandle {
        let request_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let router = Arc::clone(&self.router);
        let rid = request_id.clone();
        let sid = session_id.to_string();
        let msg = message.to_string();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            router.handle_request(&rid, &sid, &msg, token).await
        });

        tracing::info!(request_id = %request_id, session_id, "request submitted");
        RequestHandle {
            request_id,
            session_id: session_id.to_string(),
            cancel,
            task,
        }
    }

    /// 订阅会话事件流；from_seq 为最后已观测序号（0 表示从头）
    pub fn subscribe_events(&self, session_id: &str, from_seq: u64) -> EventSubscription {
        self.bus.subscribe(session_id, from_seq)
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }
}

/// 按 [llm] 段装配生成后端；provider=openai 但无 API Key 时降级为 Mock
fn generator_from_config(llm: &LlmSection) -> Arc<dyn TextGenerator> {
    match llm.provider.as_str() {
        "openai" => {
            if std::env::var("OPENAI_API_KEY").is_ok() {
                Arc::new(OpenAiGenerator::new(
                    llm.base_url.as_deref(),
                    &llm.model,
                    None,
                ))
            } else {
                tracing::warn!("OPENAI_API_KEY not set, falling back to mock generator");
                Arc::new(MockGenerator)
            }
        }
        "mock" => Arc::new(MockGenerator),
        other => {
            tracing::warn!(provider = other, "unknown llm provider, using mock generator");
            Arc::new(MockGenerator)
        }
    }
}

/// 便捷装配：加载配置 + 预置行政团队 + 空网关
pub fn from_config_path(path: Option<PathBuf>) -> Result<Orchestrator, OrchestrateError> {
    let config = crate::config::load_config(path)
        .map_err(|e| OrchestrateError::ConfigError(e.to_string()))?;
    let registry = crate::agents::executive_team();
    let gateway = ToolGateway::new(&config.gateway);
    Orchestrator::new(config, registry, gateway)
}
