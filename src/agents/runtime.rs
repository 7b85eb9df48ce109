//! 单智能体运行时
//!
//! run(profile, context) 驱动 invoke-with-context 循环：生成 -> 解析 ->
//! 若为 Tool Call 则经网关执行并把 Observation 折回上下文后再生成；
//! 工具往返次数有硬上限（ToolLoopExceeded），防止无界递归调用。
//! 委派建议只允许领导者档案产出，其余档案产出即错误。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agents::AgentProfile;
use crate::core::OrchestrateError;
use crate::events::{EventBus, EventKind};
use crate::llm::{parse_generation, ContextMessage, Generation, PromptContext, TextGenerator};
use crate::memory::{MemoryStore, OwnerScope, ToolCallRecord, Turn, TurnRole};
use crate::tools::ToolGateway;

/// 观察结果折回上下文时的预览上限
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 单次智能体调用的带类型结果
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    /// 最终文本回答
    FinalAnswer(String),
    /// 请求执行工具（由运行时循环内部消费，执行后折回上下文再生成）
    ToolCallRequested(crate::tools::ToolCallRequest),
    /// 建议委派给其它智能体（仅领导者档案允许）
    DelegationSuggested { targets: Vec<String>, reason: String },
}

/// 一次完整运行的产出：结果 + 期间发生的工具调用记录（嵌入 Turn 用）
#[derive(Debug)]
pub struct AgentRun {
    pub outcome: AgentOutcome,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// 智能体运行时：生成能力 + 工具网关 + 记忆，max_tool_rounds 限制单次调用内的工具往返
pub struct AgentRuntime {
    generator: Arc<dyn TextGenerator>,
    gateway: Arc<ToolGateway>,
    memory: Arc<MemoryStore>,
    max_tool_rounds: usize,
}

impl AgentRuntime {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        gateway: Arc<ToolGateway>,
        memory: Arc<MemoryStore>,
        max_tool_rounds: usize,
    ) -> Self {
        Self {
            generator,
            gateway,
            memory,
            max_tool_rounds,
        }
    }

    /// 组装提示上下文：档案指令 + 相关事实记忆段 + 可用工具段 + 会话历史 + 当前任务
    pub async fn compose_context(
        &self,
        profile: &AgentProfile,
        task: &str,
        history: &[Turn],
    ) -> PromptContext {
        let mut system = profile.instructions.clone();

        let mut facts = self
            .memory
            .facts
            .facts_for(&OwnerScope::Agent(profile.id.clone()))
            .await;
        facts.extend(self.memory.facts.facts_for(&OwnerScope::Global).await);
        if !facts.is_empty() {
            system.push_str("\n\n## Relevant memories\n");
            for f in &facts {
                system.push_str(&format!("- {}: {}\n", f.key, f.value));
            }
        }

        if !profile.allowed_tools.is_empty() {
            system.push_str("\n\n## Available tools\n");
            for server_id in self.gateway.server_ids() {
                let catalog = self
                    .gateway
                    .list_capabilities(&server_id)
                    .await
                    .unwrap_or_default();
                for sig in catalog {
                    if profile.allowed_tools.contains(&sig.name) {
                        system.push_str(&format!("- {}: {}\n", sig.name, sig.description));
                    }
                }
            }
            system.push_str(
                "\nTo call a tool, reply with exactly one JSON object: \
                 {\"tool\": \"<name>\", \"args\": {...}}\n",
            );
        }

        let mut ctx = PromptContext::new(system);
        for turn in history {
            match &turn.role {
                TurnRole::User => ctx.push(ContextMessage::user(turn.content.clone())),
                TurnRole::Agent(_) | TurnRole::Tool(_) => {
                    ctx.push(ContextMessage::assistant(turn.content.clone()))
                }
            }
        }
        ctx.push(ContextMessage::user(task.to_string()));
        ctx
    }

    /// 驱动一次完整调用；session_id 仅用于事件发布
    pub async fn run(
        &self,
        profile: &AgentProfile,
        mut ctx: PromptContext,
        session_id: &str,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> Result<AgentRun, OrchestrateError> {
        let mut tool_calls = Vec::new();
        let mut rounds = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(OrchestrateError::Cancelled);
            }

            let output = self
                .generator
                .generate(&ctx)
                .await
                .map_err(OrchestrateError::GenerationFailed)?;

            match parse_generation(&output)? {
                Generation::Text(answer) => {
                    return Ok(AgentRun {
                        outcome: AgentOutcome::FinalAnswer(answer),
                        tool_calls,
                    });
                }
                Generation::Delegate { targets, reason } => {
                    if !profile.is_leader {
                        return Err(OrchestrateError::DelegationNotPermitted(
                            profile.id.clone(),
                        ));
                    }
                    return Ok(AgentRun {
                        outcome: AgentOutcome::DelegationSuggested { targets, reason },
                        tool_calls,
                    });
                }
                Generation::ToolCall(request) => {
                    if rounds >= self.max_tool_rounds {
                        return Err(OrchestrateError::ToolLoopExceeded(rounds));
                    }
                    rounds += 1;

                    if !profile.allowed_tools.contains(&request.tool) {
                        return Err(OrchestrateError::ToolNotAllowed {
                            tool: request.tool,
                            agent: profile.id.clone(),
                        });
                    }

                    bus.publish(
                        session_id,
                        EventKind::ToolCalled,
                        serde_json::json!({
                            "agent": profile.id,
                            "tool": request.tool,
                            "args": request.args,
                        }),
                    );

                    // 永久失败与重试耗尽的瞬态失败都折回为失败观察，
                    // 让智能体自行调整或降级作答，而非中断本次调用
                    let (ok, observation) = match self.gateway.invoke_named(&request).await {
                        Ok(result) => (true, result.payload),
                        Err(OrchestrateError::UnknownTool(t)) => {
                            return Err(OrchestrateError::UnknownTool(t))
                        }
                        Err(e) => (false, format!("Error: {}", e)),
                    };

                    bus.publish(
                        session_id,
                        EventKind::ToolResult,
                        serde_json::json!({
                            "agent": profile.id,
                            "tool": request.tool,
                            "ok": ok,
                            "preview": preview(&observation),
                        }),
                    );

                    tool_calls.push(ToolCallRecord {
                        tool: request.tool.clone(),
                        args: request.args.clone(),
                        ok,
                        output: observation.clone(),
                    });

                    ctx.push(ContextMessage::assistant(format!(
                        "Tool call: {}",
                        request.tool
                    )));
                    ctx.push(ContextMessage::user(format!(
                        "Observation from {}: {}",
                        request.tool, observation
                    )));
                }
            }
        }
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!(
            "{}...",
            s.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>()
        )
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySection;
    use crate::llm::ScriptedGenerator;
    use crate::tools::{ToolCallRequest, ToolError, ToolServer, ToolSignature};
    use async_trait::async_trait;

    struct EchoServer;

    #[async_trait]
    impl ToolServer for EchoServer {
        fn id(&self) -> &str {
            "echo_srv"
        }

        async fn list_tools(&self) -> Result<Vec<ToolSignature>, ToolError> {
            Ok(vec![ToolSignature {
                name: "echo".to_string(),
                description: "echoes args".to_string(),
                parameters: serde_json::json!({}),
            }])
        }

        async fn call(&self, request: &ToolCallRequest) -> Result<String, ToolError> {
            Ok(format!("echo: {}", request.args))
        }
    }

    fn runtime(generator: ScriptedGenerator, max_rounds: usize) -> AgentRuntime {
        let mut gw = ToolGateway::new(&GatewaySection::default());
        gw.register(Arc::new(EchoServer));
        AgentRuntime::new(
            Arc::new(generator),
            Arc::new(gw),
            Arc::new(MemoryStore::in_memory()),
            max_rounds,
        )
    }

    fn specialist() -> AgentProfile {
        AgentProfile::new("cfo", "CFO").with_tools(&["echo"])
    }

    #[tokio::test]
    async fn test_tool_call_is_executed_and_folded_back() {
        let gen = ScriptedGenerator::new([
            r#"{"tool": "echo", "args": {"q": "revenue"}}"#,
            "Revenue is fine.",
        ]);
        let rt = runtime(gen, 4);
        let bus = EventBus::new(64);
        let ctx = PromptContext::new("sys");

        let run = rt
            .run(&specialist(), ctx, "s1", &bus, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(run.outcome, AgentOutcome::FinalAnswer(ref a) if a.contains("fine")));
        assert_eq!(run.tool_calls.len(), 1);
        assert!(run.tool_calls[0].ok);

        let kinds: Vec<_> = bus.subscribe("s1", 0).drain().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::ToolCalled, EventKind::ToolResult]);
    }

    #[tokio::test]
    async fn test_tool_loop_bound_is_enforced() {
        let gen = ScriptedGenerator::default();
        for _ in 0..5 {
            gen.push_ok(r#"{"tool": "echo", "args": {}}"#);
        }
        let rt = runtime(gen, 2);
        let err = rt
            .run(
                &specialist(),
                PromptContext::new("sys"),
                "s1",
                &EventBus::new(64),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::ToolLoopExceeded(2)));
    }

    #[tokio::test]
    async fn test_disallowed_tool_is_rejected() {
        let gen = ScriptedGenerator::new([r#"{"tool": "echo", "args": {}}"#]);
        let rt = runtime(gen, 4);
        let no_tools = AgentProfile::new("coo", "COO");
        let err = rt
            .run(
                &no_tools,
                PromptContext::new("sys"),
                "s1",
                &EventBus::new(64),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::ToolNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_delegation_from_specialist_is_an_error() {
        let gen = ScriptedGenerator::new([r#"{"delegate": ["cto"], "reason": "tech"}"#]);
        let rt = runtime(gen, 4);
        let err = rt
            .run(
                &specialist(),
                PromptContext::new("sys"),
                "s1",
                &EventBus::new(64),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::DelegationNotPermitted(_)));
    }

    #[tokio::test]
    async fn test_delegation_from_leader_is_surfaced() {
        let gen = ScriptedGenerator::new([r#"{"delegate": ["cfo"], "reason": "money"}"#]);
        let rt = runtime(gen, 4);
        let leader = AgentProfile::new("ceo", "CEO").leader();
        let run = rt
            .run(
                &leader,
                PromptContext::new("sys"),
                "s1",
                &EventBus::new(64),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(
            run.outcome,
            AgentOutcome::DelegationSuggested { ref targets, .. } if targets == &["cfo"]
        ));
    }
}
