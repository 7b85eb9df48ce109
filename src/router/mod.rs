//! 委派路由器
//!
//! 每请求状态机：Received -> Classified -> Dispatched -> Aggregating -> Completed / Failed。
//! 分类策略可插拔（classify）；DelegationPlan 决定并行或顺序派发（plan）；
//! 并行派发为扇出/扇入屏障：等待全部落定、收集部分失败、绝不让单个专家失败波及兄弟（bulkhead）。
//! 领导者最后被调用做聚合；事件与对应状态变更同步发布。

pub mod classify;
pub mod plan;

use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentOutcome, AgentProfile, AgentRegistry, AgentRuntime};
use crate::config::RouterSection;
use crate::core::OrchestrateError;
use crate::events::{EventBus, EventKind};
use crate::memory::{MemoryStore, ToolCallRecord, Turn, TurnDraft};

pub use classify::{ClassificationPolicy, KeywordPolicy};
pub use plan::{DelegationPlan, DispatchMode};

/// 单个专家的落定结果（成功产出或隔离的失败）
#[derive(Debug)]
pub struct SpecialistReport {
    pub agent_id: String,
    pub result: Result<String, OrchestrateError>,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// 一次请求的最终产出
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_id: String,
    pub session_id: String,
    pub answer: String,
    /// 参与产出最终回答的智能体（聚合成功时为领导者）
    pub answered_by: String,
}

/// 委派路由器：持有注册表、运行时、记忆、事件总线与分类策略
pub struct DelegationRouter {
    registry: Arc<AgentRegistry>,
    runtime: Arc<AgentRuntime>,
    memory: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    policy: Arc<dyn ClassificationPolicy>,
    cfg: RouterSection,
}

impl DelegationRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        runtime: Arc<AgentRuntime>,
        memory: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        policy: Arc<dyn ClassificationPolicy>,
        cfg: RouterSection,
    ) -> Self {
        Self {
            registry,
            runtime,
            memory,
            bus,
            policy,
            cfg,
        }
    }

    fn specialist_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.specialist_timeout_secs)
    }

    /// 以 Failed 终结请求：发布 request_failed 事件后上抛。只有本方法有权终结请求。
    fn fail(
        &self,
        session_id: &str,
        request_id: &str,
        err: OrchestrateError,
    ) -> Result<RequestOutcome, OrchestrateError> {
        tracing::warn!(request_id, kind = err.kind(), reason = %err, "request failed");
        self.bus.publish(
            session_id,
            EventKind::RequestFailed,
            serde_json::json!({
                "request_id": request_id,
                "kind": err.kind(),
                "reason": err.to_string(),
            }),
        );
        Err(err)
    }

    /// 处理一条入站请求（每请求一个逻辑任务，由 Orchestrator spawn）
    pub async fn handle_request(
        &self,
        request_id: &str,
        session_id: &str,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome, OrchestrateError> {
        // Received
        self.bus.publish(
            session_id,
            EventKind::RequestReceived,
            serde_json::json!({ "request_id": request_id }),
        );
        self.memory.sessions.open_session(session_id).await;
        let history = self.memory.sessions.turns(session_id).await;
        if let Err(e) = self
            .memory
            .sessions
            .append_turn(session_id, TurnDraft::user(user_message))
            .await
        {
            return self.fail(session_id, request_id, e);
        }

        if cancel.is_cancelled() {
            return self.fail(session_id, request_id, OrchestrateError::Cancelled);
        }

        // Classified：策略产出候选；无候选时领导者先行应答，其委派建议作为候选（仅一层）
        let mut candidates =
            self.policy
                .classify(user_message, &history, &self.registry);
        candidates.retain(|id| self.registry.get(id).map(|p| !p.is_leader).unwrap_or(false));

        if candidates.is_empty() {
            match self
                .invoke_leader(session_id, user_message, &history, &cancel, None)
                .await
            {
                Ok(LeaderResult::Answer(answer, tool_calls)) => {
                    return self
                        .complete(request_id, session_id, answer, tool_calls, &cancel)
                        .await;
                }
                Ok(LeaderResult::Delegate(targets)) => {
                    candidates = targets;
                    candidates.retain(|id| {
                        self.registry.get(id).map(|p| !p.is_leader).unwrap_or(false)
                    });
                    if candidates.is_empty() {
                        return self.fail(
                            session_id,
                            request_id,
                            OrchestrateError::AggregationFailure(
                                "leader delegated to unknown agents".to_string(),
                            ),
                        );
                    }
                }
                Err(OrchestrateError::Cancelled) => {
                    return self.fail(session_id, request_id, OrchestrateError::Cancelled)
                }
                Err(e) => {
                    return self.fail(
                        session_id,
                        request_id,
                        OrchestrateError::AggregationFailure(format!("leader failed: {}", e)),
                    )
                }
            }
        }

        // Dispatched
        let delegation_plan = plan::build_plan(&candidates, &self.registry);
        self.bus.publish(
            session_id,
            EventKind::DelegationStarted,
            serde_json::json!({
                "request_id": request_id,
                "targets": delegation_plan.targets,
                "mode": delegation_plan.mode,
            }),
        );

        let reports = match delegation_plan.mode {
            DispatchMode::Parallel => {
                self.dispatch_parallel(session_id, user_message, &history, &delegation_plan, &cancel)
                    .await
            }
            DispatchMode::Sequential => {
                self.dispatch_sequential(session_id, user_message, &history, &delegation_plan, &cancel)
                    .await
            }
        };
        let reports = match reports {
            Ok(r) => r,
            Err(e) => return self.fail(session_id, request_id, e),
        };

        if cancel.is_cancelled() {
            return self.fail(session_id, request_id, OrchestrateError::Cancelled);
        }

        // Aggregating：领导者最后被调用，拿到全部专家产出或失败通告
        let synthesis = synthesize_task(user_message, &reports);
        match self
            .invoke_leader(session_id, &synthesis, &history, &cancel, Some(&reports))
            .await
        {
            Ok(LeaderResult::Answer(answer, tool_calls)) => {
                self.complete(request_id, session_id, answer, tool_calls, &cancel)
                    .await
            }
            Err(OrchestrateError::Cancelled) => {
                self.fail(session_id, request_id, OrchestrateError::Cancelled)
            }
            // 聚合期间的委派建议视为领导者失败（委派深度固定一层）
            Ok(LeaderResult::Delegate(_)) | Err(_) => {
                let successes: Vec<&SpecialistReport> =
                    reports.iter().filter(|r| r.result.is_ok()).collect();
                match successes.len() {
                    0 => self.fail(
                        session_id,
                        request_id,
                        OrchestrateError::AggregationFailure(
                            "no usable output from any agent".to_string(),
                        ),
                    ),
                    1 => {
                        let s = successes[0];
                        let answer = s.result.clone().unwrap();
                        let outcome = RequestOutcome {
                            request_id: request_id.to_string(),
                            session_id: session_id.to_string(),
                            answer: answer.clone(),
                            answered_by: s.agent_id.clone(),
                        };
                        self.finish(request_id, session_id, outcome, Vec::new(), &cancel)
                            .await
                    }
                    _ => {
                        // 多个成功产出且领导者不可用：带署名拼接，绝不静默丢弃
                        let answer = successes
                            .iter()
                            .map(|s| {
                                format!("[{}] {}", s.agent_id, s.result.clone().unwrap())
                            })
                            .collect::<Vec<_>>()
                            .join("\n\n");
                        let outcome = RequestOutcome {
                            request_id: request_id.to_string(),
                            session_id: session_id.to_string(),
                            answer,
                            answered_by: "specialists".to_string(),
                        };
                        self.finish(request_id, session_id, outcome, Vec::new(), &cancel)
                            .await
                    }
                }
            }
        }
    }

    /// 并行派发：每个专家一个任务，独立超时，按完成顺序收集，
    /// 全部落定才返回（扇入屏障）。取消时中止未完成任务并丢弃其结果。
    async fn dispatch_parallel(
        &self,
        session_id: &str,
        user_message: &str,
        history: &[Turn],
        delegation_plan: &DelegationPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<SpecialistReport>, OrchestrateError> {
        let mut pending = FuturesUnordered::new();
        let mut aborts = Vec::new();

        for target in &delegation_plan.targets {
            let profile = self
                .registry
                .get(target)
                .expect("plan targets are validated")
                .clone();
            let runtime = Arc::clone(&self.runtime);
            let bus = Arc::clone(&self.bus);
            let session_id = session_id.to_string();
            let task = plan::sub_prompt(&profile, user_message);
            let history = history.to_vec();
            let cancel = cancel.clone();
            let specialist_timeout = self.specialist_timeout();

            let agent_id = profile.id.clone();
            let handle = tokio::spawn(async move {
                run_specialist(
                    &runtime,
                    &profile,
                    &task,
                    &history,
                    &session_id,
                    &bus,
                    &cancel,
                    specialist_timeout,
                )
                .await
            });
            aborts.push(handle.abort_handle());
            pending.push(async move { (agent_id, handle.await) });
        }

        let mut reports = Vec::new();
        loop {
            // biased：取消与某个专家同时落定时，取消必须先被观测到，
            // 否则该专家的 Turn 会在 cancel 之后仍被追加
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    for h in &aborts {
                        h.abort();
                    }
                    return Err(OrchestrateError::Cancelled);
                }
                next = pending.next() => match next {
                    Some((agent_id, settled)) => {
                        let report = match settled {
                            Ok(report) => report,
                            // 专家任务 panic 也按该专家失败记录，不得无声丢弃
                            Err(join_err) => SpecialistReport {
                                agent_id: agent_id.clone(),
                                result: Err(OrchestrateError::SpecialistFailure {
                                    agent: agent_id,
                                    reason: format!("task failed: {}", join_err),
                                }),
                                tool_calls: Vec::new(),
                            },
                        };
                        self.record_report(session_id, &report).await;
                        reports.push(report);
                    }
                    None => break,
                },
            }
        }
        Ok(reports)
    }

    /// 顺序派发：按依赖序逐个执行，前序成功产出折入后续任务；失败同样隔离
    async fn dispatch_sequential(
        &self,
        session_id: &str,
        user_message: &str,
        history: &[Turn],
        delegation_plan: &DelegationPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<SpecialistReport>, OrchestrateError> {
        let mut reports: Vec<SpecialistReport> = Vec::new();

        for target in &delegation_plan.targets {
            if cancel.is_cancelled() {
                return Err(OrchestrateError::Cancelled);
            }
            let profile = self
                .registry
                .get(target)
                .expect("plan targets are validated")
                .clone();

            let mut task = plan::sub_prompt(&profile, user_message);
            let prior: Vec<String> = reports
                .iter()
                .filter_map(|r| {
                    r.result
                        .as_ref()
                        .ok()
                        .map(|out| format!("- {}: {}", r.agent_id, out))
                })
                .collect();
            if !prior.is_empty() {
                task.push_str("\n\nEarlier specialist findings:\n");
                task.push_str(&prior.join("\n"));
            }

            let report = run_specialist(
                &self.runtime,
                &profile,
                &task,
                history,
                session_id,
                &self.bus,
                cancel,
                self.specialist_timeout(),
            )
            .await;
            self.record_report(session_id, &report).await;
            reports.push(report);
        }
        Ok(reports)
    }

    /// 落定一个专家：发布 agent_result，成功产出按完成顺序追加 Turn
    async fn record_report(&self, session_id: &str, report: &SpecialistReport) {
        self.bus.publish(
            session_id,
            EventKind::AgentResult,
            serde_json::json!({
                "agent": report.agent_id,
                "ok": report.result.is_ok(),
                "detail": match &report.result {
                    Ok(out) => serde_json::json!({ "preview": preview(out) }),
                    Err(e) => serde_json::json!({ "kind": e.kind(), "reason": e.to_string() }),
                },
            }),
        );
        if let Ok(output) = &report.result {
            let draft = TurnDraft::agent(&report.agent_id, output)
                .with_tool_calls(report.tool_calls.clone());
            if let Err(e) = self.memory.sessions.append_turn(session_id, draft).await {
                tracing::warn!(agent = %report.agent_id, "failed to append specialist turn: {}", e);
            }
        }
    }

    /// 调用领导者：reports 为 None 时是直接应答/分诊，Some 时是聚合
    async fn invoke_leader(
        &self,
        session_id: &str,
        task: &str,
        history: &[Turn],
        cancel: &CancellationToken,
        reports: Option<&[SpecialistReport]>,
    ) -> Result<LeaderResult, OrchestrateError> {
        let leader = self.registry.leader();
        self.bus.publish(
            session_id,
            EventKind::AgentInvoked,
            serde_json::json!({
                "agent": leader.id,
                "phase": if reports.is_some() { "aggregation" } else { "triage" },
            }),
        );

        let ctx = self.runtime.compose_context(leader, task, history).await;
        let run = timeout(
            self.specialist_timeout(),
            self.runtime.run(leader, ctx, session_id, &self.bus, cancel),
        )
        .await
        .map_err(|_| OrchestrateError::GenerationFailed("leader timed out".to_string()))??;

        match run.outcome {
            AgentOutcome::FinalAnswer(answer) => Ok(LeaderResult::Answer(answer, run.tool_calls)),
            AgentOutcome::DelegationSuggested { targets, reason } => {
                tracing::info!(?targets, %reason, "leader suggested delegation");
                Ok(LeaderResult::Delegate(targets))
            }
            AgentOutcome::ToolCallRequested(req) => Err(OrchestrateError::GenerationFailed(
                format!("unconsumed tool call from leader: {}", req.tool),
            )),
        }
    }

    /// Completed：领导者聚合成功的收尾
    async fn complete(
        &self,
        request_id: &str,
        session_id: &str,
        answer: String,
        tool_calls: Vec<ToolCallRecord>,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome, OrchestrateError> {
        let outcome = RequestOutcome {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            answer,
            answered_by: self.registry.leader().id.clone(),
        };
        self.finish(request_id, session_id, outcome, tool_calls, cancel).await
    }

    /// 追加最终回答 Turn 并发布 aggregation_done；取消后到达的结果不落日志
    async fn finish(
        &self,
        request_id: &str,
        session_id: &str,
        outcome: RequestOutcome,
        tool_calls: Vec<ToolCallRecord>,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome, OrchestrateError> {
        if cancel.is_cancelled() {
            return self.fail(session_id, request_id, OrchestrateError::Cancelled);
        }
        let draft = TurnDraft::agent(&outcome.answered_by, &outcome.answer)
            .with_tool_calls(tool_calls);
        if let Err(e) = self.memory.sessions.append_turn(session_id, draft).await {
            return self.fail(session_id, request_id, e);
        }
        self.bus.publish(
            session_id,
            EventKind::AggregationDone,
            serde_json::json!({
                "request_id": request_id,
                "answered_by": outcome.answered_by,
            }),
        );
        Ok(outcome)
    }
}

enum LeaderResult {
    Answer(String, Vec<ToolCallRecord>),
    Delegate(Vec<String>),
}

/// 执行一个专家：发布 agent_invoked，施加独立超时，一切失败折为 SpecialistFailure
#[allow(clippy::too_many_arguments)]
async fn run_specialist(
    runtime: &AgentRuntime,
    profile: &AgentProfile,
    task: &str,
    history: &[Turn],
    session_id: &str,
    bus: &EventBus,
    cancel: &CancellationToken,
    specialist_timeout: Duration,
) -> SpecialistReport {
    bus.publish(
        session_id,
        EventKind::AgentInvoked,
        serde_json::json!({ "agent": profile.id, "phase": "specialist" }),
    );

    let ctx = runtime.compose_context(profile, task, history).await;
    let outcome = timeout(
        specialist_timeout,
        runtime.run(profile, ctx, session_id, bus, cancel),
    )
    .await;

    match outcome {
        Err(_) => SpecialistReport {
            agent_id: profile.id.clone(),
            result: Err(OrchestrateError::SpecialistFailure {
                agent: profile.id.clone(),
                reason: "timed out".to_string(),
            }),
            tool_calls: Vec::new(),
        },
        Ok(Err(e)) => SpecialistReport {
            agent_id: profile.id.clone(),
            result: Err(OrchestrateError::SpecialistFailure {
                agent: profile.id.clone(),
                reason: e.to_string(),
            }),
            tool_calls: Vec::new(),
        },
        Ok(Ok(run)) => {
            let result = match run.outcome {
                AgentOutcome::FinalAnswer(answer) => Ok(answer),
                other => Err(OrchestrateError::SpecialistFailure {
                    agent: profile.id.clone(),
                    reason: format!("unexpected outcome: {:?}", other),
                }),
            };
            SpecialistReport {
                agent_id: profile.id.clone(),
                result,
                tool_calls: run.tool_calls,
            }
        }
    }
}

/// 为聚合合成领导者任务：用户消息 + 每个专家的产出或失败通告
fn synthesize_task(user_message: &str, reports: &[SpecialistReport]) -> String {
    let mut task = format!(
        "User request: {}\n\n## Specialist input\n",
        user_message
    );
    for r in reports {
        match &r.result {
            Ok(out) => task.push_str(&format!("### {} (ok)\n{}\n\n", r.agent_id, out)),
            Err(e) => task.push_str(&format!(
                "### {} (unavailable)\n{}\n\n",
                r.agent_id, e
            )),
        }
    }
    task.push_str("Synthesize the specialist input into one final answer for the user.");
    task
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::executive_team;
    use crate::config::GatewaySection;
    use crate::llm::{PromptContext, ScriptedGenerator, TextGenerator};
    use crate::tools::ToolGateway;
    use async_trait::async_trait;

    struct PanickingGenerator;

    #[async_trait]
    impl TextGenerator for PanickingGenerator {
        async fn generate(&self, _ctx: &PromptContext) -> Result<String, String> {
            panic!("generator blew up");
        }
    }

    fn router(generator: Arc<dyn TextGenerator>) -> DelegationRouter {
        let memory = Arc::new(MemoryStore::in_memory());
        let runtime = Arc::new(AgentRuntime::new(
            generator,
            Arc::new(ToolGateway::new(&GatewaySection::default())),
            Arc::clone(&memory),
            4,
        ));
        DelegationRouter::new(
            Arc::new(executive_team()),
            runtime,
            memory,
            Arc::new(EventBus::new(64)),
            Arc::new(KeywordPolicy),
            RouterSection::default(),
        )
    }

    #[tokio::test]
    async fn test_cancelled_token_wins_over_settled_specialist() {
        let r = router(Arc::new(ScriptedGenerator::new(["Instant answer."])));
        r.memory.sessions.open_session("s1").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        // 专家瞬时落定也不得被记录：取消分支必须先被观测到
        let delegation_plan = plan::build_plan(&["cfo".to_string()], &r.registry);
        let err = r
            .dispatch_parallel("s1", "revenue", &[], &delegation_plan, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::Cancelled));
        assert!(r.memory.sessions.turns("s1").await.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_specialist_is_reported_unavailable() {
        let r = router(Arc::new(PanickingGenerator));
        r.memory.sessions.open_session("s1").await;

        let delegation_plan = plan::build_plan(&["cfo".to_string()], &r.registry);
        let reports = r
            .dispatch_parallel("s1", "revenue", &[], &delegation_plan, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].agent_id, "cfo");
        assert!(matches!(
            reports[0].result,
            Err(OrchestrateError::SpecialistFailure { .. })
        ));

        let results: Vec<_> = r
            .bus
            .subscribe("s1", 0)
            .drain()
            .into_iter()
            .filter(|e| e.kind == EventKind::AgentResult)
            .collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload["ok"], false);
    }
}
