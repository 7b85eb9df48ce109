//! 文本生成能力抽象
//!
//! 核心只依赖 TextGenerator（给定提示上下文，产出文本），不窥探实现内部；
//! parse_generation 从模型文本中提取结构化输出（Tool Call / 委派建议 / 直接回复）。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::OrchestrateError;
use crate::tools::ToolCallRequest;

/// 提示上下文中的消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextRole {
    User,
    Assistant,
    System,
}

/// 提示上下文中的单条消息
#[derive(Clone, Debug)]
pub struct ContextMessage {
    pub role: ContextRole,
    pub content: String,
}

impl ContextMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ContextRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ContextRole::Assistant,
            content: content.into(),
        }
    }
}

/// 一次生成调用的完整输入：system 指令 + 对话消息
#[derive(Clone, Debug, Default)]
pub struct PromptContext {
    pub system: String,
    pub messages: Vec<ContextMessage>,
}

impl PromptContext {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, msg: ContextMessage) {
        self.messages.push(msg);
    }
}

/// 文本生成 trait：给定上下文产出文本，Err 为人类可读的失败原因
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, ctx: &PromptContext) -> Result<String, String>;
}

/// 模型输出中的委派建议（简化 JSON：{"delegate": ["cfo"], "reason": "..."}）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DelegateDirective {
    delegate: Vec<String>,
    #[serde(default)]
    reason: String,
}

/// 结构化生成结果
#[derive(Debug, Clone)]
pub enum Generation {
    /// 直接回复用户
    Text(String),
    /// 需要执行工具
    ToolCall(ToolCallRequest),
    /// 建议委派给其它智能体（仅领导者可产出）
    Delegate { targets: Vec<String>, reason: String },
}

/// 解析模型输出：含有效 JSON 且 tool 非空则为 ToolCall，含 delegate 数组则为委派建议，
/// 否则按原文作为直接回复。JSON 可以是 ```json 代码块或内联对象。
pub fn parse_generation(output: &str) -> Result<Generation, OrchestrateError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or_else(|| rest.trim())
    } else if let Some(start) = trimmed.find('{') {
        match trimmed.rfind('}') {
            Some(end) => &trimmed[start..=end],
            None => trimmed,
        }
    } else {
        return Ok(Generation::Text(trimmed.to_string()));
    };

    if let Ok(directive) = serde_json::from_str::<DelegateDirective>(json_str) {
        if !directive.delegate.is_empty() {
            return Ok(Generation::Delegate {
                targets: directive.delegate,
                reason: directive.reason,
            });
        }
    }

    if let Ok(call) = serde_json::from_str::<ToolCallRequest>(json_str) {
        if !call.tool.is_empty() {
            return Ok(Generation::ToolCall(call));
        }
    }

    Ok(Generation::Text(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text() {
        let g = parse_generation("Revenue grew 12% quarter over quarter.").unwrap();
        assert!(matches!(g, Generation::Text(t) if t.contains("12%")));
    }

    #[test]
    fn test_parse_tool_call() {
        let g = parse_generation(r#"{"tool": "crm_lookup", "args": {"account": "acme"}}"#)
            .unwrap();
        match g {
            Generation::ToolCall(call) => {
                assert_eq!(call.tool, "crm_lookup");
                assert_eq!(call.args["account"], "acme");
            }
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_fenced_tool_call() {
        let out = "Let me check.\n```json\n{\"tool\": \"echo\", \"args\": {}}\n```";
        let g = parse_generation(out).unwrap();
        assert!(matches!(g, Generation::ToolCall(c) if c.tool == "echo"));
    }

    #[test]
    fn test_parse_delegate() {
        let g = parse_generation(r#"{"delegate": ["cfo", "cto"], "reason": "needs both"}"#)
            .unwrap();
        match g {
            Generation::Delegate { targets, reason } => {
                assert_eq!(targets, vec!["cfo", "cto"]);
                assert_eq!(reason, "needs both");
            }
            other => panic!("expected delegate, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_json_falls_back_to_text() {
        let g = parse_generation("the ratio is {0.8} roughly").unwrap();
        assert!(matches!(g, Generation::Text(_)));
    }
}
