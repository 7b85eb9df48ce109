//! Mock 生成器（用于测试，无需 API）
//!
//! MockGenerator 回显最后一条 User 消息；ScriptedGenerator 按预置脚本逐条出队，
//! 便于在测试中精确控制每次生成的输出（Tool Call / 委派 / 回复）。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ContextRole, PromptContext, TextGenerator};

/// Mock 生成器：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockGenerator;

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, ctx: &PromptContext) -> Result<String, String> {
        let last_user = ctx
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ContextRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }
}

/// 脚本化生成器：每次 generate 弹出一条预置输出，脚本耗尽后返回 Err
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, String>>>,
}

impl ScriptedGenerator {
    pub fn new(replies: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|s| Ok(s.to_string())).collect()),
        }
    }

    /// 追加一条成功输出
    pub fn push_ok(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
    }

    /// 追加一条失败（模拟生成后端故障）
    pub fn push_err(&self, reason: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Err(reason.into()));
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, _ctx: &PromptContext) -> Result<String, String> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err("script exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ContextMessage;

    #[tokio::test]
    async fn test_mock_echoes_last_user_message() {
        let gen = MockGenerator;
        let mut ctx = PromptContext::new("system");
        ctx.push(ContextMessage::user("hello"));
        ctx.push(ContextMessage::assistant("hi"));
        ctx.push(ContextMessage::user("quarterly revenue"));
        let out = gen.generate(&ctx).await.unwrap();
        assert!(out.contains("quarterly revenue"));
    }

    #[tokio::test]
    async fn test_scripted_replays_in_order_then_errs() {
        let gen = ScriptedGenerator::new(["one", "two"]);
        let ctx = PromptContext::default();
        assert_eq!(gen.generate(&ctx).await.unwrap(), "one");
        assert_eq!(gen.generate(&ctx).await.unwrap(), "two");
        assert!(gen.generate(&ctx).await.is_err());
    }
}
