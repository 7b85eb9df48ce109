//! 请求分类策略
//!
//! 策略是可插拔 trait：输入请求文本与会话历史，输出按匹配度排序的专家候选。
//! 默认实现 KeywordPolicy 对档案关键词做小写子串计分；
//! 无候选不是错误，Router 会把领导者作为永久兜底。

use crate::agents::AgentRegistry;
use crate::memory::Turn;

/// 可插拔的请求分类策略
pub trait ClassificationPolicy: Send + Sync {
    /// 返回按匹配度降序的专家 ID；空表示交由领导者直接处理
    fn classify(&self, text: &str, history: &[Turn], registry: &AgentRegistry) -> Vec<String>;
}

/// 默认策略：档案关键词的小写子串匹配计分
#[derive(Default)]
pub struct KeywordPolicy;

impl ClassificationPolicy for KeywordPolicy {
    fn classify(&self, text: &str, _history: &[Turn], registry: &AgentRegistry) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut scored: Vec<(usize, &str)> = registry
            .specialists()
            .iter()
            .filter_map(|p| {
                let hits = p
                    .keywords
                    .iter()
                    .filter(|kw| lowered.contains(kw.as_str()))
                    .count();
                (hits > 0).then_some((hits, p.id.as_str()))
            })
            .collect();
        // 注册顺序作稳定次序，分数只决定相对先后
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, id)| id.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::executive_team;

    #[test]
    fn test_single_keyword_routes_to_one_specialist() {
        let team = executive_team();
        let targets = KeywordPolicy.classify("What is our quarterly revenue?", &[], &team);
        assert_eq!(targets, vec!["cfo"]);
    }

    #[test]
    fn test_multiple_domains_route_to_multiple_specialists() {
        let team = executive_team();
        let targets = KeywordPolicy.classify(
            "Review the security architecture and its budget impact",
            &[],
            &team,
        );
        assert!(targets.contains(&"cto".to_string()));
        assert!(targets.contains(&"cfo".to_string()));
        // CTO 命中两个关键词，应排在前面
        assert_eq!(targets[0], "cto");
    }

    #[test]
    fn test_no_match_yields_empty_candidates() {
        let team = executive_team();
        assert!(KeywordPolicy.classify("Good morning!", &[], &team).is_empty());
    }
}
