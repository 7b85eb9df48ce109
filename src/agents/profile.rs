//! 智能体档案与注册表
//!
//! AgentProfile 是静态描述符：身份、角色、指令、关键词（供默认分类策略）、
//! 允许的工具集、委派资格与数据依赖。注册表在启动期构建一次，之后不可变，
//! 以显式参数传入 Router，而非进程级全局状态。

use std::collections::HashMap;

use crate::core::OrchestrateError;

/// 静态智能体描述符（注册后不可变）
#[derive(Clone, Debug)]
pub struct AgentProfile {
    pub id: String,
    pub role_label: String,
    /// 该智能体的 system 指令
    pub instructions: String,
    /// 默认关键词分类策略的匹配词
    pub keywords: Vec<String>,
    /// 允许调用的工具名集合；空表示无工具
    pub allowed_tools: Vec<String>,
    /// 是否领导者（有权分类、委派与聚合）
    pub is_leader: bool,
    /// 声明依赖的兄弟智能体产出（非空时同批委派退化为顺序执行）
    pub depends_on: Vec<String>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, role_label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role_label: role_label.into(),
            instructions: String::new(),
            keywords: Vec::new(),
            allowed_tools: Vec::new(),
            is_leader: false,
            depends_on: Vec::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.allowed_tools = tools.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn leader(mut self) -> Self {
        self.is_leader = true;
        self
    }
}

/// 进程级注册表：恰好一名领导者 + 若干专家，启动时加载一次
pub struct AgentRegistry {
    leader: AgentProfile,
    specialists: Vec<AgentProfile>,
    by_id: HashMap<String, usize>,
}

impl AgentRegistry {
    /// 构建注册表：校验领导者标记与 ID 唯一性
    pub fn new(
        leader: AgentProfile,
        specialists: Vec<AgentProfile>,
    ) -> Result<Self, OrchestrateError> {
        if !leader.is_leader {
            return Err(OrchestrateError::ConfigError(format!(
                "agent {} is not marked as leader",
                leader.id
            )));
        }
        let mut by_id = HashMap::new();
        for (i, s) in specialists.iter().enumerate() {
            if s.is_leader {
                return Err(OrchestrateError::ConfigError(format!(
                    "specialist {} must not be a leader",
                    s.id
                )));
            }
            if s.id == leader.id || by_id.insert(s.id.clone(), i).is_some() {
                return Err(OrchestrateError::ConfigError(format!(
                    "duplicate agent id: {}",
                    s.id
                )));
            }
        }
        Ok(Self {
            leader,
            specialists,
            by_id,
        })
    }

    pub fn leader(&self) -> &AgentProfile {
        &self.leader
    }

    pub fn specialists(&self) -> &[AgentProfile] {
        &self.specialists
    }

    pub fn get(&self, id: &str) -> Option<&AgentProfile> {
        if id == self.leader.id {
            return Some(&self.leader);
        }
        self.by_id.get(id).map(|&i| &self.specialists[i])
    }
}

/// 预置的行政团队：CEO 领导，CFO / COO / CTO 为专家
pub fn executive_team() -> AgentRegistry {
    let ceo = AgentProfile::new("ceo", "Chief Executive Officer")
        .with_instructions(
            "You are the CEO of a corporate organization. Coordinate the CFO \
             (finance), COO (operations) and CTO (technology). Synthesize each \
             executive's input, attribute perspectives clearly, highlight \
             agreements and disagreements, and give one unified recommendation \
             with action items.",
        )
        .leader();

    let cfo = AgentProfile::new("cfo", "Chief Financial Officer")
        .with_instructions(
            "You are the CFO. Handle budgets, costs, revenue, profitability, \
             investments, quotations and invoicing. Ground answers in CRM data \
             when tools are available.",
        )
        .with_keywords(&[
            "budget", "cost", "revenue", "profit", "invoice", "quotation", "roi",
            "investment", "finance",
        ])
        .with_tools(&["erp_customers", "erp_invoices"]);

    let coo = AgentProfile::new("coo", "Chief Operating Officer")
        .with_instructions(
            "You are the COO. Handle project status, timelines, resource \
             allocation, process improvements, team capacity and operational \
             blockers.",
        )
        .with_keywords(&[
            "project", "timeline", "resource", "process", "capacity", "operations",
            "blocker", "allocation",
        ])
        .with_tools(&["erp_projects", "gitea_issues"]);

    let cto = AgentProfile::new("cto", "Chief Technology Officer")
        .with_instructions(
            "You are the CTO. Handle technical architecture, code reviews, pull \
             requests, technology evaluations, development estimates and \
             security concerns.",
        )
        .with_keywords(&[
            "architecture", "code", "technology", "security", "development",
            "review", "pull request", "estimate",
        ])
        .with_tools(&["gitea_pulls", "gitea_repos"]);

    AgentRegistry::new(ceo, vec![cfo, coo, cto]).expect("static team is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_rejects_unmarked_leader() {
        let not_leader = AgentProfile::new("ceo", "CEO");
        assert!(AgentRegistry::new(not_leader, vec![]).is_err());
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let leader = AgentProfile::new("ceo", "CEO").leader();
        let a = AgentProfile::new("cfo", "CFO");
        let b = AgentProfile::new("cfo", "CFO again");
        assert!(AgentRegistry::new(leader, vec![a, b]).is_err());
    }

    #[test]
    fn test_executive_team_lookup() {
        let team = executive_team();
        assert_eq!(team.leader().id, "ceo");
        assert_eq!(team.specialists().len(), 3);
        assert!(team.get("cto").unwrap().keywords.contains(&"security".to_string()));
        assert!(team.get("nobody").is_none());
    }
}
