//! 委派计划
//!
//! 由候选专家构建 DelegationPlan：默认并行扇出；当任一目标声明依赖
//! 同批其他目标的产出（depends_on 相交）时退化为顺序执行，且依赖方在后。

use serde::Serialize;

use crate::agents::{AgentProfile, AgentRegistry};

/// 派发方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Parallel,
    Sequential,
}

/// 一次委派的执行计划
#[derive(Debug)]
pub struct DelegationPlan {
    pub targets: Vec<String>,
    pub mode: DispatchMode,
}

/// 由候选构建计划；candidates 必须已在注册表中校验过
pub fn build_plan(candidates: &[String], registry: &AgentRegistry) -> DelegationPlan {
    let in_batch = |id: &str| candidates.iter().any(|c| c == id);
    let has_dependency = candidates.iter().any(|id| {
        registry
            .get(id)
            .map(|p| p.depends_on.iter().any(|d| in_batch(d)))
            .unwrap_or(false)
    });

    if !has_dependency {
        return DelegationPlan {
            targets: candidates.to_vec(),
            mode: DispatchMode::Parallel,
        };
    }

    // 依赖先行的稳定排序：无依赖者保持原序在前，依赖方挪到其依赖之后
    let mut ordered: Vec<String> = Vec::with_capacity(candidates.len());
    let mut pending: Vec<&String> = candidates.iter().collect();
    while !pending.is_empty() {
        let ready: Vec<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, id)| {
                registry
                    .get(id)
                    .map(|p| {
                        p.depends_on
                            .iter()
                            .all(|d| !in_batch(d) || ordered.iter().any(|o| o == d))
                    })
                    .unwrap_or(true)
            })
            .map(|(i, _)| i)
            .collect();
        if ready.is_empty() {
            // 依赖成环时放弃排序，按原序执行
            ordered.extend(pending.iter().map(|s| s.to_string()));
            break;
        }
        for i in ready.iter() {
            ordered.push(pending[*i].clone());
        }
        for i in ready.into_iter().rev() {
            pending.remove(i);
        }
    }

    DelegationPlan {
        targets: ordered,
        mode: DispatchMode::Sequential,
    }
}

/// 为目标专家生成子任务提示：角色框定 + 原始请求
pub fn sub_prompt(profile: &AgentProfile, user_message: &str) -> String {
    format!(
        "As {}, address the following request from your own domain:\n\n{}",
        profile.role_label, user_message
    )
}
