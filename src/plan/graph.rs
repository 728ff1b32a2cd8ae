//! 计划依赖图
//!
//! 使用邻接表（步骤 -> 依赖它的步骤）与依赖表实现就绪判定和失败阻断传播。
//! 图只能从通过校验的 Plan 构建，因此依赖总是指向更早的步骤，不存在环。

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::plan::{Plan, PlanError};

/// 步骤执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// 等待依赖满足
    Pending,
    /// 正在执行
    Running,
    Succeeded,
    Failed,
    /// 上游失败，永不执行
    Blocked,
}

impl StepState {
    /// 是否已有结果（成功或失败）
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Blocked)
    }
}

/// 按声明下标组织的依赖图
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// 下标 -> 它依赖的步骤下标
    dependencies: Vec<Vec<usize>>,
    /// 下标 -> 依赖它的步骤下标
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new(plan: &Plan) -> Result<Self, PlanError> {
        plan.validate()?;

        let index: HashMap<&str, usize> = plan
            .steps()
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); plan.len()];
        let mut dependents = vec![Vec::new(); plan.len()];
        for (i, step) in plan.steps().iter().enumerate() {
            for dep in &step.depends_on {
                // validate 已保证依赖存在
                if let Some(&d) = index.get(dep.as_str()) {
                    if !dependencies[i].contains(&d) {
                        dependencies[i].push(d);
                        dependents[d].push(i);
                    }
                }
            }
        }

        Ok(Self {
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn dependencies(&self, step: usize) -> &[usize] {
        &self.dependencies[step]
    }

    pub fn dependents(&self, step: usize) -> &[usize] {
        &self.dependents[step]
    }

    /// 可执行的步骤：Pending 且所有依赖都成功，按声明顺序返回
    pub fn ready(&self, states: &[StepState]) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| {
                states[i] == StepState::Pending
                    && self.dependencies[i]
                        .iter()
                        .all(|&d| states[d] == StepState::Succeeded)
            })
            .collect()
    }

    /// 依赖中是否有失败或被阻断的步骤
    pub fn is_blocked(&self, step: usize, states: &[StepState]) -> bool {
        self.dependencies[step]
            .iter()
            .any(|&d| matches!(states[d], StepState::Failed | StepState::Blocked))
    }

    /// 从失败步骤出发，将所有仍在等待的下游标记为 Blocked，返回新阻断的下标（升序）
    pub fn block_dependents(&self, failed: usize, states: &mut [StepState]) -> Vec<usize> {
        let mut blocked = Vec::new();
        let mut queue: VecDeque<usize> = self.dependents[failed].iter().copied().collect();
        while let Some(i) = queue.pop_front() {
            if states[i] == StepState::Pending {
                states[i] = StepState::Blocked;
                blocked.push(i);
                queue.extend(self.dependents[i].iter().copied());
            }
        }
        blocked.sort_unstable();
        blocked
    }
}
