//! 计划类型定义
//!
//! Plan 由上游 Planner 产生，构建后不可变：字段私有，只读访问；校验规则见 Plan::validate。

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StepId = String;

/// 计划中的单个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskStep {
    /// 步骤 ID（计划内唯一）
    pub id: StepId,
    /// 目标名：工具名或 LLM 函数角色名
    pub target: String,
    #[serde(default)]
    pub description: String,
    /// 原始参数文本，可含 {{变量}} 占位符
    #[serde(default)]
    pub parameters: String,
    /// 成功后输出写入 SharedData 的变量名
    #[serde(default)]
    pub output_variable: Option<String>,
    /// 依赖的步骤 ID（必须是计划中更早的步骤）
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub cost_estimate: Option<f64>,
    /// 主目标失败时改用的目标名（只尝试一次）
    #[serde(default)]
    pub fallback: Option<String>,
}

impl TaskStep {
    pub fn new(id: impl Into<StepId>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            description: String::new(),
            parameters: String::new(),
            output_variable: None,
            depends_on: Vec::new(),
            cost_estimate: None,
            fallback: None,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn parameters(mut self, params: impl Into<String>) -> Self {
        self.parameters = params.into();
        self
    }

    pub fn output(mut self, variable: impl Into<String>) -> Self {
        self.output_variable = Some(variable.into());
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn cost(mut self, estimate: f64) -> Self {
        self.cost_estimate = Some(estimate);
        self
    }

    pub fn fallback(mut self, target: impl Into<String>) -> Self {
        self.fallback = Some(target.into());
        self
    }
}

/// 不可变的有序步骤列表 + 元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    #[serde(default = "new_plan_id")]
    id: String,
    /// 计划要达成的目标（通常是用户请求的复述）
    #[serde(default)]
    goal: String,
    steps: Vec<TaskStep>,
    /// 创建时间（毫秒时间戳）
    #[serde(default = "now_millis")]
    created_at: i64,
}

fn new_plan_id() -> String {
    format!("plan_{}", uuid::Uuid::new_v4())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        Self {
            id: new_plan_id(),
            goal: goal.into(),
            steps,
            created_at: now_millis(),
        }
    }

    pub fn empty(goal: impl Into<String>) -> Self {
        Self::new(goal, Vec::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn steps(&self) -> &[TaskStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// 所有步骤的目标名（按声明顺序）
    pub fn targets(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.target.clone()).collect()
    }

    pub fn total_cost_estimate(&self) -> Option<f64> {
        let costs: Vec<f64> = self.steps.iter().filter_map(|s| s.cost_estimate).collect();
        if costs.is_empty() {
            None
        } else {
            Some(costs.iter().sum())
        }
    }

    /// 执行前校验：ID 唯一、target 非空、依赖只能指向更早声明的步骤
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(PlanError::EmptyStepId);
            }
            if step.target.trim().is_empty() {
                return Err(PlanError::EmptyTarget(step.id.clone()));
            }
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(PlanError::SelfDependency(step.id.clone()));
                }
                if !seen.contains(dep.as_str()) {
                    let exists_later = self.steps.iter().any(|s| &s.id == dep);
                    return Err(if exists_later {
                        PlanError::ForwardDependency {
                            step: step.id.clone(),
                            dependency: dep.clone(),
                        }
                    } else {
                        PlanError::UnknownDependency {
                            step: step.id.clone(),
                            dependency: dep.clone(),
                        }
                    });
                }
            }
            if !seen.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
        }
        Ok(())
    }
}

/// 计划校验错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Step id must not be empty")]
    EmptyStepId,
    #[error("Step {0} has an empty target")]
    EmptyTarget(StepId),
    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),
    #[error("Step {0} depends on itself")]
    SelfDependency(StepId),
    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },
    #[error("Step {step} depends on later step {dependency}")]
    ForwardDependency { step: StepId, dependency: StepId },
}
