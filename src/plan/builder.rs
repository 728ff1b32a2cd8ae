//! 计划构建器
//!
//! 提供流畅的 API 构建 Plan（上游 Planner 或测试使用），build 时统一校验

use crate::plan::{Plan, PlanError, StepId, TaskStep};

/// 计划构建器
pub struct PlanBuilder {
    goal: String,
    steps: Vec<TaskStep>,
}

impl PlanBuilder {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            steps: Vec::new(),
        }
    }

    /// 添加步骤；id 为空时自动编号为 step{n}
    pub fn step(mut self, mut step: TaskStep) -> Self {
        if step.id.trim().is_empty() {
            step.id = format!("step{}", self.steps.len() + 1);
        }
        self.steps.push(step);
        self
    }

    /// 添加一组互不依赖的步骤（可被并行执行模式同时调度）
    pub fn parallel(mut self, steps: Vec<TaskStep>) -> Self {
        for step in steps {
            self = self.step(step);
        }
        self
    }

    /// 设置顺序依赖：to 在 from 之后执行
    pub fn sequential(mut self, from: impl Into<StepId>, to: impl Into<StepId>) -> Self {
        let from = from.into();
        let to = to.into();
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == to) {
            if !step.depends_on.contains(&from) {
                step.depends_on.push(from);
            }
        }
        self
    }

    /// 设置 AND 依赖：所有前置步骤都有结果后才执行
    pub fn depends_on_all(mut self, step_id: impl Into<StepId>, deps: Vec<StepId>) -> Self {
        let id = step_id.into();
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == id) {
            for dep in deps {
                if !step.depends_on.contains(&dep) {
                    step.depends_on.push(dep);
                }
            }
        }
        self
    }

    /// 设置失败备用目标
    pub fn with_fallback(mut self, step_id: impl Into<StepId>, target: impl Into<String>) -> Self {
        let id = step_id.into();
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == id) {
            step.fallback = Some(target.into());
        }
        self
    }

    /// 构建并校验计划
    pub fn build(self) -> Result<Plan, PlanError> {
        let plan = Plan::new(self.goal, self.steps);
        plan.validate()?;
        Ok(plan)
    }
}
