//! 完成判定：只读检查会话上下文，决定编排循环是否停止

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::session::OrchestrationContext;

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// 已被显式标记完成
    Explicit,
    /// 历史步数达到上限（防失控）
    RunawayGuard,
    /// 首个计划中的每个动作都有成功记录
    AllActionsSucceeded,
    /// 最新输出请求用户补充信息（会话保持打开）
    NeedsUserInput,
    /// 最近若干步大多失败
    Stuck,
    /// Planner 返回空计划
    EmptyPlan,
    /// 达到最大迭代轮数
    IterationLimit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionConfig {
    pub max_steps: usize,
    pub stuck_window: usize,
    pub stuck_failures: usize,
    pub clarification_markers: Vec<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            stuck_window: 3,
            stuck_failures: 2,
            clarification_markers: vec![
                "need more information".to_string(),
                "please clarify".to_string(),
                "user input required".to_string(),
                "clarification needed".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionChecker {
    config: CompletionConfig,
}

impl CompletionChecker {
    pub fn new(config: CompletionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    pub fn is_complete(&self, context: &OrchestrationContext) -> bool {
        self.evaluate(context).is_some()
    }

    /// 按优先级返回第一个满足的停止原因
    pub fn evaluate(&self, context: &OrchestrationContext) -> Option<CompletionReason> {
        if context.is_completed() {
            return Some(CompletionReason::Explicit);
        }
        if context.history.len() >= self.config.max_steps {
            return Some(CompletionReason::RunawayGuard);
        }
        if all_actions_succeeded(context) {
            return Some(CompletionReason::AllActionsSucceeded);
        }
        if self.needs_user_input(context) {
            return Some(CompletionReason::NeedsUserInput);
        }
        if self.is_stuck(context) {
            return Some(CompletionReason::Stuck);
        }
        None
    }

    fn needs_user_input(&self, context: &OrchestrationContext) -> bool {
        let Some(output) = context.latest_output() else {
            return false;
        };
        let output = output.to_lowercase();
        self.config
            .clarification_markers
            .iter()
            .any(|m| !m.is_empty() && output.contains(&m.to_lowercase()))
    }

    fn is_stuck(&self, context: &OrchestrationContext) -> bool {
        if self.config.stuck_failures == 0 || self.config.stuck_window == 0 {
            return false;
        }
        let failures = context
            .history
            .iter()
            .rev()
            .take(self.config.stuck_window)
            .filter(|s| !s.success)
            .count();
        failures >= self.config.stuck_failures
    }
}

/// 按 target 计数：每个计划动作都要有对应数量的成功记录
fn all_actions_succeeded(context: &OrchestrationContext) -> bool {
    if context.planned_actions.is_empty() {
        return false;
    }
    let mut needed: HashMap<&str, usize> = HashMap::new();
    for action in &context.planned_actions {
        *needed.entry(action.as_str()).or_default() += 1;
    }
    let mut succeeded: HashMap<&str, usize> = HashMap::new();
    for step in context.history.iter().filter(|s| s.success) {
        *succeeded.entry(step.target.as_str()).or_default() += 1;
    }
    needed
        .iter()
        .all(|(target, count)| succeeded.get(target).copied().unwrap_or(0) >= *count)
}
