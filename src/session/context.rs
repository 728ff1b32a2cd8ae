//! 编排会话上下文：一次用户交互（可能多轮 plan/execute/evaluate）内的全部状态

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::SharedData;
use crate::executor::{ExecutionResult, StepExecutionResult};
use crate::orchestrator::{CompletionReason, Evaluation};

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationContext {
    pub session_id: String,
    pub original_request: String,
    /// 全部轮次的步骤结果（只追加）
    pub history: Vec<StepExecutionResult>,
    pub shared_data: SharedData,
    /// 首个计划的 target 列表，用于「计划动作全部成功」判定
    pub planned_actions: Vec<String>,
    pub iterations: usize,
    /// continue_session 追加的用户输入
    pub additional_inputs: Vec<String>,
    /// 因需要用户补充信息而暂停
    pub awaiting_input: bool,
    pub completion_reason: Option<CompletionReason>,
    pub last_evaluation: Option<Evaluation>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_active: DateTime<Utc>,
    is_completed: bool,
}

impl OrchestrationContext {
    pub fn new(session_id: impl Into<String>, request: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            original_request: request.into(),
            history: Vec::new(),
            shared_data: SharedData::new(),
            planned_actions: Vec::new(),
            iterations: 0,
            additional_inputs: Vec::new(),
            awaiting_input: false,
            completion_reason: None,
            last_evaluation: None,
            started_at: now,
            completed_at: None,
            last_active: now,
            is_completed: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// 标记完成；只生效一次，之后的调用不改变原因和时间
    pub fn mark_completed(&mut self, reason: CompletionReason) {
        if self.is_completed {
            return;
        }
        self.is_completed = true;
        self.awaiting_input = false;
        self.completion_reason = Some(reason);
        self.completed_at = Some(Utc::now());
    }

    /// 追加本轮结果
    pub fn record(&mut self, execution: &ExecutionResult) {
        self.history.extend(execution.steps.iter().cloned());
        self.touch();
    }

    pub fn add_input(&mut self, input: impl Into<String>) {
        self.additional_inputs.push(input.into());
        self.awaiting_input = false;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    /// 最新一步的输出（失败步骤取错误文本）
    pub fn latest_output(&self) -> Option<&str> {
        self.history.last().map(|s| {
            if s.success {
                s.output.as_str()
            } else {
                s.error.as_deref().unwrap_or_default()
            }
        })
    }

    /// 已使用的最大步骤编号，下一轮从它之后继续编号
    pub fn last_step_number(&self) -> usize {
        self.history.iter().map(|s| s.step_number).max().unwrap_or(0)
    }

    /// 历史摘要（提供给 Planner）
    pub fn history_summary(&self) -> String {
        self.history
            .iter()
            .map(|s| {
                let outcome = if s.success {
                    format!("ok: {}", truncate(&s.output, 200))
                } else {
                    format!("failed: {}", s.error.as_deref().unwrap_or("unknown error"))
                };
                format!("#{} {} [{}] {}", s.step_number, s.step_id, s.target, outcome)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
