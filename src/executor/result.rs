//! 执行结果：单步结果、整份计划的汇总结果

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::ErrorKind;
use crate::plan::StepId;

/// 单步执行结果（产生后不再修改）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    /// 会话内编号（从 1 开始）：本轮起点 + 步骤在计划中的声明位置
    pub step_number: usize,
    pub step_id: StepId,
    pub description: String,
    pub target: String,
    /// 实际使用的参数（处理后）
    pub parameters: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub output_variable: Option<String>,
}

impl StepExecutionResult {
    pub fn is_failure(&self) -> bool {
        !self.success
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// 整份计划的执行结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub steps: Vec<StepExecutionResult>,
    pub status: ExecutionStatus,
    pub summary: String,
    #[serde(with = "duration_ms")]
    pub total_duration: Duration,
    /// 因依赖失败而未执行的步骤
    pub blocked: Vec<StepId>,
    pub cancelled: bool,
}

impl ExecutionResult {
    /// 计划无法开始（校验失败等）
    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            status: ExecutionStatus::Failed,
            summary: summary.into(),
            total_duration: Duration::ZERO,
            blocked: Vec::new(),
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn succeeded(&self) -> usize {
        self.steps.iter().filter(|s| s.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps.iter().filter(|s| !s.success).count()
    }

    /// 最后一个成功步骤的输出
    pub fn last_output(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.success)
            .map(|s| s.output.as_str())
    }
}

/// 汇总状态：全部成功为 Success；至少一个成功且有失败/阻塞/未执行为 PartialSuccess；否则 Failed
pub fn aggregate_status(planned: usize, steps: &[StepExecutionResult]) -> ExecutionStatus {
    let succeeded = steps.iter().filter(|s| s.success).count();
    if planned > 0 && succeeded == planned {
        ExecutionStatus::Success
    } else if succeeded > 0 {
        ExecutionStatus::PartialSuccess
    } else {
        ExecutionStatus::Failed
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
