//! 编排错误类型
//!
//! 步骤级错误（NotFound / Parameter / Execution / Timeout / CircuitOpen）在 StepExecutor 边界被捕获并转为失败的
//! StepExecutionResult；Cancelled 终止 PlanExecutor 循环；只有会话查找与配置类错误会从公开 API 以 Err 返回。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    /// 目标名既不是已注册工具，也不是已注册的 LLM 函数
    #[error("Executable not found: {0}")]
    NotFound(String),

    /// 占位符未解析 / 参数生成失败 / 与 schema 不符
    #[error("Parameter error: {0}")]
    Parameter(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// 熔断器打开，调用未被尝试
    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 会话已完成（完成标志单调，不能重新打开）
    #[error("Session already completed: {0}")]
    SessionCompleted(String),

    /// 同一会话已有循环在运行
    #[error("Session is already running: {0}")]
    SessionBusy(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl OrchestrationError {
    /// 是否值得重试：熔断拒绝、取消以及解析/参数类错误重试也不会改变结果
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Timeout(_))
    }

    /// 是否计入熔断器的失败次数
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Timeout(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Parameter(_) => ErrorKind::Parameter,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidPlan(_) => ErrorKind::InvalidPlan,
            Self::SessionNotFound(_)
            | Self::SessionCompleted(_)
            | Self::SessionBusy(_)
            | Self::Config(_) => ErrorKind::Execution,
        }
    }
}

/// 写入 StepExecutionResult 的错误分类（数据形式，可序列化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Parameter,
    Execution,
    Timeout,
    CircuitOpen,
    Cancelled,
    InvalidPlan,
}
