//! 计划执行层
//!
//! - **resolver**：target 名 → 工具 / LLM 函数
//! - **parameters**：占位符替换、参数自动生成、required 校验
//! - **step**：单步执行（弹性策略、流式转发、回退目标、审计日志）
//! - **plan_executor**：按依赖执行整份计划，汇总状态
//! - **result**：StepExecutionResult / ExecutionResult

pub mod parameters;
pub mod plan_executor;
pub mod resolver;
pub mod result;
pub mod step;

pub use parameters::{
    LlmParameterGenerator, ParameterGenerator, ParameterInput, ParameterProcessingResult,
    ParameterProcessor, ParameterRequest, ParameterSource, PARAMETER_GENERATOR_KEY,
};
pub use plan_executor::{ExecutionMode, ExecutionScope, PlanExecutor};
pub use resolver::{CatalogEntry, ExecutableItem, ExecutableKind, ExecutableResolver};
pub use result::{aggregate_status, ExecutionResult, ExecutionStatus, StepExecutionResult};
pub use step::{StepCall, StepExecutor};
