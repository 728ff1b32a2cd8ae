//! Hive - 多步智能体工作流的计划执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、会话共享变量（SharedData）、调用上下文
//! - **events**: 流式输出片段（StreamChunk）
//! - **executor**: 目标解析、参数处理、单步执行、计划执行
//! - **functions**: 按角色注册的 LLM 函数
//! - **llm**: LLM 客户端抽象与 Mock
//! - **observability**: tracing 日志初始化
//! - **orchestrator**: plan → execute → evaluate 会话循环、完成判定、Planner / Evaluator 接口
//! - **plan**: Plan / TaskStep、依赖图、构建器、JSON Schema
//! - **resilience**: 熔断、重试、超时、回退
//! - **session**: 会话上下文与会话存储
//! - **tools**: Tool trait 与注册表

pub mod config;
pub mod core;
pub mod events;
pub mod executor;
pub mod functions;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod plan;
pub mod resilience;
pub mod session;
pub mod tools;

pub use crate::core::{ErrorKind, InvocationContext, OrchestrationError, SharedData};
pub use events::{ChunkKind, StreamChunk};
pub use executor::{ExecutionMode, ExecutionResult, ExecutionStatus, StepExecutionResult};
pub use orchestrator::{
    OrchestrationResult, OrchestrationStream, Orchestrator, OrchestratorBuilder, Outcome,
};
pub use plan::{Plan, PlanBuilder, TaskStep};
