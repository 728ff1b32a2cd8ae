//! 编排层
//!
//! - **engine**：Orchestrator 会话循环（execute / execute_stream / continue_session / cancel）
//! - **builder**：OrchestratorBuilder
//! - **completion**：CompletionChecker 与停止原因
//! - **collaborators**：Planner / Evaluator 接口
//! - **evaluator**：基于 LLM 的 Evaluator

pub mod builder;
pub mod collaborators;
pub mod completion;
pub mod engine;
pub mod evaluator;

pub use builder::OrchestratorBuilder;
pub use collaborators::{Catalog, Evaluation, Evaluator, Planner, PlanningRequest};
pub use completion::{CompletionChecker, CompletionConfig, CompletionReason};
pub use engine::{
    OrchestrationResult, OrchestrationStream, Orchestrator, OrchestratorConfig, Outcome,
    EVALUATOR_KEY, PLANNER_KEY,
};
pub use evaluator::{parse_evaluation, LlmEvaluator};
