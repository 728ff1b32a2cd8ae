//! 计划层：Plan / TaskStep 数据类型、构建器、依赖图与 JSON Schema

pub mod builder;
pub mod graph;
pub mod schema;
pub mod types;

pub use builder::PlanBuilder;
pub use graph::{DependencyGraph, StepState};
pub use schema::plan_schema_json;
pub use types::{Plan, PlanError, StepId, TaskStep};
