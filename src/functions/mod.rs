//! LLM 函数层：按角色注册的 LLM 调用单元（计划步骤可直接以角色名为 target）

pub mod chat;
pub mod registry;

pub use chat::ChatFunction;
pub use registry::{FunctionOutput, FunctionRegistry, LlmFunction};
