//! 核心类型：错误分类、会话共享变量、调用上下文

pub mod error;
pub mod invocation;
pub mod shared;

pub use error::{ErrorKind, OrchestrationError};
pub use invocation::InvocationContext;
pub use shared::SharedData;
