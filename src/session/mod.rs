//! 会话：编排上下文与会话存储

pub mod context;
pub mod store;

pub use context::OrchestrationContext;
pub use store::{new_session_id, MemorySessionStore, SessionStore};
