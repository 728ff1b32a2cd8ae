//! LLM 层：客户端抽象与测试用 Mock（具体后端由调用方提供）

pub mod mock;
pub mod traits;

pub use mock::MockLlmClient;
pub use traits::{extract_json_block, LlmClient, Message, Role, TokenStream};
