//! 工具层：Tool trait、注册表与内置 echo 工具（具体业务工具由调用方注册）

pub mod echo;
pub mod registry;

pub use echo::EchoTool;
pub use registry::{Tool, ToolOutput, ToolRegistry};
