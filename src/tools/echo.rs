//! Echo 工具（调试与冒烟测试用）

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::InvocationContext;
use crate::tools::{Tool, ToolOutput};

/// Echo 工具：回显文本；参数可为纯文本或 {"text": "..."}
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"} or plain text"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": []
        })
    }

    async fn execute(
        &self,
        input: &str,
        _context: &InvocationContext,
        _cancel: CancellationToken,
    ) -> ToolOutput {
        let text = serde_json::from_str::<Value>(input)
            .ok()
            .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_else(|| input.to_string());
        if text.is_empty() {
            ToolOutput::ok("(empty)")
        } else {
            ToolOutput::ok(text)
        }
    }
}
