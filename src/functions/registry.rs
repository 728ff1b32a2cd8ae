//! LLM 函数注册表
//!
//! LlmFunction 与 Tool 平行：Tool 接收参数文本，LlmFunction 从 InvocationContext 取参数并调用模型。
//! 支持流式的函数可实现 execute_stream，由 StepExecutor 将 Token 逐段转发。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::InvocationContext;
use crate::llm::TokenStream;

/// LLM 函数执行结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionOutput {
    pub success: bool,
    pub content: String,
    /// 内容能解析为 JSON 时的结构化结果
    pub parsed: Option<Value>,
    pub error: Option<String>,
}

impl FunctionOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        let content = content.into();
        let parsed = serde_json::from_str(content.trim()).ok();
        Self {
            success: true,
            content,
            parsed,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            parsed: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait LlmFunction: Send + Sync {
    /// 注册用的角色名（Plan 中 TaskStep 的 target）
    fn role(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {}, "required": [] })
    }

    fn requires_parameters(&self) -> bool {
        false
    }

    async fn execute(&self, context: &InvocationContext, cancel: CancellationToken) -> FunctionOutput;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// 流式执行；仅在 supports_streaming 为 true 时被调用
    async fn execute_stream(
        &self,
        _context: &InvocationContext,
        _cancel: CancellationToken,
    ) -> Result<TokenStream, String> {
        Err(format!("{} does not support streaming", self.role()))
    }
}

/// 按角色名存储的 LLM 函数注册表
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn LlmFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function: impl LlmFunction + 'static) {
        self.register_arc(Arc::new(function));
    }

    pub fn register_arc(&mut self, function: Arc<dyn LlmFunction>) {
        let role = function.role().to_string();
        if self.functions.insert(role.clone(), function).is_some() {
            tracing::warn!("LLM function '{}' registered twice, keeping the latest", role);
        }
    }

    pub fn get(&self, role: &str) -> Option<Arc<dyn LlmFunction>> {
        self.functions.get(role).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.functions.keys().cloned().collect();
        roles.sort();
        roles
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn LlmFunction>> {
        self.functions.values()
    }
}
