//! 单次调用的上下文：工具与 LLM 函数在执行时可见的信息

use serde::Serialize;

use crate::core::SharedData;

/// 传给 Tool / LlmFunction 的调用上下文（每次调用独立一份快照）
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvocationContext {
    pub session_id: String,
    /// 用户原始请求
    pub user_request: String,
    /// 当前步骤描述
    pub step_description: String,
    /// 处理后的参数文本
    pub parameters: String,
    /// 调用时刻的 SharedData 快照
    pub variables: SharedData,
}

impl InvocationContext {
    pub fn new(session_id: impl Into<String>, user_request: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_request: user_request.into(),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, description: impl Into<String>, parameters: impl Into<String>) -> Self {
        self.step_description = description.into();
        self.parameters = parameters.into();
        self
    }

    pub fn with_variables(mut self, variables: SharedData) -> Self {
        self.variables = variables;
        self
    }

    /// 将参数文本按 JSON 解析（工具多以 JSON 对象接收参数）
    pub fn parameters_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(self.parameters.trim()).ok()
    }
}
