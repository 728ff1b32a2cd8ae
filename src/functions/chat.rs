//! ChatFunction：最简单的 LLM 函数，system prompt + 步骤输入 -> 模型回复
//!
//! 用户消息优先取处理后的参数文本，参数为空时退回步骤描述；可选流式输出。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::core::InvocationContext;
use crate::functions::{FunctionOutput, LlmFunction};
use crate::llm::{LlmClient, Message, TokenStream};

pub struct ChatFunction {
    role: String,
    description: String,
    system_prompt: String,
    llm: Arc<dyn LlmClient>,
    streaming: bool,
}

impl ChatFunction {
    pub fn new(
        role: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            role: role.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            llm,
            streaming: false,
        }
    }

    /// 启用流式输出
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    fn messages(&self, context: &InvocationContext) -> Vec<Message> {
        let input = if context.parameters.trim().is_empty() {
            context.step_description.clone()
        } else {
            context.parameters.clone()
        };
        vec![
            Message::system(self.system_prompt.clone()),
            Message::user(format!(
                "Request: {}\n\nTask: {}",
                context.user_request, input
            )),
        ]
    }
}

#[async_trait]
impl LlmFunction for ChatFunction {
    fn role(&self) -> &str {
        &self.role
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, context: &InvocationContext, cancel: CancellationToken) -> FunctionOutput {
        let messages = self.messages(context);
        tokio::select! {
            _ = cancel.cancelled() => FunctionOutput::failed("cancelled"),
            res = self.llm.complete(&messages) => match res {
                Ok(content) => FunctionOutput::ok(content),
                Err(e) => FunctionOutput::failed(e),
            },
        }
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn execute_stream(
        &self,
        context: &InvocationContext,
        cancel: CancellationToken,
    ) -> Result<TokenStream, String> {
        let messages = self.messages(context);
        let stream = self.llm.complete_stream(&messages).await?;
        // 取消后停止拉取后续 Token
        Ok(Box::pin(stream.take_until(cancel.cancelled_owned())))
    }
}
