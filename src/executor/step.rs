//! 单步执行器
//!
//! 对已解析的目标（工具或 LLM 函数）施加弹性策略（key = 目标名），把任何错误（包括目标内部的 panic）转为失败的 StepExecutionResult，
//! 从不向上抛出。流式函数的 Token 逐段转发，最终仍只返回一个拼接后的结果。每次调用输出一行 JSON 审计日志。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{InvocationContext, OrchestrationError};
use crate::events::{emit, ChunkKind, StreamChunk};
use crate::executor::{ExecutableItem, ExecutableResolver, StepExecutionResult};
use crate::plan::TaskStep;
use crate::resilience::{fallback, ResiliencePolicy};

/// 单次步骤调用的输入
pub struct StepCall<'a> {
    pub step_number: usize,
    pub step: &'a TaskStep,
    pub item: &'a ExecutableItem,
    /// parameters 字段为处理后的参数
    pub context: &'a InvocationContext,
    pub events: Option<&'a mpsc::Sender<StreamChunk>>,
    pub cancel: &'a CancellationToken,
}

#[derive(Clone)]
pub struct StepExecutor {
    resolver: ExecutableResolver,
    resilience: Arc<ResiliencePolicy>,
}

impl StepExecutor {
    pub fn new(resolver: ExecutableResolver, resilience: Arc<ResiliencePolicy>) -> Self {
        Self {
            resolver,
            resilience,
        }
    }

    pub fn resilience(&self) -> &Arc<ResiliencePolicy> {
        &self.resilience
    }

    pub async fn execute(&self, call: StepCall<'_>) -> StepExecutionResult {
        let started = Instant::now();
        let StepCall {
            step_number,
            step,
            item,
            context,
            events,
            cancel,
        } = call;

        emit(events, tool_call_chunk(item.name(), &context.parameters, step_number)).await;
        let primary = self.resilience.execute(item.name(), cancel, |token| {
            invoke(item, context, events, step_number, token)
        });

        let result = match step.fallback.as_deref() {
            Some(alternate) => {
                fallback(primary, |err| {
                    self.run_fallback(alternate, err, context, events, step_number, cancel)
                })
                .await
            }
            None => primary.await,
        };

        let duration = started.elapsed();
        audit(step, item.name(), &result, duration, &context.parameters);

        match result {
            Ok(output) => StepExecutionResult {
                step_number,
                step_id: step.id.clone(),
                description: step.description.clone(),
                target: step.target.clone(),
                parameters: context.parameters.clone(),
                success: true,
                output,
                error: None,
                error_kind: None,
                duration,
                output_variable: step.output_variable.clone(),
            },
            Err(e) => failed_result(step_number, step, &context.parameters, &e, duration),
        }
    }

    /// 主目标失败后执行一次备选目标（不重试）
    async fn run_fallback(
        &self,
        alternate: &str,
        primary_error: OrchestrationError,
        context: &InvocationContext,
        events: Option<&mpsc::Sender<StreamChunk>>,
        step_number: usize,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestrationError> {
        let item = self.resolver.resolve(alternate)?;
        tracing::info!(
            fallback = %alternate,
            primary_error = %primary_error,
            "Running fallback target"
        );
        emit(events, tool_call_chunk(item.name(), &context.parameters, step_number)).await;
        self.resilience
            .execute_once(item.name(), cancel, |token| {
                invoke(&item, context, events, step_number, token)
            })
            .await
    }
}

/// 在目标上执行一次调用；工具/函数返回失败或 panic 时转为 Execution 错误
async fn invoke(
    item: &ExecutableItem,
    context: &InvocationContext,
    events: Option<&mpsc::Sender<StreamChunk>>,
    step_number: usize,
    token: CancellationToken,
) -> Result<String, OrchestrationError> {
    let call = call_item(item, context, events, step_number, token.clone());
    let result = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(target_name = %item.name(), panic = %message, "Executable panicked");
            Err(OrchestrationError::Execution(format!(
                "{} panicked: {}",
                item.name(),
                message
            )))
        }
    };

    // 被取消的调用不计为目标失败
    match result {
        Err(_) if token.is_cancelled() => Err(OrchestrationError::Cancelled),
        other => other,
    }
}

async fn call_item(
    item: &ExecutableItem,
    context: &InvocationContext,
    events: Option<&mpsc::Sender<StreamChunk>>,
    step_number: usize,
    token: CancellationToken,
) -> Result<String, OrchestrationError> {
    match item {
        ExecutableItem::Tool(tool) => {
            let out = tool.execute(&context.parameters, context, token).await;
            if out.success {
                Ok(out.data)
            } else {
                Err(OrchestrationError::Execution(
                    out.error.unwrap_or_else(|| format!("{} failed", tool.name())),
                ))
            }
        }
        ExecutableItem::Function(function) if function.supports_streaming() => {
            let mut stream = function
                .execute_stream(context, token)
                .await
                .map_err(OrchestrationError::Execution)?;
            let mut content = String::new();
            while let Some(piece) = stream.next().await {
                let piece = piece.map_err(OrchestrationError::Execution)?;
                emit(
                    events,
                    StreamChunk::new(ChunkKind::Token, piece.clone()).with_step(step_number),
                )
                .await;
                content.push_str(&piece);
            }
            Ok(content)
        }
        ExecutableItem::Function(function) => {
            let out = function.execute(context, token).await;
            if out.success {
                Ok(out.content)
            } else {
                Err(OrchestrationError::Execution(
                    out.error.unwrap_or_else(|| format!("{} failed", function.role())),
                ))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 构造失败的步骤结果（解析失败、参数失败、执行失败共用）
pub(crate) fn failed_result(
    step_number: usize,
    step: &TaskStep,
    parameters: &str,
    error: &OrchestrationError,
    duration: Duration,
) -> StepExecutionResult {
    StepExecutionResult {
        step_number,
        step_id: step.id.clone(),
        description: step.description.clone(),
        target: step.target.clone(),
        parameters: parameters.to_string(),
        success: false,
        output: String::new(),
        error: Some(error.to_string()),
        error_kind: Some(error.kind()),
        duration,
        output_variable: step.output_variable.clone(),
    }
}

fn tool_call_chunk(target: &str, parameters: &str, step_number: usize) -> StreamChunk {
    let content = serde_json::json!({
        "target": target,
        "parameters": preview(parameters),
    });
    StreamChunk::new(ChunkKind::ToolCall, content.to_string()).with_step(step_number)
}

fn audit(
    step: &TaskStep,
    target: &str,
    result: &Result<String, OrchestrationError>,
    duration: Duration,
    parameters: &str,
) {
    let outcome = match result {
        Ok(_) => "ok".to_string(),
        Err(e) => serde_json::to_value(e.kind())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "error".to_string()),
    };
    let audit = serde_json::json!({
        "event": "step_audit",
        "step": step.id,
        "target": target,
        "ok": result.is_ok(),
        "outcome": outcome,
        "duration_ms": duration.as_millis() as u64,
        "params_preview": preview(parameters),
    });
    tracing::info!(audit = %audit.to_string(), "step");
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}
