//! 编排器：plan → execute → evaluate → 完成判定 的会话循环
//!
//! 每个会话一条循环；Planner / Evaluator 调用经弹性策略（key = planner / evaluator）。评估失败只记警告。
//! NeedsUserInput 时停止循环但保持会话打开，continue_session 可继续；其它停止原因都把会话标记为完成。
//! 流式接口通过有界通道推送 StreamChunk，接收端慢时背压到执行方。
//! 同一会话同时只有一条循环（active 登记，continue_session 遇到运行中的会话返回 SessionBusy）；
//! 循环中途会话被删除时停止且不再写回。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{FutureExt, Stream};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::OrchestrationError;
use crate::events::{emit, ChunkKind, StreamChunk};
use crate::executor::{ExecutionMode, ExecutionResult, ExecutionScope, PlanExecutor};
use crate::orchestrator::{
    CompletionChecker, CompletionReason, Evaluation, Evaluator, Planner, PlanningRequest,
};
use crate::plan::Plan;
use crate::resilience::ResiliencePolicy;
use crate::session::{OrchestrationContext, SessionStore};

pub const PLANNER_KEY: &str = "planner";
pub const EVALUATOR_KEY: &str = "evaluator";

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_iterations: usize,
    pub stream_buffer: usize,
    pub execution_mode: ExecutionMode,
    pub session_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            stream_buffer: 64,
            execution_mode: ExecutionMode::Sequential,
            session_ttl: Duration::from_secs(3600),
        }
    }
}

/// 会话循环的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Completed(CompletionReason),
    /// 等待用户补充信息，会话保持打开
    AwaitingInput,
    Cancelled,
    /// 达到最大迭代轮数（会话已标记完成）
    IterationLimit,
    /// Planner 调用失败，会话保持打开
    PlanningFailed,
    /// 会话在运行期间被删除（remove / 过期清理），循环停止且不再写回
    Removed,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub session_id: String,
    pub success: bool,
    pub summary: String,
    pub score: Option<f64>,
    pub improvements: Vec<String>,
    pub outcome: Outcome,
    /// 最后一轮的执行结果
    pub execution: Option<ExecutionResult>,
}

/// 流式会话句柄
pub struct OrchestrationStream {
    session_id: String,
    cancel: CancellationToken,
    rx: mpsc::Receiver<StreamChunk>,
}

impl OrchestrationStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn next(&mut self) -> Option<StreamChunk> {
        self.rx.recv().await
    }

    /// 请求取消；循环在下一步开始前停止
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamChunk> {
        futures_util::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
    }
}

pub struct Orchestrator {
    pub(crate) planner: Arc<dyn Planner>,
    pub(crate) evaluator: Option<Arc<dyn Evaluator>>,
    pub(crate) executor: PlanExecutor,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) checker: CompletionChecker,
    pub(crate) resilience: Arc<ResiliencePolicy>,
    pub(crate) config: OrchestratorConfig,
    /// 正在运行的会话及其取消令牌
    pub(crate) active: DashMap<String, CancellationToken>,
}

impl Orchestrator {
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn resilience(&self) -> &Arc<ResiliencePolicy> {
        &self.resilience
    }

    /// 新建会话并运行到停止
    pub async fn execute(&self, request: &str) -> Result<OrchestrationResult, OrchestrationError> {
        let context = self.sessions.create(request).await;
        let cancel = self.claim(&context.session_id)?;
        Ok(self.run_session(context, cancel, None).await)
    }

    /// 新建会话并在后台运行，返回片段流；最后一个片段为 Final（内容是 OrchestrationResult 的 JSON）
    pub async fn execute_stream(self: &Arc<Self>, request: &str) -> OrchestrationStream {
        let context = self.sessions.create(request).await;
        // 新会话 id 唯一，不会与运行中的循环冲突
        let cancel = CancellationToken::new();
        self.active.insert(context.session_id.clone(), cancel.clone());
        self.spawn_stream(context, cancel)
    }

    /// 继续一个等待输入（或尚未完成）的会话；同一会话已有循环在运行时返回 SessionBusy
    pub async fn continue_session(
        &self,
        session_id: &str,
        input: &str,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        let (context, cancel) = self.reopen(session_id, input).await?;
        Ok(self.run_session(context, cancel, None).await)
    }

    /// continue_session 的流式版本
    pub async fn continue_session_stream(
        self: &Arc<Self>,
        session_id: &str,
        input: &str,
    ) -> Result<OrchestrationStream, OrchestrationError> {
        let (context, cancel) = self.reopen(session_id, input).await?;
        Ok(self.spawn_stream(context, cancel))
    }

    /// 取消正在运行的会话；会话不在运行时返回 false
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.active.get(session_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(session = %session_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }

    /// 会话状态快照
    pub async fn session(&self, session_id: &str) -> Option<OrchestrationContext> {
        self.sessions.get(session_id).await
    }

    /// 清理超过 session_ttl 的会话
    pub async fn sweep_expired(&self) -> usize {
        self.sessions.remove_expired(self.config.session_ttl).await
    }

    /// 登记运行中的会话；同一会话只允许一条循环
    fn claim(&self, session_id: &str) -> Result<CancellationToken, OrchestrationError> {
        match self.active.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(OrchestrationError::SessionBusy(session_id.to_string())),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                slot.insert(cancel.clone());
                Ok(cancel)
            }
        }
    }

    async fn reopen(
        &self,
        session_id: &str,
        input: &str,
    ) -> Result<(OrchestrationContext, CancellationToken), OrchestrationError> {
        let cancel = self.claim(session_id)?;
        let context = match self.sessions.get(session_id).await {
            Some(context) if context.is_completed() => {
                Err(OrchestrationError::SessionCompleted(session_id.to_string()))
            }
            Some(context) => Ok(context),
            None => Err(OrchestrationError::SessionNotFound(session_id.to_string())),
        };
        match context {
            Ok(mut context) => {
                context.add_input(input);
                Ok((context, cancel))
            }
            Err(e) => {
                self.active.remove(session_id);
                Err(e)
            }
        }
    }

    fn spawn_stream(
        self: &Arc<Self>,
        context: OrchestrationContext,
        cancel: CancellationToken,
    ) -> OrchestrationStream {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let session_id = context.session_id.clone();
        let this = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move {
            let id = context.session_id.clone();
            let run = AssertUnwindSafe(this.run_session(context, token, Some(&tx)))
                .catch_unwind()
                .await;
            let chunk = match run {
                Ok(result) => match serde_json::to_string(&result) {
                    Ok(json) => StreamChunk::new(ChunkKind::Final, json),
                    Err(e) => StreamChunk::error(format!("Failed to serialize result: {}", e)),
                },
                Err(_) => {
                    tracing::error!(session = %id, "Session loop panicked");
                    StreamChunk::error(format!("Session {} aborted by a panic", id))
                }
            };
            let _ = tx.send(chunk).await;
        });
        OrchestrationStream {
            session_id,
            cancel,
            rx,
        }
    }

    async fn run_session(
        &self,
        mut context: OrchestrationContext,
        cancel: CancellationToken,
        events: Option<&mpsc::Sender<StreamChunk>>,
    ) -> OrchestrationResult {
        let session_id = context.session_id.clone();
        // 调用方已通过 claim 登记；循环结束（含 panic 展开）时移除
        let guard = ActiveGuard {
            active: &self.active,
            session_id: &session_id,
        };
        tracing::info!(session = %session_id, "Session started");

        let (outcome, execution) = self.drive(&mut context, &cancel, events).await;

        let result = build_result(&context, outcome, execution);
        if outcome != Outcome::Removed && !self.sessions.update_existing(context).await {
            tracing::warn!(session = %session_id, "Session removed while stopping, result not stored");
        }
        drop(guard);
        tracing::info!(
            session = %session_id,
            outcome = ?result.outcome,
            success = result.success,
            "Session stopped"
        );
        result
    }

    async fn drive(
        &self,
        context: &mut OrchestrationContext,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<StreamChunk>>,
    ) -> (Outcome, Option<ExecutionResult>) {
        let mut last_execution = None;
        let mut additional_input = context.additional_inputs.last().cloned();

        for _ in 0..self.config.max_iterations {
            if cancel.is_cancelled() {
                return (Outcome::Cancelled, last_execution);
            }
            emit(
                events,
                StreamChunk::status(format!("Planning (iteration {})", context.iterations + 1)),
            )
            .await;

            let plan = match self.plan(context, additional_input.take(), cancel).await {
                Ok(plan) => plan,
                Err(OrchestrationError::Cancelled) => return (Outcome::Cancelled, last_execution),
                Err(e) => {
                    tracing::warn!(session = %context.session_id, error = %e, "Planning failed");
                    emit(events, StreamChunk::error(format!("Planning failed: {}", e))).await;
                    return (Outcome::PlanningFailed, last_execution);
                }
            };
            tracing::info!(session = %context.session_id, steps = plan.len(), "Plan received");

            if context.planned_actions.is_empty() {
                context.planned_actions = plan.targets();
            }
            if plan.is_empty() {
                context.mark_completed(CompletionReason::EmptyPlan);
                return (Outcome::Completed(CompletionReason::EmptyPlan), last_execution);
            }

            emit(
                events,
                StreamChunk::status(format!("Executing plan with {} steps", plan.len())),
            )
            .await;
            let execution = self.execute_plan(&plan, context, cancel, events).await;
            context.record(&execution);
            context.iterations += 1;

            if execution.cancelled || cancel.is_cancelled() {
                return (Outcome::Cancelled, Some(execution));
            }

            if let Some(evaluation) = self.evaluate(context, &execution, cancel).await {
                context.last_evaluation = Some(evaluation);
            }
            last_execution = Some(execution);
            if !self.sessions.update_existing(context.clone()).await {
                tracing::warn!(session = %context.session_id, "Session removed while running, stopping");
                return (Outcome::Removed, last_execution);
            }

            match self.checker.evaluate(context) {
                Some(CompletionReason::NeedsUserInput) => {
                    context.awaiting_input = true;
                    return (Outcome::AwaitingInput, last_execution);
                }
                Some(reason) => {
                    context.mark_completed(reason);
                    return (Outcome::Completed(reason), last_execution);
                }
                None => {
                    tracing::debug!(session = %context.session_id, iteration = context.iterations, "Not complete, replanning");
                }
            }
        }

        tracing::warn!(
            session = %context.session_id,
            max_iterations = self.config.max_iterations,
            "Iteration limit reached"
        );
        context.mark_completed(CompletionReason::IterationLimit);
        (Outcome::IterationLimit, last_execution)
    }

    async fn plan(
        &self,
        context: &OrchestrationContext,
        additional_input: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Plan, OrchestrationError> {
        let request = PlanningRequest {
            session_id: context.session_id.clone(),
            user_request: context.original_request.clone(),
            catalog: self.executor.resolver().catalog(),
            shared_data: context.shared_data.clone(),
            history: context.history_summary(),
            additional_input,
            iteration: context.iterations,
        };
        let planner = self.planner.clone();
        self.resilience
            .execute(PLANNER_KEY, cancel, |_| {
                let planner = planner.clone();
                let request = request.clone();
                async move {
                    planner
                        .plan(&request)
                        .await
                        .map_err(|e| OrchestrationError::Execution(e.to_string()))
                }
            })
            .await
    }

    async fn execute_plan(
        &self,
        plan: &Plan,
        context: &mut OrchestrationContext,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<StreamChunk>>,
    ) -> ExecutionResult {
        let offset = context.last_step_number();
        let mut scope = ExecutionScope::new(
            &context.session_id,
            &context.original_request,
            &mut context.shared_data,
            cancel,
        )
        .with_step_offset(offset);
        if let Some(tx) = events {
            scope = scope.with_events(tx);
        }
        self.executor.execute(plan, scope).await
    }

    async fn evaluate(
        &self,
        context: &OrchestrationContext,
        execution: &ExecutionResult,
        cancel: &CancellationToken,
    ) -> Option<Evaluation> {
        let evaluator = self.evaluator.clone()?;
        let request = context.original_request.clone();
        let result = self
            .resilience
            .execute(EVALUATOR_KEY, cancel, |_| {
                let evaluator = evaluator.clone();
                let request = request.clone();
                async move {
                    evaluator
                        .evaluate(&request, execution)
                        .await
                        .map_err(|e| OrchestrationError::Execution(e.to_string()))
                }
            })
            .await;
        match result {
            Ok(evaluation) => {
                tracing::debug!(session = %context.session_id, score = evaluation.score, "Evaluation done");
                Some(evaluation)
            }
            Err(e) => {
                tracing::warn!(session = %context.session_id, error = %e, "Evaluation failed, continuing");
                None
            }
        }
    }
}

/// 运行中会话的登记守卫：drop 时从 active 移除
struct ActiveGuard<'a> {
    active: &'a DashMap<String, CancellationToken>,
    session_id: &'a str,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(self.session_id);
    }
}

fn build_result(
    context: &OrchestrationContext,
    outcome: Outcome,
    execution: Option<ExecutionResult>,
) -> OrchestrationResult {
    let last_ok = execution.as_ref().map(|e| e.is_success());
    let success = match outcome {
        Outcome::Completed(CompletionReason::AllActionsSucceeded) => true,
        Outcome::Completed(CompletionReason::EmptyPlan) => last_ok.unwrap_or(true),
        Outcome::Completed(CompletionReason::Stuck) => false,
        Outcome::Completed(_) | Outcome::IterationLimit => last_ok.unwrap_or(false),
        Outcome::AwaitingInput
        | Outcome::Cancelled
        | Outcome::PlanningFailed
        | Outcome::Removed => false,
    };
    let summary = match (&outcome, &execution) {
        (Outcome::AwaitingInput, _) => format!(
            "Waiting for user input: {}",
            context.latest_output().unwrap_or_default()
        ),
        (Outcome::PlanningFailed, _) => "Planning failed".to_string(),
        (Outcome::Cancelled, Some(e)) => format!("Cancelled. {}", e.summary),
        (Outcome::Cancelled, None) => "Cancelled".to_string(),
        (Outcome::Removed, _) => "Session removed while running".to_string(),
        (Outcome::Completed(CompletionReason::RunawayGuard), Some(e)) => {
            format!("{} (stopped: step limit reached)", e.summary)
        }
        (Outcome::Completed(CompletionReason::RunawayGuard), None) => {
            "Stopped: step limit reached".to_string()
        }
        (_, Some(e)) => e.summary.clone(),
        (_, None) => "Nothing to execute".to_string(),
    };
    let (score, improvements) = match &context.last_evaluation {
        Some(e) => (Some(e.score), e.improvements.clone()),
        None => (None, Vec::new()),
    };
    OrchestrationResult {
        session_id: context.session_id.clone(),
        success,
        summary,
        score,
        improvements,
        outcome,
        execution,
    }
}
