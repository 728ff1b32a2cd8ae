//! 计划执行器
//!
//! 校验计划 → 按依赖执行：解析 → 参数处理 → 执行 → 追加结果 → 成功时写入输出变量 → 推送 StepResult。
//! 失败沿依赖链快速失败：失败（或被阻断）步骤的下游不再执行，记入 blocked；无关步骤照常执行。
//! 每步开始前检查取消；已开始的步骤运行到结束（令牌同时传给远程调用）。

use std::time::Instant;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{InvocationContext, SharedData};
use crate::events::{emit, ChunkKind, StreamChunk};
use crate::executor::step::{failed_result, StepCall};
use crate::executor::{
    aggregate_status, ExecutableResolver, ExecutionResult, ParameterInput, ParameterProcessor,
    StepExecutionResult, StepExecutor,
};
use crate::plan::{DependencyGraph, Plan, StepState, TaskStep};

/// 执行模式：默认顺序执行；并行模式下就绪的独立步骤并发执行（有上限）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel { max_concurrency: usize },
}

/// 一次计划执行的会话上下文
pub struct ExecutionScope<'a> {
    pub session_id: &'a str,
    pub user_request: &'a str,
    pub shared: &'a mut SharedData,
    pub cancel: &'a CancellationToken,
    pub events: Option<&'a mpsc::Sender<StreamChunk>>,
    /// 步骤编号起点（会话内跨轮次连续编号）
    pub step_offset: usize,
}

impl<'a> ExecutionScope<'a> {
    pub fn new(
        session_id: &'a str,
        user_request: &'a str,
        shared: &'a mut SharedData,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            session_id,
            user_request,
            shared,
            cancel,
            events: None,
            step_offset: 0,
        }
    }

    pub fn with_events(mut self, events: &'a mpsc::Sender<StreamChunk>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_step_offset(mut self, offset: usize) -> Self {
        self.step_offset = offset;
        self
    }
}

#[derive(Clone)]
pub struct PlanExecutor {
    resolver: ExecutableResolver,
    parameters: ParameterProcessor,
    steps: StepExecutor,
    mode: ExecutionMode,
}

/// 执行过程中的记账：步骤状态与已追加的结果
struct Progress {
    states: Vec<StepState>,
    results: Vec<StepExecutionResult>,
}

impl PlanExecutor {
    pub fn new(
        resolver: ExecutableResolver,
        parameters: ParameterProcessor,
        steps: StepExecutor,
    ) -> Self {
        Self {
            resolver,
            parameters,
            steps,
            mode: ExecutionMode::Sequential,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn resolver(&self) -> &ExecutableResolver {
        &self.resolver
    }

    pub async fn execute(&self, plan: &Plan, scope: ExecutionScope<'_>) -> ExecutionResult {
        let started = Instant::now();
        let graph = match DependencyGraph::new(plan) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::warn!(plan = %plan.id(), error = %e, "Plan rejected");
                return ExecutionResult::failed(format!("Invalid plan: {}", e));
            }
        };
        tracing::info!(plan = %plan.id(), steps = plan.len(), mode = ?self.mode, "Executing plan");

        let mut progress = Progress {
            states: vec![StepState::Pending; plan.len()],
            results: Vec::with_capacity(plan.len()),
        };
        let cancelled = match self.mode {
            ExecutionMode::Sequential => self.run_sequential(plan, &graph, scope, &mut progress).await,
            ExecutionMode::Parallel { max_concurrency } => {
                self.run_parallel(plan, &graph, scope, &mut progress, max_concurrency.max(1))
                    .await
            }
        };

        let blocked: Vec<String> = plan
            .steps()
            .iter()
            .zip(&progress.states)
            .filter(|(_, state)| **state == StepState::Blocked)
            .map(|(step, _)| step.id.clone())
            .collect();
        let status = aggregate_status(plan.len(), &progress.results);
        let succeeded = progress.results.iter().filter(|r| r.success).count();
        let failed = progress.results.len() - succeeded;
        let mut summary = format!(
            "Executed {} of {} steps: {} succeeded, {} failed, {} blocked",
            progress.results.len(),
            plan.len(),
            succeeded,
            failed,
            blocked.len()
        );
        if cancelled {
            summary.push_str(" (cancelled)");
        }
        tracing::info!(plan = %plan.id(), status = ?status, "{}", summary);

        ExecutionResult {
            steps: progress.results,
            status,
            summary,
            total_duration: started.elapsed(),
            blocked,
            cancelled,
        }
    }

    /// 按声明顺序执行；依赖都在前面，轮到某步时其依赖已全部落定
    async fn run_sequential(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        scope: ExecutionScope<'_>,
        progress: &mut Progress,
    ) -> bool {
        let ExecutionScope {
            session_id,
            user_request,
            shared,
            cancel,
            events,
            step_offset,
        } = scope;
        for (index, step) in plan.steps().iter().enumerate() {
            if progress.states[index] != StepState::Pending {
                continue;
            }
            if cancel.is_cancelled() {
                tracing::info!(session = %session_id, "Plan execution cancelled");
                return true;
            }
            progress.states[index] = StepState::Running;
            let result = self
                .run_step(
                    step,
                    step_offset + index + 1,
                    session_id,
                    user_request,
                    shared,
                    cancel,
                    events,
                )
                .await;
            settle(graph, index, result, progress, shared, events).await;
        }
        // 最后一步执行期间到达的取消也要反映在结果中
        cancel.is_cancelled()
    }

    /// 并发执行就绪步骤（不超过 max_concurrency），结果按完成顺序追加；SharedData 只在驱动任务中写入
    async fn run_parallel(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        scope: ExecutionScope<'_>,
        progress: &mut Progress,
        max_concurrency: usize,
    ) -> bool {
        let ExecutionScope {
            session_id,
            user_request,
            shared,
            cancel,
            events,
            step_offset,
        } = scope;
        let mut running = FuturesUnordered::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                tracing::info!(session = %session_id, "Plan execution cancelled");
                cancelled = true;
            }
            if !cancelled {
                for index in graph.ready(&progress.states) {
                    if running.len() >= max_concurrency {
                        break;
                    }
                    progress.states[index] = StepState::Running;
                    let step = &plan.steps()[index];
                    let snapshot = shared.clone();
                    running.push(async move {
                        let result = self
                            .run_step(
                                step,
                                step_offset + index + 1,
                                session_id,
                                user_request,
                                &snapshot,
                                cancel,
                                events,
                            )
                            .await;
                        (index, result)
                    });
                }
            }

            let Some((index, result)) = running.next().await else {
                break;
            };
            settle(graph, index, result, progress, shared, events).await;
        }
        cancelled || cancel.is_cancelled()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        step: &TaskStep,
        step_number: usize,
        session_id: &str,
        user_request: &str,
        shared: &SharedData,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<StreamChunk>>,
    ) -> StepExecutionResult {
        let started = Instant::now();
        tracing::debug!(step = %step.id, target_name = %step.target, "Running step");

        let item = match self.resolver.resolve(&step.target) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(step = %step.id, error = %e, "Target not resolved");
                return failed_result(step_number, step, &step.parameters, &e, started.elapsed());
            }
        };

        let schema = item.parameters_schema();
        let processed = self
            .parameters
            .process(
                ParameterInput {
                    target: item.name(),
                    raw: &step.parameters,
                    schema: &schema,
                    requires_parameters: item.requires_parameters(),
                    user_request,
                    description: &step.description,
                },
                shared,
                cancel,
            )
            .await;
        let raw_parameters = processed.parameters.clone();
        let parameters = match processed.into_result() {
            Ok(parameters) => parameters,
            Err(e) => {
                tracing::warn!(step = %step.id, error = %e, "Parameter processing failed");
                return failed_result(step_number, step, &raw_parameters, &e, started.elapsed());
            }
        };

        let context = InvocationContext::new(session_id, user_request)
            .with_step(step.description.clone(), parameters)
            .with_variables(shared.clone());
        let mut result = self
            .steps
            .execute(StepCall {
                step_number,
                step,
                item: &item,
                context: &context,
                events,
                cancel,
            })
            .await;
        result.duration = started.elapsed().max(result.duration);
        result
    }
}

/// 记录一步的结果：更新状态、阻断下游、写输出变量、推送 StepResult
async fn settle(
    graph: &DependencyGraph,
    index: usize,
    result: StepExecutionResult,
    progress: &mut Progress,
    shared: &mut SharedData,
    events: Option<&mpsc::Sender<StreamChunk>>,
) {
    if result.success {
        progress.states[index] = StepState::Succeeded;
        if let Some(var) = &result.output_variable {
            shared.store_output(var.clone(), &result.output);
        }
    } else {
        progress.states[index] = StepState::Failed;
        let blocked = graph.block_dependents(index, &mut progress.states);
        if !blocked.is_empty() {
            tracing::warn!(step = %result.step_id, blocked = blocked.len(), "Step failed, dependents blocked");
        }
    }

    let content = serde_json::to_string(&result).unwrap_or_default();
    emit(
        events,
        StreamChunk::new(ChunkKind::StepResult, content).with_step(result.step_number),
    )
    .await;
    progress.results.push(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::executor::ExecutionStatus;
    use crate::functions::FunctionRegistry;
    use crate::plan::PlanBuilder;
    use crate::resilience::{CircuitConfig, ResilienceConfig, ResiliencePolicy, RetryPolicy};
    use crate::tools::{EchoTool, Tool, ToolOutput, ToolRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// 记录调用顺序；输入为 "fail" 时失败
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Records invocations"
        }

        async fn execute(
            &self,
            input: &str,
            _context: &InvocationContext,
            _cancel: CancellationToken,
        ) -> ToolOutput {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(input.to_string());
            if input == "fail" {
                ToolOutput::failed("asked to fail")
            } else {
                ToolOutput::ok(format!("done:{}", input))
            }
        }
    }

    struct Fixture {
        executor: PlanExecutor,
        log: Arc<Mutex<Vec<String>>>,
        peak: Arc<AtomicUsize>,
    }

    fn fixture(delay: Duration) -> Fixture {
        let log = Arc::new(Mutex::new(Vec::new()));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tools = ToolRegistry::new();
        tools.register(Recorder {
            name: "record",
            log: log.clone(),
            delay,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        });
        tools.register(EchoTool);
        let resolver = ExecutableResolver::new(Arc::new(tools), Arc::new(FunctionRegistry::new()));
        let resilience = Arc::new(ResiliencePolicy::new(ResilienceConfig {
            retry: RetryPolicy::none(),
            circuit: CircuitConfig {
                failure_threshold: 100,
                cool_down: Duration::from_secs(30),
            },
            call_timeout: Duration::from_secs(5),
        }));
        let executor = PlanExecutor::new(
            resolver.clone(),
            ParameterProcessor::new(resilience.clone()),
            StepExecutor::new(resolver, resilience),
        );
        Fixture { executor, log, peak }
    }

    async fn run(executor: &PlanExecutor, plan: &Plan, shared: &mut SharedData) -> ExecutionResult {
        let cancel = CancellationToken::new();
        executor
            .execute(plan, ExecutionScope::new("s1", "request", shared, &cancel))
            .await
    }

    #[tokio::test]
    async fn test_independent_steps_succeed_in_order() {
        let f = fixture(Duration::ZERO);
        let plan = PlanBuilder::new("two")
            .step(TaskStep::new("a", "record").parameters("first"))
            .step(TaskStep::new("b", "record").parameters("second"))
            .build()
            .unwrap();
        let res = run(&f.executor, &plan, &mut SharedData::new()).await;

        assert_eq!(res.status, ExecutionStatus::Success);
        assert_eq!(res.steps.len(), 2);
        assert_eq!(res.steps[0].step_id, "a");
        assert_eq!(res.steps[1].step_id, "b");
        assert_eq!(res.steps[0].step_number, 1);
        assert_eq!(*f.log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependent() {
        let f = fixture(Duration::ZERO);
        let plan = PlanBuilder::new("chain")
            .step(TaskStep::new("step1", "record").parameters("fail"))
            .step(TaskStep::new("step2", "record").parameters("never").depends_on(["step1"]))
            .build()
            .unwrap();
        let res = run(&f.executor, &plan, &mut SharedData::new()).await;

        assert_eq!(res.status, ExecutionStatus::Failed);
        assert_eq!(res.steps.len(), 1);
        assert_eq!(res.blocked, vec!["step2".to_string()]);
        assert_eq!(*f.log.lock().unwrap(), vec!["fail"]);
    }

    #[tokio::test]
    async fn test_independent_step_still_runs_after_failure() {
        let f = fixture(Duration::ZERO);
        let plan = PlanBuilder::new("chain")
            .step(TaskStep::new("step1", "record").parameters("fail"))
            .step(TaskStep::new("step2", "record").parameters("never").depends_on(["step1"]))
            .step(TaskStep::new("step3", "record").parameters("ok"))
            .build()
            .unwrap();
        let res = run(&f.executor, &plan, &mut SharedData::new()).await;

        assert_eq!(res.status, ExecutionStatus::PartialSuccess);
        assert_eq!(res.steps.len(), 2);
        assert_eq!(res.steps[1].step_id, "step3");
        assert!(!f.log.lock().unwrap().contains(&"never".to_string()));
        assert!(res.summary.contains("1 blocked"));
    }

    #[tokio::test]
    async fn test_invalid_plan_has_no_results() {
        let f = fixture(Duration::ZERO);
        let plan = Plan::new(
            "bad",
            vec![
                TaskStep::new("a", "record").depends_on(["b"]),
                TaskStep::new("b", "record"),
            ],
        );
        let res = run(&f.executor, &plan, &mut SharedData::new()).await;
        assert_eq!(res.status, ExecutionStatus::Failed);
        assert!(res.steps.is_empty());
        assert!(res.summary.starts_with("Invalid plan"));
        assert!(f.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_output_variable_feeds_later_step() {
        let f = fixture(Duration::ZERO);
        let plan = PlanBuilder::new("vars")
            .step(TaskStep::new("a", "echo").parameters(r#"{"text":"rust"}"#).output("lang"))
            .step(TaskStep::new("b", "record").parameters("lang={{lang}}").depends_on(["a"]))
            .build()
            .unwrap();
        let mut shared = SharedData::new();
        let res = run(&f.executor, &plan, &mut shared).await;

        assert!(res.is_success());
        assert_eq!(shared.render("lang").as_deref(), Some("rust"));
        assert_eq!(res.steps[1].parameters, "lang=rust");
        assert_eq!(*f.log.lock().unwrap(), vec!["lang=rust"]);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_write_variable() {
        let f = fixture(Duration::ZERO);
        let plan = PlanBuilder::new("vars")
            .step(TaskStep::new("a", "record").parameters("fail").output("x"))
            .build()
            .unwrap();
        let mut shared = SharedData::new();
        run(&f.executor, &plan, &mut shared).await;
        assert!(!shared.contains_key("x"));
    }

    #[tokio::test]
    async fn test_unknown_target_and_missing_variable_are_step_failures() {
        let f = fixture(Duration::ZERO);
        let plan = PlanBuilder::new("errors")
            .step(TaskStep::new("a", "teleport"))
            .step(TaskStep::new("b", "record").parameters("{{ghost}}"))
            .build()
            .unwrap();
        let res = run(&f.executor, &plan, &mut SharedData::new()).await;
        assert_eq!(res.status, ExecutionStatus::Failed);
        assert_eq!(res.steps[0].error_kind, Some(ErrorKind::NotFound));
        assert_eq!(res.steps[1].error_kind, Some(ErrorKind::Parameter));
        assert!(res.steps[1].error.as_deref().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_step() {
        let f = fixture(Duration::ZERO);
        let plan = PlanBuilder::new("cancel")
            .step(TaskStep::new("a", "record").parameters("one"))
            .step(TaskStep::new("b", "record").parameters("two"))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut shared = SharedData::new();
        let res = f
            .executor
            .execute(&plan, ExecutionScope::new("s1", "r", &mut shared, &cancel))
            .await;
        assert!(res.cancelled);
        assert!(res.steps.is_empty());
        assert_eq!(res.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_started_step_finishes_when_cancelled_mid_call() {
        // Recorder 不看取消令牌
        let f = fixture(Duration::from_millis(60));
        let plan = PlanBuilder::new("cancel-mid")
            .step(TaskStep::new("a", "record").parameters("one"))
            .step(TaskStep::new("b", "record").parameters("two").depends_on(["a"]))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            trigger.cancel();
        });
        let mut shared = SharedData::new();
        let res = f
            .executor
            .execute(&plan, ExecutionScope::new("s1", "r", &mut shared, &cancel))
            .await;

        assert!(res.cancelled);
        assert_eq!(res.steps.len(), 1);
        assert!(res.steps[0].success);
        assert_eq!(res.steps[0].output, "done:one");
        assert!(res.blocked.is_empty());
        assert_eq!(res.status, ExecutionStatus::PartialSuccess);
        assert_eq!(*f.log.lock().unwrap(), vec!["one"]);
    }

    #[tokio::test]
    async fn test_step_result_chunks_are_emitted() {
        let f = fixture(Duration::ZERO);
        let plan = PlanBuilder::new("events")
            .step(TaskStep::new("a", "record").parameters("x"))
            .build()
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let mut shared = SharedData::new();
        f.executor
            .execute(
                &plan,
                ExecutionScope::new("s1", "r", &mut shared, &cancel)
                    .with_events(&tx)
                    .with_step_offset(4),
            )
            .await;
        drop(tx);
        let mut chunks = Vec::new();
        while let Some(c) = rx.recv().await {
            chunks.push(c);
        }
        let last = chunks.last().unwrap();
        assert_eq!(last.kind, ChunkKind::StepResult);
        assert_eq!(last.step, Some(5));
        let parsed: StepExecutionResult = serde_json::from_str(&last.content).unwrap();
        assert_eq!(parsed.output, "done:x");
    }

    #[tokio::test]
    async fn test_parallel_mode_bounds_concurrency_and_respects_dependencies() {
        let f = fixture(Duration::from_millis(30));
        let executor = f
            .executor
            .clone()
            .with_mode(ExecutionMode::Parallel { max_concurrency: 2 });
        let plan = PlanBuilder::new("fan-out")
            .step(TaskStep::new("a", "record").parameters("a"))
            .step(TaskStep::new("b", "record").parameters("b"))
            .step(TaskStep::new("c", "record").parameters("c"))
            .step(TaskStep::new("join", "record").parameters("join").depends_on(["a", "b", "c"]))
            .build()
            .unwrap();
        let res = run(&executor, &plan, &mut SharedData::new()).await;

        assert_eq!(res.status, ExecutionStatus::Success);
        assert_eq!(res.steps.len(), 4);
        assert_eq!(f.peak.load(Ordering::SeqCst), 2);
        assert_eq!(res.steps.last().unwrap().step_id, "join");
        assert_eq!(f.log.lock().unwrap().last().map(String::as_str), Some("join"));
    }

    #[tokio::test]
    async fn test_parallel_mode_blocks_dependents() {
        let f = fixture(Duration::ZERO);
        let executor = f
            .executor
            .clone()
            .with_mode(ExecutionMode::Parallel { max_concurrency: 4 });
        let plan = PlanBuilder::new("fan-out")
            .step(TaskStep::new("a", "record").parameters("fail"))
            .step(TaskStep::new("b", "record").parameters("b"))
            .step(TaskStep::new("c", "record").parameters("c").depends_on(["a"]))
            .build()
            .unwrap();
        let res = run(&executor, &plan, &mut SharedData::new()).await;
        assert_eq!(res.status, ExecutionStatus::PartialSuccess);
        assert_eq!(res.blocked, vec!["c".to_string()]);
        assert_eq!(res.steps.len(), 2);
    }
}
