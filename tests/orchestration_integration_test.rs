//! 编排集成测试：脚本化 Planner + 计数工具，覆盖完整会话循环

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::executor::ExecutionResult;
    use hive::orchestrator::{
        CompletionConfig, CompletionReason, Evaluation, Evaluator, OrchestratorConfig, Planner,
        PlanningRequest,
    };
    use hive::resilience::{CircuitConfig, ResilienceConfig, RetryPolicy};
    use hive::session::{MemorySessionStore, SessionStore};
    use hive::tools::{EchoTool, Tool, ToolOutput};
    use hive::{
        ChunkKind, ExecutionMode, InvocationContext, OrchestrationError, OrchestratorBuilder,
        Outcome, Plan, PlanBuilder, TaskStep,
    };
    use tokio_util::sync::CancellationToken;

    /// 按顺序返回预置计划，用完后返回空计划；记录收到的请求
    struct ScriptedPlanner {
        plans: Mutex<VecDeque<anyhow::Result<Plan>>>,
        requests: Mutex<Vec<PlanningRequest>>,
    }

    impl ScriptedPlanner {
        fn new(plans: Vec<anyhow::Result<Plan>>) -> Arc<Self> {
            Arc::new(Self {
                plans: Mutex::new(plans.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(&self, request: &PlanningRequest) -> anyhow::Result<Plan> {
            self.requests.lock().unwrap().push(request.clone());
            self.plans
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Plan::empty("done")))
        }
    }

    /// 返回固定文本的工具，可设置延迟
    struct FixedTool {
        name: &'static str,
        reply: &'static str,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FixedTool {
        fn new(name: &'static str, reply: &'static str) -> Self {
            Self {
                name,
                reply,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Tool for FixedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Returns a fixed reply"
        }

        async fn execute(
            &self,
            _input: &str,
            _context: &InvocationContext,
            cancel: CancellationToken,
        ) -> ToolOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return ToolOutput::failed("cancelled"),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            ToolOutput::ok(self.reply)
        }
    }

    /// 不看取消令牌、总是睡满 delay 的工具；记录完成次数
    struct StubbornTool {
        delay: Duration,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for StubbornTool {
        fn name(&self) -> &str {
            "stubborn"
        }

        fn description(&self) -> &str {
            "Ignores cancellation"
        }

        async fn execute(
            &self,
            _input: &str,
            _context: &InvocationContext,
            _cancel: CancellationToken,
        ) -> ToolOutput {
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            ToolOutput::ok("written")
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic"
        }

        fn description(&self) -> &str {
            "Panics on every call"
        }

        async fn execute(
            &self,
            _input: &str,
            _context: &InvocationContext,
            _cancel: CancellationToken,
        ) -> ToolOutput {
            let empty: Vec<&str> = Vec::new();
            ToolOutput::ok(empty[0])
        }
    }

    fn slow_tool(delay_ms: u64) -> FixedTool {
        FixedTool {
            name: "slow",
            reply: "slow done",
            delay: Duration::from_millis(delay_ms),
            calls: AtomicUsize::new(0),
        }
    }

    struct FailingEvaluator;

    #[async_trait]
    impl Evaluator for FailingEvaluator {
        async fn evaluate(&self, _request: &str, _execution: &ExecutionResult) -> anyhow::Result<Evaluation> {
            anyhow::bail!("evaluator offline")
        }
    }

    struct FixedEvaluator;

    #[async_trait]
    impl Evaluator for FixedEvaluator {
        async fn evaluate(&self, _request: &str, execution: &ExecutionResult) -> anyhow::Result<Evaluation> {
            Ok(Evaluation {
                score: 8.5,
                improvements: vec![format!("{} steps ran", execution.steps.len())],
            })
        }
    }

    fn fast_resilience() -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            circuit: CircuitConfig {
                failure_threshold: 50,
                cool_down: Duration::from_secs(30),
            },
            call_timeout: Duration::from_secs(5),
        }
    }

    fn two_step_plan() -> Plan {
        PlanBuilder::new("greet")
            .step(TaskStep::new("s1", "echo").parameters("hello").output("greeting"))
            .step(
                TaskStep::new("s2", "echo")
                    .parameters("{{greeting}} world")
                    .depends_on(["s1"]),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_completes_when_all_actions_succeed() {
        hive::observability::init();
        let planner = ScriptedPlanner::new(vec![Ok(two_step_plan())]);
        let orchestrator = OrchestratorBuilder::new(planner.clone())
            .tool(EchoTool)
            .with_evaluator(Arc::new(FixedEvaluator))
            .with_resilience(fast_resilience())
            .build();

        let result = orchestrator.execute("say hello").await.unwrap();
        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Completed(CompletionReason::AllActionsSucceeded));
        assert_eq!(result.score, Some(8.5));
        assert_eq!(result.improvements, vec!["2 steps ran".to_string()]);

        let execution = result.execution.unwrap();
        assert_eq!(execution.steps[1].output, "hello world");

        let session = orchestrator.session(&result.session_id).await.unwrap();
        assert!(session.is_completed());
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.shared_data.render("greeting").as_deref(), Some("hello"));
        assert_eq!(planner.calls(), 1);
        let request = planner.requests.lock().unwrap()[0].clone();
        assert!(request.catalog.iter().any(|e| e.name == "echo"));
        assert_eq!(request.iteration, 0);
    }

    #[tokio::test]
    async fn test_empty_plan_completes_session() {
        let planner = ScriptedPlanner::new(vec![Ok(Plan::empty("nothing"))]);
        let orchestrator = OrchestratorBuilder::new(planner)
            .with_app_config(&hive::config::AppConfig::default())
            .build();
        let result = orchestrator.execute("idle").await.unwrap();
        assert!(result.success);
        assert_eq!(result.outcome, Outcome::Completed(CompletionReason::EmptyPlan));
        assert!(result.execution.is_none());
        assert!(orchestrator.session(&result.session_id).await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_needs_user_input_then_continue() {
        let planner = ScriptedPlanner::new(vec![
            Ok(PlanBuilder::new("ask")
                .step(TaskStep::new("b", "echo").parameters("{{date}}"))
                .step(TaskStep::new("q", "ask"))
                .build()
                .unwrap()),
            Ok(PlanBuilder::new("book")
                .step(TaskStep::new("b2", "echo").parameters("booked"))
                .build()
                .unwrap()),
        ]);
        let orchestrator = OrchestratorBuilder::new(planner.clone())
            .tool(EchoTool)
            .tool(FixedTool::new("ask", "Please clarify the travel date"))
            .with_resilience(fast_resilience())
            .build();

        let first = orchestrator.execute("book a flight").await.unwrap();
        assert_eq!(first.outcome, Outcome::AwaitingInput);
        assert!(!first.success);
        let session = orchestrator.session(&first.session_id).await.unwrap();
        assert!(session.awaiting_input);
        assert!(!session.is_completed());

        let second = orchestrator
            .continue_session(&first.session_id, "next friday")
            .await
            .unwrap();
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(
            second.outcome,
            Outcome::Completed(CompletionReason::AllActionsSucceeded)
        );
        let request = planner.requests.lock().unwrap()[1].clone();
        assert_eq!(request.additional_input.as_deref(), Some("next friday"));
        assert!(request.history.contains("[ask]"));

        let session = orchestrator.session(&first.session_id).await.unwrap();
        assert_eq!(session.additional_inputs, vec!["next friday".to_string()]);
        assert_eq!(session.history.len(), 3);
        assert_eq!(session.history[2].step_number, 3);
        assert!(session.is_completed());
    }

    #[tokio::test]
    async fn test_continue_errors() {
        let planner = ScriptedPlanner::new(vec![]);
        let orchestrator = OrchestratorBuilder::new(planner).build();
        assert_eq!(
            orchestrator.continue_session("session_missing", "x").await.unwrap_err(),
            OrchestrationError::SessionNotFound("session_missing".into())
        );

        let done = orchestrator.execute("nothing to do").await.unwrap();
        assert!(matches!(
            orchestrator.continue_session(&done.session_id, "more").await,
            Err(OrchestrationError::SessionCompleted(_))
        ));
    }

    #[tokio::test]
    async fn test_planner_failure_is_retried_then_reported() {
        let planner = ScriptedPlanner::new(vec![
            Err(anyhow::anyhow!("llm down")),
            Err(anyhow::anyhow!("llm down")),
            Err(anyhow::anyhow!("llm down")),
        ]);
        let orchestrator = OrchestratorBuilder::new(planner.clone())
            .with_resilience(fast_resilience())
            .build();
        let result = orchestrator.execute("plan something").await.unwrap();
        assert_eq!(result.outcome, Outcome::PlanningFailed);
        assert!(!result.success);
        assert_eq!(planner.calls(), 3);
        assert!(!orchestrator.session(&result.session_id).await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_evaluator_failure_is_not_fatal() {
        let planner = ScriptedPlanner::new(vec![Ok(two_step_plan())]);
        let orchestrator = OrchestratorBuilder::new(planner)
            .tool(EchoTool)
            .with_evaluator(Arc::new(FailingEvaluator))
            .with_resilience(fast_resilience())
            .build();
        let result = orchestrator.execute("say hello").await.unwrap();
        assert!(result.success);
        assert!(result.score.is_none());
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let failing = || {
            Ok(PlanBuilder::new("broken")
                .step(TaskStep::new("x", "no_such_tool"))
                .build()
                .unwrap())
        };
        let planner = ScriptedPlanner::new(vec![failing(), failing(), failing()]);
        let orchestrator = OrchestratorBuilder::new(planner.clone())
            .with_resilience(fast_resilience())
            .with_completion(CompletionConfig {
                stuck_failures: 0,
                ..CompletionConfig::default()
            })
            .with_config(OrchestratorConfig {
                max_iterations: 2,
                ..OrchestratorConfig::default()
            })
            .build();
        let result = orchestrator.execute("loop").await.unwrap();
        assert_eq!(result.outcome, Outcome::IterationLimit);
        assert!(!result.success);
        assert_eq!(planner.calls(), 2);
        let session = orchestrator.session(&result.session_id).await.unwrap();
        assert_eq!(session.iterations, 2);
        assert_eq!(session.completion_reason, Some(CompletionReason::IterationLimit));
    }

    #[tokio::test]
    async fn test_stream_emits_chunks_in_order() {
        let planner = ScriptedPlanner::new(vec![Ok(two_step_plan())]);
        let orchestrator = Arc::new(
            OrchestratorBuilder::new(planner)
                .tool(EchoTool)
                .with_resilience(fast_resilience())
                .build(),
        );

        let mut stream = orchestrator.execute_stream("say hello").await;
        let mut kinds = Vec::new();
        let mut last = None;
        while let Some(chunk) = stream.next().await {
            kinds.push(chunk.kind);
            last = Some(chunk);
        }

        assert_eq!(kinds.first(), Some(&ChunkKind::Status));
        assert_eq!(kinds.iter().filter(|k| **k == ChunkKind::StepResult).count(), 2);
        let first_call = kinds.iter().position(|k| *k == ChunkKind::ToolCall).unwrap();
        let first_result = kinds.iter().position(|k| *k == ChunkKind::StepResult).unwrap();
        assert!(first_call < first_result);

        let last = last.unwrap();
        assert_eq!(last.kind, ChunkKind::Final);
        let json: serde_json::Value = serde_json::from_str(&last.content).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["session_id"], stream.session_id());
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_step() {
        let slow = FixedTool {
            name: "slow",
            reply: "slow done",
            delay: Duration::from_millis(100),
            calls: AtomicUsize::new(0),
        };
        let plan = PlanBuilder::new("slow")
            .step(TaskStep::new("a", "slow"))
            .step(TaskStep::new("b", "slow"))
            .step(TaskStep::new("c", "slow"))
            .build()
            .unwrap();
        let planner = ScriptedPlanner::new(vec![Ok(plan)]);
        let orchestrator = Arc::new(
            OrchestratorBuilder::new(planner)
                .tool(slow)
                .with_resilience(fast_resilience())
                .build(),
        );

        let mut stream = orchestrator.execute_stream("slow work").await;
        let session_id = stream.session_id().to_string();
        let mut final_chunk = None;
        while let Some(chunk) = stream.next().await {
            if chunk.kind == ChunkKind::ToolCall {
                assert!(orchestrator.cancel(&session_id));
            }
            if chunk.kind == ChunkKind::Final {
                final_chunk = Some(chunk);
            }
        }

        let json: serde_json::Value = serde_json::from_str(&final_chunk.unwrap().content).unwrap();
        assert_eq!(json["outcome"]["status"], "cancelled");
        let session = orchestrator.session(&session_id).await.unwrap();
        assert!(session.history.len() < 3);
        assert!(!orchestrator.is_running(&session_id));
    }

    #[tokio::test]
    async fn test_parallel_mode_through_orchestrator() {
        let plan = PlanBuilder::new("fan")
            .parallel(vec![
                TaskStep::new("a", "echo").parameters("a"),
                TaskStep::new("b", "echo").parameters("b"),
            ])
            .build()
            .unwrap();
        let planner = ScriptedPlanner::new(vec![Ok(plan)]);
        let orchestrator = OrchestratorBuilder::new(planner)
            .tool(EchoTool)
            .with_config(OrchestratorConfig {
                execution_mode: ExecutionMode::Parallel { max_concurrency: 2 },
                ..OrchestratorConfig::default()
            })
            .build();
        let result = orchestrator.execute("fan out").await.unwrap();
        assert!(result.success);
        assert_eq!(result.execution.unwrap().steps.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_expired_sessions() {
        let planner = ScriptedPlanner::new(vec![]);
        let orchestrator = OrchestratorBuilder::new(planner)
            .with_config(OrchestratorConfig {
                session_ttl: Duration::ZERO,
                ..OrchestratorConfig::default()
            })
            .build();
        let result = orchestrator.execute("short lived").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(orchestrator.sweep_expired().await, 1);
        assert!(orchestrator.session(&result.session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_started_step_completes_after_cancel() {
        let finished = Arc::new(AtomicUsize::new(0));
        let plan = PlanBuilder::new("write")
            .step(TaskStep::new("w1", "stubborn"))
            .step(TaskStep::new("w2", "stubborn").depends_on(["w1"]))
            .build()
            .unwrap();
        let planner = ScriptedPlanner::new(vec![Ok(plan)]);
        let orchestrator = Arc::new(
            OrchestratorBuilder::new(planner)
                .tool(StubbornTool {
                    delay: Duration::from_millis(80),
                    finished: finished.clone(),
                })
                .with_resilience(fast_resilience())
                .build(),
        );

        let mut stream = orchestrator.execute_stream("write twice").await;
        let session_id = stream.session_id().to_string();
        let mut final_chunk = None;
        while let Some(chunk) = stream.next().await {
            if chunk.kind == ChunkKind::ToolCall {
                stream.cancel();
            }
            if chunk.kind == ChunkKind::Final {
                final_chunk = Some(chunk);
            }
        }

        let json: serde_json::Value = serde_json::from_str(&final_chunk.unwrap().content).unwrap();
        assert_eq!(json["outcome"]["status"], "cancelled");
        assert_eq!(json["execution"]["cancelled"], true);
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        let session = orchestrator.session(&session_id).await.unwrap();
        assert_eq!(session.history.len(), 1);
        assert!(session.history[0].success);
        assert!(!session.is_completed());
    }

    #[tokio::test]
    async fn test_panicking_tool_fails_step_and_session_stops() {
        let plan = PlanBuilder::new("boom")
            .step(TaskStep::new("p", "panic"))
            .build()
            .unwrap();
        let planner = ScriptedPlanner::new(vec![Ok(plan)]);
        let orchestrator = Arc::new(
            OrchestratorBuilder::new(planner)
                .tool(PanicTool)
                .with_resilience(fast_resilience())
                .with_config(OrchestratorConfig {
                    max_iterations: 1,
                    ..OrchestratorConfig::default()
                })
                .build(),
        );

        let mut stream = orchestrator.execute_stream("explode").await;
        let session_id = stream.session_id().to_string();
        let mut last = None;
        while let Some(chunk) = stream.next().await {
            last = Some(chunk);
        }

        assert_eq!(last.unwrap().kind, ChunkKind::Final);
        assert!(!orchestrator.is_running(&session_id));
        let session = orchestrator.session(&session_id).await.unwrap();
        assert_eq!(session.history.len(), 1);
        assert!(!session.history[0].success);
        assert!(session.history[0].error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_removed_session_is_not_written_back() {
        let store = Arc::new(MemorySessionStore::new());
        let plan = PlanBuilder::new("slow")
            .step(TaskStep::new("a", "slow"))
            .build()
            .unwrap();
        let planner = ScriptedPlanner::new(vec![Ok(plan)]);
        let orchestrator = Arc::new(
            OrchestratorBuilder::new(planner)
                .tool(slow_tool(50))
                .with_session_store(store.clone())
                .with_resilience(fast_resilience())
                .build(),
        );

        let mut stream = orchestrator.execute_stream("short lived").await;
        let session_id = stream.session_id().to_string();
        let mut final_chunk = None;
        while let Some(chunk) = stream.next().await {
            if chunk.kind == ChunkKind::ToolCall {
                assert!(store.remove(&session_id).await.is_some());
            }
            if chunk.kind == ChunkKind::Final {
                final_chunk = Some(chunk);
            }
        }

        let json: serde_json::Value = serde_json::from_str(&final_chunk.unwrap().content).unwrap();
        assert_eq!(json["outcome"]["status"], "removed");
        assert!(store.get(&session_id).await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_continue_rejected_while_session_running() {
        let plan = PlanBuilder::new("slow")
            .step(TaskStep::new("a", "slow"))
            .build()
            .unwrap();
        let planner = ScriptedPlanner::new(vec![Ok(plan)]);
        let orchestrator = Arc::new(
            OrchestratorBuilder::new(planner.clone())
                .tool(slow_tool(50))
                .with_resilience(fast_resilience())
                .build(),
        );

        let mut stream = orchestrator.execute_stream("slow work").await;
        let session_id = stream.session_id().to_string();
        let mut busy = None;
        while let Some(chunk) = stream.next().await {
            if chunk.kind == ChunkKind::ToolCall && busy.is_none() {
                busy = Some(orchestrator.continue_session(&session_id, "more").await);
            }
        }

        assert_eq!(
            busy.unwrap().unwrap_err(),
            OrchestrationError::SessionBusy(session_id.clone())
        );
        assert_eq!(planner.calls(), 1);
        let session = orchestrator.session(&session_id).await.unwrap();
        assert!(session.is_completed());
        assert!(session.additional_inputs.is_empty());
        assert!(!orchestrator.is_running(&session_id));
    }

    #[tokio::test]
    async fn test_step_limit_noted_in_summary() {
        let planner = ScriptedPlanner::new(vec![Ok(two_step_plan())]);
        let orchestrator = OrchestratorBuilder::new(planner)
            .tool(EchoTool)
            .with_resilience(fast_resilience())
            .with_completion(CompletionConfig {
                max_steps: 2,
                ..CompletionConfig::default()
            })
            .build();
        let result = orchestrator.execute("say hello").await.unwrap();
        assert_eq!(result.outcome, Outcome::Completed(CompletionReason::RunawayGuard));
        assert!(result.summary.ends_with("(stopped: step limit reached)"));
        assert!(result.success);
    }
}
