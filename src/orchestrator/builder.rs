//! 编排器构建器：统一组装注册表、弹性策略、执行器与会话存储

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::AppConfig;
use crate::executor::{
    ExecutableResolver, ParameterGenerator, ParameterProcessor, PlanExecutor, StepExecutor,
};
use crate::functions::{FunctionRegistry, LlmFunction};
use crate::orchestrator::{
    CompletionChecker, CompletionConfig, Evaluator, Orchestrator, OrchestratorConfig, Planner,
};
use crate::resilience::{ResilienceConfig, ResiliencePolicy};
use crate::session::{MemorySessionStore, SessionStore};
use crate::tools::{Tool, ToolRegistry};

pub struct OrchestratorBuilder {
    planner: Arc<dyn Planner>,
    evaluator: Option<Arc<dyn Evaluator>>,
    generator: Option<Arc<dyn ParameterGenerator>>,
    tools: ToolRegistry,
    functions: FunctionRegistry,
    sessions: Option<Arc<dyn SessionStore>>,
    resilience: ResilienceConfig,
    completion: CompletionConfig,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn new(planner: Arc<dyn Planner>) -> Self {
        Self {
            planner,
            evaluator: None,
            generator: None,
            tools: ToolRegistry::new(),
            functions: FunctionRegistry::new(),
            sessions: None,
            resilience: ResilienceConfig::default(),
            completion: CompletionConfig::default(),
            config: OrchestratorConfig::default(),
        }
    }

    /// 按应用配置设置弹性、完成判定与编排参数
    pub fn with_app_config(mut self, config: &AppConfig) -> Self {
        self.resilience = ResilienceConfig::from(&config.resilience);
        self.completion = CompletionConfig::from(&config.completion);
        self.config = OrchestratorConfig::from(&config.orchestrator);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_parameter_generator(mut self, generator: Arc<dyn ParameterGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn function(mut self, function: impl LlmFunction + 'static) -> Self {
        self.functions.register(function);
        self
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_resilience(mut self, config: ResilienceConfig) -> Self {
        self.resilience = config;
        self
    }

    pub fn with_completion(mut self, config: CompletionConfig) -> Self {
        self.completion = config;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Orchestrator {
        let resilience = Arc::new(ResiliencePolicy::new(self.resilience));
        let resolver = ExecutableResolver::new(Arc::new(self.tools), Arc::new(self.functions));

        let mut parameters = ParameterProcessor::new(resilience.clone());
        if let Some(generator) = self.generator {
            parameters = parameters.with_generator(generator);
        }
        let steps = StepExecutor::new(resolver.clone(), resilience.clone());
        let executor =
            PlanExecutor::new(resolver, parameters, steps).with_mode(self.config.execution_mode);

        tracing::info!(
            targets = executor.resolver().catalog().len(),
            mode = ?self.config.execution_mode,
            "Orchestrator built"
        );

        Orchestrator {
            planner: self.planner,
            evaluator: self.evaluator,
            executor,
            sessions: self
                .sessions
                .unwrap_or_else(|| Arc::new(MemorySessionStore::new())),
            checker: CompletionChecker::new(self.completion),
            resilience,
            config: self.config,
            active: DashMap::new(),
        }
    }
}
