//! 可执行目标解析：先查工具注册表，再查 LLM 函数注册表（按角色名）

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::core::OrchestrationError;
use crate::functions::{FunctionRegistry, LlmFunction};
use crate::tools::{Tool, ToolRegistry};

/// 解析结果：工具或 LLM 函数
#[derive(Clone)]
pub enum ExecutableItem {
    Tool(Arc<dyn Tool>),
    Function(Arc<dyn LlmFunction>),
}

impl ExecutableItem {
    pub fn name(&self) -> &str {
        match self {
            Self::Tool(t) => t.name(),
            Self::Function(f) => f.role(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Tool(t) => t.description(),
            Self::Function(f) => f.description(),
        }
    }

    pub fn parameters_schema(&self) -> Value {
        match self {
            Self::Tool(t) => t.parameters_schema(),
            Self::Function(f) => f.parameters_schema(),
        }
    }

    pub fn requires_parameters(&self) -> bool {
        match self {
            Self::Tool(t) => t.requires_parameters(),
            Self::Function(f) => f.requires_parameters(),
        }
    }

    pub fn kind(&self) -> ExecutableKind {
        match self {
            Self::Tool(_) => ExecutableKind::Tool,
            Self::Function(_) => ExecutableKind::Function,
        }
    }

    pub fn supports_streaming(&self) -> bool {
        matches!(self, Self::Function(f) if f.supports_streaming())
    }
}

impl std::fmt::Debug for ExecutableItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableItem")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutableKind {
    Tool,
    Function,
}

/// 目录条目：提供给 Planner 的可用目标说明
#[derive(Clone, Debug, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub kind: ExecutableKind,
    pub description: String,
    pub parameters_schema: Value,
}

/// 按名称解析 Plan 中的 target
#[derive(Clone, Default)]
pub struct ExecutableResolver {
    tools: Arc<ToolRegistry>,
    functions: Arc<FunctionRegistry>,
}

impl ExecutableResolver {
    pub fn new(tools: Arc<ToolRegistry>, functions: Arc<FunctionRegistry>) -> Self {
        Self { tools, functions }
    }

    /// 工具优先；都找不到时返回 NotFound（由调用方转为失败的步骤结果）
    pub fn resolve(&self, name: &str) -> Result<ExecutableItem, OrchestrationError> {
        if let Some(tool) = self.tools.get(name) {
            return Ok(ExecutableItem::Tool(tool));
        }
        if let Some(function) = self.functions.get(name) {
            return Ok(ExecutableItem::Function(function));
        }
        Err(OrchestrationError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.get(name).is_some() || self.functions.get(name).is_some()
    }

    /// 所有可解析目标，工具在前，各自按名称排序；与工具同名的函数被遮蔽，不列出
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        let mut tools: Vec<CatalogEntry> = self
            .tools
            .iter()
            .map(|t| CatalogEntry {
                name: t.name().to_string(),
                kind: ExecutableKind::Tool,
                description: t.description().to_string(),
                parameters_schema: t.parameters_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));

        let mut functions: Vec<CatalogEntry> = self
            .functions
            .iter()
            .filter(|f| self.tools.get(f.role()).is_none())
            .map(|f| CatalogEntry {
                name: f.role().to_string(),
                kind: ExecutableKind::Function,
                description: f.description().to_string(),
                parameters_schema: f.parameters_schema(),
            })
            .collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));

        tools.extend(functions);
        tools
    }
}
