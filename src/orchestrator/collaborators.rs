//! 外部协作者：Planner 产生计划、Evaluator 评估执行结果（实现不透明，统一以 anyhow::Result 返回）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::SharedData;
use crate::executor::{CatalogEntry, ExecutionResult};
use crate::plan::Plan;

/// 可用目标目录
pub type Catalog = Vec<CatalogEntry>;

/// 交给 Planner 的输入
#[derive(Debug, Clone, Serialize)]
pub struct PlanningRequest {
    pub session_id: String,
    pub user_request: String,
    pub catalog: Catalog,
    pub shared_data: SharedData,
    /// 之前各轮的步骤摘要
    pub history: String,
    /// continue_session 提供的最新输入
    pub additional_input: Option<String>,
    /// 从 0 开始的轮次
    pub iteration: usize,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanningRequest) -> anyhow::Result<Plan>;
}

/// 评估结果：分数与改进建议
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    pub improvements: Vec<String>,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &str, execution: &ExecutionResult) -> anyhow::Result<Evaluation>;
}
