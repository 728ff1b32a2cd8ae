//! 编排过程事件：流式接口按顺序推送的片段（状态、工具调用、Token、步骤结果、最终结果、错误）

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// 阶段状态（开始规划、第几轮等）
    Status,
    /// 即将调用工具/函数
    ToolCall,
    /// 流式函数的一段输出
    Token,
    /// 单步完成（内容为 StepExecutionResult 的 JSON）
    StepResult,
    /// 会话结束（内容为 OrchestrationResult 的 JSON）
    Final,
    Error,
}

/// 流式片段；step 为关联的步骤编号（从 1 开始）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub kind: ChunkKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
}

impl StreamChunk {
    pub fn new(kind: ChunkKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            step: None,
        }
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self::new(ChunkKind::Status, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(ChunkKind::Error, content)
    }

    pub fn with_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }
}

/// 发送片段；没有订阅方或接收端已关闭时静默丢弃
pub(crate) async fn emit(events: Option<&mpsc::Sender<StreamChunk>>, chunk: StreamChunk) {
    if let Some(tx) = events {
        let _ = tx.send(chunk).await;
    }
}
