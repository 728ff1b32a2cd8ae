//! LlmEvaluator：用一次 LLM 调用给执行结果打分并列出改进建议
//!
//! 模板占位符：{request} {summary} {results}。回复中需含 `SCORE: <数字>` 行，`- ` / `* ` 开头的行作为改进建议。

use std::sync::Arc;

use async_trait::async_trait;

use crate::executor::ExecutionResult;
use crate::llm::{LlmClient, Message};
use crate::orchestrator::{Evaluation, Evaluator};

pub const DEFAULT_EVALUATION_PROMPT: &str = "Evaluate how well the executed steps satisfy the request.\n\
Request: {request}\n\
Summary: {summary}\n\
Step results:\n{results}\n\n\
Reply with a line `SCORE: <0-10>` followed by improvement suggestions, one per line starting with `- `.";

pub struct LlmEvaluator {
    llm: Arc<dyn LlmClient>,
    prompt_template: String,
}

impl LlmEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            prompt_template: DEFAULT_EVALUATION_PROMPT.to_string(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    async fn evaluate(&self, request: &str, execution: &ExecutionResult) -> anyhow::Result<Evaluation> {
        let results = execution
            .steps
            .iter()
            .map(|s| {
                if s.success {
                    format!("{} ({}): ok: {}", s.step_id, s.target, s.output)
                } else {
                    format!(
                        "{} ({}): failed: {}",
                        s.step_id,
                        s.target,
                        s.error.as_deref().unwrap_or("unknown")
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self
            .prompt_template
            .replace("{request}", request)
            .replace("{summary}", &execution.summary)
            .replace("{results}", &results);

        let response = self
            .llm
            .complete(&[Message::user(prompt)])
            .await
            .map_err(|e| anyhow::anyhow!("LLM error: {}", e))?;
        parse_evaluation(&response)
    }
}

/// 解析 `SCORE:` 行与建议列表
pub fn parse_evaluation(response: &str) -> anyhow::Result<Evaluation> {
    let mut score = None;
    let mut improvements = Vec::new();
    for line in response.lines().map(str::trim) {
        if let Some(rest) = strip_prefix_ignore_case(line, "score:") {
            let number = rest.trim().split('/').next().unwrap_or("").trim();
            score = number.parse::<f64>().ok();
        } else if let Some(item) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            if !item.trim().is_empty() {
                improvements.push(item.trim().to_string());
            }
        }
    }
    let score = score.ok_or_else(|| anyhow::anyhow!("No SCORE line in evaluation"))?;
    Ok(Evaluation {
        score,
        improvements,
    })
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() >= prefix.len()
        && line.is_char_boundary(prefix.len())
        && line[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}
