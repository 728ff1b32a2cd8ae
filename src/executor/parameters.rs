//! 参数处理
//!
//! 三种结果：原样返回、按 SharedData 替换 `{{name}}` / `{{$name}}` / `{{name.path}}` 占位符、
//! 参数缺失且目标要求参数时调用 ParameterGenerator 生成。替换是严格的：任一占位符无法解析即失败，并列出缺失变量。
//! 生成每步最多一次，经 ResiliencePolicy（key = parameter-generator）调用，失败以数据返回。

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{OrchestrationError, SharedData};
use crate::llm::{extract_json_block, LlmClient, Message};
use crate::resilience::ResiliencePolicy;

/// 参数生成所用的熔断/超时 key
pub const PARAMETER_GENERATOR_KEY: &str = "parameter-generator";

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE
        .get_or_init(|| Regex::new(r"\{\{\s*\$?([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").unwrap())
}

/// 参数来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSource {
    Raw,
    Substituted,
    Generated,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParameterProcessingResult {
    pub success: bool,
    pub parameters: String,
    pub error: Option<String>,
    pub source: ParameterSource,
}

impl ParameterProcessingResult {
    fn ok(parameters: String, source: ParameterSource) -> Self {
        Self {
            success: true,
            parameters,
            error: None,
            source,
        }
    }

    fn failed(parameters: String, source: ParameterSource, error: impl Into<String>) -> Self {
        Self {
            success: false,
            parameters,
            error: Some(error.into()),
            source,
        }
    }

    /// 转为 Result，失败时为 Parameter 错误
    pub fn into_result(self) -> Result<String, OrchestrationError> {
        match self.error {
            Some(e) if !self.success => Err(OrchestrationError::Parameter(e)),
            _ => Ok(self.parameters),
        }
    }
}

/// 参数处理的输入
#[derive(Clone, Copy, Debug)]
pub struct ParameterInput<'a> {
    pub target: &'a str,
    pub raw: &'a str,
    pub schema: &'a Value,
    pub requires_parameters: bool,
    pub user_request: &'a str,
    pub description: &'a str,
}

/// 参数生成请求
#[derive(Clone, Debug, Serialize)]
pub struct ParameterRequest {
    pub target: String,
    pub schema: Value,
    pub description: String,
    pub user_request: String,
}

/// 参数生成器（通常由 LLM 实现）；返回参数文本（一般为 JSON 对象）
#[async_trait]
pub trait ParameterGenerator: Send + Sync {
    async fn generate(&self, request: &ParameterRequest) -> anyhow::Result<String>;
}

/// 默认生成提示词模板
pub const DEFAULT_PARAMETER_PROMPT: &str = "You generate call parameters for the tool `{target}`.\n\
Task: {description}\n\
User request: {request}\n\
Parameter JSON schema:\n{schema}\n\n\
Reply with a single JSON object that satisfies the schema, inside a ```json block.";

/// 基于 LlmClient 的参数生成器
pub struct LlmParameterGenerator {
    llm: Arc<dyn LlmClient>,
    template: String,
}

impl LlmParameterGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            template: DEFAULT_PARAMETER_PROMPT.to_string(),
        }
    }

    /// 自定义模板，支持 {schema} {description} {request} {target}
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    fn render(&self, request: &ParameterRequest) -> String {
        let schema = serde_json::to_string_pretty(&request.schema)
            .unwrap_or_else(|_| request.schema.to_string());
        self.template
            .replace("{schema}", &schema)
            .replace("{description}", &request.description)
            .replace("{request}", &request.user_request)
            .replace("{target}", &request.target)
    }
}

#[async_trait]
impl ParameterGenerator for LlmParameterGenerator {
    async fn generate(&self, request: &ParameterRequest) -> anyhow::Result<String> {
        let prompt = self.render(request);
        let reply = self
            .llm
            .complete(&[Message::user(prompt)])
            .await
            .map_err(|e| anyhow::anyhow!("LLM error: {}", e))?;
        let json = extract_json_block(&reply)
            .ok_or_else(|| anyhow::anyhow!("No JSON object in generated parameters"))?;
        let value: Value = serde_json::from_str(json)?;
        if !value.is_object() {
            anyhow::bail!("Generated parameters are not a JSON object");
        }
        Ok(value.to_string())
    }
}

/// 参数处理器
#[derive(Clone)]
pub struct ParameterProcessor {
    generator: Option<Arc<dyn ParameterGenerator>>,
    resilience: Arc<ResiliencePolicy>,
}

impl ParameterProcessor {
    pub fn new(resilience: Arc<ResiliencePolicy>) -> Self {
        Self {
            generator: None,
            resilience,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn ParameterGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// 处理一步的参数。
    ///
    /// 只有原始文本为空白、且目标要求参数（requires_parameters 或 schema 含 required）时才调用生成器，
    /// 每步至多一次。给出了参数文本但缺少 required 字段时不触发生成，直接返回 Parameter 失败，
    /// 由 Planner 在下一轮修正。
    pub async fn process(
        &self,
        input: ParameterInput<'_>,
        shared: &SharedData,
        cancel: &CancellationToken,
    ) -> ParameterProcessingResult {
        if input.raw.trim().is_empty() && needs_generation(input.schema, input.requires_parameters) {
            return self.generate(input, cancel).await;
        }

        let (parameters, source) = match substitute(input.raw, shared) {
            Ok(Some(text)) => (text, ParameterSource::Substituted),
            Ok(None) => (input.raw.to_string(), ParameterSource::Raw),
            Err(missing) => {
                return ParameterProcessingResult::failed(
                    input.raw.to_string(),
                    ParameterSource::Raw,
                    format!("Unresolved variables: {}", missing.join(", ")),
                );
            }
        };

        match check_required(&parameters, input.schema) {
            Ok(()) => ParameterProcessingResult::ok(parameters, source),
            Err(e) => ParameterProcessingResult::failed(parameters, source, e),
        }
    }

    async fn generate(
        &self,
        input: ParameterInput<'_>,
        cancel: &CancellationToken,
    ) -> ParameterProcessingResult {
        let Some(generator) = self.generator.clone() else {
            return ParameterProcessingResult::failed(
                String::new(),
                ParameterSource::Generated,
                format!("Parameters required for '{}' but no generator is configured", input.target),
            );
        };

        let request = ParameterRequest {
            target: input.target.to_string(),
            schema: input.schema.clone(),
            description: input.description.to_string(),
            user_request: input.user_request.to_string(),
        };
        tracing::debug!(target_name = %input.target, "Generating parameters");

        let generated = self
            .resilience
            .execute_once(PARAMETER_GENERATOR_KEY, cancel, |_| {
                let generator = generator.clone();
                let request = request.clone();
                async move {
                    generator
                        .generate(&request)
                        .await
                        .map_err(|e| OrchestrationError::Execution(e.to_string()))
                }
            })
            .await;

        match generated {
            Ok(parameters) => match check_required(&parameters, input.schema) {
                Ok(()) => ParameterProcessingResult::ok(parameters, ParameterSource::Generated),
                Err(e) => ParameterProcessingResult::failed(parameters, ParameterSource::Generated, e),
            },
            Err(e) => {
                tracing::warn!(target_name = %input.target, error = %e, "Parameter generation failed");
                ParameterProcessingResult::failed(
                    String::new(),
                    ParameterSource::Generated,
                    format!("Parameter generation failed: {}", e),
                )
            }
        }
    }
}

/// 是否需要生成：目标声明需要参数，或 schema 列出了 required 字段
pub fn needs_generation(schema: &Value, requires_parameters: bool) -> bool {
    requires_parameters || !required_fields(schema).is_empty()
}

fn required_fields(schema: &Value) -> Vec<&str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// 替换占位符。无占位符返回 Ok(None)；有未解析的占位符返回 Err(缺失变量，去重排序)
pub fn substitute(raw: &str, shared: &SharedData) -> Result<Option<String>, Vec<String>> {
    let re = placeholder_re();
    if !re.is_match(raw) {
        return Ok(None);
    }

    let mut missing = BTreeSet::new();
    let replaced = re.replace_all(raw, |caps: &regex::Captures| {
        let name = &caps[1];
        match shared.render(name) {
            Some(value) => value,
            None => {
                missing.insert(name.to_string());
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(Some(replaced.into_owned()))
    } else {
        Err(missing.into_iter().collect())
    }
}

/// 参数文本是 JSON 对象时，检查 schema 的 required 字段都存在
fn check_required(parameters: &str, schema: &Value) -> Result<(), String> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(parameters.trim()) else {
        return Ok(());
    };
    let missing: Vec<&str> = required_fields(schema)
        .into_iter()
        .filter(|field| !map.contains_key(*field))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("Missing required parameters: {}", missing.join(", ")))
    }
}
