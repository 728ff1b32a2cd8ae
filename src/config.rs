//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RESILIENCE__MAX_ATTEMPTS=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::executor::ExecutionMode;
use crate::orchestrator::{CompletionConfig, OrchestratorConfig};
use crate::resilience::{CircuitConfig, ResilienceConfig, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub resilience: ResilienceSection,
    pub completion: CompletionSection,
}

/// [orchestrator] 段：迭代上限、流式缓冲、执行模式、会话过期时间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 单个会话内 plan -> execute -> evaluate 的最大轮数
    pub max_iterations: usize,
    /// 流式输出通道容量（有界，满时背压）
    pub stream_buffer: usize,
    /// sequential / parallel
    pub execution_mode: String,
    /// parallel 模式下同时执行的步骤数上限
    pub max_concurrency: usize,
    /// 会话过期清理阈值（秒）
    pub session_ttl_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            stream_buffer: 64,
            execution_mode: "sequential".to_string(),
            max_concurrency: 3,
            session_ttl_secs: 3600,
        }
    }
}

/// [resilience] 段：重试、超时、熔断
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    /// 总调用次数上限（含首次）
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 单次远程调用超时（秒）
    pub call_timeout_secs: u64,
    /// 连续失败多少次后打开熔断
    pub failure_threshold: u32,
    /// 熔断打开后的冷却时间（秒）
    pub cool_down_secs: u64,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            call_timeout_secs: 60,
            failure_threshold: 5,
            cool_down_secs: 30,
        }
    }
}

/// [completion] 段：完成判定的阈值与关键词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionSection {
    /// 历史步数达到此值即停止（防失控）
    pub max_steps: usize,
    /// 「卡住」检测窗口：最近 N 步
    pub stuck_window: usize,
    /// 窗口内失败步数达到此值视为卡住
    pub stuck_failures: usize,
    /// 最新输出包含这些文本（不区分大小写）时视为需要用户补充信息
    pub clarification_markers: Vec<String>,
}

impl Default for CompletionSection {
    fn default() -> Self {
        let defaults = CompletionConfig::default();
        Self {
            max_steps: defaults.max_steps,
            stuck_window: defaults.stuck_window,
            stuck_failures: defaults.stuck_failures,
            clarification_markers: defaults.clarification_markers,
        }
    }
}

impl From<&ResilienceSection> for ResilienceConfig {
    fn from(s: &ResilienceSection) -> Self {
        Self {
            retry: RetryPolicy::new(
                s.max_attempts,
                Duration::from_millis(s.base_delay_ms),
                Duration::from_millis(s.max_delay_ms),
            ),
            circuit: CircuitConfig {
                failure_threshold: s.failure_threshold,
                cool_down: Duration::from_secs(s.cool_down_secs),
            },
            call_timeout: Duration::from_secs(s.call_timeout_secs),
        }
    }
}

impl From<&CompletionSection> for CompletionConfig {
    fn from(s: &CompletionSection) -> Self {
        Self {
            max_steps: s.max_steps,
            stuck_window: s.stuck_window,
            stuck_failures: s.stuck_failures,
            clarification_markers: s.clarification_markers.clone(),
        }
    }
}

impl From<&OrchestratorSection> for OrchestratorConfig {
    fn from(s: &OrchestratorSection) -> Self {
        let execution_mode = match s.execution_mode.to_lowercase().as_str() {
            "parallel" => ExecutionMode::Parallel {
                max_concurrency: s.max_concurrency.max(1),
            },
            "sequential" => ExecutionMode::Sequential,
            other => {
                tracing::warn!("Unknown execution_mode '{}', using sequential", other);
                ExecutionMode::Sequential
            }
        };
        Self {
            max_iterations: s.max_iterations.max(1),
            stream_buffer: s.stream_buffer.max(1),
            execution_mode,
            session_ttl: Duration::from_secs(s.session_ttl_secs),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
