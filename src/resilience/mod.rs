//! 弹性策略：熔断 + 超时 + 重试 + 回退
//!
//! 每个逻辑依赖（工具/函数名、"planner"、"evaluator"、"parameter-generator"）各有一个熔断器，
//! 由 ResiliencePolicy 按 key 懒创建并在整个编排器内共享。单次调用顺序：熔断许可 → 超时 → 记录结果 → 按需退避重试。

pub mod circuit;
pub mod retry;
pub mod timeout;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::core::OrchestrationError;
use retry::backoff_sleep;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use retry::RetryPolicy;
pub use timeout::{fallback, with_timeout};

/// 弹性配置
#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub circuit: CircuitConfig,
    /// 单次调用超时
    pub call_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// 按依赖维护熔断器并组合重试/超时
#[derive(Debug, Default)]
pub struct ResiliencePolicy {
    config: ResilienceConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl ResiliencePolicy {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// 获取（必要时创建）某依赖的熔断器
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.circuit.clone())))
            .clone()
    }

    pub fn circuit_state(&self, key: &str) -> CircuitState {
        self.breakers
            .get(key)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// 带重试执行；op 每次尝试收到一个子取消令牌（超时会取消它）
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, OrchestrationError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
    {
        let breaker = self.breaker(key);
        let retry = &self.config.retry;
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }
            match self.guarded(&breaker, cancel, &mut op).await {
                Ok(value) => return Ok(value),
                Err(e) if retry.should_retry(attempt, &e) => {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        key,
                        attempt,
                        max_attempts = retry.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Guarded call failed, retrying"
                    );
                    backoff_sleep(delay, cancel).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 单次执行（不重试），仍经过熔断与超时
    pub async fn execute_once<T, F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, OrchestrationError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
    {
        let breaker = self.breaker(key);
        self.guarded(&breaker, cancel, &mut op).await
    }

    async fn guarded<T, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        op: &mut F,
    ) -> Result<T, OrchestrationError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
    {
        breaker.try_acquire()?;
        let res = with_timeout(self.config.call_timeout, cancel, |child| op(child)).await;
        breaker.record(&res);
        res
    }
}
