//! 重试策略：指数退避（base * 2^(n-1)，上限 max_delay），max_attempts 为总调用次数（含首次）

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::OrchestrationError;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_secs(5))
    }
}

impl RetryPolicy {
    /// max_attempts 至少为 1
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 还可以继续尝试吗：错误可重试且未达到次数上限
    pub fn should_retry(&self, attempt: u32, error: &OrchestrationError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// 按策略重复执行 op；退避等待期间响应取消
    pub async fn retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, OrchestrationError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    backoff_sleep(delay, cancel).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// 退避等待，可被取消打断
pub(crate) async fn backoff_sleep(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), OrchestrationError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(OrchestrationError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
