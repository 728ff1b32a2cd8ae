//! 超时与回退包装

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::OrchestrationError;

/// 在 duration 内完成 op，否则返回 Timeout 并取消传给 op 的子令牌。
///
/// 父令牌在调用开始前已取消时直接返回 Cancelled；调用开始后的取消只通过子令牌通知 op，
/// 已开始的调用仍等待其结束（上限为 duration）。
pub async fn with_timeout<T, F, Fut>(
    duration: Duration,
    parent: &CancellationToken,
    op: F,
) -> Result<T, OrchestrationError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, OrchestrationError>>,
{
    if parent.is_cancelled() {
        return Err(OrchestrationError::Cancelled);
    }
    let child = parent.child_token();
    match tokio::time::timeout(duration, op(child.clone())).await {
        Ok(inner) => inner,
        Err(_) => {
            child.cancel();
            Err(OrchestrationError::Timeout(duration.as_millis() as u64))
        }
    }
}

/// 主操作失败（取消除外）时执行一次备选操作；备选也失败则返回备选的错误
pub async fn fallback<T, P, F, Fut>(primary: P, alternate: F) -> Result<T, OrchestrationError>
where
    P: Future<Output = Result<T, OrchestrationError>>,
    F: FnOnce(OrchestrationError) -> Fut,
    Fut: Future<Output = Result<T, OrchestrationError>>,
{
    match primary.await {
        Ok(value) => Ok(value),
        Err(OrchestrationError::Cancelled) => Err(OrchestrationError::Cancelled),
        Err(e) => {
            tracing::info!(error = %e, "Primary failed, running fallback");
            alternate(e).await
        }
    }
}
