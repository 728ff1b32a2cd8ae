//! 熔断器
//!
//! Closed：调用放行，失败计数，任一成功清零；Open：直接拒绝（CircuitOpen），不发起调用；
//! HalfOpen：冷却期过后自动进入，只放行一个探测调用，成功则关闭，失败则重新打开并重新计时。
//! 所有状态转换在同一把锁内完成；每个逻辑依赖一个实例。

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::OrchestrationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Closed 状态下连续失败多少次后打开
    pub failure_threshold: u32,
    /// 打开后多久进入 HalfOpen
    pub cool_down: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    /// HalfOpen 时探测调用是否已放行
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前状态；Open 且冷却期已过时报告 HalfOpen（实际转换发生在下一次 try_acquire）
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Open if self.cool_down_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).opened_at
    }

    fn cool_down_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.cool_down)
            .unwrap_or(true)
    }

    /// 申请一次调用许可；拒绝时返回 CircuitOpen
    pub fn try_acquire(&self) -> Result<(), OrchestrationError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.cool_down_elapsed(&inner) {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(breaker = %self.name, "Circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(OrchestrationError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(OrchestrationError::CircuitOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                tracing::info!(breaker = %self.name, "Circuit breaker closed");
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                tracing::warn!(breaker = %self.name, "Probe failed, circuit breaker reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// 释放探测许可但不记录结果（探测调用被取消时使用）
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// 记录一次调用结果：只有执行失败与超时计入失败，取消只释放探测许可
    pub fn record<T>(&self, result: &Result<T, OrchestrationError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.counts_as_failure() => self.record_failure(),
            Err(_) => self.release_probe(),
        }
    }

    /// 经过熔断器执行一次操作
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, OrchestrationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
    {
        self.try_acquire()?;
        let result = op().await;
        self.record(&result);
        result
    }
}
