use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{ExecutionError, ExecutionOutput, ExecutionPort};
use crate::core::errors::{CascadeError, Result};
use crate::registry::BlockDefinition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = match self {
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64 * multiplier.powf(attempt as f64)).round();
                (delay as u64).min(*max_delay_ms)
            }
            RetryStrategy::Linear { delay_ms } => *delay_ms,
            RetryStrategy::Immediate => 0,
        };
        Duration::from_millis(millis)
    }
}

/// How a single block execution is bounded and retried.
///
/// The scheduler never re-runs a failed block; this policy only decides how hard
/// one execution tries before its failure is recorded. The default is a single
/// attempt with no timeout, pausing briefly when the remote side rate-limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    /// Per-attempt timeout; `None` waits forever
    pub timeout_secs: Option<u64>,
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub retry_strategy: RetryStrategy,
    /// Pause after a rate-limit response that carries no retry hint
    pub rate_limit_pause_ms: u64,
    /// Add up to 10% random jitter to retry delays
    pub jitter: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            max_attempts: 1,
            retry_strategy: RetryStrategy::default(),
            rate_limit_pause_ms: 5_000,
            jitter: false,
        }
    }
}

impl ExecutionPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn rate_limit_pause(&self) -> Duration {
        Duration::from_millis(self.rate_limit_pause_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CascadeError::configuration_field(
                "max_attempts must be greater than 0",
                "execution.max_attempts",
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(CascadeError::configuration_field(
                "timeout_secs must be greater than 0",
                "execution.timeout_secs",
            ));
        }
        if let RetryStrategy::Exponential { multiplier, .. } = self.retry_strategy {
            if multiplier < 1.0 {
                return Err(CascadeError::configuration_field(
                    "multiplier must be >= 1.0",
                    "execution.retry_strategy.multiplier",
                ));
            }
        }
        Ok(())
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let delay = self.retry_strategy.delay(attempt);
        if self.jitter && !delay.is_zero() {
            let extra = delay.as_millis() as u64 / 10;
            delay + Duration::from_millis(fastrand::u64(0..=extra))
        } else {
            delay
        }
    }
}

/// Wraps a port with an [`ExecutionPolicy`]
pub struct PolicyExecutor {
    inner: Arc<dyn ExecutionPort>,
    policy: ExecutionPolicy,
}

impl PolicyExecutor {
    pub fn new(inner: Arc<dyn ExecutionPort>, policy: ExecutionPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    async fn attempt(&self, block: &BlockDefinition) -> std::result::Result<ExecutionOutput, ExecutionError> {
        match self.policy.timeout() {
            Some(limit) => match tokio::time::timeout(limit, self.inner.execute(block)).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::Timeout(limit)),
            },
            None => self.inner.execute(block).await,
        }
    }
}

#[async_trait]
impl ExecutionPort for PolicyExecutor {
    async fn execute(&self, block: &BlockDefinition) -> std::result::Result<ExecutionOutput, ExecutionError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let error = match self.attempt(block).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };

            if let ExecutionError::RateLimited { retry_after } = &error {
                let pause = retry_after.unwrap_or_else(|| self.policy.rate_limit_pause());
                warn!(
                    "PolicyExecutor: block {} rate limited, pausing {:?}",
                    block.block_number, pause
                );
                tokio::time::sleep(pause).await;
            }

            if attempt >= self.policy.max_attempts || !error.is_retryable() {
                return Err(error);
            }

            let delay = self.policy.retry_delay(attempt - 1);
            info!(
                "PolicyExecutor: block {} attempt {}/{} failed ({}); retrying in {:?}",
                block.block_number, attempt, self.policy.max_attempts, error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn name(&self) -> String {
        format!("{}+policy", self.inner.name())
    }
}
