//! Execution port
//!
//! The boundary to whatever actually performs a block's work. The scheduler only
//! sees success or failure plus a little metadata; everything behind the port is
//! an opaque, potentially slow, potentially failing call.

pub mod policy;
pub mod simulated;

pub use policy::{ExecutionPolicy, PolicyExecutor, RetryStrategy};
pub use simulated::{ScriptedExecutor, ScriptedOutcome, SimulatedExecutor};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::registry::BlockDefinition;

/// Longest output kept in run state
pub const MAX_RECORDED_OUTPUT: usize = 500;

/// What the port reports back for one block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    pub success: bool,
    pub output: Option<String>,
    pub tokens_used: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub error_message: Option<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl ExecutionOutput {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_output<S: Into<String>>(mut self, output: S) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = Some(input);
        self.output_tokens = Some(output);
        self.tokens_used = Some(input + output);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Output cut to [`MAX_RECORDED_OUTPUT`] characters
    pub fn truncated_output(&self) -> Option<String> {
        self.output
            .as_ref()
            .map(|o| o.chars().take(MAX_RECORDED_OUTPUT).collect())
    }
}

/// Port-level failures, distinct from a block that ran and reported `success: false`
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Rate limited by remote service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Remote(_) | ExecutionError::RateLimited { .. } | ExecutionError::Timeout(_)
        )
    }
}

/// The external collaborator that performs a block's work
#[async_trait]
pub trait ExecutionPort: Send + Sync {
    /// Executes one block.
    ///
    /// # Arguments
    /// - `block`: The block to run.
    ///
    /// # Returns
    /// An `ExecutionOutput` whose `success` flag decides the block's fate, or an
    /// `ExecutionError` when the call itself broke. Both failure shapes are
    /// recorded by the scheduler the same way.
    async fn execute(&self, block: &BlockDefinition) -> Result<ExecutionOutput, ExecutionError>;

    /// Short name for logs
    fn name(&self) -> String {
        "execution-port".to_string()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
