use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

use super::{ExecutionError, ExecutionOutput, ExecutionPort};
use crate::registry::{BlockDefinition, BlockNumber};

/// Stand-in for the remote collaborator: waits, then reports success
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    delay: Duration,
    tokens_per_block: u64,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            tokens_per_block: 1000,
        }
    }
}

impl SimulatedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn with_tokens_per_block(mut self, tokens: u64) -> Self {
        self.tokens_per_block = tokens;
        self
    }
}

#[async_trait]
impl ExecutionPort for SimulatedExecutor {
    async fn execute(&self, block: &BlockDefinition) -> Result<ExecutionOutput, ExecutionError> {
        info!(
            "SimulatedExecutor: running block {} ({})",
            block.block_number, block.name
        );
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        Ok(ExecutionOutput::succeeded()
            .with_output(format!("Simulated output for block {}", block.block_number))
            .with_tokens(self.tokens_per_block / 2, self.tokens_per_block - self.tokens_per_block / 2)
            .with_duration(started.elapsed()))
    }

    fn name(&self) -> String {
        "simulated".to_string()
    }
}

/// One scripted response
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Succeed,
    /// The block ran and reported failure
    Fail(String),
    /// The call itself broke with a retryable remote error
    Error(String),
    RateLimited,
}

/// Test double that replays per-block outcome scripts and records call order.
///
/// Blocks without a script, or whose script is used up, succeed.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<BlockNumber, VecDeque<ScriptedOutcome>>>,
    calls: Mutex<Vec<BlockNumber>>,
    delay: Duration,
    tokens: u64,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, block: BlockNumber, outcomes: Vec<ScriptedOutcome>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(block, outcomes.into());
        }
        self
    }

    /// Shorthand for a block whose first execution reports failure
    pub fn fail(self, block: BlockNumber) -> Self {
        self.script(block, vec![ScriptedOutcome::Fail(format!("block {block} failed"))])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    /// Block numbers in the order they were executed
    pub fn calls(&self) -> Vec<BlockNumber> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_outcome(&self, block: BlockNumber) -> ScriptedOutcome {
        self.scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&block).and_then(|q| q.pop_front()))
            .unwrap_or(ScriptedOutcome::Succeed)
    }
}

#[async_trait]
impl ExecutionPort for ScriptedExecutor {
    async fn execute(&self, block: &BlockDefinition) -> Result<ExecutionOutput, ExecutionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(block.block_number);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.next_outcome(block.block_number) {
            ScriptedOutcome::Succeed => Ok(ExecutionOutput::succeeded()
                .with_output(format!("block {} done", block.block_number))
                .with_tokens(self.tokens, 0)
                .with_duration(self.delay)),
            ScriptedOutcome::Fail(message) => Ok(ExecutionOutput::failed(message)),
            ScriptedOutcome::Error(message) => Err(ExecutionError::Remote(message)),
            ScriptedOutcome::RateLimited => Err(ExecutionError::RateLimited { retry_after: None }),
        }
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}
