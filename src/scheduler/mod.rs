//! Dependency-aware, one-block-at-a-time scheduler
//!
//! Each tick picks the lowest-numbered block that is neither completed nor failed
//! and whose dependencies are all completed, runs it through the execution port,
//! and records the result. When no block can be picked the tick settles the run on
//! `Complete`, `Blocked` or `Waiting` and tells the driver to stop.
//!
//! The scheduler is the only writer of [`RunState`]. Every transition is saved
//! through the [`RunStateStore`] before the next step; a failed save is logged and
//! the in-memory state stays authoritative.

pub mod events;

pub use events::{
    BufferingEventSink, CascadeEvent, CascadeEventEnvelope, EventSink, LoggingEventSink,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::errors::{CascadeError, Result};
use crate::execution::ExecutionPort;
use crate::health::{HealthOutcome, HealthTracker, DEFAULT_START_WORKLOAD};
use crate::registry::{BlockDefinition, BlockNumber, Registry};
use crate::state::{derive_status, CascadeStatus, RunState, RunStateStore};

/// What to do with blocks found in progress when a saved run is reopened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Forget the interrupted attempt; the block is selected again
    #[default]
    Rerun,
    /// Record the interrupted attempt as a failure
    MarkFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pause between ticks in `run_until_stopped`
    pub tick_delay_ms: u64,
    /// Upper bound on ticks for a full run; `None` runs until the cascade stops
    pub max_ticks: Option<u64>,
    /// Stop the run right after a block fails instead of trying the next one
    pub halt_on_failure: bool,
    pub recovery_mode: RecoveryMode,
    /// Workload reported to the health tracker while a block executes
    pub start_workload: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_delay_ms: 1_000,
            max_ticks: None,
            halt_on_failure: false,
            recovery_mode: RecoveryMode::Rerun,
            start_workload: DEFAULT_START_WORKLOAD,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_delay(&self) -> Duration {
        Duration::from_millis(self.tick_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_workload > 100 {
            return Err(CascadeError::configuration_field(
                format!("start_workload must be 0-100, got {}", self.start_workload),
                "scheduler.start_workload",
            ));
        }
        Ok(())
    }
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Completed {
        block: BlockNumber,
        tokens_used: u64,
    },
    Failed {
        block: BlockNumber,
        error: String,
    },
    /// A block failed and `halt_on_failure` is set
    Halted {
        block: BlockNumber,
        error: String,
    },
    /// Nothing could be selected; `status` is where the run settled
    Stopped { status: CascadeStatus },
}

impl TickOutcome {
    pub fn should_continue(&self) -> bool {
        matches!(self, TickOutcome::Completed { .. } | TickOutcome::Failed { .. })
    }

    pub fn block(&self) -> Option<BlockNumber> {
        match self {
            TickOutcome::Completed { block, .. }
            | TickOutcome::Failed { block, .. }
            | TickOutcome::Halted { block, .. } => Some(*block),
            TickOutcome::Stopped { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No block could be selected
    Settled,
    MaxTicks,
    Halted { block: BlockNumber },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub status: CascadeStatus,
    pub stop_reason: StopReason,
    pub blocks_completed: usize,
    pub blocks_failed: usize,
    pub total_tokens_used: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.stop_reason {
            StopReason::Settled => "settled".to_string(),
            StopReason::MaxTicks => "max ticks reached".to_string(),
            StopReason::Halted { block } => format!("halted after block {block} failed"),
        };
        write!(
            f,
            "status {} after {} ticks ({}): {} completed, {} failed, {} tokens",
            self.status,
            self.ticks,
            reason,
            self.blocks_completed,
            self.blocks_failed,
            self.total_tokens_used
        )
    }
}

pub struct Scheduler {
    registry: Arc<Registry>,
    store: Arc<dyn RunStateStore>,
    executor: Arc<dyn ExecutionPort>,
    health: Arc<HealthTracker>,
    config: SchedulerConfig,
    state: RunState,
    event_sink: Option<Arc<dyn EventSink>>,
    persistence_degraded: bool,
    session_id: String,
}

impl Scheduler {
    /// Resume the run saved in `store`, or start a new one named `cascade_id`.
    ///
    /// A store that exists but cannot be read is an error: starting fresh would
    /// overwrite the progress it holds. Move or repair it before reopening.
    pub async fn open(
        cascade_id: &str,
        registry: Arc<Registry>,
        store: Arc<dyn RunStateStore>,
        executor: Arc<dyn ExecutionPort>,
        health: Arc<HealthTracker>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let loaded = store.load().await.map_err(|e| {
            error!(
                "Scheduler: could not load run state from {}: {}",
                store.describe(),
                e
            );
            e
        })?;

        let resumed = loaded.is_some();
        let state = match loaded {
            Some(state) => {
                if state.cascade_id != cascade_id {
                    warn!(
                        "Scheduler: stored run belongs to cascade '{}', resuming it instead of '{}'",
                        state.cascade_id, cascade_id
                    );
                }
                info!(
                    "Scheduler: resuming cascade '{}' at iteration {} ({} completed, {} failed)",
                    state.cascade_id,
                    state.iteration,
                    state.blocks_completed.len(),
                    state.blocks_failed.len()
                );
                state
            }
            None => {
                info!(
                    "Scheduler: starting cascade '{}' with {} blocks",
                    cascade_id,
                    registry.len()
                );
                RunState::new(cascade_id)
            }
        };

        let mut scheduler = Self {
            registry,
            store,
            executor,
            health,
            config,
            state,
            event_sink: None,
            persistence_degraded: false,
            session_id: Uuid::new_v4().to_string(),
        };
        debug!("Scheduler: session {}", scheduler.session_id);

        if scheduler.recover() || !resumed {
            scheduler.persist().await;
        }
        Ok(scheduler)
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// True while the stored state lags behind the in-memory one
    pub fn is_persistence_degraded(&self) -> bool {
        self.persistence_degraded
    }

    /// The block the next tick would run, if any
    pub fn select_next(&self) -> Option<&BlockDefinition> {
        self.registry
            .next_ready(&self.state.blocks_completed, &self.state.blocks_failed)
    }

    /// Run one scheduling step.
    pub async fn tick(&mut self) -> TickOutcome {
        let Some(block) = self.select_next().cloned() else {
            return self.settle().await;
        };
        let number = block.block_number;

        info!(
            "Scheduler: executing block {} ({}, weight {}) via {}",
            number,
            block.name,
            block.weight,
            self.executor.name()
        );
        let before = self.state.status;
        self.state.mark_in_progress(number);
        self.status_changed(before);
        self.persist().await;
        self.emit(CascadeEvent::BlockStarted {
            block: number,
            id: block.id.clone(),
        });
        self.health.set_cascade_active(true).await;
        self.health
            .record(
                &block,
                HealthOutcome::Started,
                Some(self.config.start_workload),
                0,
            )
            .await;

        let failure = match self.executor.execute(&block).await {
            Ok(output) if output.success => {
                let tokens = output.tokens_used.unwrap_or(0);
                self.state.mark_completed(number);
                self.state.total_tokens_used += tokens;
                if let Some(text) = output.truncated_output() {
                    self.state.last_block_output = Some(text);
                }

                info!(
                    "Scheduler: block {} complete in {:?} ({} tokens)",
                    number, output.duration, tokens
                );
                self.emit(CascadeEvent::BlockCompleted {
                    block: number,
                    duration_ms: output.duration.as_millis() as u64,
                    tokens_used: tokens,
                });
                self.refresh_status();
                self.persist().await;
                self.health
                    .record(&block, HealthOutcome::Succeeded, None, tokens)
                    .await;
                return TickOutcome::Completed {
                    block: number,
                    tokens_used: tokens,
                };
            }
            Ok(output) => output
                .error_message
                .unwrap_or_else(|| "block reported failure".to_string()),
            Err(e) => e.to_string(),
        };

        self.state.mark_failed(number);
        error!("Scheduler: block {} failed: {}", number, failure);
        self.emit(CascadeEvent::BlockFailed {
            block: number,
            error: failure.clone(),
        });
        self.refresh_status();
        self.persist().await;
        self.health
            .record(&block, HealthOutcome::Failed, None, 0)
            .await;

        if self.config.halt_on_failure {
            TickOutcome::Halted {
                block: number,
                error: failure,
            }
        } else {
            TickOutcome::Failed {
                block: number,
                error: failure,
            }
        }
    }

    /// Tick until the run stops or `max_ticks` ticks have run.
    pub async fn run_until_stopped(&mut self, max_ticks: Option<u64>) -> RunSummary {
        info!(
            "Scheduler: running cascade '{}' (max ticks: {})",
            self.state.cascade_id,
            max_ticks.map_or_else(|| "unlimited".to_string(), |m| m.to_string())
        );

        let mut ticks = 0;
        let stop_reason = loop {
            if max_ticks.is_some_and(|max| ticks >= max) {
                info!("Scheduler: stopped after max ticks ({})", ticks);
                break StopReason::MaxTicks;
            }
            ticks += 1;
            debug!("Scheduler: tick {} (iteration {})", ticks, self.state.iteration);

            let outcome = self.tick().await;
            match outcome {
                TickOutcome::Stopped { .. } => break StopReason::Settled,
                TickOutcome::Halted { block, .. } => break StopReason::Halted { block },
                TickOutcome::Completed { .. } | TickOutcome::Failed { .. } => {}
            }

            let delay = self.config.tick_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        };

        let summary = RunSummary {
            ticks,
            status: self.state.status,
            stop_reason,
            blocks_completed: self.state.blocks_completed.len(),
            blocks_failed: self.state.blocks_failed.len(),
            total_tokens_used: self.state.total_tokens_used,
        };
        info!("Scheduler: {}", summary);
        summary
    }

    /// Forget a recorded failure so the block can be selected again.
    ///
    /// Returns false when the block was not in the failed set.
    pub async fn clear_failure(&mut self, block: BlockNumber) -> bool {
        if !self.state.clear_failure(block) {
            warn!("Scheduler: block {} is not marked failed", block);
            return false;
        }
        info!("Scheduler: cleared failure of block {}", block);
        if self.state.status != CascadeStatus::Initialized {
            self.refresh_status();
        }
        self.persist().await;
        true
    }

    /// Undo what an interrupted previous process left behind. Returns true when
    /// the state changed.
    fn recover(&mut self) -> bool {
        let mut changed = false;

        let overlap: Vec<BlockNumber> = self
            .state
            .blocks_completed
            .intersection(&self.state.blocks_failed)
            .copied()
            .collect();
        for block in overlap {
            warn!(
                "Scheduler: block {} stored as both completed and failed; keeping it completed",
                block
            );
            self.state.blocks_failed.remove(&block);
            changed = true;
        }

        let interrupted: Vec<BlockNumber> = std::mem::take(&mut self.state.blocks_in_progress)
            .into_iter()
            .collect();
        for block in interrupted {
            changed = true;
            if self.state.blocks_completed.contains(&block) {
                continue;
            }
            match self.config.recovery_mode {
                RecoveryMode::Rerun => {
                    warn!(
                        "Scheduler: block {} was interrupted mid-execution; it will run again",
                        block
                    );
                }
                RecoveryMode::MarkFailed => {
                    warn!(
                        "Scheduler: block {} was interrupted mid-execution; marking it failed",
                        block
                    );
                    self.state.blocks_failed.insert(block);
                }
            }
        }

        if changed && self.state.status != CascadeStatus::Initialized {
            self.refresh_status();
        }
        changed
    }

    /// No candidate: settle on the derived status and persist it.
    async fn settle(&mut self) -> TickOutcome {
        let before = self.state.status;
        let status = derive_status(&self.registry, &self.state);
        self.state.status = status;
        self.status_changed(before);
        self.persist().await;
        self.health.set_cascade_active(false).await;

        match status {
            CascadeStatus::Complete => info!(
                "Scheduler: cascade complete, all {} blocks executed",
                self.registry.len()
            ),
            CascadeStatus::Blocked => warn!(
                "Scheduler: cascade blocked, failed blocks {:?} prevent progress",
                self.state.blocks_failed
            ),
            _ => {
                warn!("Scheduler: cascade waiting, no block has its dependencies met");
                for cycle in self.registry.cycles() {
                    warn!("Scheduler: registry defect, dependency cycle {:?}", cycle);
                }
            }
        }
        TickOutcome::Stopped { status }
    }

    fn refresh_status(&mut self) {
        let before = self.state.status;
        self.state.status = derive_status(&self.registry, &self.state);
        self.status_changed(before);
    }

    fn status_changed(&self, before: CascadeStatus) {
        if before != self.state.status {
            debug!("Scheduler: status {} -> {}", before, self.state.status);
            self.emit(CascadeEvent::StatusChanged {
                from: before,
                to: self.state.status,
            });
        }
    }

    async fn persist(&mut self) {
        self.state.touch();
        match self.store.save(&self.state).await {
            Ok(()) => {
                if self.persistence_degraded {
                    info!("Scheduler: run state saved to {} again", self.store.describe());
                    self.persistence_degraded = false;
                    self.emit(CascadeEvent::PersistenceRestored);
                }
            }
            Err(e) => {
                error!(
                    "Scheduler: failed to save run state to {}: {}",
                    self.store.describe(),
                    e
                );
                if !self.persistence_degraded {
                    self.persistence_degraded = true;
                    self.emit(CascadeEvent::PersistenceDegraded {
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    fn emit(&self, event: CascadeEvent) {
        if let Some(sink) = &self.event_sink {
            let envelope = CascadeEventEnvelope {
                sequence: events::next_sequence(),
                cascade_id: self.state.cascade_id.clone(),
                session_id: self.session_id.clone(),
                timestamp: events::now_ms(),
                event,
            };
            sink.emit(&envelope);
        }
    }
}
