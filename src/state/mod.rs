//! Persisted run state
//!
//! `RunState` is the single record the scheduler mutates. The three membership sets
//! are explicit, and the terminal part of `status` is always recomputed from them
//! by [`derive_status`] rather than being set on its own.

pub mod store;

pub use store::{
    write_atomic, JsonFileStateStore, MemoryStateStore, RunStateStore, SledStateStore,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::registry::{BlockNumber, Registry};

/// Overall status of a cascade run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CascadeStatus {
    Initialized,
    Running,
    /// Nothing is ready and nothing has failed: unmet or cyclic dependencies.
    Waiting,
    /// Nothing is ready and at least one block has failed.
    Blocked,
    Complete,
}

impl CascadeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeStatus::Initialized => "INITIALIZED",
            CascadeStatus::Running => "RUNNING",
            CascadeStatus::Waiting => "WAITING",
            CascadeStatus::Blocked => "BLOCKED",
            CascadeStatus::Complete => "COMPLETE",
        }
    }

    /// Only `Complete` ends a run for good; `Waiting` and `Blocked` can clear.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CascadeStatus::Complete)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, CascadeStatus::Initialized | CascadeStatus::Running)
    }
}

impl fmt::Display for CascadeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable progress record for one cascade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub cascade_id: String,
    pub started_at: DateTime<Utc>,
    pub current_block: Option<BlockNumber>,
    pub blocks_completed: BTreeSet<BlockNumber>,
    pub blocks_in_progress: BTreeSet<BlockNumber>,
    pub blocks_failed: BTreeSet<BlockNumber>,
    pub status: CascadeStatus,
    pub iteration: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub last_block_output: Option<String>,
    #[serde(default)]
    pub total_tokens_used: u64,
}

impl RunState {
    pub fn new<S: Into<String>>(cascade_id: S) -> Self {
        let now = Utc::now();
        Self {
            cascade_id: cascade_id.into(),
            started_at: now,
            current_block: None,
            blocks_completed: BTreeSet::new(),
            blocks_in_progress: BTreeSet::new(),
            blocks_failed: BTreeSet::new(),
            status: CascadeStatus::Initialized,
            iteration: 0,
            last_updated: now,
            last_block_output: None,
            total_tokens_used: 0,
        }
    }

    pub fn is_completed(&self, block: BlockNumber) -> bool {
        self.blocks_completed.contains(&block)
    }

    pub fn is_failed(&self, block: BlockNumber) -> bool {
        self.blocks_failed.contains(&block)
    }

    pub fn mark_in_progress(&mut self, block: BlockNumber) {
        self.blocks_in_progress.insert(block);
        self.status = CascadeStatus::Running;
    }

    /// Move a block from in-progress to completed and count the iteration.
    pub fn mark_completed(&mut self, block: BlockNumber) {
        self.blocks_in_progress.remove(&block);
        self.blocks_failed.remove(&block);
        self.blocks_completed.insert(block);
        self.current_block = Some(block);
        self.iteration += 1;
    }

    /// Move a block from in-progress to failed and count the iteration.
    pub fn mark_failed(&mut self, block: BlockNumber) {
        self.blocks_in_progress.remove(&block);
        if self.blocks_completed.contains(&block) {
            tracing::warn!(
                "RunState: block {} reported failed after completing; keeping it completed",
                block
            );
        } else {
            self.blocks_failed.insert(block);
        }
        self.iteration += 1;
    }

    /// Remove a block from the failed set so a later tick may select it again.
    pub fn clear_failure(&mut self, block: BlockNumber) -> bool {
        self.blocks_failed.remove(&block)
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Completed and failed sets never overlap.
    pub fn is_consistent(&self) -> bool {
        self.blocks_completed.is_disjoint(&self.blocks_failed)
    }
}

/// Status implied by the membership sets and the registry.
///
/// `Running` while some block can still be selected; otherwise one of the three
/// stop statuses. Failed entries that are not in the registry are ignored.
pub fn derive_status(registry: &Registry, state: &RunState) -> CascadeStatus {
    if registry
        .next_ready(&state.blocks_completed, &state.blocks_failed)
        .is_some()
    {
        return CascadeStatus::Running;
    }
    if registry
        .block_numbers()
        .all(|n| state.blocks_completed.contains(&n))
    {
        CascadeStatus::Complete
    } else if state.blocks_failed.iter().any(|&n| registry.contains(n)) {
        CascadeStatus::Blocked
    } else {
        CascadeStatus::Waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BlockDefinition;

    fn registry(edges: &[(BlockNumber, &[BlockNumber])]) -> Registry {
        Registry::new_allowing_cycles(
            edges
                .iter()
                .map(|(n, deps)| BlockDefinition::new(format!("b{n}"), *n, deps.iter().copied()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&CascadeStatus::Blocked).unwrap();
        assert_eq!(json, "\"BLOCKED\"");
        let back: CascadeStatus = serde_json::from_str("\"WAITING\"").unwrap();
        assert_eq!(back, CascadeStatus::Waiting);
    }

    #[test]
    fn test_run_state_uses_camel_case_keys() {
        let state = RunState::new("phase-1b");
        let value = serde_json::to_value(&state).unwrap();
        for key in [
            "cascadeId",
            "startedAt",
            "currentBlock",
            "blocksCompleted",
            "blocksInProgress",
            "blocksFailed",
            "status",
            "iteration",
            "lastUpdated",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["status"], "INITIALIZED");
    }

    #[test]
    fn test_transitions_keep_sets_disjoint() {
        let mut state = RunState::new("c");
        state.mark_in_progress(1);
        assert_eq!(state.status, CascadeStatus::Running);
        state.mark_completed(1);
        state.mark_in_progress(2);
        state.mark_failed(2);
        state.mark_failed(1);

        assert!(state.is_consistent());
        assert!(state.is_completed(1));
        assert!(state.is_failed(2));
        assert!(state.blocks_in_progress.is_empty());
        assert_eq!(state.iteration, 3);
        assert_eq!(state.current_block, Some(1));
    }

    #[test]
    fn test_derive_status() {
        let reg = registry(&[(1, &[]), (2, &[1]), (4, &[2])]);
        let mut state = RunState::new("c");
        assert_eq!(derive_status(&reg, &state), CascadeStatus::Running);

        state.blocks_completed.insert(1);
        state.blocks_failed.insert(2);
        assert_eq!(derive_status(&reg, &state), CascadeStatus::Blocked);

        state.clear_failure(2);
        state.blocks_completed.extend([2, 4]);
        assert_eq!(derive_status(&reg, &state), CascadeStatus::Complete);
    }

    #[test]
    fn test_cycle_derives_waiting() {
        let reg = registry(&[(1, &[2]), (2, &[1])]);
        let state = RunState::new("c");
        assert_eq!(derive_status(&reg, &state), CascadeStatus::Waiting);
    }

    #[test]
    fn test_unknown_failed_block_does_not_block() {
        let reg = registry(&[(1, &[2]), (2, &[1])]);
        let mut state = RunState::new("c");
        state.blocks_failed.insert(99);
        assert_eq!(derive_status(&reg, &state), CascadeStatus::Waiting);
    }
}
