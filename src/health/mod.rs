//! Per-block health and workload tracking
//!
//! One [`AgentHealth`] entry per block, created the first time the block sees an
//! execution event. The [`HealthSummary`] is recomputed from the whole collection
//! on every update. Nothing here feeds back into scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::errors::{CascadeError, Result};
use crate::registry::{BlockDefinition, BlockNumber};
use crate::state::write_atomic;

/// Workload assigned when an execution starts without a hint
pub const DEFAULT_START_WORKLOAD: u8 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Loaded,
    Overloaded,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Loaded => "loaded",
            AgentStatus::Overloaded => "overloaded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthFlag {
    Healthy,
    Unhealthy,
}

/// Workload bucket boundaries.
///
/// `workload < idle` is idle, `workload >= overloaded` is overloaded, anything
/// from `loaded` up to `overloaded` is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub idle: u8,
    pub loaded: u8,
    pub overloaded: u8,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            idle: 10,
            loaded: 10,
            overloaded: 70,
        }
    }
}

impl HealthThresholds {
    pub fn classify(&self, workload: u8) -> AgentStatus {
        if workload >= self.overloaded {
            AgentStatus::Overloaded
        } else if workload >= self.loaded && workload >= self.idle {
            AgentStatus::Loaded
        } else {
            AgentStatus::Idle
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle > self.loaded || self.loaded >= self.overloaded || self.overloaded > 100 {
            return Err(CascadeError::configuration_field(
                format!(
                    "health thresholds must satisfy idle <= loaded < overloaded <= 100 (got {}/{}/{})",
                    self.idle, self.loaded, self.overloaded
                ),
                "health.thresholds",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub agent_id: String,
    pub name: String,
    pub block: BlockNumber,
    pub status: AgentStatus,
    pub workload: u8,
    pub health: HealthFlag,
    pub assigned_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub current_task: Option<String>,
    pub token_usage: u64,
    pub last_activity: DateTime<Utc>,
}

impl AgentHealth {
    fn new(block: &BlockDefinition) -> Self {
        Self {
            agent_id: block.id.clone(),
            name: block.name.clone(),
            block: block.block_number,
            status: AgentStatus::Idle,
            workload: 0,
            health: HealthFlag::Healthy,
            assigned_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            current_task: None,
            token_usage: 0,
            last_activity: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub loaded_agents: usize,
    pub overloaded_agents: usize,
    pub unhealthy_agents: usize,
    pub total_workload: u64,
    pub avg_workload: f64,
    pub max_workload: u8,
}

impl HealthSummary {
    /// Full recomputation over `agents`
    pub fn compute<'a>(agents: impl IntoIterator<Item = &'a AgentHealth>) -> Self {
        let mut summary = HealthSummary::default();
        for agent in agents {
            summary.total_agents += 1;
            match agent.status {
                AgentStatus::Idle => summary.idle_agents += 1,
                AgentStatus::Loaded => summary.loaded_agents += 1,
                AgentStatus::Overloaded => summary.overloaded_agents += 1,
            }
            if agent.health == HealthFlag::Unhealthy {
                summary.unhealthy_agents += 1;
            }
            summary.total_workload += u64::from(agent.workload);
            summary.max_workload = summary.max_workload.max(agent.workload);
        }
        if summary.total_agents > 0 {
            summary.avg_workload = summary.total_workload as f64 / summary.total_agents as f64;
        }
        summary
    }
}

/// Execution event fed to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Started,
    Succeeded,
    Failed,
}

/// Body of the health state file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRuntime {
    pub timestamp: DateTime<Utc>,
    pub cascade_active: bool,
    /// Keyed by block id
    pub agents: BTreeMap<String, AgentHealth>,
    pub summary: HealthSummary,
    pub thresholds: HealthThresholds,
}

impl HealthRuntime {
    fn new(thresholds: HealthThresholds) -> Self {
        Self {
            timestamp: Utc::now(),
            cascade_active: false,
            agents: BTreeMap::new(),
            summary: HealthSummary::default(),
            thresholds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthDocument {
    pub runtime: HealthRuntime,
}

/// Owns the health collection and, optionally, its on-disk copy
#[derive(Debug)]
pub struct HealthTracker {
    runtime: Mutex<HealthRuntime>,
    path: Option<PathBuf>,
}

impl HealthTracker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            runtime: Mutex::new(HealthRuntime::new(thresholds)),
            path: None,
        }
    }

    /// Tracker that rewrites `path` after every update, starting empty
    pub fn with_path(thresholds: HealthThresholds, path: impl Into<PathBuf>) -> Self {
        Self {
            runtime: Mutex::new(HealthRuntime::new(thresholds)),
            path: Some(path.into()),
        }
    }

    /// Tracker that continues the health file at `path`.
    ///
    /// Entries written by earlier processes are kept; `thresholds` replaces the
    /// stored ones and every status is reclassified under it. A missing file
    /// starts empty, an unreadable one is an error so it is never overwritten.
    pub async fn open(thresholds: HealthThresholds, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut runtime = HealthRuntime::new(thresholds);
        if let Some(document) = Self::read_document(&path).await? {
            runtime.agents = document.runtime.agents;
            for agent in runtime.agents.values_mut() {
                agent.status = thresholds.classify(agent.workload);
            }
            runtime.summary = HealthSummary::compute(runtime.agents.values());
            debug!(
                "HealthTracker: resumed {} entries from {}",
                runtime.agents.len(),
                path.display()
            );
        }
        Ok(Self {
            runtime: Mutex::new(runtime),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply one execution event to `block`'s entry and recompute the summary.
    ///
    /// `workload_hint` only matters for `Started`. `tokens` is added to the
    /// entry's running total.
    pub async fn record(
        &self,
        block: &BlockDefinition,
        outcome: HealthOutcome,
        workload_hint: Option<u8>,
        tokens: u64,
    ) -> HealthSummary {
        let mut runtime = self.runtime.lock().await;
        let thresholds = runtime.thresholds;
        let agent = runtime
            .agents
            .entry(block.id.clone())
            .or_insert_with(|| AgentHealth::new(block));

        match outcome {
            HealthOutcome::Started => {
                agent.workload = workload_hint.unwrap_or(DEFAULT_START_WORKLOAD).min(100);
                agent.assigned_tasks += 1;
                agent.current_task = Some(format!("block-{}", block.block_number));
            }
            HealthOutcome::Succeeded => {
                agent.workload = 0;
                agent.completed_tasks += 1;
                agent.current_task = None;
                agent.health = HealthFlag::Healthy;
            }
            HealthOutcome::Failed => {
                agent.workload = 0;
                agent.failed_tasks += 1;
                agent.current_task = None;
                agent.health = HealthFlag::Unhealthy;
            }
        }
        agent.status = thresholds.classify(agent.workload);
        agent.token_usage += tokens;
        agent.last_activity = Utc::now();

        runtime.summary = HealthSummary::compute(runtime.agents.values());
        runtime.timestamp = Utc::now();
        debug!(
            "HealthTracker: block {} {:?}, {} unhealthy of {}",
            block.block_number, outcome, runtime.summary.unhealthy_agents, runtime.summary.total_agents
        );

        self.persist(&runtime).await;
        runtime.summary.clone()
    }

    pub async fn set_cascade_active(&self, active: bool) {
        let mut runtime = self.runtime.lock().await;
        if runtime.cascade_active == active {
            return;
        }
        runtime.cascade_active = active;
        runtime.timestamp = Utc::now();
        self.persist(&runtime).await;
    }

    pub async fn summary(&self) -> HealthSummary {
        self.runtime.lock().await.summary.clone()
    }

    pub async fn snapshot(&self) -> HealthRuntime {
        self.runtime.lock().await.clone()
    }

    pub async fn agent(&self, block_id: &str) -> Option<AgentHealth> {
        self.runtime.lock().await.agents.get(block_id).cloned()
    }

    /// Read a health file written by another process; `None` if absent
    pub async fn read_document(path: &Path) -> Result<Option<HealthDocument>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CascadeError::persistence(
                    "read health state",
                    Some(path.to_path_buf()),
                    e,
                ))
            }
        };
        let document = serde_json::from_slice(&bytes).map_err(|e| {
            CascadeError::persistence("decode health state", Some(path.to_path_buf()), e)
        })?;
        Ok(Some(document))
    }

    async fn persist(&self, runtime: &HealthRuntime) {
        let Some(path) = &self.path else {
            return;
        };
        let document = HealthDocument {
            runtime: runtime.clone(),
        };
        let result = match serde_json::to_vec_pretty(&document) {
            Ok(bytes) => write_atomic(path, &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("HealthTracker: failed to write {}: {}", path.display(), e);
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn block(n: BlockNumber) -> BlockDefinition {
        BlockDefinition::new(format!("agent-{n}"), n, [])
    }

    #[test]
    fn test_threshold_buckets() {
        let t = HealthThresholds::default();
        assert_eq!(t.classify(0), AgentStatus::Idle);
        assert_eq!(t.classify(9), AgentStatus::Idle);
        assert_eq!(t.classify(10), AgentStatus::Loaded);
        assert_eq!(t.classify(69), AgentStatus::Loaded);
        assert_eq!(t.classify(70), AgentStatus::Overloaded);
        assert_eq!(t.classify(100), AgentStatus::Overloaded);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(HealthThresholds::default().validate().is_ok());
        let bad = HealthThresholds {
            idle: 10,
            loaded: 80,
            overloaded: 70,
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_start_then_success() {
        let tracker = HealthTracker::default();
        let summary = tracker.record(&block(1), HealthOutcome::Started, None, 0).await;
        assert_eq!(summary.loaded_agents, 1);
        assert_eq!(summary.max_workload, DEFAULT_START_WORKLOAD);

        let agent = tracker.agent("agent-1").await.unwrap();
        assert_eq!(agent.current_task.as_deref(), Some("block-1"));
        assert_eq!(agent.assigned_tasks, 1);

        let summary = tracker
            .record(&block(1), HealthOutcome::Succeeded, None, 1000)
            .await;
        assert_eq!(summary.idle_agents, 1);
        assert_eq!(summary.total_workload, 0);

        let agent = tracker.agent("agent-1").await.unwrap();
        assert_eq!(agent.completed_tasks, 1);
        assert_eq!(agent.token_usage, 1000);
        assert_eq!(agent.current_task, None);
    }

    #[tokio::test]
    async fn test_failure_is_sticky_until_success() {
        let tracker = HealthTracker::default();
        tracker.record(&block(2), HealthOutcome::Failed, None, 0).await;
        tracker.record(&block(2), HealthOutcome::Started, Some(80), 0).await;
        let agent = tracker.agent("agent-2").await.unwrap();
        assert_eq!(agent.health, HealthFlag::Unhealthy);
        assert_eq!(agent.status, AgentStatus::Overloaded);

        tracker.record(&block(2), HealthOutcome::Succeeded, None, 0).await;
        assert_eq!(tracker.summary().await.unhealthy_agents, 0);
    }

    #[tokio::test]
    async fn test_summary_is_recomputed_over_all_agents() {
        let tracker = HealthTracker::default();
        tracker.record(&block(1), HealthOutcome::Succeeded, None, 0).await;
        tracker.record(&block(2), HealthOutcome::Started, Some(40), 0).await;
        tracker.record(&block(3), HealthOutcome::Started, Some(90), 0).await;
        let summary = tracker.record(&block(4), HealthOutcome::Failed, None, 0).await;

        assert_eq!(
            summary,
            HealthSummary {
                total_agents: 4,
                idle_agents: 2,
                loaded_agents: 1,
                overloaded_agents: 1,
                unhealthy_agents: 1,
                total_workload: 130,
                avg_workload: 32.5,
                max_workload: 90,
            }
        );
    }

    #[tokio::test]
    async fn test_health_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-state.json");
        let tracker = HealthTracker::with_path(HealthThresholds::default(), &path);
        tracker.set_cascade_active(true).await;
        tracker.record(&block(1), HealthOutcome::Started, None, 0).await;

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["runtime"]["cascadeActive"], true);
        assert_eq!(raw["runtime"]["agents"]["agent-1"]["status"], "loaded");
        assert_eq!(raw["runtime"]["thresholds"]["overloaded"], 70);

        let document = HealthTracker::read_document(&path).await.unwrap().unwrap();
        assert_eq!(document.runtime.summary.total_agents, 1);
    }

    #[tokio::test]
    async fn test_open_keeps_earlier_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-state.json");
        let first = HealthTracker::open(HealthThresholds::default(), &path).await.unwrap();
        first.record(&block(1), HealthOutcome::Succeeded, None, 500).await;
        first.record(&block(2), HealthOutcome::Started, Some(50), 0).await;
        drop(first);

        let strict = HealthThresholds {
            idle: 10,
            loaded: 10,
            overloaded: 40,
        };
        let second = HealthTracker::open(strict, &path).await.unwrap();
        assert_eq!(second.agent("agent-2").await.unwrap().status, AgentStatus::Overloaded);

        let summary = second.record(&block(3), HealthOutcome::Failed, None, 0).await;
        assert_eq!(summary.total_agents, 3);
        assert_eq!(second.agent("agent-1").await.unwrap().token_usage, 500);

        let document = HealthTracker::read_document(&path).await.unwrap().unwrap();
        let ids: Vec<_> = document.runtime.agents.keys().cloned().collect();
        assert_eq!(ids, vec!["agent-1", "agent-2", "agent-3"]);
        assert_eq!(document.runtime.thresholds, strict);
    }

    #[tokio::test]
    async fn test_open_refuses_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-state.json");
        std::fs::write(&path, b"{\"runtime\": ").unwrap();
        let err = HealthTracker::open(HealthThresholds::default(), &path)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "persistence");
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"runtime\": ");
    }

    #[tokio::test]
    async fn test_unwritable_path_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let tracker =
            HealthTracker::with_path(HealthThresholds::default(), blocker.join("health.json"));
        let summary = tracker.record(&block(1), HealthOutcome::Failed, None, 0).await;
        assert_eq!(summary.unhealthy_agents, 1);
    }
}
