use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::health::HealthSummary;
use crate::state::{CascadeStatus, RunState};

const RULE: &str = "════════════════════════════════════════════════════════════";
const THIN_RULE: &str = "────────────────────────────────────────────────────────────";

/// Point-in-time view of a cascade, as seen from outside the scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub sampled_at: DateTime<Utc>,
    /// `None` until the scheduler has saved a first state
    pub state: Option<RunState>,
    pub health: Option<HealthSummary>,
    /// Why `state` could not be read, when it exists but is unreadable
    pub state_error: Option<String>,
}

impl StatusReport {
    pub fn iteration(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.iteration)
    }

    pub fn status(&self) -> Option<CascadeStatus> {
        self.state.as_ref().map(|s| s.status)
    }

    pub fn failed_blocks(&self) -> Vec<u32> {
        self.state
            .as_ref()
            .map(|s| s.blocks_failed.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// True when both samples have a state and the iteration did not move.
pub fn detect_stall(previous: &StatusReport, current: &StatusReport) -> bool {
    match (previous.iteration(), current.iteration()) {
        (Some(prev), Some(curr)) => prev == curr,
        _ => false,
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔{RULE}╗")?;
        writeln!(f, "║ Cascade Status Report")?;
        writeln!(f, "╠{RULE}╣")?;
        writeln!(f, "║ Time: {}", self.sampled_at.format("%Y-%m-%d %H:%M:%S"))?;

        let Some(state) = &self.state else {
            match &self.state_error {
                Some(e) => writeln!(f, "║ Cascade state unreadable: {e}")?,
                None => writeln!(f, "║ No cascade state yet")?,
            }
            return write!(f, "╚{RULE}╝");
        };

        writeln!(f, "║ Cascade: {}", state.cascade_id)?;
        writeln!(f, "║ Status: {}", state.status)?;
        writeln!(f, "║ Iteration: {}", state.iteration)?;
        writeln!(f, "├{THIN_RULE}┤")?;
        writeln!(f, "║   ✓ Completed: {} blocks", state.blocks_completed.len())?;
        writeln!(f, "║   ✗ Failed: {} blocks", state.blocks_failed.len())?;
        writeln!(f, "║   ⟳ In Progress: {} blocks", state.blocks_in_progress.len())?;
        if !state.blocks_completed.is_empty() {
            writeln!(f, "║ Completed Blocks: {:?}", state.blocks_completed)?;
        }
        if !state.blocks_failed.is_empty() {
            writeln!(f, "║ Failed Blocks: {:?}", state.blocks_failed)?;
        }

        if let Some(health) = &self.health {
            writeln!(f, "├{THIN_RULE}┤")?;
            writeln!(
                f,
                "║ Agents: {} total, {} idle, {} loaded, {} overloaded, {} unhealthy",
                health.total_agents,
                health.idle_agents,
                health.loaded_agents,
                health.overloaded_agents,
                health.unhealthy_agents
            )?;
            writeln!(
                f,
                "║ Workload: avg {:.1}, max {}",
                health.avg_workload, health.max_workload
            )?;
        }
        write!(f, "╚{RULE}╝")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(iteration: Option<u64>) -> StatusReport {
        StatusReport {
            sampled_at: Utc::now(),
            state: iteration.map(|i| {
                let mut state = RunState::new("c");
                state.iteration = i;
                state
            }),
            health: None,
            state_error: None,
        }
    }

    #[test]
    fn test_detect_stall() {
        assert!(detect_stall(&report(Some(3)), &report(Some(3))));
        assert!(!detect_stall(&report(Some(3)), &report(Some(4))));
        assert!(!detect_stall(&report(None), &report(Some(0))));
        assert!(!detect_stall(&report(None), &report(None)));
    }

    #[test]
    fn test_report_rendering() {
        let mut sample = report(Some(2));
        if let Some(state) = sample.state.as_mut() {
            state.blocks_completed.insert(1);
            state.blocks_failed.insert(2);
            state.status = CascadeStatus::Blocked;
        }
        let text = sample.to_string();
        assert!(text.contains("Status: BLOCKED"));
        assert!(text.contains("Failed Blocks: {2}"));
        assert!(report(None).to_string().contains("No cascade state yet"));
    }
}
