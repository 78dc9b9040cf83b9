//! Out-of-band progress monitoring
//!
//! The observer samples the stored run state and the health summary on a timer.
//! It never writes either. Consecutive samples with an unchanged iteration count
//! as stalls, and enough of them raise alerts.

pub mod report;

pub use report::{detect_stall, StatusReport};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::core::errors::{CascadeError, Result};
use crate::health::{HealthSummary, HealthTracker};
use crate::registry::BlockNumber;
use crate::state::{CascadeStatus, RunStateStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub interval_ms: u64,
    /// Warn on every n-th consecutive stall
    pub alert_every: u32,
    /// Go critical once the stall count exceeds this
    pub critical_after: u32,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            alert_every: 3,
            critical_after: 5,
        }
    }
}

impl ObserverConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(CascadeError::configuration_field(
                "interval_ms must be greater than 0",
                "observer.interval_ms",
            ));
        }
        if self.alert_every == 0 {
            return Err(CascadeError::configuration_field(
                "alert_every must be greater than 0",
                "observer.alert_every",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    Stalled {
        stalled_samples: u32,
        stalled_for: Duration,
    },
    Critical {
        stalled_samples: u32,
        status: Option<CascadeStatus>,
        failed_blocks: Vec<BlockNumber>,
    },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::Stalled { stalled_for, .. } => {
                write!(f, "no progress for {}s", stalled_for.as_secs())
            }
            Alert::Critical {
                stalled_samples,
                status,
                failed_blocks,
            } => {
                write!(
                    f,
                    "cascade appears stuck after {} samples without progress",
                    stalled_samples
                )?;
                if let Some(status) = status {
                    write!(f, " (status {status})")?;
                }
                if !failed_blocks.is_empty() {
                    write!(f, "; failed blocks: {failed_blocks:?}")?;
                }
                Ok(())
            }
        }
    }
}

/// Where the observer reads health from
#[derive(Debug, Clone)]
pub enum HealthSource {
    Tracker(Arc<HealthTracker>),
    /// A health file written by another process
    File(PathBuf),
    None,
}

pub struct Observer {
    store: Arc<dyn RunStateStore>,
    health: HealthSource,
    config: ObserverConfig,
    previous: Option<StatusReport>,
    stall_count: u32,
    alerts: broadcast::Sender<Alert>,
}

impl Observer {
    pub fn new(store: Arc<dyn RunStateStore>, health: HealthSource, config: ObserverConfig) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            store,
            health,
            config,
            previous: None,
            stall_count: 0,
            alerts,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn stall_count(&self) -> u32 {
        self.stall_count
    }

    /// Read the current state and health summary.
    pub async fn sample(&self) -> StatusReport {
        let (state, state_error) = match self.store.load().await {
            Ok(state) => (state, None),
            Err(e) => {
                warn!(
                    "Observer: could not read run state from {}: {}",
                    self.store.describe(),
                    e
                );
                (None, Some(e.to_string()))
            }
        };
        StatusReport {
            sampled_at: Utc::now(),
            state,
            health: self.read_health().await,
            state_error,
        }
    }

    async fn read_health(&self) -> Option<HealthSummary> {
        match &self.health {
            HealthSource::Tracker(tracker) => Some(tracker.summary().await),
            HealthSource::File(path) => match HealthTracker::read_document(path).await {
                Ok(document) => document.map(|d| d.runtime.summary),
                Err(e) => {
                    warn!("Observer: could not read health from {}: {}", path.display(), e);
                    None
                }
            },
            HealthSource::None => None,
        }
    }

    /// Feed one sample into stall tracking and return the alerts it raises.
    pub fn observe(&mut self, report: &StatusReport) -> Vec<Alert> {
        if report.state.is_none() {
            return Vec::new();
        }

        let stalled = self
            .previous
            .as_ref()
            .is_some_and(|prev| detect_stall(prev, report));
        let complete = report.status() == Some(CascadeStatus::Complete);
        if stalled && !complete {
            self.stall_count += 1;
        } else {
            self.stall_count = 0;
        }
        self.previous = Some(report.clone());

        let mut alerts = Vec::new();
        if self.stall_count > 0 && self.stall_count % self.config.alert_every == 0 {
            alerts.push(Alert::Stalled {
                stalled_samples: self.stall_count,
                stalled_for: self.config.interval() * self.stall_count,
            });
        }
        if self.stall_count > self.config.critical_after {
            alerts.push(Alert::Critical {
                stalled_samples: self.stall_count,
                status: report.status(),
                failed_blocks: report.failed_blocks(),
            });
        }
        alerts
    }

    /// Sample once, track stalls, then log and broadcast any alerts.
    pub async fn poll_once(&mut self) -> (StatusReport, Vec<Alert>) {
        let report = self.sample().await;
        if report.state.is_none() && report.state_error.is_none() {
            info!("Observer: no cascade state found, waiting for the scheduler to start");
        }
        let alerts = self.observe(&report);
        for alert in &alerts {
            match alert {
                Alert::Stalled { .. } => warn!("Observer: ALERT: {}", alert),
                Alert::Critical { .. } => error!("Observer: CRITICAL: {}", alert),
            }
            // No subscribers is fine
            let _ = self.alerts.send(alert.clone());
        }
        (report, alerts)
    }

    /// Poll every `interval` until `shutdown` flips to true or its sender drops.
    /// Returns the number of samples taken.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> u64 {
        info!(
            "Observer: monitoring {} every {:?}",
            self.store.describe(),
            self.config.interval()
        );
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut samples = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let (report, _) = self.poll_once().await;
                    samples += 1;
                    if report.state.is_some() {
                        info!("Observer: sample {}\n{}", samples, report);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Observer: stopped after {} samples", samples);
        samples
    }
}
