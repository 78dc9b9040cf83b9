//! Observer sampling files written by a running scheduler

use cascade::execution::ScriptedExecutor;
use cascade::health::{HealthThresholds, HealthTracker};
use cascade::observer::{Alert, HealthSource, Observer, ObserverConfig};
use cascade::registry::{BlockDefinition, Registry};
use cascade::scheduler::{Scheduler, SchedulerConfig};
use cascade::state::{CascadeStatus, JsonFileStateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_observer_reads_scheduler_files() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("run-state.json");
    let health_path = dir.path().join("agent-state.json");

    let registry = Arc::new(
        Registry::new(vec![
            BlockDefinition::new("planner", 1, []),
            BlockDefinition::new("builder", 2, [1]),
            BlockDefinition::new("reviewer", 3, [2]),
        ])
        .unwrap(),
    );
    let mut scheduler = Scheduler::open(
        "observed",
        registry,
        Arc::new(JsonFileStateStore::new(&state_path)),
        Arc::new(ScriptedExecutor::new().fail(2)),
        Arc::new(HealthTracker::with_path(
            HealthThresholds::default(),
            &health_path,
        )),
        SchedulerConfig {
            tick_delay_ms: 0,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut observer = Observer::new(
        Arc::new(JsonFileStateStore::new(&state_path)),
        HealthSource::File(health_path.clone()),
        ObserverConfig {
            interval_ms: 10,
            alert_every: 2,
            critical_after: 3,
        },
    );

    let (report, _) = observer.poll_once().await;
    assert_eq!(report.status(), Some(CascadeStatus::Initialized));
    assert!(report.health.is_none());

    scheduler.tick().await;
    let (report, alerts) = observer.poll_once().await;
    assert_eq!(report.iteration(), Some(1));
    assert!(alerts.is_empty());
    assert_eq!(report.health.as_ref().map(|h| h.total_agents), Some(1));

    let summary = scheduler.run_until_stopped(None).await;
    assert_eq!(summary.status, CascadeStatus::Blocked);

    let mut alerts = observer.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { observer.run(shutdown_rx).await });

    let first = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, Alert::Stalled { .. }));

    let critical = loop {
        let alert = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
            .await
            .unwrap()
            .unwrap();
        if let Alert::Critical { .. } = alert {
            break alert;
        }
    };
    match critical {
        Alert::Critical {
            status,
            failed_blocks,
            ..
        } => {
            assert_eq!(status, Some(CascadeStatus::Blocked));
            assert_eq!(failed_blocks, vec![2]);
        }
        Alert::Stalled { .. } => unreachable!(),
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    // The observer never writes either file
    let state: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&state_path).unwrap()).unwrap();
    assert_eq!(state["status"], "BLOCKED");
    assert_eq!(state["blocksFailed"], serde_json::json!([2]));
}
