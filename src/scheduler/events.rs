//! Typed scheduler events
//!
//! Emitted to an optional [`EventSink`] as the scheduler moves blocks through
//! their lifecycle.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::registry::BlockNumber;
use crate::state::CascadeStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CascadeEvent {
    BlockStarted {
        block: BlockNumber,
        id: String,
    },
    BlockCompleted {
        block: BlockNumber,
        duration_ms: u64,
        tokens_used: u64,
    },
    BlockFailed {
        block: BlockNumber,
        error: String,
    },
    StatusChanged {
        from: CascadeStatus,
        to: CascadeStatus,
    },
    /// A save failed; the in-memory state is ahead of the stored one
    PersistenceDegraded {
        error: String,
    },
    PersistenceRestored,
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeEventEnvelope {
    pub sequence: u64,
    pub cascade_id: String,
    /// Distinguishes the processes that worked on one resumed cascade
    pub session_id: String,
    pub timestamp: u64,
    pub event: CascadeEvent,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &CascadeEventEnvelope);
}

/// Writes each event to the log; the CLI attaches it to every run
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &CascadeEventEnvelope) {
        let seq = envelope.sequence;
        match &envelope.event {
            CascadeEvent::BlockFailed { block, error } => {
                tracing::warn!(seq, block, "event: block failed: {}", error)
            }
            CascadeEvent::PersistenceDegraded { error } => {
                tracing::warn!(seq, "event: persistence degraded: {}", error)
            }
            CascadeEvent::StatusChanged { from, to } => {
                tracing::info!(seq, cascade = %envelope.cascade_id, "event: status {} -> {}", from, to)
            }
            event => tracing::debug!(seq, session = %envelope.session_id, "event: {:?}", event),
        }
    }
}

/// Collects every event; used by tests and embedders that poll
#[derive(Default)]
pub struct BufferingEventSink {
    events: Mutex<Vec<CascadeEventEnvelope>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<CascadeEventEnvelope> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Just the event payloads, in emission order
    pub fn events(&self) -> Vec<CascadeEvent> {
        self.get_events().into_iter().map(|e| e.event).collect()
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &CascadeEventEnvelope) {
        if let Ok(mut events) = self.events.lock() {
            events.push(envelope.clone());
        }
    }
}

static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
