// Core infrastructure shared by every component
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod registry;   // Block definitions and registry loading
pub mod state;      // Run state and its stores
pub mod execution;  // Execution port, policy and test doubles
pub mod health;     // Per-block health tracking
pub mod scheduler;  // The dependency-aware scheduler
pub mod observer;   // Stall detection and status reports

// Re-exports for convenience
pub use crate::core::config::{CascadeConfig, StorageBackend};
pub use crate::core::errors::{CascadeError, RegistryError, Result};
pub use execution::{
    ExecutionError, ExecutionOutput, ExecutionPolicy, ExecutionPort, PolicyExecutor,
    ScriptedExecutor, ScriptedOutcome, SimulatedExecutor,
};
pub use health::{HealthOutcome, HealthSummary, HealthThresholds, HealthTracker};
pub use observer::{Alert, HealthSource, Observer, ObserverConfig, StatusReport};
pub use registry::{BlockDefinition, BlockNumber, Registry, RegistryLoader};
pub use scheduler::{RecoveryMode, RunSummary, Scheduler, SchedulerConfig, TickOutcome};
pub use state::{
    derive_status, CascadeStatus, JsonFileStateStore, MemoryStateStore, RunState, RunStateStore,
    SledStateStore,
};
