use serde::Serialize;

pub mod ingest;
pub mod mixer;
pub mod recorder;

/// Lifecycle of one engine instance. Transitions are total and
/// timeout-bounded; outside an engine's own steady-state self-transitions,
/// only the supervisor mutates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Degraded,
    Stopping,
    Error,
    /// The source is not delivering usable frames. A parked state, not a
    /// failure: the engine auto-starts on signal recovery.
    NoSignal,
}

impl LifecycleState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Degraded)
    }
}
