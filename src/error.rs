use crate::lifecycle::LifecycleState;
use std::time::Duration;
use thiserror::Error;

/// Rejections and failures reported by [`crate::lifecycle::BackendLifecycle`]
///
/// Transient telemetry problems never show up here; they are folded into
/// [`crate::telemetry::ReadStatus::None`].
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Failed to start {backend}: {source}")]
    StartFailed {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Backend is already active ({0:?})")]
    AlreadyRunning(LifecycleState),

    #[error("Backend is in cooldown for another {remaining:?}")]
    InCooldown { remaining: Duration },

    #[error("A benchmark is already in progress")]
    BenchmarkAlreadyInProgress,

    #[error("Operation not valid while {0:?}")]
    InvalidState(LifecycleState),

    #[error("Benchmark was cancelled by a stop request")]
    BenchmarkCancelled,

    #[error("Start was cancelled by a stop request")]
    StartCancelled,

    #[error("Backend process exited unexpectedly (code {code:?})")]
    ProcessExited { code: Option<i32> },
}

impl LifecycleError {
    /// Whether the error comes from calling the lifecycle at the wrong time
    /// rather than from the backend itself
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LifecycleError::AlreadyRunning(_)
                | LifecycleError::InCooldown { .. }
                | LifecycleError::BenchmarkAlreadyInProgress
                | LifecycleError::InvalidState(_)
        )
    }
}
