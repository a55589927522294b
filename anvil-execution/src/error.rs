//! Error types for worker execution

use std::time::Duration;
use thiserror::Error;

use anvil_ipc::ChannelError;

/// Worker execution errors
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Invalid worker configuration; detected before any process exists
    #[error("invalid worker configuration: {0}")]
    Configuration(String),

    /// Worker process failed to launch or complete its handshake
    #[error("worker failed to start: {reason}")]
    WorkerStartFailure {
        reason: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// Graceful stop did not complete within the grace period; the worker
    /// was forcibly terminated
    #[error("worker did not stop within {timeout:?} and was forcibly terminated")]
    WorkerStopTimeout { timeout: Duration },

    /// Channel-level failure, including a broken transport mid-session
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// `start_processing` was called twice on one processor
    #[error("processing already started")]
    AlreadyStarted,

    /// A work unit was submitted before `start_processing`
    #[error("processing not started")]
    NotStarted,

    /// The processor has been stopped
    #[error("processor is stopped")]
    ProcessorStopped,

    /// Operation invoked in the wrong worker lifecycle state
    #[error("invalid worker state: {0}")]
    InvalidState(String),

    /// OS-level process control failure
    #[error("worker process error: {0}")]
    Process(String),
}

impl ExecutionError {
    /// Errors that mean the worker is unusable; never retried internally,
    /// because the worker may already have performed partial work
    pub fn worker_unusable(&self) -> bool {
        matches!(
            self,
            ExecutionError::WorkerStartFailure { .. }
                | ExecutionError::Channel(ChannelError::Broken(_))
        )
    }

    /// Programmer-usage errors; always synchronous and immediate
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ExecutionError::AlreadyStarted
                | ExecutionError::NotStarted
                | ExecutionError::ProcessorStopped
                | ExecutionError::Channel(ChannelError::DuplicateBinding { .. })
        )
    }
}
