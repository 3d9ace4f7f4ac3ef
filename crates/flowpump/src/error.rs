//! Error types for pipeline execution.

use thiserror::Error;

/// Business failure raised by a wrapped processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("processor failed: {message}")]
pub struct ProcessorError {
    message: String,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Terminal outcomes a caller can observe for a submitted event.
///
/// Scheduler rejection never appears here: it is always retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A scheduler this pipeline depends on has been shut down.
    #[error("scheduler has been shut down")]
    SchedulerShutDown,

    /// The wrapped processor finished with an error.
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// The pipeline was disposed before this event completed.
    #[error("pipeline execution was cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Returns `true` if this outcome came from the business logic rather
    /// than the engine.
    #[inline]
    pub fn is_processor_failure(&self) -> bool {
        matches!(self, Self::Processor(_))
    }

    /// Returns `true` if the engine itself stopped the execution.
    #[inline]
    pub fn is_terminal_infrastructure(&self) -> bool {
        matches!(self, Self::SchedulerShutDown | Self::Cancelled)
    }
}

/// Failure of a retried submission surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The scheduler (or its retry decorator) has been shut down; retries
    /// cease and the task is abandoned.
    #[error("scheduler has been shut down")]
    ShutDown,
}
