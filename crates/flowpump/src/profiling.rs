//! Profiling hooks fired around scheduling and execution boundaries.
//!
//! Producers are registered per event type at build time; the registry is
//! immutable afterwards. Hook failures are counted and reported, never
//! propagated into the main signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Boundaries a pipeline reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfilingEventType {
    /// A component execution is about to hop to its dispatcher.
    Scheduling,
    /// A component execution starts on the dispatch thread.
    StartingExecution,
    /// A component execution finished (success or error).
    Executed,
    /// A whole-flow execution is about to be dispatched, before any hop.
    PsSchedulingFlowExecution,
    /// A whole-flow execution starts on the dispatch thread.
    StartingFlowExecution,
    /// A whole-flow execution completed (success or error).
    FlowExecuted,
}

/// Outcome marker carried on closing hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Error,
}

/// Data handed to every producer when a hook fires.
#[derive(Debug, Clone)]
pub struct ProfilingEventContext {
    pub correlation_id: String,
    pub artifact_id: String,
    pub thread_name: String,
    /// Present on closing hooks (`Executed`, `FlowExecuted`).
    pub outcome: Option<ExecutionOutcome>,
    pub timestamp_nanos: u64,
}

impl ProfilingEventContext {
    pub fn now(
        correlation_id: impl Into<String>,
        artifact_id: impl Into<String>,
        outcome: Option<ExecutionOutcome>,
    ) -> Self {
        let thread = std::thread::current();
        Self {
            correlation_id: correlation_id.into(),
            artifact_id: artifact_id.into(),
            thread_name: thread.name().unwrap_or("unnamed").to_string(),
            outcome,
            timestamp_nanos: std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos() as u64),
        }
    }
}

/// Failure raised by a profiling data producer.
#[derive(Debug, Clone, Error)]
#[error("profiling hook failed: {0}")]
pub struct ProfilingHookError(pub String);

/// Consumer of profiling data for one or more event types.
pub trait ProfilingDataProducer: Send + Sync {
    fn on_event(&self, ctx: &ProfilingEventContext) -> Result<(), ProfilingHookError>;
}

/// Builds an immutable [`ProfilingService`].
#[derive(Default)]
pub struct ProfilingServiceBuilder {
    producers: HashMap<ProfilingEventType, Vec<Arc<dyn ProfilingDataProducer>>>,
}

impl ProfilingServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        event_type: ProfilingEventType,
        producer: Arc<dyn ProfilingDataProducer>,
    ) -> Self {
        self.producers.entry(event_type).or_default().push(producer);
        self
    }

    pub fn build(self) -> ProfilingService {
        ProfilingService {
            producers: self.producers,
            hook_failures: AtomicU64::new(0),
        }
    }
}

/// Registry of profiling data producers keyed by event type.
#[derive(Default)]
pub struct ProfilingService {
    producers: HashMap<ProfilingEventType, Vec<Arc<dyn ProfilingDataProducer>>>,
    hook_failures: AtomicU64,
}

impl ProfilingService {
    /// A service with no producers; every trigger is a cheap no-op.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Fires every producer registered for `event_type`. Failures are
    /// swallowed here and only show up in [`hook_failures`](Self::hook_failures).
    pub fn trigger(&self, event_type: ProfilingEventType, ctx: &ProfilingEventContext) {
        let Some(producers) = self.producers.get(&event_type) else {
            return;
        };
        for producer in producers {
            if let Err(e) = producer.on_event(ctx) {
                self.hook_failures.fetch_add(1, Ordering::Relaxed);
                eprintln!("profiling hook error ({event_type:?}): {e}");
            }
        }
    }

    pub fn hook_failures(&self) -> u64 {
        self.hook_failures.load(Ordering::Relaxed)
    }
}
