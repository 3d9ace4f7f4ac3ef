//! Staged event-pipeline execution engine.
//!
//! An event submitted to a [`Pipeline`] travels through three stages: a
//! dispatch hop onto the dispatcher scheduler, synchronous execution of the
//! wrapped processor, and a callback hop onto the callback scheduler where
//! the caller's completion runs. Saturated schedulers hand tasks back
//! instead of queueing them; the [`RejectionRetryingScheduler`] decorator
//! absorbs those rejections with timed retries so callers never observe
//! transient saturation.
//!
//! Parallel pipelines fan events out over N independent slots, each with its
//! own FIFO queue, via [`RoundRobinSinkSupplier`]. Wrapping it in a
//! [`TransactionAwareSinkSupplier`] keeps a thread-bound transaction pinned
//! to one dedicated slot.
//!
//! Execution is observable through profiling hooks ([`ProfilingService`])
//! and execution span trees (the `flowpump-trace` crate); both are
//! best-effort and never alter the outcome an event's completion sees.

mod context;
mod error;
mod event;
mod pipeline;
mod profiling;
mod retry;
mod scheduler;
mod sink;
mod transaction;

pub use context::SubscribedProcessorsContext;
pub use error::{PipelineError, ProcessorError, ScheduleError};
pub use event::Event;
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineMetrics, PipelineTracing, Processor, SchedulingPolicy,
};
pub use profiling::{
    ExecutionOutcome, ProfilingDataProducer, ProfilingEventContext, ProfilingEventType,
    ProfilingHookError, ProfilingService, ProfilingServiceBuilder,
};
pub use retry::{RejectionCallback, RejectionRetryingScheduler, RetryConfig, RetryMetrics};
pub use scheduler::{CallerScheduler, Scheduler, SubmitError, Task, TaskHandle, TokioScheduler};
pub use sink::{
    Completion, EventSink, RoundRobinSinkSupplier, SinkFactory, SinkSupplier,
    TransactionAwareSinkSupplier,
};
pub use transaction::{current_transaction, is_transacted, TransactionBinding, TransactionId};
