//! The staged pipeline every event execution passes through.
//!
//! [`PipelineBuilder`] wires a processor into dispatch hop → execution →
//! callback hop, optionally fanned out across parallel slots. Each slot is a
//! [`ProcessorSink`](self) with its own FIFO queue and at most one in-flight
//! dispatch task, so per-slot arrival order is preserved while up to
//! `parallelism` events are mid-flight concurrently. Saturated schedulers
//! are absorbed by the rejection-retrying decorator; the caller observes
//! exactly one terminal outcome per event.

use crate::error::{PipelineError, ProcessorError};
use crate::event::Event;
use crate::profiling::{
    ExecutionOutcome, ProfilingEventContext, ProfilingEventType, ProfilingService,
};
use crate::retry::{RejectionCallback, RejectionRetryingScheduler, RetryConfig, RetryMetrics};
use crate::scheduler::{Scheduler, Task};
use crate::sink::{
    Completion, EventSink, RoundRobinSinkSupplier, SinkSupplier, TransactionAwareSinkSupplier,
};
use flowpump_trace::{
    ExecutionSpanTree, SpanCustomization, SpanId, SpanOutcome, SpanRequest, SpanTreeConfig,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// The unit of business logic a pipeline wraps. Runs synchronously to
/// completion on the dispatch thread it is handed.
pub type Processor = Arc<dyn Fn(Event) -> Result<Event, ProcessorError> + Send + Sync>;

/// Which pool runs which stage. Immutable once built.
#[derive(Clone)]
pub struct SchedulingPolicy {
    context: Arc<dyn Scheduler>,
    dispatcher: Arc<dyn Scheduler>,
    callback: Arc<dyn Scheduler>,
    parallelism: usize,
}

impl SchedulingPolicy {
    pub fn context_scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.context
    }

    pub fn dispatcher_scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.dispatcher
    }

    pub fn callback_scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.callback
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }
}

/// Tracing collaborators for one pipeline.
#[derive(Clone)]
pub struct PipelineTracing {
    pub tree: Arc<ExecutionSpanTree>,
    pub config: SpanTreeConfig,
    pub customization: SpanCustomization,
}

/// Per-pipeline event counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    accepted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl PipelineMetrics {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Fluent configuration for a staged pipeline execution.
pub struct PipelineBuilder {
    processor: Processor,
    context: Arc<dyn Scheduler>,
    dispatcher: Option<Arc<dyn Scheduler>>,
    callback: Option<Arc<dyn Scheduler>>,
    parallelism: usize,
    retry: RetryConfig,
    on_rejected: RejectionCallback,
    on_recovered: RejectionCallback,
    profiling: Arc<ProfilingService>,
    tracing: Option<PipelineTracing>,
    transaction_aware: bool,
    artifact_id: Arc<str>,
}

impl PipelineBuilder {
    /// Starts a builder for `processor`, with `context` as the default
    /// scheduler for every stage not configured explicitly.
    pub fn new(
        processor: impl Fn(Event) -> Result<Event, ProcessorError> + Send + Sync + 'static,
        context: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            processor: Arc::new(processor),
            context,
            dispatcher: None,
            callback: None,
            parallelism: 1,
            retry: RetryConfig::default(),
            on_rejected: Arc::new(|| {}),
            on_recovered: Arc::new(|| {}),
            profiling: Arc::new(ProfilingService::disabled()),
            tracing: None,
            transaction_aware: false,
            artifact_id: Arc::from("pipeline"),
        }
    }

    /// Pool the dispatch hop lands on. Defaults to the context scheduler.
    pub fn dispatcher(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.dispatcher = Some(scheduler);
        self
    }

    /// Pool the callback hop lands on. Defaults to the context scheduler.
    pub fn callback(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.callback = Some(scheduler);
        self
    }

    /// Number of independent execution slots. Clamped to at least 1.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Metrics hooks for the dispatcher's rejection-retrying decorator.
    pub fn rejection_callbacks(
        mut self,
        on_rejected: RejectionCallback,
        on_recovered: RejectionCallback,
    ) -> Self {
        self.on_rejected = on_rejected;
        self.on_recovered = on_recovered;
        self
    }

    pub fn profiling(mut self, profiling: Arc<ProfilingService>) -> Self {
        self.profiling = profiling;
        self
    }

    pub fn tracing(mut self, tracing: PipelineTracing) -> Self {
        self.tracing = Some(tracing);
        self
    }

    /// Pins transactional callers to a dedicated slot instead of fanning
    /// their events out round-robin.
    pub fn transaction_aware(mut self, transaction_aware: bool) -> Self {
        self.transaction_aware = transaction_aware;
        self
    }

    /// Identity reported on profiling hooks and span attributes.
    pub fn artifact_id(mut self, artifact_id: impl Into<Arc<str>>) -> Self {
        self.artifact_id = artifact_id.into();
        self
    }

    pub fn build(self) -> Pipeline {
        let parallelism = self.parallelism;
        let dispatcher_raw = self
            .dispatcher
            .unwrap_or_else(|| Arc::clone(&self.context));
        let callback_raw = self.callback.unwrap_or_else(|| Arc::clone(&self.context));

        // The context scheduler doubles as the retry timer.
        let dispatcher = RejectionRetryingScheduler::with_callbacks(
            Arc::clone(&dispatcher_raw),
            Arc::clone(&self.context),
            self.retry.clone(),
            self.on_rejected,
            self.on_recovered,
        );
        let callback = RejectionRetryingScheduler::new(
            Arc::clone(&callback_raw),
            Arc::clone(&self.context),
            self.retry,
        );

        let shared = Arc::new(Shared {
            processor: self.processor,
            dispatcher,
            callback,
            profiling: self.profiling,
            tracing: self.tracing,
            artifact_id: self.artifact_id,
            metrics: Arc::new(PipelineMetrics::default()),
            disposed: AtomicBool::new(false),
            sinks: Mutex::new(Vec::new()),
        });

        let slots: Vec<Arc<ProcessorSink>> = (0..parallelism)
            .map(|slot| ProcessorSink::new(Arc::clone(&shared), slot))
            .collect();
        let round_robin = Arc::new(RoundRobinSinkSupplier::new(parallelism, |slot| {
            let sink: Arc<dyn EventSink> = Arc::<ProcessorSink>::clone(&slots[slot]);
            sink
        }));

        let supplier: Arc<dyn SinkSupplier> = if self.transaction_aware {
            let tx_shared = Arc::clone(&shared);
            let next_slot = AtomicUsize::new(parallelism);
            Arc::new(TransactionAwareSinkSupplier::new(
                Box::new(move || {
                    let slot = next_slot.fetch_add(1, Ordering::Relaxed);
                    let sink: Arc<dyn EventSink> =
                        ProcessorSink::new(Arc::clone(&tx_shared), slot);
                    sink
                }),
                round_robin,
            ))
        } else {
            round_robin
        };

        Pipeline {
            shared,
            supplier,
            policy: SchedulingPolicy {
                context: self.context,
                dispatcher: dispatcher_raw,
                callback: callback_raw,
                parallelism,
            },
        }
    }
}

/// A ready-to-subscribe staged executor.
pub struct Pipeline {
    shared: Arc<Shared>,
    supplier: Arc<dyn SinkSupplier>,
    policy: SchedulingPolicy,
}

impl Pipeline {
    /// Submits one event. The calling thread returns as soon as the event
    /// is queued on its slot; `completion` is invoked exactly once with the
    /// terminal outcome, on the callback scheduler.
    pub fn process(
        &self,
        event: Event,
        completion: impl FnOnce(Result<Event, PipelineError>) + Send + 'static,
    ) {
        let completion: Completion = Box::new(completion);
        if self.shared.is_disposed() {
            self.shared.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
            self.shared
                .deliver_via_callback(completion, Err(PipelineError::Cancelled));
            return;
        }

        self.shared.metrics.accepted.fetch_add(1, Ordering::Relaxed);
        let correlation = event.correlation_id().to_string();
        self.shared.trigger(
            ProfilingEventType::PsSchedulingFlowExecution,
            &correlation,
            None,
        );

        // The flow span encloses the whole staged execution; the component
        // span opened on the dispatch thread becomes its child.
        let flow_span = self.shared.open_span(self.shared.artifact_id.as_ref(), &event);
        let event = match flow_span {
            Some(id) => event.with_current_span(id),
            None => event,
        };

        let shared = Arc::clone(&self.shared);
        let wrapped: Completion = Box::new(move |result| {
            let outcome = if result.is_ok() {
                ExecutionOutcome::Success
            } else {
                ExecutionOutcome::Error
            };
            if let Some(id) = flow_span {
                let span_outcome = match &result {
                    Ok(_) => SpanOutcome::Ok,
                    Err(PipelineError::Cancelled) => SpanOutcome::Cancelled,
                    Err(_) => SpanOutcome::Error,
                };
                shared.seal_span(id, span_outcome);
            }
            match &result {
                Ok(_) => shared.metrics.completed.fetch_add(1, Ordering::Relaxed),
                Err(PipelineError::Cancelled) => {
                    shared.metrics.cancelled.fetch_add(1, Ordering::Relaxed)
                }
                Err(_) => shared.metrics.failed.fetch_add(1, Ordering::Relaxed),
            };
            completion(result);
            shared.trigger(ProfilingEventType::FlowExecuted, &correlation, Some(outcome));
        });

        self.supplier.get().accept(event, wrapped);
    }

    /// Async convenience over [`process`](Self::process).
    pub async fn process_awaited(&self, event: Event) -> Result<Event, PipelineError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.process(event, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(PipelineError::Cancelled))
    }

    /// Stops the pipeline. Idempotent.
    ///
    /// New submissions complete with `Cancelled`; queued-but-undispatched
    /// events complete with `Cancelled`; pending dispatch retries are
    /// cancelled; spans still open are sealed as cancelled. Completions for
    /// work already on a dispatch thread still drain through the callback
    /// scheduler.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sinks = {
            let registry = self.shared.lock_sinks();
            registry.clone()
        };
        for weak in sinks {
            if let Some(sink) = weak.upgrade() {
                sink.fail_queued(&PipelineError::Cancelled);
            }
        }
        self.shared.dispatcher.shutdown_now();
        if let Some(tracing) = &self.shared.tracing {
            tracing.tree.seal_open_spans(SpanOutcome::Cancelled);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.shared.metrics
    }

    /// Counters of the dispatcher's rejection-retrying decorator.
    pub fn dispatcher_retry_metrics(&self) -> &Arc<RetryMetrics> {
        self.shared.dispatcher.metrics()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct Shared {
    processor: Processor,
    dispatcher: Arc<RejectionRetryingScheduler>,
    callback: Arc<RejectionRetryingScheduler>,
    profiling: Arc<ProfilingService>,
    tracing: Option<PipelineTracing>,
    artifact_id: Arc<str>,
    metrics: Arc<PipelineMetrics>,
    disposed: AtomicBool,
    /// Every slot ever created for this pipeline, round-robin and
    /// transaction-dedicated alike, so dispose can flush them all.
    sinks: Mutex<Vec<Weak<ProcessorSink>>>,
}

impl Shared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn trigger(
        &self,
        event_type: ProfilingEventType,
        correlation_id: &str,
        outcome: Option<ExecutionOutcome>,
    ) {
        let ctx =
            ProfilingEventContext::now(correlation_id, self.artifact_id.as_ref(), outcome);
        self.profiling.trigger(event_type, &ctx);
    }

    fn open_span(&self, name: &str, event: &Event) -> Option<SpanId> {
        self.tracing.as_ref().map(|t| {
            t.tree.open_span(&SpanRequest {
                name,
                parent: event.current_span(),
                correlation_id: event.correlation_id(),
                config: &t.config,
                customization: &t.customization,
            })
        })
    }

    fn seal_span(&self, id: SpanId, outcome: SpanOutcome) {
        if let Some(tracing) = &self.tracing {
            tracing.tree.seal(id, outcome);
        }
    }

    fn lock_sinks(&self) -> MutexGuard<'_, Vec<Weak<ProcessorSink>>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers a completion through the callback scheduler for events that
    /// never reached a slot. The payload lives in a take-once cell: either
    /// the accepted task delivers it, or the submission error path does.
    fn deliver_via_callback(&self, completion: Completion, result: Result<Event, PipelineError>) {
        let cell = Arc::new(Mutex::new(Some((completion, result))));
        let task_cell = Arc::clone(&cell);
        let task: Task = Box::new(move || {
            let taken = task_cell
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some((completion, result)) = taken {
                completion(result);
            }
        });
        if self.callback.submit(task).is_err() {
            let taken = cell.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some((completion, result)) = taken {
                completion(result);
            }
        }
    }
}

struct SlotQueue {
    items: VecDeque<(Event, Completion)>,
    draining: bool,
}

struct CompletionQueue {
    items: VecDeque<(Completion, Result<Event, PipelineError>)>,
    draining: bool,
}

/// One parallel execution slot: a FIFO dispatch queue plus at most one
/// in-flight dispatch task, giving per-slot ordering without locking around
/// the processor itself. Completions funnel through a second single-drain
/// queue on the callback scheduler, so they also land in submission order.
struct ProcessorSink {
    shared: Arc<Shared>,
    slot: usize,
    queue: Mutex<SlotQueue>,
    completions: Mutex<CompletionQueue>,
    weak_self: Weak<Self>,
}

impl ProcessorSink {
    fn new(shared: Arc<Shared>, slot: usize) -> Arc<Self> {
        let sink = Arc::new_cyclic(|weak_self| Self {
            shared: Arc::clone(&shared),
            slot,
            queue: Mutex::new(SlotQueue {
                items: VecDeque::new(),
                draining: false,
            }),
            completions: Mutex::new(CompletionQueue {
                items: VecDeque::new(),
                draining: false,
            }),
            weak_self: weak_self.clone(),
        });
        shared.lock_sinks().push(Arc::downgrade(&sink));
        sink
    }

    fn lock_queue(&self) -> MutexGuard<'_, SlotQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_completions(&self) -> MutexGuard<'_, CompletionQueue> {
        self.completions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_drain(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let task: Task = Box::new(move || this.drain_one());
        if self.shared.dispatcher.submit(task).is_err() {
            self.fail_queued(&PipelineError::SchedulerShutDown);
        }
    }

    fn drain_one(&self) {
        let entry = {
            let mut queue = self.lock_queue();
            match queue.items.pop_front() {
                Some(entry) => entry,
                None => {
                    queue.draining = false;
                    return;
                }
            }
        };

        let (event, completion) = entry;
        if self.shared.is_disposed() {
            self.deliver(completion, Err(PipelineError::Cancelled));
        } else {
            self.process_entry(event, completion);
        }

        let more = {
            let mut queue = self.lock_queue();
            if queue.items.is_empty() {
                queue.draining = false;
                false
            } else {
                true
            }
        };
        if more {
            self.schedule_drain();
        }
    }

    /// Runs one event through hooks, span, processor and the callback hop.
    /// Executes on the dispatch thread.
    fn process_entry(&self, event: Event, completion: Completion) {
        let shared = &self.shared;
        let correlation = event.correlation_id().to_string();
        shared.trigger(ProfilingEventType::StartingFlowExecution, &correlation, None);
        shared.trigger(ProfilingEventType::StartingExecution, &correlation, None);

        let span_name = format!("{}:processor", shared.artifact_id);
        let span = shared.open_span(&span_name, &event);

        let component = format!("{}/slot-{}", shared.artifact_id, self.slot);
        let forked = event
            .subscribed_processors()
            .add_subscribed_processor(component.as_str());
        let mut event = event.with_subscribed_context(forked);
        if let Some(id) = span {
            event = event.with_current_span(id);
        }

        let result = (shared.processor)(event);

        let outcome = if result.is_ok() {
            ExecutionOutcome::Success
        } else {
            ExecutionOutcome::Error
        };
        if let Some(id) = span {
            let span_outcome = if result.is_ok() {
                SpanOutcome::Ok
            } else {
                SpanOutcome::Error
            };
            shared.seal_span(id, span_outcome);
        }
        shared.trigger(ProfilingEventType::Executed, &correlation, Some(outcome));

        self.deliver(completion, result.map_err(PipelineError::from));
    }

    /// Enqueues one terminal outcome for the callback hop. Completions on a
    /// slot drain one at a time in enqueue order.
    fn deliver(&self, completion: Completion, result: Result<Event, PipelineError>) {
        let schedule = {
            let mut queue = self.lock_completions();
            queue.items.push_back((completion, result));
            if queue.draining {
                false
            } else {
                queue.draining = true;
                true
            }
        };
        if schedule {
            self.schedule_completion_drain();
        }
    }

    fn schedule_completion_drain(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let task: Task = Box::new(move || this.drain_one_completion());
        if self.shared.callback.submit(task).is_err() {
            // Callback pool is gone. Deliver inline, preserving order, so
            // every event still observes its terminal outcome.
            let drained: Vec<(Completion, Result<Event, PipelineError>)> = {
                let mut queue = self.lock_completions();
                queue.draining = false;
                queue.items.drain(..).collect()
            };
            for (completion, result) in drained {
                completion(result);
            }
        }
    }

    fn drain_one_completion(&self) {
        let entry = {
            let mut queue = self.lock_completions();
            match queue.items.pop_front() {
                Some(entry) => entry,
                None => {
                    queue.draining = false;
                    return;
                }
            }
        };
        let (completion, result) = entry;
        completion(result);

        let more = {
            let mut queue = self.lock_completions();
            if queue.items.is_empty() {
                queue.draining = false;
                false
            } else {
                true
            }
        };
        if more {
            self.schedule_completion_drain();
        }
    }

    /// Completes everything queued on this slot with `error` and stops the
    /// dispatch loop. Used on dispose and when the dispatcher is gone.
    fn fail_queued(&self, error: &PipelineError) {
        let drained: Vec<(Event, Completion)> = {
            let mut queue = self.lock_queue();
            queue.draining = false;
            queue.items.drain(..).collect()
        };
        for (_event, completion) in drained {
            self.deliver(completion, Err(error.clone()));
        }
    }
}

impl EventSink for ProcessorSink {
    fn accept(&self, event: Event, completion: Completion) {
        if self.shared.is_disposed() {
            self.deliver(completion, Err(PipelineError::Cancelled));
            return;
        }
        self.shared
            .trigger(ProfilingEventType::Scheduling, event.correlation_id(), None);

        let schedule = {
            let mut queue = self.lock_queue();
            queue.items.push_back((event, completion));
            if queue.draining {
                false
            } else {
                queue.draining = true;
                true
            }
        };
        if schedule {
            self.schedule_drain();
        }
    }
}
