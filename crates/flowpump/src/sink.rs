//! Fan-out publish points.
//!
//! A [`SinkSupplier`] hands out one of N independent sinks, each bound 1:1
//! to a parallel execution slot. Round-robin assignment spreads
//! non-transactional work; the transaction-aware variant pins a bound
//! transaction to one dedicated sink so a single transactional unit of work
//! is never split across concurrent slots.

use crate::error::PipelineError;
use crate::event::Event;
use crate::transaction::{current_transaction, TransactionId};
use crossbeam_utils::CachePadded;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;

/// Delivers the terminal outcome of one event. Invoked exactly once.
pub type Completion = Box<dyn FnOnce(Result<Event, PipelineError>) + Send + 'static>;

/// A single publish point bound to one parallel execution slot.
///
/// `accept` consumes the event and guarantees exactly one completion call,
/// even when the sink can no longer process (the completion then observes a
/// terminal error).
pub trait EventSink: Send + Sync {
    fn accept(&self, event: Event, completion: Completion);
}

/// Produces the sink an incoming event should be published to.
pub trait SinkSupplier: Send + Sync {
    fn get(&self) -> Arc<dyn EventSink>;
}

/// Factory building one sink per slot.
pub type SinkFactory = Box<dyn Fn() -> Arc<dyn EventSink> + Send + Sync>;

/// Cycles through N pre-created sinks in creation order, wrapping after N.
///
/// N consecutive `get()` calls return N pairwise-distinct sinks; call N+1
/// repeats call 1. The cursor is the only shared state and is padded to its
/// own cache line.
pub struct RoundRobinSinkSupplier {
    sinks: Vec<Arc<dyn EventSink>>,
    cursor: CachePadded<AtomicUsize>,
}

impl RoundRobinSinkSupplier {
    /// Eagerly builds `n` sinks via `factory` (called with the slot index).
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn new(n: usize, factory: impl Fn(usize) -> Arc<dyn EventSink>) -> Self {
        assert!(n >= 1, "round-robin supplier needs at least one sink");
        Self {
            sinks: (0..n).map(factory).collect(),
            cursor: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl SinkSupplier for RoundRobinSinkSupplier {
    fn get(&self) -> Arc<dyn EventSink> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.sinks.len();
        Arc::clone(&self.sinks[idx])
    }
}

/// Pins transactional work to a dedicated per-thread sink.
///
/// While the calling thread is bound to a transaction, every `get()` on that
/// thread returns the same sink, created on first access for that
/// thread+transaction pair. Distinct concurrently-transacted threads receive
/// distinct sinks. Threads with no bound transaction delegate unchanged.
///
/// Reclamation is lazy: a thread's dedicated sink is dropped the next time
/// that thread calls `get()` without (or with a different) bound
/// transaction.
pub struct TransactionAwareSinkSupplier {
    factory: SinkFactory,
    delegate: Arc<dyn SinkSupplier>,
    bound: Mutex<HashMap<ThreadId, (TransactionId, Arc<dyn EventSink>)>>,
}

impl TransactionAwareSinkSupplier {
    pub fn new(factory: SinkFactory, delegate: Arc<dyn SinkSupplier>) -> Self {
        Self {
            factory,
            delegate,
            bound: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live thread-dedicated sinks (for diagnostics).
    pub fn bound_sinks(&self) -> usize {
        self.lock_bound().len()
    }

    fn lock_bound(
        &self,
    ) -> MutexGuard<'_, HashMap<ThreadId, (TransactionId, Arc<dyn EventSink>)>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SinkSupplier for TransactionAwareSinkSupplier {
    fn get(&self) -> Arc<dyn EventSink> {
        let thread = std::thread::current().id();
        match current_transaction() {
            Some(tx) => {
                let mut bound = self.lock_bound();
                match bound.get(&thread) {
                    Some((bound_tx, sink)) if *bound_tx == tx => Arc::clone(sink),
                    _ => {
                        // First access for this pair, or a stale binding
                        // from a previous transaction on this thread.
                        let sink = (self.factory)();
                        bound.insert(thread, (tx, Arc::clone(&sink)));
                        sink
                    }
                }
            }
            None => {
                let mut bound = self.lock_bound();
                bound.remove(&thread);
                drop(bound);
                self.delegate.get()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionBinding;

    struct NoopSink;

    impl EventSink for NoopSink {
        fn accept(&self, event: Event, completion: Completion) {
            completion(Ok(event));
        }
    }

    fn noop_factory(_slot: usize) -> Arc<dyn EventSink> {
        Arc::new(NoopSink)
    }

    #[test]
    fn round_robin_cycles_through_distinct_sinks() {
        for n in 1..=4 {
            let supplier = RoundRobinSinkSupplier::new(n, noop_factory);

            let first_cycle: Vec<_> = (0..n).map(|_| supplier.get()).collect();
            for i in 0..n {
                for j in (i + 1)..n {
                    assert!(
                        !Arc::ptr_eq(&first_cycle[i], &first_cycle[j]),
                        "sinks {i} and {j} must differ for n={n}"
                    );
                }
            }

            // Call N+1 repeats call 1.
            assert!(Arc::ptr_eq(&supplier.get(), &first_cycle[0]));
        }
    }

    #[test]
    fn transacted_thread_reuses_its_dedicated_sink() {
        let delegate = Arc::new(RoundRobinSinkSupplier::new(2, noop_factory));
        let supplier =
            TransactionAwareSinkSupplier::new(Box::new(|| Arc::new(NoopSink)), delegate);

        let _guard = TransactionBinding::bind(TransactionId(1));
        let first = supplier.get();
        let second = supplier.get();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(supplier.bound_sinks(), 1);
    }

    #[test]
    fn untransacted_threads_delegate_unchanged() {
        let delegate = Arc::new(RoundRobinSinkSupplier::new(2, noop_factory));
        let shared_delegate: Arc<dyn SinkSupplier> = delegate.clone();
        let supplier =
            TransactionAwareSinkSupplier::new(Box::new(|| Arc::new(NoopSink)), shared_delegate);

        // Round-robin order is observable straight through the wrapper.
        let a = supplier.get();
        let b = supplier.get();
        let c = supplier.get();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(supplier.bound_sinks(), 0);
    }

    #[test]
    fn dedicated_sink_is_reclaimed_after_unbind() {
        let delegate = Arc::new(RoundRobinSinkSupplier::new(1, noop_factory));
        let supplier =
            TransactionAwareSinkSupplier::new(Box::new(|| Arc::new(NoopSink)), delegate);

        let bound_sink = {
            let _guard = TransactionBinding::bind(TransactionId(1));
            supplier.get()
        };
        assert_eq!(supplier.bound_sinks(), 1);

        // Next untransacted access reclaims this thread's dedicated sink.
        let delegated = supplier.get();
        assert_eq!(supplier.bound_sinks(), 0);
        assert!(!Arc::ptr_eq(&bound_sink, &delegated));
    }

    #[test]
    fn concurrently_transacted_threads_get_distinct_sinks() {
        let delegate = Arc::new(RoundRobinSinkSupplier::new(1, noop_factory));
        let supplier = Arc::new(TransactionAwareSinkSupplier::new(
            Box::new(|| Arc::new(NoopSink)),
            delegate,
        ));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let supplier = Arc::clone(&supplier);
                std::thread::spawn(move || {
                    let _guard = TransactionBinding::bind(TransactionId(i));
                    let first = supplier.get();
                    let second = supplier.get();
                    assert!(Arc::ptr_eq(&first, &second));
                    first
                })
            })
            .collect();

        let sinks: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for i in 0..sinks.len() {
            for j in (i + 1)..sinks.len() {
                assert!(
                    !Arc::ptr_eq(&sinks[i], &sinks[j]),
                    "threads {i} and {j} must not share a transactional sink"
                );
            }
        }
    }
}
