//! Saturation-tolerant submission: a decorator that turns scheduler
//! rejection into timed retries instead of caller-visible failures.

use crate::error::ScheduleError;
use crate::scheduler::{Scheduler, SubmitError, Task, TaskHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

/// Callback invoked by the retry decorator. `on_rejected` fires once per
/// rejected attempt (a metrics hook); `on_recovered` fires once per task
/// journey, on the first acceptance following at least one rejection.
pub type RejectionCallback = Arc<dyn Fn() + Send + Sync>;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Fixed delay between a rejection and the next attempt.
    pub retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(10),
        }
    }
}

/// Per-instance counters, safe under concurrent submission. Injected per
/// decorator instance, never process-wide, so pipelines cannot interfere
/// with each other's numbers.
#[derive(Debug, Default)]
pub struct RetryMetrics {
    rejections: AtomicU64,
    recoveries: AtomicU64,
    accepted: AtomicU64,
    abandoned: AtomicU64,
}

impl RetryMetrics {
    /// Total rejected attempts (one task may contribute many).
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Tasks accepted after at least one rejection.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Tasks accepted by the delegate.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Tasks abandoned because of shutdown. Never incremented while the
    /// decorator is live and healthy.
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }
}

/// Decorates a [`Scheduler`] so rejection never fails a submission.
///
/// On rejection the task is re-submitted on a retry-timer scheduler after a
/// fixed delay, indefinitely. Every submitted task is either eventually
/// accepted by the delegate exactly once, or abandoned only as a consequence
/// of explicit [`shutdown_now`](Self::shutdown_now) — never dropped silently.
pub struct RejectionRetryingScheduler {
    delegate: Arc<dyn Scheduler>,
    timer: Arc<dyn Scheduler>,
    retry_delay: Duration,
    on_rejected: RejectionCallback,
    on_recovered: RejectionCallback,
    metrics: Arc<RetryMetrics>,
    shut_down: AtomicBool,
    pending: Mutex<Vec<TaskHandle>>,
    weak_self: Weak<Self>,
}

impl RejectionRetryingScheduler {
    pub fn new(
        delegate: Arc<dyn Scheduler>,
        timer: Arc<dyn Scheduler>,
        config: RetryConfig,
    ) -> Arc<Self> {
        Self::with_callbacks(delegate, timer, config, Arc::new(|| {}), Arc::new(|| {}))
    }

    pub fn with_callbacks(
        delegate: Arc<dyn Scheduler>,
        timer: Arc<dyn Scheduler>,
        config: RetryConfig,
        on_rejected: RejectionCallback,
        on_recovered: RejectionCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            delegate,
            timer,
            retry_delay: config.retry_delay,
            on_rejected,
            on_recovered,
            metrics: Arc::new(RetryMetrics::default()),
            shut_down: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Submits a task to the delegate, absorbing rejection internally.
    ///
    /// Returns `Ok` once the task is accepted or queued for retry. The only
    /// error a caller can observe is shutdown.
    pub fn submit(&self, task: Task) -> Result<(), ScheduleError> {
        self.dispatch(task, false)
    }

    fn dispatch(&self, task: Task, rejected_before: bool) -> Result<(), ScheduleError> {
        let mut task = task;
        let mut rejected_before = rejected_before;
        loop {
            if self.is_shutdown() {
                if rejected_before {
                    self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
                }
                return Err(ScheduleError::ShutDown);
            }

            match self.delegate.submit(task) {
                Ok(_) => {
                    self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
                    if rejected_before {
                        self.metrics.recoveries.fetch_add(1, Ordering::Relaxed);
                        (self.on_recovered)();
                    }
                    return Ok(());
                }
                Err(SubmitError::Rejected(returned)) => {
                    self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
                    (self.on_rejected)();
                    if self.timer.runs_inline() {
                        // An inline timer would re-enter this dispatch on the
                        // same stack, one frame per rejected attempt. Wait
                        // the delay here and loop instead.
                        if !self.retry_delay.is_zero() {
                            std::thread::sleep(self.retry_delay);
                        }
                        task = returned;
                        rejected_before = true;
                        continue;
                    }
                    return self.schedule_retry(returned);
                }
                Err(SubmitError::ShutDown(_)) => {
                    if rejected_before {
                        self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(ScheduleError::ShutDown);
                }
            }
        }
    }

    fn schedule_retry(&self, task: Task) -> Result<(), ScheduleError> {
        let Some(this) = self.weak_self.upgrade() else {
            return Err(ScheduleError::ShutDown);
        };
        let retry: Task = Box::new(move || {
            // Outcome already accounted for inside dispatch.
            let _ = this.dispatch(task, true);
        });
        match self.timer.submit_after(self.retry_delay, retry) {
            Ok(handle) => {
                let mut pending = self.lock_pending();
                pending.retain(|h| !h.is_finished());
                pending.push(handle);
                Ok(())
            }
            Err(_) => {
                self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
                Err(ScheduleError::ShutDown)
            }
        }
    }

    /// Stops scheduling further retries and cancels pending ones. Tasks
    /// already accepted by the delegate are unaffected. Idempotent.
    pub fn shutdown_now(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = {
            let mut pending = self.lock_pending();
            std::mem::take(&mut *pending)
        };
        for handle in pending {
            if !handle.is_finished() {
                handle.cancel();
                self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<RetryMetrics> {
        &self.metrics
    }

    pub fn delegate_name(&self) -> &str {
        self.delegate.name()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<TaskHandle>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{CallerScheduler, TokioScheduler};
    use std::sync::atomic::AtomicU32;

    /// Delegate that rejects a configured number of submissions, then
    /// forwards to a real scheduler.
    struct RejectingScheduler {
        remaining: AtomicU64,
        inner: Arc<dyn Scheduler>,
    }

    impl RejectingScheduler {
        fn new(reject_count: u64, inner: Arc<dyn Scheduler>) -> Self {
            Self {
                remaining: AtomicU64::new(reject_count),
                inner,
            }
        }
    }

    impl Scheduler for RejectingScheduler {
        fn submit(&self, task: Task) -> Result<TaskHandle, SubmitError> {
            let claimed = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
            if claimed.is_ok() {
                Err(SubmitError::Rejected(task))
            } else {
                self.inner.submit(task)
            }
        }

        fn submit_after(&self, delay: Duration, task: Task) -> Result<TaskHandle, SubmitError> {
            self.inner.submit_after(delay, task)
        }

        fn name(&self) -> &str {
            "rejecting"
        }
    }

    async fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        condition()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn task_survives_ten_thousand_rejections_and_runs_once() {
        let handle = tokio::runtime::Handle::current();
        let pool: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(handle.clone(), "cpu"));
        let delegate = Arc::new(RejectingScheduler::new(10_000, pool));
        let timer: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(handle, "timer"));

        let rejected_calls = Arc::new(AtomicU64::new(0));
        let recovered_calls = Arc::new(AtomicU64::new(0));
        let rejected_probe = Arc::clone(&rejected_calls);
        let recovered_probe = Arc::clone(&recovered_calls);

        let retrying = RejectionRetryingScheduler::with_callbacks(
            delegate,
            timer,
            RetryConfig {
                retry_delay: Duration::ZERO,
            },
            Arc::new(move || {
                rejected_probe.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move || {
                recovered_probe.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        retrying
            .submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(
            wait_until(Duration::from_secs(30), || runs.load(Ordering::SeqCst) == 1).await,
            "task never ran; rejections so far: {}",
            retrying.metrics().rejections()
        );

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(rejected_calls.load(Ordering::SeqCst), 10_000);
        assert_eq!(recovered_calls.load(Ordering::SeqCst), 1);
        assert_eq!(retrying.metrics().rejections(), 10_000);
        assert_eq!(retrying.metrics().recoveries(), 1);
        assert_eq!(retrying.metrics().accepted(), 1);
    }

    #[test]
    fn inline_timer_absorbs_sustained_rejection_without_growing_the_stack() {
        let inner: Arc<dyn Scheduler> = Arc::new(CallerScheduler::default());
        let delegate = Arc::new(RejectingScheduler::new(10_000, inner));
        let timer: Arc<dyn Scheduler> = Arc::new(CallerScheduler::default());

        let retrying = RejectionRetryingScheduler::new(
            delegate,
            timer,
            RetryConfig {
                retry_delay: Duration::ZERO,
            },
        );

        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        retrying
            .submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        // 10,000 inline retries complete on one stack frame's worth of depth.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(retrying.metrics().rejections(), 10_000);
        assert_eq!(retrying.metrics().recoveries(), 1);
        assert_eq!(retrying.metrics().accepted(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clean_acceptance_fires_no_callbacks() {
        let handle = tokio::runtime::Handle::current();
        let pool: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(handle.clone(), "cpu"));
        let timer: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(handle, "timer"));

        let recovered_calls = Arc::new(AtomicU64::new(0));
        let recovered_probe = Arc::clone(&recovered_calls);
        let retrying = RejectionRetryingScheduler::with_callbacks(
            pool,
            timer,
            RetryConfig::default(),
            Arc::new(|| {}),
            Arc::new(move || {
                recovered_probe.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        retrying
            .submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) == 1).await);
        assert_eq!(recovered_calls.load(Ordering::SeqCst), 0);
        assert_eq!(retrying.metrics().rejections(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_cancels_pending_retries_and_rejects_new_work() {
        let handle = tokio::runtime::Handle::current();
        let pool: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(handle.clone(), "cpu"));
        // Delegate that never accepts.
        let delegate = Arc::new(RejectingScheduler::new(u64::MAX, pool));
        let timer: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(handle, "timer"));

        let retrying = RejectionRetryingScheduler::new(
            delegate,
            timer,
            RetryConfig {
                retry_delay: Duration::from_millis(20),
            },
        );

        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        retrying
            .submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        retrying.shutdown_now();
        let rejections_at_shutdown = retrying.metrics().rejections();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(retrying.metrics().abandoned() >= 1);
        // No retry scheduled after shutdown beyond the in-flight one.
        assert!(retrying.metrics().rejections() <= rejections_at_shutdown + 1);

        let result = retrying.submit(Box::new(|| {}));
        assert_eq!(result, Err(ScheduleError::ShutDown));
    }
}
