//! The scheduler capability every stage hop runs through.
//!
//! The core never creates raw OS threads: it only decides which pool runs
//! which stage, through the [`Scheduler`] trait. A saturated pool signals
//! rejection by handing the task back to the caller, in the same shape as a
//! full channel handing back the unsent item.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// A unit of work. Runs synchronously to completion on whichever thread the
/// scheduler hands it to.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a submitted task, used to cancel it before it starts.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. A task that has not started yet will be
    /// skipped; a task already running is unaffected.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `true` once the task has run (or been skipped).
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Runs the task unless cancelled, then marks the handle finished.
    fn run_gated(&self, task: Task) {
        if !self.is_cancelled() {
            task();
        }
        self.mark_finished();
    }
}

/// Submission failure. The task travels back with the error so the caller
/// can retry or drop it explicitly; a scheduler never consumes a task it
/// did not accept.
pub enum SubmitError {
    /// The pool is saturated. Transient: retrying later may succeed.
    Rejected(Task),
    /// The scheduler has been shut down. Terminal.
    ShutDown(Task),
}

impl SubmitError {
    /// Recovers ownership of the unaccepted task.
    pub fn into_task(self) -> Task {
        match self {
            Self::Rejected(task) | Self::ShutDown(task) => task,
        }
    }

    #[inline]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(_) => f.write_str("SubmitError::Rejected(..)"),
            Self::ShutDown(_) => f.write_str("SubmitError::ShutDown(..)"),
        }
    }
}

/// An execution pool accepting units of work.
pub trait Scheduler: Send + Sync {
    /// Submits a task for execution. A saturated scheduler returns
    /// `SubmitError::Rejected` with the task intact.
    fn submit(&self, task: Task) -> Result<TaskHandle, SubmitError>;

    /// Submits a task to run after `delay`. Used for retry timers.
    fn submit_after(&self, delay: Duration, task: Task) -> Result<TaskHandle, SubmitError>;

    /// Returns `true` if submitted tasks run on the submitting thread.
    /// Callers that would otherwise re-enter themselves through such a
    /// scheduler (retry loops) must iterate instead of resubmitting.
    fn runs_inline(&self) -> bool {
        false
    }

    /// Scheduler name for diagnostics.
    fn name(&self) -> &str;
}

/// Scheduler backed by a tokio runtime's blocking pool.
///
/// An optional concurrency limit turns pool saturation into an observable
/// rejection via `Semaphore::try_acquire`, which is what the rejection-
/// retrying decorator feeds on.
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
    name: String,
    limit: Option<Arc<Semaphore>>,
    closed: AtomicBool,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
            limit: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Bounds the number of concurrently running tasks; submissions beyond
    /// the bound are rejected rather than queued.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.limit = Some(Arc::new(Semaphore::new(max)));
        self
    }

    /// Marks the scheduler shut down. Tasks already accepted still run.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Scheduler for TokioScheduler {
    fn submit(&self, task: Task) -> Result<TaskHandle, SubmitError> {
        if self.is_shutdown() {
            return Err(SubmitError::ShutDown(task));
        }

        let permit = match &self.limit {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => return Err(SubmitError::Rejected(task)),
            },
            None => None,
        };

        let handle = TaskHandle::new();
        let gate = handle.clone();
        self.handle.spawn_blocking(move || {
            gate.run_gated(task);
            drop(permit);
        });
        Ok(handle)
    }

    fn submit_after(&self, delay: Duration, task: Task) -> Result<TaskHandle, SubmitError> {
        if self.is_shutdown() {
            return Err(SubmitError::ShutDown(task));
        }

        // Timer tasks are short control hops (retry re-submissions); they
        // run on the async pool without consuming a concurrency permit.
        let handle = TaskHandle::new();
        let gate = handle.clone();
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            gate.run_gated(task);
        });
        Ok(handle)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Scheduler that runs tasks inline on the submitting thread.
///
/// Default context scheduler for direct processing and the test substrate.
/// `submit_after` blocks the caller for the delay.
pub struct CallerScheduler {
    name: String,
}

impl CallerScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for CallerScheduler {
    fn default() -> Self {
        Self::new("caller")
    }
}

impl Scheduler for CallerScheduler {
    fn submit(&self, task: Task) -> Result<TaskHandle, SubmitError> {
        let handle = TaskHandle::new();
        handle.run_gated(task);
        Ok(handle)
    }

    fn submit_after(&self, delay: Duration, task: Task) -> Result<TaskHandle, SubmitError> {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.submit(task)
    }

    fn runs_inline(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    #[test]
    fn caller_scheduler_runs_inline() {
        let scheduler = CallerScheduler::default();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let handle = scheduler
            .submit(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert!(handle.is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounded_scheduler_rejects_when_saturated() {
        let scheduler =
            TokioScheduler::new(tokio::runtime::Handle::current(), "io").with_max_concurrency(1);

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        scheduler
            .submit(Box::new(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }))
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Pool occupied: next submission is handed back, not queued.
        let result = scheduler.submit(Box::new(|| {}));
        assert!(matches!(result, Err(SubmitError::Rejected(_))));

        release_tx.send(()).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_timer_task_never_runs() {
        let scheduler = TokioScheduler::new(tokio::runtime::Handle::current(), "timer");
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);

        let handle = scheduler
            .submit_after(
                Duration::from_millis(50),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(handle.is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_scheduler_returns_task() {
        let scheduler = TokioScheduler::new(tokio::runtime::Handle::current(), "io");
        scheduler.shutdown();

        let result = scheduler.submit(Box::new(|| {}));
        assert!(matches!(result, Err(SubmitError::ShutDown(_))));
    }
}
