//! Bounded worker-thread pool that runs blocking commit and rollback calls off the scheduler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{Span, debug, dispatcher};

use crate::error::SqlComponentError;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct ExecutorState {
    sender: Option<Sender<Job>>,
    receiver: Arc<Mutex<Receiver<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

struct ExecutorInner {
    name: String,
    max_workers: usize,
    runtime: Option<Handle>,
    idle: Arc<AtomicUsize>,
    state: Mutex<ExecutorState>,
}

/// Runs closures on up to `max_workers` OS threads.
///
/// Threads are spawned lazily, only when no worker is idle. Each worker enters the Tokio
/// runtime that was current when the executor was built, so jobs may use `Handle::current()`.
/// [`run`](CommitExecutor::run) carries the caller's tracing dispatcher and span over to the
/// worker thread.
#[derive(Clone)]
pub struct CommitExecutor {
    inner: Arc<ExecutorInner>,
}

impl CommitExecutor {
    #[must_use]
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        Self {
            inner: Arc::new(ExecutorInner {
                name: name.into(),
                max_workers: max_workers.max(1),
                runtime: Handle::try_current().ok(),
                idle: Arc::new(AtomicUsize::new(0)),
                state: Mutex::new(ExecutorState {
                    sender: Some(sender),
                    receiver: Arc::new(Mutex::new(receiver)),
                    workers: Vec::new(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Worker threads spawned so far.
    #[must_use]
    pub fn spawned_workers(&self) -> usize {
        self.lock_state().workers.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ExecutorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self, state: &mut ExecutorState) -> Result<(), SqlComponentError> {
        let receiver = Arc::clone(&state.receiver);
        let idle = Arc::clone(&self.inner.idle);
        let runtime = self.inner.runtime.clone();
        let worker = thread::Builder::new()
            .name(format!("{}-{}", self.inner.name, state.workers.len()))
            .spawn(move || {
                let _runtime_guard = runtime.as_ref().map(Handle::enter);
                worker_loop(&receiver, &idle);
            })
            .map_err(|e| {
                SqlComponentError::ExecutorError(format!("failed to spawn worker thread: {e}"))
            })?;
        state.workers.push(worker);
        Ok(())
    }

    fn submit(&self, job: Job) -> Result<(), SqlComponentError> {
        let mut state = self.lock_state();
        let Some(sender) = state.sender.clone() else {
            return Err(SqlComponentError::ExecutorError(
                "commit executor is shut down".into(),
            ));
        };
        if self.inner.idle.load(Ordering::Acquire) == 0
            && state.workers.len() < self.inner.max_workers
        {
            self.spawn_worker(&mut state)?;
        }
        sender
            .send(job)
            .map_err(|_| SqlComponentError::ExecutorError("commit executor is shut down".into()))
    }

    /// Run `func` on a worker thread and await its result.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ExecutorError` after shutdown or if `func` panics;
    /// otherwise whatever `func` returns.
    pub async fn run<F, R>(&self, func: F) -> Result<R, SqlComponentError>
    where
        F: FnOnce() -> Result<R, SqlComponentError> + Send + 'static,
        R: Send + 'static,
    {
        let dispatch = dispatcher::get_default(Clone::clone);
        let span = Span::current();
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                dispatcher::with_default(&dispatch, || span.in_scope(func))
            }));
            let _ = tx.send(outcome.unwrap_or_else(|_| {
                Err(SqlComponentError::ExecutorError("commit job panicked".into()))
            }));
        }))?;
        rx.await.map_err(|_| {
            SqlComponentError::ExecutorError("commit executor dropped the job".into())
        })?
    }

    /// Stop accepting work, let the workers drain the queue, then join them.
    ///
    /// # Errors
    /// Returns `SqlComponentError::ExecutorError` if a worker thread panicked.
    pub async fn shutdown(&self) -> Result<(), SqlComponentError> {
        let workers = {
            let mut state = self.lock_state();
            state.sender = None;
            std::mem::take(&mut state.workers)
        };
        let count = workers.len();
        let failures = tokio::task::spawn_blocking(move || {
            workers
                .into_iter()
                .map(JoinHandle::join)
                .filter(Result::is_err)
                .count()
        })
        .await
        .map_err(|e| SqlComponentError::ExecutorError(format!("shutdown join error: {e}")))?;
        debug!(executor = %self.inner.name, workers = count, "commit executor shut down");
        if failures > 0 {
            return Err(SqlComponentError::ExecutorError(format!(
                "{failures} worker thread(s) panicked"
            )));
        }
        Ok(())
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>, idle: &AtomicUsize) {
    loop {
        idle.fetch_add(1, Ordering::AcqRel);
        let job = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        idle.fetch_sub(1, Ordering::AcqRel);
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}
