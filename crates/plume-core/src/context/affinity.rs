//! Driving a future so that every poll happens on one designated executor.
//!
//! A wake never polls inline. It hands "the next step" to the executor as a
//! task, so the future resumes on that executor no matter which thread
//! triggered the wake-up.

use super::executor::Executor;
use crate::error::DispatchError;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use tokio::sync::oneshot;
use tracing::warn;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Completion<T> = Box<dyn FnOnce(Result<T, DispatchError>) + Send>;

/// Not scheduled, waiting for a wake
const IDLE: u8 = 0;
/// A poll step is queued on the executor
const SCHEDULED: u8 = 1;
/// A poll step is running
const RUNNING: u8 = 2;
/// Woken while running; the runner polls again before going idle
const NOTIFIED: u8 = 3;
const DONE: u8 = 4;

// `AffinityTask::dispatch`: whether `schedule` is inside `Executor::execute`
const NOT_EXECUTING: u8 = 0;
const EXECUTING: u8 = 1;
const DROPPED_IN_EXECUTE: u8 = 2;

struct AffinityTask<T> {
    state: AtomicU8,
    dispatch: AtomicU8,
    future: Mutex<Option<BoxFuture<T>>>,
    completion: Mutex<Option<Completion<T>>>,
    executor: Arc<dyn Executor>,
}

/// One queued poll step. An executor that drops the step without running it
/// (a tokio runtime that has shut down, say) fails the task with
/// [`DispatchError::Dropped`].
struct Step<T: Send + 'static> {
    task: Option<Arc<AffinityTask<T>>>,
}

impl<T: Send + 'static> Step<T> {
    fn run(mut self) {
        if let Some(task) = self.task.take() {
            task.run();
        }
    }
}

impl<T: Send + 'static> Drop for Step<T> {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        // Dropped inside `execute`: leave the outcome to `schedule`, which
        // still has to learn whether the executor rejected the step.
        if task
            .dispatch
            .compare_exchange(EXECUTING, DROPPED_IN_EXECUTE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        warn!(executor = task.executor.name(), "affinity step dropped before it ran");
        task.finish(Err(DispatchError::Dropped));
    }
}

impl<T: Send + 'static> AffinityTask<T> {
    fn schedule(self: &Arc<Self>) {
        let step = Step {
            task: Some(Arc::clone(self)),
        };
        self.dispatch.store(EXECUTING, Ordering::Release);
        let result = self.executor.execute(Box::new(move || step.run()));
        let dropped = self.dispatch.swap(NOT_EXECUTING, Ordering::AcqRel) == DROPPED_IN_EXECUTE;
        match result {
            Err(err) => {
                warn!(executor = self.executor.name(), "affinity dispatch rejected");
                self.finish(Err(err));
            }
            Ok(()) if dropped => {
                warn!(executor = self.executor.name(), "affinity step dropped before it ran");
                self.finish(Err(DispatchError::Dropped));
            }
            Ok(()) => {}
        }
    }

    fn run(self: Arc<Self>) {
        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        loop {
            if self
                .state
                .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let poll = {
                let mut slot = self
                    .future
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let Some(future) = slot.as_mut() else {
                    return;
                };
                match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
                    Ok(poll) => poll,
                    Err(_) => {
                        slot.take();
                        drop(slot);
                        self.finish(Err(DispatchError::Panicked));
                        return;
                    }
                }
            };

            match poll {
                Poll::Ready(output) => {
                    self.finish(Ok(output));
                    return;
                }
                Poll::Pending => {
                    match self.state.compare_exchange(
                        RUNNING,
                        IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        // Woken during the poll: we are already on the
                        // designated executor, so step again here.
                        Err(_) => self.state.store(SCHEDULED, Ordering::Release),
                    }
                }
            }
        }
    }

    fn finish(&self, result: Result<T, DispatchError>) {
        self.state.store(DONE, Ordering::Release);
        let future = self
            .future
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(future);

        let completion = self
            .completion
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(completion) = completion {
            completion(result);
        }
    }
}

impl<T> Drop for AffinityTask<T> {
    // Every waker is gone while the future is still pending: it can never
    // complete.
    fn drop(&mut self) {
        let completion = self
            .completion
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(completion) = completion {
            completion(Err(DispatchError::Dropped));
        }
    }
}

impl<T: Send + 'static> Wake for AffinityTask<T> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if next == SCHEDULED {
                        self.schedule();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Start `future` on `executor` and report its outcome to `on_complete`.
///
/// Every poll, including each resumption after a wake from an unrelated
/// thread, runs on `executor`. If the executor rejects a step the future is
/// dropped and `on_complete` receives the [`DispatchError`].
pub fn spawn_with_affinity<F, C>(executor: Arc<dyn Executor>, future: F, on_complete: C)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    C: FnOnce(Result<F::Output, DispatchError>) + Send + 'static,
{
    let task = Arc::new(AffinityTask {
        state: AtomicU8::new(SCHEDULED),
        dispatch: AtomicU8::new(NOT_EXECUTING),
        future: Mutex::new(Some(Box::pin(future))),
        completion: Mutex::new(Some(Box::new(on_complete))),
        executor,
    });
    task.schedule();
}

/// Run `future` on `executor`; the returned handle resolves to its output.
///
/// The future starts immediately, whether or not the handle is awaited.
pub fn with_affinity<F>(executor: Arc<dyn Executor>, future: F) -> Affinity<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    spawn_with_affinity(executor, future, move |result| {
        let _ = tx.send(result);
    });
    Affinity { rx }
}

/// Handle returned by [`with_affinity`]
pub struct Affinity<T> {
    rx: oneshot::Receiver<Result<T, DispatchError>>,
}

impl<T> Future for Affinity<T> {
    type Output = Result<T, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DispatchError::Dropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}
