//! Carrying a context value across dispatch boundaries.

use super::affinity::{with_affinity, Affinity};
use super::cell::ContextCell;
use super::executor::Executor;
use pin_project::pin_project;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// One activation of a context value on the current thread.
///
/// Entering swaps the value into the cell and remembers what was there;
/// exiting (explicitly or by drop, including unwinding) puts it back.
pub struct PropagationFrame<T: Clone + 'static> {
    cell: ContextCell<T>,
    previous: Option<T>,
    restored: bool,
}

impl<T: Clone + 'static> PropagationFrame<T> {
    pub fn enter(value: Option<T>) -> Self {
        let cell = ContextCell::new();
        let previous = cell.get_and_set(value);
        Self {
            cell,
            previous,
            restored: false,
        }
    }

    /// The value that was current before this frame was entered
    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }

    /// Restore the previous value and return the one current at exit
    pub fn exit(mut self) -> Option<T> {
        self.restored = true;
        self.cell.get_and_set(self.previous.take())
    }
}

impl<T: Clone + 'static> Drop for PropagationFrame<T> {
    fn drop(&mut self) {
        if !self.restored {
            self.restored = true;
            let _ = self.cell.get_and_set(self.previous.take());
        }
    }
}

/// Establishes a value of type `T` as current for a piece of work.
///
/// Two disciplines are offered: [`propagate`](Self::propagate) and
/// [`with_context`](Self::with_context) swap the value in for every step of
/// the work on whatever thread runs it; [`with_affinity`](Self::with_affinity)
/// additionally pins every step to one executor.
pub struct ContextBridge<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> ContextBridge<T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// The value current on this thread
    pub fn current(&self) -> Option<T> {
        ContextCell::<T>::new().current()
    }

    /// Run `work` with `value` current, restoring the previous value on every exit path.
    pub fn propagate<R>(&self, value: T, work: impl FnOnce() -> R) -> R {
        let _frame = PropagationFrame::enter(Some(value));
        work()
    }

    /// Wrap a future so `value` is current during each of its polls.
    ///
    /// Changes the future makes to the current value survive across polls.
    pub fn with_context<F: Future>(&self, value: T, future: F) -> WithContext<T, F> {
        WithContext {
            value: Some(value),
            inner: future,
        }
    }

    /// Run `future` on `executor` with `value` current for each poll.
    pub fn with_affinity<F>(
        &self,
        executor: Arc<dyn Executor>,
        value: T,
        future: F,
    ) -> Affinity<F::Output>
    where
        T: Send,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        with_affinity(executor, self.with_context(value, future))
    }
}

impl<T: Clone + 'static> Default for ContextBridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`ContextBridge::with_context`]
#[pin_project]
pub struct WithContext<T, F> {
    value: Option<T>,
    #[pin]
    inner: F,
}

impl<T: Clone + 'static, F: Future> Future for WithContext<T, F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.project();
        let frame = PropagationFrame::enter(this.value.take());
        let poll = this.inner.poll(cx);
        *this.value = frame.exit();
        poll
    }
}
