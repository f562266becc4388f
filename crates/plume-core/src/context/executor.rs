//! Executors that accept units of work.

use crate::error::DispatchError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A unit of work handed to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run tasks, possibly on another thread.
pub trait Executor: Send + Sync + 'static {
    /// Queue `task` for execution.
    ///
    /// Fails with [`DispatchError::Rejected`] when the executor no longer
    /// accepts work.
    fn execute(&self, task: Task) -> Result<(), DispatchError>;

    /// Name used in logs and rejection errors
    fn name(&self) -> &str {
        "executor"
    }

    /// Whether the calling thread is one of this executor's threads
    fn in_executor(&self) -> bool {
        false
    }
}

/// Runs each task immediately on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, task: Task) -> Result<(), DispatchError> {
        task();
        Ok(())
    }

    fn name(&self) -> &str {
        "direct"
    }

    fn in_executor(&self) -> bool {
        true
    }
}

/// Spawns each task onto a tokio runtime
impl Executor for tokio::runtime::Handle {
    fn execute(&self, task: Task) -> Result<(), DispatchError> {
        self.spawn(async move { task() });
        Ok(())
    }

    fn name(&self) -> &str {
        "tokio"
    }
}

/// A single dedicated thread that runs tasks in submission order.
///
/// The thread drives a current-thread tokio runtime, so tasks may create
/// timers and channels. After [`shutdown`](Self::shutdown) every `execute`
/// is rejected.
pub struct EventLoop {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Start a new event loop thread
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Arc<Self>> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let loop_name = name.clone();
        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            let task_loop = loop_name.clone();
            runtime.block_on(async move {
                while let Some(task) = receiver.recv().await {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        warn!(event_loop = %task_loop, "task panicked on event loop");
                    }
                }
            });
            debug!(event_loop = %loop_name, "event loop stopped");
        })?;

        Ok(Arc::new(Self {
            name,
            thread_id: join.thread().id(),
            sender: Mutex::new(Some(sender)),
            join: Mutex::new(Some(join)),
        }))
    }

    /// Stop accepting tasks; already queued tasks still run.
    ///
    /// Waits for the thread to finish unless called from the loop itself.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);

        if self.in_executor() {
            return;
        }
        let join = self
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl Executor for EventLoop {
    fn execute(&self, task: Task) -> Result<(), DispatchError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sender.as_ref() {
            Some(sender) => sender
                .send(task)
                .map_err(|_| DispatchError::Rejected(self.name.clone())),
            None => Err(DispatchError::Rejected(self.name.clone())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn in_executor(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn test_event_loop_runs_tasks_in_order_on_its_thread() {
        let event_loop = EventLoop::spawn("test-loop").unwrap();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..3 {
            let tx = tx.clone();
            event_loop
                .execute(Box::new(move || {
                    let name = thread::current().name().map(str::to_owned);
                    tx.send((i, name)).unwrap();
                }))
                .unwrap();
        }

        for i in 0..3 {
            let (seen, name) = rx.recv().unwrap();
            assert_eq!(seen, i);
            assert_eq!(name.as_deref(), Some("test-loop"));
        }
        event_loop.shutdown();
    }

    #[test]
    fn test_event_loop_rejects_after_shutdown() {
        let event_loop = EventLoop::spawn("closing-loop").unwrap();
        event_loop.shutdown();
        assert!(event_loop.is_shutdown());

        let err = event_loop.execute(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(name) if name == "closing-loop"));
    }

    #[test]
    fn test_event_loop_survives_panicking_task() {
        let event_loop = EventLoop::spawn("sturdy-loop").unwrap();
        let (tx, rx) = std_mpsc::channel();
        event_loop.execute(Box::new(|| panic!("bad task"))).unwrap();
        event_loop
            .execute(Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        rx.recv().unwrap();
        event_loop.shutdown();
    }

    #[test]
    fn test_direct_executor_runs_inline() {
        let caller = thread::current().id();
        let (tx, rx) = std_mpsc::channel();
        DirectExecutor
            .execute(Box::new(move || tx.send(thread::current().id()).unwrap()))
            .unwrap();
        assert_eq!(rx.recv().unwrap(), caller);
    }
}
