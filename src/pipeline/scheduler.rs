//! Task scheduler used to defer work off the calling path

use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Handle on the event loop that runs deferred tasks
///
/// Tasks submitted from the same source are spawned in submission order.
#[derive(Clone, Debug)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the caller, if any
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Spawn a deferred task
    pub fn schedule<F>(&self, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        TaskHandle {
            join: self.handle.spawn(task),
        }
    }
}

/// Handle on a scheduled task
#[derive(Debug)]
pub struct TaskHandle {
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Cancel the task; it will not run past its next suspension point
    pub fn cancel(&self) {
        self.join.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_schedule_runs_task() {
        let scheduler = Scheduler::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.schedule(async move {
            let _ = tx.send(42u32);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let scheduler = Scheduler::current().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = scheduler.schedule(async move {
            flag.store(true, Ordering::SeqCst);
        });
        // current-thread runtime: the task cannot start before we yield
        handle.cancel();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_no_runtime() {
        assert!(Scheduler::current().is_none());
    }
}
