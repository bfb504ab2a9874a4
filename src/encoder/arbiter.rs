//! Process-wide serialization of engine open and close
//!
//! Engines are not reentrant across instances when opening or closing, so
//! every stage sharing an [`Arbiter`] goes through a single FIFO grant. A
//! stage asks for the grant with a [`DealRequest`]: a deferred task queued on
//! the stage's scheduler that waits its turn and hands back a [`Grant`]. The
//! engine operation runs while the grant is alive; dropping the grant lets the
//! next requester in.

use log::debug;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};

use crate::pipeline::scheduler::{Scheduler, TaskHandle};

static GLOBAL: Lazy<Arbiter> = Lazy::new(Arbiter::new);

/// Engine operation a deal is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealKind {
    Open,
    Close,
}

/// Shared exclusive grant for engine open and close
#[derive(Debug, Clone)]
pub struct Arbiter {
    permits: Arc<Semaphore>,
}

impl Arbiter {
    /// Independent arbiter, for stages that do not share engines with the
    /// rest of the process
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Arbiter shared by the whole process
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Take the grant if nobody holds or waits for it
    pub fn try_grab(&self) -> Option<Grant> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Grant { _permit: permit })
    }

    /// Wait for the grant in line with every other requester
    pub async fn acquire(&self) -> Option<Grant> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| Grant { _permit: permit })
    }

    /// Queue a deferred request for the grant on `scheduler`
    pub fn request(&self, kind: DealKind, scheduler: &Scheduler) -> DealRequest {
        let arbiter = self.clone();
        let (tx, rx) = oneshot::channel();
        let task = scheduler.schedule(async move {
            if let Some(grant) = arbiter.acquire().await {
                // A dropped receiver hands the grant back immediately
                let _ = tx.send(grant);
            }
        });
        debug!("arbiter: {:?} deal requested", kind);
        DealRequest { kind, task, rx }
    }

    /// Whether a grant is currently held, or waiting to be picked up
    pub fn is_granted(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for Arbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to open or close an engine
///
/// Released on drop.
#[derive(Debug)]
pub struct Grant {
    _permit: OwnedSemaphorePermit,
}

/// Pending request for the grant
///
/// Dropping the request aborts it: a task that has not run yet never runs,
/// and a grant already handed over is released.
#[derive(Debug)]
pub struct DealRequest {
    kind: DealKind,
    task: TaskHandle,
    rx: oneshot::Receiver<Grant>,
}

impl DealRequest {
    pub fn kind(&self) -> DealKind {
        self.kind
    }

    /// Wait for the grant
    ///
    /// Cancel safe. Returns `None` if the deferred task was cancelled.
    pub async fn granted(&mut self) -> Option<Grant> {
        (&mut self.rx).await.ok()
    }

    /// Grant, if it has already been handed over
    pub fn try_granted(&mut self) -> Option<Grant> {
        self.rx.try_recv().ok()
    }

    pub fn abort(self) {
        debug!("arbiter: {:?} deal aborted", self.kind);
        drop(self);
    }
}

impl Drop for DealRequest {
    fn drop(&mut self) {
        self.task.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_single_grant() {
        let arbiter = Arbiter::new();
        let other = arbiter.clone();
        let scheduler = Scheduler::current().unwrap();

        let mut first = arbiter.request(DealKind::Open, &scheduler);
        let mut second = other.request(DealKind::Open, &scheduler);

        let grant = first.granted().await.unwrap();
        assert!(arbiter.is_granted());
        settle().await;
        assert!(second.try_granted().is_none());
        assert!(other.try_grab().is_none());

        drop(grant);
        let grant = second.granted().await.unwrap();
        assert!(arbiter.is_granted());
        drop(grant);
        assert!(!arbiter.is_granted());
    }

    #[tokio::test]
    async fn test_abort_before_run() {
        let arbiter = Arbiter::new();
        let scheduler = Scheduler::current().unwrap();
        let request = arbiter.request(DealKind::Close, &scheduler);
        assert_eq!(request.kind(), DealKind::Close);
        request.abort();
        settle().await;
        assert!(!arbiter.is_granted());
        assert!(arbiter.try_grab().is_some());
    }

    #[tokio::test]
    async fn test_abort_after_grant_releases() {
        let arbiter = Arbiter::new();
        let scheduler = Scheduler::current().unwrap();
        let request = arbiter.request(DealKind::Open, &scheduler);
        settle().await;
        // the grant sits in the channel until picked up
        assert!(arbiter.is_granted());
        drop(request);
        assert!(!arbiter.is_granted());
    }

    #[tokio::test]
    async fn test_try_grab_and_acquire() {
        let arbiter = Arbiter::new();
        let grant = arbiter.try_grab().unwrap();
        assert!(arbiter.try_grab().is_none());
        drop(grant);
        let grant = arbiter.acquire().await;
        assert!(grant.is_some());
    }

    #[test]
    fn test_global_is_shared() {
        let a = Arbiter::global();
        let b = Arbiter::global();
        assert!(Arc::ptr_eq(&a.permits, &b.permits));
    }
}
