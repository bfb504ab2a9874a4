//! Bounded holding area for frames that arrive before the engine is open

use std::collections::VecDeque;
use tokio::sync::oneshot;

use super::arbiter::Arbiter;
use crate::pipeline::types::Frame;

#[derive(Debug)]
enum Release {
    /// Sent by the queue when the engine opens or the stage goes away
    Queue(oneshot::Receiver<()>),
    /// The arbiter grant becoming free
    Arbiter(Arbiter),
}

/// Token handed to upstream when the queue is full
///
/// Upstream must stop pushing until [`Blocker::released`] returns.
#[derive(Debug)]
pub struct Blocker {
    release: Release,
}

impl Blocker {
    /// Blocker released once nobody holds or waits for the arbiter grant
    ///
    /// Used when no open is pending on the stage, so that the retry happens
    /// when an inline open can succeed.
    pub(crate) fn on_arbiter(arbiter: Arbiter) -> Self {
        Self {
            release: Release::Arbiter(arbiter),
        }
    }

    /// Wait until the stage unblocks, or goes away
    ///
    /// Cancel safe.
    pub async fn released(&mut self) {
        match &mut self.release {
            Release::Queue(rx) => {
                let _ = rx.await;
            }
            Release::Arbiter(arbiter) => drop(arbiter.acquire().await),
        }
    }

    pub fn is_released(&mut self) -> bool {
        match &mut self.release {
            Release::Queue(rx) => !matches!(
                rx.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            ),
            Release::Arbiter(arbiter) => !arbiter.is_granted(),
        }
    }
}

/// Frame refused by a full queue, with the blocker to wait on
#[derive(Debug)]
pub struct Blocked {
    pub frame: Frame,
    pub blocker: Blocker,
}

/// FIFO of held frames, bounded by `max_depth`
#[derive(Debug)]
pub struct SinkQueue {
    frames: VecDeque<Frame>,
    max_depth: usize,
    blockers: Vec<oneshot::Sender<()>>,
}

impl SinkQueue {
    pub fn new(max_depth: usize) -> Self {
        let max_depth = max_depth.max(1);
        Self {
            frames: VecDeque::with_capacity(max_depth),
            max_depth,
            blockers: Vec::new(),
        }
    }

    /// Hold a frame, or hand it back with a blocker once the queue is full
    pub fn hold(&mut self, frame: Frame) -> Result<(), Blocked> {
        if self.is_full() {
            let (tx, rx) = oneshot::channel();
            self.blockers.push(tx);
            return Err(Blocked {
                frame,
                blocker: Blocker {
                    release: Release::Queue(rx),
                },
            });
        }
        self.frames.push_back(frame);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.max_depth
    }

    /// Whether upstream has been told to stop
    pub fn is_blocked(&self) -> bool {
        !self.blockers.is_empty()
    }

    /// Take every held frame, oldest first
    pub fn drain(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }

    /// Drop every held frame, returning how many were dropped
    pub fn flush(&mut self) -> usize {
        let count = self.frames.len();
        self.frames.clear();
        count
    }

    /// Release every outstanding blocker, returning how many were released
    pub fn unblock(&mut self) -> usize {
        let count = self.blockers.len();
        for blocker in self.blockers.drain(..) {
            let _ = blocker.send(());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::FrameClock;
    use bytes::Bytes;

    fn frame(pts: u64) -> Frame {
        Frame::block(Bytes::from_static(b"x"), FrameClock::with_pts(pts))
    }

    #[test]
    fn test_bound_triggers_blocker() {
        let mut queue = SinkQueue::new(2);
        assert!(queue.hold(frame(1)).is_ok());
        assert!(queue.hold(frame(2)).is_ok());
        assert!(queue.is_full());
        assert!(!queue.is_blocked());

        let blocked = queue.hold(frame(3)).unwrap_err();
        assert_eq!(blocked.frame.clock, FrameClock::with_pts(3));
        assert!(queue.is_blocked());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut queue = SinkQueue::new(4);
        for pts in 1..=3 {
            queue.hold(frame(pts)).unwrap();
        }
        let clocks: Vec<_> = queue.drain().into_iter().map(|f| f.clock).collect();
        assert_eq!(
            clocks,
            vec![
                FrameClock::with_pts(1),
                FrameClock::with_pts(2),
                FrameClock::with_pts(3)
            ]
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unblock_releases() {
        let mut queue = SinkQueue::new(1);
        queue.hold(frame(1)).unwrap();
        let Blocked { mut blocker, .. } = queue.hold(frame(2)).unwrap_err();
        assert!(!blocker.is_released());

        assert_eq!(queue.unblock(), 1);
        assert!(!queue.is_blocked());
        blocker.released().await;
        assert_eq!(queue.flush(), 1);
    }

    #[tokio::test]
    async fn test_dropped_queue_releases() {
        let mut queue = SinkQueue::new(1);
        queue.hold(frame(1)).unwrap();
        let Blocked { mut blocker, .. } = queue.hold(frame(2)).unwrap_err();
        drop(queue);
        blocker.released().await;
        assert!(blocker.is_released());
    }

    #[tokio::test]
    async fn test_arbiter_blocker_waits_for_grant() {
        let arbiter = Arbiter::new();
        let grant = arbiter.try_grab().unwrap();
        let mut blocker = Blocker::on_arbiter(arbiter.clone());
        assert!(!blocker.is_released());

        drop(grant);
        blocker.released().await;
        assert!(blocker.is_released());
        // waiting does not keep the grant
        assert!(arbiter.try_grab().is_some());
    }

    #[test]
    fn test_zero_depth_is_clamped() {
        assert_eq!(SinkQueue::new(0).max_depth(), 1);
    }
}
