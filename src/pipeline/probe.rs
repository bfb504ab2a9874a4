//! Lifecycle notifications raised by stages to their owner

use log::{error, info};
use tokio::sync::mpsc;

use crate::error::ErrorKind;

/// Lifecycle event raised by a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    /// Stage is allocated and accepts input
    Ready { stage: String },
    /// Stage cannot make progress; the owner is expected to tear it down
    Fatal { stage: String, kind: ErrorKind },
    /// Stage has been released
    Dead { stage: String },
}

/// Sender side of the owner's event channel
///
/// Events are always logged; forwarding is best-effort and a closed channel
/// is not an error.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    tx: Option<mpsc::UnboundedSender<StageEvent>>,
}

impl Probe {
    /// Probe that only logs
    pub fn silent() -> Self {
        Self { tx: None }
    }

    /// Create a probe and the receiver the owner listens on
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn throw(&self, event: StageEvent) {
        match &event {
            StageEvent::Ready { stage } => info!("{}: ready", stage),
            StageEvent::Fatal { stage, kind } => error!("{}: fatal {:?} error", stage, kind),
            StageEvent::Dead { stage } => info!("{}: dead", stage),
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
