//! Task driver for an encoding stage
//!
//! Owns an [`EncodeStage`] and multiplexes its three wake-up sources: input
//! from upstream, the arbiter grant of a pending deal, and the release of a
//! blocked frame. Closing the input channel tears the stage down.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use super::arbiter::Grant;
use super::control::{Control, ControlReply, OutputEvent};
use super::engine::CodecEngine;
use super::sink::Blocked;
use super::stage::{Admission, EncodeStage};
use crate::error::{ErrorKind, StageError};
use crate::pipeline::PipelineStage;
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::types::Frame;

/// Message sent to a running stage
pub enum StageInput {
    Frame(Frame),
    /// Control command and where to send its reply
    Control(Control, oneshot::Sender<Result<ControlReply, StageError>>),
}

impl StageInput {
    /// Wrap a control command, returning the receiver of its reply
    pub fn control(command: Control) -> (Self, oneshot::Receiver<Result<ControlReply, StageError>>) {
        let (tx, rx) = oneshot::channel();
        (StageInput::Control(command, tx), rx)
    }
}

enum Wake {
    Deal(Option<Grant>),
    Unblocked,
    Input(Option<StageInput>),
}

/// Runs an [`EncodeStage`] as a [`PipelineStage`]
pub struct EncodeRunner<E: CodecEngine + 'static> {
    stage: EncodeStage<E>,
    input_rx: Option<mpsc::Receiver<StageInput>>,
}

impl<E: CodecEngine + 'static> EncodeRunner<E> {
    pub fn new(stage: EncodeStage<E>) -> Self {
        Self {
            stage,
            input_rx: None,
        }
    }

    /// Create the input channel, sized from the stage configuration
    pub fn input(&mut self) -> mpsc::Sender<StageInput> {
        let (tx, rx) = mpsc::channel(self.stage.config().output_capacity.max(1));
        self.input_rx = Some(rx);
        tx
    }

    /// Get the output channel for encoded frames
    pub fn take_output(&mut self) -> mpsc::UnboundedReceiver<OutputEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stage.set_output(tx);
        rx
    }

    pub fn stage(&self) -> &EncodeStage<E> {
        &self.stage
    }

    pub fn stage_mut(&mut self) -> &mut EncodeStage<E> {
        &mut self.stage
    }

    /// Push a frame, keeping it aside if the stage blocks
    fn push(&mut self, frame: Frame, blocked: &mut Option<Blocked>) -> Result<(), StageError> {
        match self.stage.input(frame) {
            Ok(Admission::Blocked(refused)) => *blocked = Some(refused),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Allocation => return Err(err),
            Err(err) => warn!("EncodeStage[{}]: frame refused ({})", self.stage.name(), err),
        }
        Ok(())
    }

    async fn event_loop(&mut self, input_rx: &mut mpsc::Receiver<StageInput>) -> Result<(), StageError> {
        let mut blocked: Option<Blocked> = None;

        loop {
            let wake = tokio::select! {
                grant = self.stage.wait_deal(), if self.stage.has_pending_deal() => Wake::Deal(grant),
                () = released(&mut blocked), if blocked.is_some() => Wake::Unblocked,
                input = input_rx.recv(), if blocked.is_none() => Wake::Input(input),
            };

            match wake {
                Wake::Deal(Some(grant)) => {
                    if let Err(err) = self.stage.complete_deal(grant) {
                        if err.kind() == ErrorKind::Allocation {
                            return Err(err);
                        }
                        warn!("EncodeStage[{}]: {}", self.stage.name(), err);
                    }
                }
                Wake::Deal(None) => debug!("EncodeStage[{}]: deal cancelled", self.stage.name()),
                Wake::Unblocked => {
                    if let Some(Blocked { frame, .. }) = blocked.take() {
                        self.push(frame, &mut blocked)?;
                    }
                }
                Wake::Input(Some(StageInput::Frame(frame))) => self.push(frame, &mut blocked)?,
                Wake::Input(Some(StageInput::Control(command, reply))) => {
                    let _ = reply.send(self.stage.control(command));
                }
                Wake::Input(None) => {
                    // let held frames through before teardown
                    while self.stage.has_pending_deal() {
                        if let Err(err) = self.stage.process_deal().await {
                            if err.kind() == ErrorKind::Allocation {
                                return Err(err);
                            }
                            warn!("EncodeStage[{}]: {}", self.stage.name(), err);
                        }
                    }
                    return Ok(());
                }
            }
        }
    }
}

/// Resolves once the blocked frame may be pushed again; pending if none
async fn released(blocked: &mut Option<Blocked>) {
    match blocked {
        Some(blocked) => blocked.blocker.released().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl<E: CodecEngine + 'static> PipelineStage for EncodeRunner<E> {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input channel"))?;

        // opens are deferred to this task
        if self.stage.scheduler().is_none() {
            self.stage.control(Control::SetScheduler(Scheduler::current()))?;
        }

        info!("EncodeStage[{}]: started", self.stage.name());
        let result = self.event_loop(&mut input_rx).await;

        if let Err(err) = self.stage.shutdown().await {
            warn!("EncodeStage[{}]: teardown failed ({})", self.stage.name(), err);
        }
        info!("EncodeStage[{}]: finished", self.stage.name());
        Ok(result?)
    }

    fn name(&self) -> &str {
        self.stage.name()
    }
}
