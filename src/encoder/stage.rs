//! Encoding stage
//!
//! Feeds raw frames to a [`CodecEngine`] and pushes the encoded frames
//! downstream. The engine is opened lazily on the first frame through the
//! shared [`Arbiter`]; frames arriving meanwhile are held in a bounded
//! [`SinkQueue`] and replayed in order once the engine is open. Audio is
//! reframed to the engine frame size. Every frame entering the engine is
//! tracked by the [`Correlator`] so the encoded output inherits its dates.
//!
//! The stage itself never blocks. Waiting for the arbiter grant is the only
//! suspension point and is left to the owner through [`EncodeStage::wait_deal`]
//! and [`EncodeStage::complete_deal`], or the [`EncodeStage::process_deal`]
//! shortcut.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use super::arbiter::{Arbiter, DealKind, DealRequest, Grant};
use super::control::{Control, ControlReply, OutputEvent, OutputSender};
use super::correlator::Correlator;
use super::engine::{
    Capabilities, CodecEngine, EngineConfig, EngineFormat, EngineFrame, EngineParams, Packet,
};
use super::negotiate::Negotiator;
use super::reframer::{Reframer, SampleLayout, deinterleave};
use super::sink::{Blocked, Blocker, SinkQueue};
use super::timing::{LeakyBucket, TimingModel};
use crate::config::EncodeConfig;
use crate::error::{AllocError, ConfigError, ErrorKind, StageError};
use crate::pipeline::allocator::{BufferAllocator, PoolAllocator};
use crate::pipeline::flow::{FlowDescriptor, FlowFormat};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::probe::{Probe, StageEvent};
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::state::StageState;
use crate::pipeline::types::{Frame, MediaKind};

/// Outcome of pushing one frame into the stage
#[derive(Debug)]
pub enum Admission {
    /// The frame went through the engine
    Accepted,
    /// The frame is held until the engine opens
    Held,
    /// The queue is full: the frame is handed back and upstream must wait
    /// for the blocker before pushing it again
    Blocked(Blocked),
    /// The frame was invalid and has been dropped
    Dropped,
}

/// Encoding stage wrapping one codec engine
pub struct EncodeStage<E: CodecEngine> {
    name: String,
    engine: E,
    caps: Capabilities,
    config: EncodeConfig,
    options: BTreeMap<String, String>,

    arbiter: Arbiter,
    scheduler: Option<Scheduler>,
    allocator: Option<Arc<dyn BufferAllocator>>,
    output: Option<OutputSender>,
    probe: Probe,

    state: StageState,
    deal: Option<DealRequest>,
    sink: SinkQueue,
    reframer: Option<Reframer>,
    /// Byte layout of the negotiated sound input
    input_layout: Option<SampleLayout>,
    /// Channels and sample size to deinterleave packed input for a planar engine
    deinterleave: Option<(usize, usize)>,
    correlator: Correlator,
    /// Engine timestamp of the next submitted frame, in engine time base units
    next_pts: i64,
    timing: TimingModel,
    negotiator: Negotiator,

    health: Arc<PipelineHealth>,
}

impl<E: CodecEngine> EncodeStage<E> {
    /// Create a stage and announce it ready
    pub fn new(engine: E, arbiter: Arbiter, config: EncodeConfig, probe: Probe) -> Self {
        let caps = engine.capabilities();
        let stage = Self {
            name: config.name.clone(),
            engine,
            caps,
            options: config.options.clone(),
            sink: SinkQueue::new(config.max_queue_depth),
            config,
            arbiter,
            scheduler: None,
            allocator: Some(Arc::new(PoolAllocator::default())),
            output: None,
            probe,
            state: StageState::Closed,
            deal: None,
            reframer: None,
            input_layout: None,
            deinterleave: None,
            correlator: Correlator::new(),
            next_pts: 1,
            timing: TimingModel::new(),
            negotiator: Negotiator::new(),
            health: Arc::new(PipelineHealth::new()),
        };
        stage.probe.throw(StageEvent::Ready {
            stage: stage.name.clone(),
        });
        stage
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        Arc::clone(&self.health)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &EncodeConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Frames waiting for the engine to open
    pub fn held(&self) -> usize {
        self.sink.len()
    }

    /// Frames inside the engine waiting for output
    pub fn in_flight(&self) -> usize {
        self.correlator.len()
    }

    pub fn is_blocked(&self) -> bool {
        self.sink.is_blocked()
    }

    pub fn has_pending_deal(&self) -> bool {
        self.deal.is_some()
    }

    /// Bytes of audio retained for the next engine frame
    pub fn retained_bytes(&self) -> usize {
        self.reframer.as_ref().map_or(0, Reframer::retained_bytes)
    }

    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    pub fn set_output(&mut self, output: OutputSender) {
        self.output = Some(output);
    }

    // ========================================================================
    // Input
    // ========================================================================

    /// Push one frame into the stage
    pub fn input(&mut self, frame: Frame) -> Result<Admission, StageError> {
        if self.state.is_terminating() {
            return Err(StageError::Terminated(self.state.description()));
        }
        if self.negotiator.input().is_none() {
            warn!("EncodeStage[{}]: frame received before any flow definition", self.name);
            self.health.record_frame_drop();
            return Err(ConfigError::NoFlowDefinition.into());
        }

        let admission = if self.state.is_open() {
            self.encode(frame)?
        } else if self.deal.is_some() {
            self.hold(frame)
        } else {
            if let Err(err) = self.open() {
                self.health.record_frame_drop();
                return Err(err);
            }
            // a direct open replays held frames first
            if self.state.is_open() {
                self.encode(frame)?
            } else {
                self.hold(frame)
            }
        };

        if !matches!(admission, Admission::Blocked(_)) {
            self.health.record_input();
        }
        Ok(admission)
    }

    fn hold(&mut self, frame: Frame) -> Admission {
        if self.deal.is_none() && self.sink.is_full() {
            // nothing pending would unblock the queue: the retry waits for
            // the arbiter instead
            debug!(
                "EncodeStage[{}]: {} frames held, blocking upstream until the arbiter is free",
                self.name,
                self.sink.len()
            );
            self.health.record_backpressure();
            return Admission::Blocked(Blocked {
                frame,
                blocker: Blocker::on_arbiter(self.arbiter.clone()),
            });
        }
        match self.sink.hold(frame) {
            Ok(()) => Admission::Held,
            Err(blocked) => {
                debug!(
                    "EncodeStage[{}]: {} frames held, blocking upstream",
                    self.name,
                    self.sink.len()
                );
                self.health.record_backpressure();
                Admission::Blocked(blocked)
            }
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub fn control(&mut self, command: Control) -> Result<ControlReply, StageError> {
        if self.state == StageState::Dead {
            return Err(StageError::Terminated(self.state.description()));
        }
        debug!("EncodeStage[{}]: control {:?}", self.name, command);

        match command {
            Control::GetAllocator => Ok(ControlReply::Allocator(self.allocator.clone())),
            Control::SetAllocator(allocator) => {
                self.allocator = allocator;
                Ok(ControlReply::Done)
            }
            Control::GetOutput => Ok(ControlReply::Output(self.output.clone())),
            Control::SetOutput(output) => {
                self.output = output;
                // the new output learns the current format first
                if let Some(flow) = self.negotiator.output().cloned() {
                    self.emit(OutputEvent::FlowDef(flow));
                }
                Ok(ControlReply::Done)
            }
            Control::GetScheduler => Ok(ControlReply::Scheduler(self.scheduler.clone())),
            Control::SetScheduler(scheduler) => {
                self.set_scheduler(scheduler)?;
                Ok(ControlReply::Done)
            }
            Control::GetInputFlow => Ok(ControlReply::Flow(self.negotiator.input().cloned())),
            Control::SetInputFlow(flow) => {
                let output = self.set_input_flow(flow)?;
                Ok(ControlReply::Flow(Some(output)))
            }
            Control::GetOutputFlow => Ok(ControlReply::Flow(self.negotiator.output().cloned())),
            Control::SetOutputFlow(flow) => {
                self.negotiator.override_output(flow)?;
                Ok(ControlReply::Done)
            }
            Control::GetOption(name) => Ok(ControlReply::Option(self.options.get(&name).cloned())),
            Control::SetOption { name, value } => {
                if !self.caps.supports_option(&name) {
                    error!(
                        "EncodeStage[{}]: can't set option {}:{:?}",
                        self.name, name, value
                    );
                    return Err(ConfigError::UnknownOption(name).into());
                }
                match value {
                    Some(value) => self.options.insert(name, value),
                    None => self.options.remove(&name),
                };
                Ok(ControlReply::Done)
            }
        }
    }

    fn set_input_flow(&mut self, flow: FlowDescriptor) -> Result<FlowDescriptor, StageError> {
        let latency = flow.latency;
        match self
            .negotiator
            .negotiate(&self.caps, flow, self.state.is_open())
        {
            Ok(output) => {
                self.timing.set_input_latency(latency);
                debug!("EncodeStage[{}]: input flow accepted", self.name);
                Ok(output)
            }
            Err(err) => {
                error!("EncodeStage[{}]: {}", self.name, err);
                Err(err.into())
            }
        }
    }

    fn set_scheduler(&mut self, scheduler: Option<Scheduler>) -> Result<(), StageError> {
        let reopen = self
            .deal
            .as_ref()
            .is_some_and(|deal| deal.kind() == DealKind::Open);
        self.abort_deal();
        self.scheduler = scheduler;

        if reopen {
            // held frames must not wait on a request that was just dropped
            self.set_state(StageState::Closed);
            self.open()?;
            if self.deal.is_none() {
                // blocked upstream retries against the arbiter from now on
                self.sink.unblock();
            }
        }
        Ok(())
    }

    // ========================================================================
    // Arbiter deals
    // ========================================================================

    fn abort_deal(&mut self) {
        if let Some(deal) = self.deal.take() {
            deal.abort();
        }
    }

    /// Start opening the engine
    ///
    /// With a scheduler the open is deferred until the arbiter grants it.
    /// Without one it happens inline if the grant is free, and is retried on
    /// the next input otherwise. Upstream blocked meanwhile is released when
    /// the grant frees up.
    fn open(&mut self) -> Result<(), StageError> {
        self.abort_deal();

        match self.scheduler.clone() {
            Some(scheduler) => {
                debug!("EncodeStage[{}]: scheduler present, deferring open", self.name);
                self.deal = Some(self.arbiter.request(DealKind::Open, &scheduler));
                self.set_state(StageState::Opening);
                Ok(())
            }
            None => {
                debug!("EncodeStage[{}]: no scheduler, opening directly", self.name);
                match self.arbiter.try_grab() {
                    Some(grant) => self.finish_open(grant),
                    None => {
                        debug!(
                            "EncodeStage[{}]: arbiter busy, open retried on next input",
                            self.name
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// Wait until the pending deal is granted
    ///
    /// Returns `None` right away if no deal is pending. Cancel safe.
    pub async fn wait_deal(&mut self) -> Option<Grant> {
        let grant = self.deal.as_mut()?.granted().await;
        if grant.is_none() {
            self.deal = None;
        }
        grant
    }

    /// Run the engine operation of the pending deal under `grant`
    pub fn complete_deal(&mut self, grant: Grant) -> Result<(), StageError> {
        let Some(deal) = self.deal.take() else {
            debug!("EncodeStage[{}]: stale grant released", self.name);
            return Ok(());
        };
        match deal.kind() {
            DealKind::Open => self.finish_open(grant),
            DealKind::Close => {
                self.close_engine();
                drop(grant);
                if !self.state.is_terminating() {
                    self.set_state(StageState::Closed);
                }
                Ok(())
            }
        }
    }

    /// Wait for the pending deal and complete it
    ///
    /// Returns `false` if there was nothing to wait for.
    pub async fn process_deal(&mut self) -> Result<bool, StageError> {
        match self.wait_deal().await {
            Some(grant) => self.complete_deal(grant).map(|()| true),
            None => Ok(false),
        }
    }

    fn finish_open(&mut self, grant: Grant) -> Result<(), StageError> {
        let opened = self.open_engine();
        drop(grant);

        let result = match opened {
            Ok(()) => self.output_sink(),
            Err(err) => {
                let dropped = self.sink.flush();
                if dropped > 0 {
                    warn!("EncodeStage[{}]: {} held frames dropped", self.name, dropped);
                }
                self.health.record_frame_drops(dropped);
                self.set_state(StageState::Closed);
                Err(err)
            }
        };
        self.sink.unblock();
        result
    }

    fn open_engine(&mut self) -> Result<(), StageError> {
        let Some(config) = self.negotiator.engine_config(&self.options) else {
            self.fatal(ErrorKind::Configuration);
            return Err(ConfigError::NoFlowDefinition.into());
        };

        if let Err(err) = self.engine.open(&config) {
            warn!(
                "EncodeStage[{}]: could not open codec {} ({})",
                self.name, self.caps.name, err
            );
            self.fatal(ErrorKind::Engine);
            return Err(err.into());
        }
        info!(
            "EncodeStage[{}]: codec {} ({}) opened",
            self.name, self.caps.name, self.caps.codec
        );

        self.set_state(StageState::Open {
            opened_at: Instant::now(),
        });
        self.timing.reset();
        self.configure_audio(&config);
        Ok(())
    }

    fn configure_audio(&mut self, config: &EngineConfig) {
        self.reframer = None;
        self.input_layout = None;
        self.deinterleave = None;

        let EngineFormat::Audio {
            sample_format,
            rate,
            ..
        } = &config.format
        else {
            return;
        };
        let Some(FlowFormat::Sound(input)) = self.negotiator.input().map(|flow| flow.format.clone())
        else {
            return;
        };

        let layout = SampleLayout::of(input.sample_format, input.channels);
        self.input_layout = Some(layout);
        if sample_format.is_planar() && !input.sample_format.is_planar() {
            self.deinterleave = Some((
                input.channels as usize,
                input.sample_format.bytes_per_sample(),
            ));
        }
        if let Some(frame_size) = self.engine.params().frame_size.filter(|size| *size > 0) {
            debug!(
                "EncodeStage[{}]: reframing audio to {} samples",
                self.name, frame_size
            );
            self.reframer = Some(Reframer::new(layout, frame_size, *rate));
        }
    }

    /// Replay held frames, oldest first
    fn output_sink(&mut self) -> Result<(), StageError> {
        let frames = self.sink.drain();
        if !frames.is_empty() {
            debug!("EncodeStage[{}]: releasing {} held frames", self.name, frames.len());
        }

        let total = frames.len();
        for (index, frame) in frames.into_iter().enumerate() {
            if let Err(err) = self.encode(frame) {
                self.health.record_frame_drops(total - index - 1);
                return Err(err);
            }
        }
        Ok(())
    }

    fn close_engine(&mut self) {
        match self.engine.close() {
            Ok(()) => info!(
                "EncodeStage[{}]: codec {} ({}) closed",
                self.name, self.caps.name, self.caps.codec
            ),
            Err(err) => warn!("EncodeStage[{}]: error while closing codec ({})", self.name, err),
        }
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    fn allocator(&self) -> Result<Arc<dyn BufferAllocator>, StageError> {
        self.allocator
            .clone()
            .ok_or(StageError::Alloc(AllocError::NoAllocator))
    }

    fn encode(&mut self, frame: Frame) -> Result<Admission, StageError> {
        let result = match self.caps.kind {
            MediaKind::Video => self.encode_video(frame),
            MediaKind::Audio => self.encode_audio(frame),
        };

        match result {
            Err(StageError::InvalidBuffer(reason)) => {
                warn!("EncodeStage[{}]: invalid buffer received ({})", self.name, reason);
                self.health.record_frame_drop();
                Ok(Admission::Dropped)
            }
            Err(err) => {
                if err.kind() == ErrorKind::Allocation {
                    self.fatal(ErrorKind::Allocation);
                }
                Err(err)
            }
            ok => ok,
        }
    }

    fn encode_video(&mut self, frame: Frame) -> Result<Admission, StageError> {
        let Some(EngineFormat::Video {
            pixel_format,
            width,
            height,
            ..
        }) = self.negotiator.engine_format().cloned()
        else {
            return Err(StageError::InvalidBuffer("no picture format negotiated".into()));
        };

        let size_matches = frame
            .picture
            .is_some_and(|picture| picture.width == width && picture.height == height);
        if !size_matches || frame.planes.len() != pixel_format.planes() {
            return Err(StageError::InvalidBuffer(format!(
                "expected {}x{} {} picture, got {:?} with {} planes",
                width,
                height,
                pixel_format.name(),
                frame.picture,
                frame.planes.len()
            )));
        }

        self.submit(frame, None)?;
        Ok(Admission::Accepted)
    }

    fn encode_audio(&mut self, frame: Frame) -> Result<Admission, StageError> {
        let allocator = self.allocator()?;
        let frames = match self.reframer.as_mut() {
            Some(reframer) => {
                let samples = reframer.frame_samples();
                reframer
                    .append(frame, allocator.as_ref())?
                    .into_iter()
                    .map(|frame| (frame, samples))
                    .collect()
            }
            None => {
                let samples = self
                    .input_layout
                    .and_then(|layout| layout.samples(&frame))
                    .ok_or_else(|| {
                        StageError::InvalidBuffer("sound buffer without whole samples".into())
                    })?;
                vec![(frame, samples)]
            }
        };

        for (frame, samples) in frames {
            let frame = self.prepare_audio(frame, allocator.as_ref())?;
            self.submit(frame, Some(samples as u32))?;
        }
        Ok(Admission::Accepted)
    }

    fn prepare_audio(
        &self,
        frame: Frame,
        allocator: &dyn BufferAllocator,
    ) -> Result<Frame, StageError> {
        match self.deinterleave {
            Some((channels, sample_size)) => deinterleave(frame, channels, sample_size, allocator),
            None => Ok(frame),
        }
    }

    /// Hand one frame to the engine
    ///
    /// Engine timestamps count frames for video and samples for audio, so
    /// the pts/dts gap of a packet is in the engine time base.
    fn submit(&mut self, frame: Frame, samples: Option<u32>) -> Result<(), StageError> {
        let planes = frame.planes.clone();
        let pts = self.next_pts;
        self.next_pts += samples.map_or(1, i64::from);
        self.correlator.attach(frame, pts);

        let result = self.engine.encode(Some(EngineFrame {
            pts,
            planes,
            samples,
        }));
        match result {
            Ok(Some(packet)) => self.output_packet(packet),
            Ok(None) => Ok(()),
            Err(err) => {
                warn!("EncodeStage[{}]: error while encoding frame ({})", self.name, err);
                self.health.record_encode_failure();
                if self.correlator.resolve(pts).is_some() {
                    self.health.record_frame_drop();
                }
                Ok(())
            }
        }
    }

    /// Collect whatever the engine still buffers
    fn drain_engine(&mut self) -> Result<(), StageError> {
        if let Some(mut reframer) = self.reframer.take()
            && reframer.retained_samples() > 0
        {
            let allocator = self.allocator()?;
            if let Some(frame) = reframer.flush(allocator.as_ref())? {
                debug!(
                    "EncodeStage[{}]: feeding last incomplete frame",
                    self.name
                );
                let samples = reframer.frame_samples() as u32;
                let frame = self.prepare_audio(frame, allocator.as_ref())?;
                self.submit(frame, Some(samples))?;
            }
        }

        if self.caps.delay {
            loop {
                match self.engine.encode(None) {
                    Ok(Some(packet)) => self.output_packet(packet)?,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("EncodeStage[{}]: error while draining codec ({})", self.name, err);
                        self.health.record_encode_failure();
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn output_packet(&mut self, packet: Packet) -> Result<(), StageError> {
        let Some(mut frame) = self.correlator.resolve(packet.pts) else {
            warn!(
                "EncodeStage[{}]: could not find pts {} in frames in use",
                self.name, packet.pts
            );
            self.health.record_frame_drop();
            return Ok(());
        };

        let params = self.engine.params();

        let latency = self
            .timing
            .output_latency(params.delay, self.negotiator.input_fps());
        let flow = self.negotiator.derive_output(
            &self.caps,
            &params,
            self.config.audio_buffer_size,
            latency,
        );
        self.arm_bucket(&params, &flow);
        if self.negotiator.announce(&flow) {
            debug!("EncodeStage[{}]: output flow {:?}", self.name, flow);
            self.emit(OutputEvent::FlowDef(flow));
        }

        let allocated = self.allocator().and_then(|allocator| {
            let mut buffer = allocator.allocate(packet.data.len())?;
            buffer.extend_from_slice(&packet.data);
            Ok((allocator, buffer.freeze()))
        });
        let (allocator, buffer) = match allocated {
            Ok(allocated) => allocated,
            Err(err) => {
                self.health.record_frame_drop();
                return Err(err);
            }
        };

        let raw = std::mem::replace(&mut frame.planes, vec![buffer]);
        for plane in raw {
            allocator.recycle(plane);
        }
        frame.picture = None;
        frame.is_keyframe = packet.keyframe;

        let stamp = self.timing.stamp(&mut frame.clock, &packet, &params);
        if let Some(underflow) = stamp.underflow {
            warn!("EncodeStage[{}]: audio buffer underflow {}", self.name, underflow);
            self.health.record_underflow();
        }

        let size = frame.size();
        if self.emit(OutputEvent::Frame(frame)) {
            self.health.record_output(size);
        } else {
            self.health.record_frame_drop();
        }
        Ok(())
    }

    /// Start the constant bitrate buffer model for engines that do not
    /// report a buffering delay themselves
    fn arm_bucket(&mut self, params: &EngineParams, flow: &FlowDescriptor) {
        if self.caps.kind != MediaKind::Audio
            || !self.caps.cbr_buffer_model
            || params.rc_buffer_size.is_some_and(|size| size > 0)
            || params.vbv_delay.is_some_and(|delay| delay > 0)
        {
            return;
        }
        let FlowFormat::Block(block) = &flow.format else {
            return;
        };
        let (Some(octet_rate), Some(cpb_buffer), Some(samples)) =
            (block.octet_rate, block.cpb_buffer, block.samples)
        else {
            return;
        };
        let Some(EngineFormat::Audio { rate, .. }) = self.negotiator.engine_format() else {
            return;
        };
        if let Some(bucket) = LeakyBucket::new(cpb_buffer, octet_rate, samples, *rate) {
            self.timing.arm_bucket(bucket);
        }
    }

    fn emit(&self, event: OutputEvent) -> bool {
        match &self.output {
            Some(output) => {
                if output.send(event).is_err() {
                    warn!("EncodeStage[{}]: output closed, event dropped", self.name);
                    return false;
                }
                true
            }
            None => {
                warn!("EncodeStage[{}]: no output set, event dropped", self.name);
                false
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn set_state(&mut self, next: StageState) {
        if !self.state.can_transition_to(&next) {
            warn!(
                "EncodeStage[{}]: unexpected transition {} -> {}",
                self.name, self.state, next
            );
        }
        debug!("EncodeStage[{}]: {} -> {}", self.name, self.state, next);
        self.state = next;
    }

    fn fatal(&self, kind: ErrorKind) {
        self.probe.throw(StageEvent::Fatal {
            stage: self.name.clone(),
            kind,
        });
    }

    /// Drain and close the engine, then release the stage
    ///
    /// Pending open requests are aborted, the last incomplete audio frame is
    /// padded and encoded, the engine is drained and closed under the arbiter
    /// grant. Frames still in flight afterwards are reported and freed.
    pub async fn shutdown(&mut self) -> Result<(), StageError> {
        if self.state == StageState::Dead {
            return Ok(());
        }
        self.abort_deal();

        let mut result = Ok(());
        if self.state.is_open()
            && let Err(err) = self.drain_engine()
        {
            if err.kind() == ErrorKind::Allocation {
                self.fatal(ErrorKind::Allocation);
            }
            result = Err(err);
        }
        if let Some(open_for) = self.state.open_duration() {
            debug!("EncodeStage[{}]: codec was open for {:?}", self.name, open_for);
        }
        self.set_state(StageState::Closing);

        if self.engine.is_open() {
            let mut closed = false;
            if let Some(scheduler) = self.scheduler.clone() {
                self.deal = Some(self.arbiter.request(DealKind::Close, &scheduler));
                closed = self.process_deal().await?;
            }
            if !closed {
                let grant = self.arbiter.acquire().await;
                self.close_engine();
                drop(grant);
            }
        }

        let dropped = self.sink.flush();
        self.health.record_frame_drops(dropped);
        self.sink.unblock();
        if let Some(mut reframer) = self.reframer.take() {
            reframer.clear();
        }

        let leaks = self.correlator.drain_leaks();
        for (token, _) in &leaks {
            warn!("EncodeStage[{}]: remaining frame {} freed", self.name, token);
        }
        self.health.record_leaks(leaks.len());

        self.set_state(StageState::Dead);
        self.probe.throw(StageEvent::Dead {
            stage: self.name.clone(),
        });
        info!("EncodeStage[{}]: {}", self.name, self.health.summary());
        result
    }
}
