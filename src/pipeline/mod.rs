//! Pipeline abstraction layer
//!
//! This module provides the pieces every stage is built on:
//! - Data model: frames, frame clocks and flow descriptors
//! - Control: the stage state machine and lifecycle events
//! - Resources: the task scheduler and the buffer allocator
//! - Observability: per-stage health counters
//!
//! # Architecture
//!
//! Stages communicate via channels:
//! - Each stage runs in its own async task
//! - Stages implement the `PipelineStage` trait
//! - The coordinator runs stages to completion
//! - Flow descriptors announce the format of the frames that follow them

pub mod allocator;
pub mod clock;
pub mod flow;
pub mod health;
pub mod probe;
pub mod scheduler;
pub mod stage;
pub mod state;
pub mod types;

pub use allocator::{BufferAllocator, PoolAllocator};
pub use clock::{CLOCK_FREQ, Date, DateKind, Domain, FrameClock};
pub use flow::{
    BlockFlow, ChannelLayout, FlowCheck, FlowDescriptor, FlowFormat, PictureFlow, PixelFormat,
    SampleFormat, SoundFlow,
};
pub use health::{HealthSummary, PipelineHealth};
pub use probe::{Probe, StageEvent};
pub use scheduler::{Scheduler, TaskHandle};
pub use stage::{PipelineCoordinator, PipelineStage};
pub use state::StageState;
pub use types::{Frame, MediaKind, PictureSize, Rational};
