//! Encoding stage
//!
//! Wraps a codec engine behind a stage that negotiates formats, reframes
//! audio, holds input while the engine opens and dates the encoded output.
//! Engine open and close are serialized process-wide by the arbiter.

mod correlator;
mod reframer;
mod sink;
mod timing;

pub mod arbiter;
pub mod control;
pub mod engine;
pub mod negotiate;
pub mod passthrough;
pub mod runner;
pub mod stage;

pub use arbiter::{Arbiter, DealKind, DealRequest, Grant};
pub use control::{Control, ControlReply, OutputEvent, OutputSender};
pub use correlator::Correlator;
pub use engine::{
    Capabilities, CodecEngine, EngineConfig, EngineFormat, EngineFrame, EngineParams, Packet,
};
pub use negotiate::Negotiator;
pub use passthrough::PassthroughEngine;
pub use reframer::{Reframer, SampleLayout, deinterleave};
pub use runner::{EncodeRunner, StageInput};
pub use sink::{Blocked, Blocker, SinkQueue};
pub use stage::{Admission, EncodeStage};
pub use timing::{LeakyBucket, Stamp, TimingModel};
