//! Codec engine interface
//!
//! The engine is an opaque, stateful and non-reentrant encoder. The stage only
//! talks to it through [`CodecEngine`]: capability queries, open/close and a
//! single-packet encode call where `None` asks for buffered output.

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::pipeline::flow::{ChannelLayout, PixelFormat, SampleFormat};
use crate::pipeline::types::{MediaKind, Rational};

/// What an engine is able to encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Engine name, used in logs
    pub name: String,
    /// Codec of the produced elementary stream
    pub codec: String,
    pub kind: MediaKind,
    pub pixel_formats: Vec<PixelFormat>,
    /// Accepted frame rates, `None` accepts any
    pub frame_rates: Option<Vec<Rational>>,
    pub sample_formats: Vec<SampleFormat>,
    /// Accepted sample rates, `None` accepts any
    pub sample_rates: Option<Vec<u64>>,
    pub channel_layouts: Vec<ChannelLayout>,
    /// Names of the options understood by `open`
    pub options: Vec<String>,
    /// Engine buffers input and must be drained with `encode(None)`
    pub delay: bool,
    /// Output follows a constant bitrate buffer model without reporting
    /// a buffer size of its own
    pub cbr_buffer_model: bool,
}

impl Capabilities {
    pub fn supports_option(&self, name: &str) -> bool {
        self.options.iter().any(|option| option == name)
    }
}

/// Concrete input format resolved at negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFormat {
    Video {
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
        sar: Option<Rational>,
    },
    Audio {
        sample_format: SampleFormat,
        channel_layout: ChannelLayout,
        rate: u64,
    },
}

/// Everything the engine needs to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub format: EngineFormat,
    /// Unit of the timestamps passed to and returned by the engine
    pub time_base: Rational,
    pub options: BTreeMap<String, String>,
}

/// Output parameters reported by an open engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineParams {
    /// Achieved bit rate in bits per second
    pub bit_rate: Option<u64>,
    /// Rate control buffer size in bits
    pub rc_buffer_size: Option<u64>,
    /// Samples per channel the engine consumes per call (audio)
    pub frame_size: Option<u32>,
    /// Frames held inside the engine before output starts
    pub delay: u32,
    /// Buffering delay in clock ticks, when the engine computes it
    pub vbv_delay: Option<u64>,
    pub time_base: Rational,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            bit_rate: None,
            rc_buffer_size: None,
            frame_size: None,
            delay: 0,
            vbv_delay: None,
            time_base: Rational::new(1, 1),
        }
    }
}

/// One unit of raw input handed to the engine
#[derive(Debug, Clone)]
pub struct EngineFrame {
    /// Presentation timestamp in `time_base` units, echoed back on the
    /// matching packet
    pub pts: i64,
    pub planes: Vec<Bytes>,
    /// Samples per channel (audio)
    pub samples: Option<u32>,
}

/// One encoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
}

/// Stateful codec engine driven by an encoding stage
///
/// `open` and `close` must only be called while holding an arbiter grant.
pub trait CodecEngine: Send {
    fn capabilities(&self) -> Capabilities;

    fn open(&mut self, config: &EngineConfig) -> Result<(), EngineError>;

    fn close(&mut self) -> Result<(), EngineError>;

    fn is_open(&self) -> bool;

    /// Output parameters, meaningful once open
    fn params(&self) -> EngineParams;

    /// Feed one frame, or `None` to collect buffered output
    ///
    /// Returns at most one packet per call.
    fn encode(&mut self, frame: Option<EngineFrame>) -> Result<Option<Packet>, EngineError>;
}

impl<T: CodecEngine + ?Sized> CodecEngine for Box<T> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn open(&mut self, config: &EngineConfig) -> Result<(), EngineError> {
        (**self).open(config)
    }

    fn close(&mut self) -> Result<(), EngineError> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn params(&self) -> EngineParams {
        (**self).params()
    }

    fn encode(&mut self, frame: Option<EngineFrame>) -> Result<Option<Packet>, EngineError> {
        (**self).encode(frame)
    }
}
