//! # Stage Error Types
//!
//! Error taxonomy for the encoding stage and its collaborators.

use thiserror::Error;

use crate::pipeline::flow::{PixelFormat, SampleFormat};
use crate::pipeline::types::Rational;

/// Broad class of a failure, as reported in fatal events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unsupported format or incompatible reconfiguration; stage keeps its state
    Configuration,
    /// Buffer or descriptor allocation failed; fatal for the stage
    Allocation,
    /// The codec engine reported an error
    Engine,
    /// Internal bookkeeping mismatch; the frame is dropped
    Invariant,
    /// Operation not possible in the current lifecycle state
    Lifecycle,
}

/// Rejections raised while negotiating formats or handling control commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    // ========================================================================
    // Flow Errors
    // ========================================================================
    /// The engine cannot encode this kind of flow.
    #[error("Unsupported flow for {engine}: {flow}")]
    UnsupportedFlow { engine: String, flow: String },

    /// A required flow attribute is missing or zero.
    #[error("Incompatible flow definition: missing {0}")]
    MissingAttribute(&'static str),

    /// No input flow definition was set before the first frame.
    #[error("No input flow definition")]
    NoFlowDefinition,

    /// The engine is open and the check attributes changed.
    #[error("Incompatible reconfiguration of an open engine")]
    IncompatibleReconfiguration,

    // ========================================================================
    // Format Errors
    // ========================================================================
    #[error("Unsupported pixel format {}", .0.name())]
    UnsupportedPixelFormat(PixelFormat),

    #[error("Unsupported frame rate {0}")]
    UnsupportedFrameRate(Rational),

    #[error("Unsupported sample format {}", .0.name())]
    UnsupportedSampleFormat(SampleFormat),

    #[error("Unsupported sample rate {0}")]
    UnsupportedSampleRate(u64),

    #[error("Unsupported channel layout for {0} channels")]
    UnsupportedChannels(u8),

    // ========================================================================
    // Control Errors
    // ========================================================================
    #[error("Unknown engine option: {0}")]
    UnknownOption(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors reported by a codec engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine rejected configuration: {0}")]
    Open(String),

    #[error("Engine is not open")]
    NotOpen,

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Close failed: {0}")]
    Close(String),

    #[error("Invalid option {name}={value}")]
    InvalidOption { name: String, value: String },
}

/// Errors reported by a buffer allocator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Allocation of {requested} bytes exceeds limit of {limit}")]
    TooLarge { requested: usize, limit: usize },

    #[error("Buffer pool exhausted")]
    Exhausted,

    #[error("No buffer allocator configured")]
    NoAllocator,
}

/// Top-level error of stage operations.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A frame did not match what the stage expected.
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    /// The stage is shutting down or released.
    #[error("Stage is {0}")]
    Terminated(&'static str),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Config(_) => ErrorKind::Configuration,
            StageError::Alloc(_) => ErrorKind::Allocation,
            StageError::Engine(_) => ErrorKind::Engine,
            StageError::InvalidBuffer(_) => ErrorKind::Invariant,
            StageError::Terminated(_) => ErrorKind::Lifecycle,
        }
    }
}

/// Convenience result alias for stage operations.
pub type Result<T> = std::result::Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            StageError::from(ConfigError::UnsupportedSampleRate(1)).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            StageError::from(AllocError::Exhausted).kind(),
            ErrorKind::Allocation
        );
        assert_eq!(
            StageError::from(EngineError::NotOpen).kind(),
            ErrorKind::Engine
        );
        assert_eq!(
            StageError::InvalidBuffer("x".into()).kind(),
            ErrorKind::Invariant
        );
    }

    #[test]
    fn test_messages() {
        let err = StageError::from(ConfigError::UnsupportedPixelFormat(PixelFormat::Nv12));
        assert_eq!(err.to_string(), "Unsupported pixel format nv12");
        let err = ConfigError::UnsupportedFrameRate(Rational::new(24000, 1001));
        assert_eq!(err.to_string(), "Unsupported frame rate 24000/1001");
    }
}
