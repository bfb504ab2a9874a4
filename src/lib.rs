//! Pipe-based media dataflow with an arbitrated, backpressured encoding stage

pub mod config;
pub mod encoder;
pub mod error;
pub mod pipeline;

pub use config::EncodeConfig;
pub use encoder::{EncodeRunner, EncodeStage};
pub use error::{ErrorKind, StageError};
