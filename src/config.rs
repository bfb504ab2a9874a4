use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;

/// Default bound of the sink queue
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Default audio buffer model size in bytes
pub const DEFAULT_AUDIO_BUFFER_SIZE: u64 = 3584;

/// Default capacity of the runner input channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// Configuration of one encoding stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    /// Label used in logs and lifecycle events
    pub name: String,

    /// Frames held while the engine is not open before upstream is blocked
    pub max_queue_depth: usize,

    /// Leaky bucket capacity for engines without an explicit buffer size
    pub audio_buffer_size: u64,

    /// Engine options, applied at the next open
    pub options: BTreeMap<String, String>,

    /// Capacity of the runner input channel
    pub output_capacity: usize,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            name: String::from("encode"),
            max_queue_depth: DEFAULT_QUEUE_DEPTH,
            audio_buffer_size: DEFAULT_AUDIO_BUFFER_SIZE,
            options: BTreeMap::new(),
            output_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EncodeConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_queue_depth must be at least 1".into(),
            ));
        }
        if self.output_capacity == 0 {
            return Err(ConfigError::Invalid(
                "output_capacity must be at least 1".into(),
            ));
        }
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        Ok(())
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EncodeConfig::default();
        assert_eq!(config.max_queue_depth, 16);
        assert_eq!(config.audio_buffer_size, 3584);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            EncodeConfig::from_json_str(r#"{"name":"aac","max_queue_depth":2,"options":{"b":"128000"}}"#)
                .unwrap();
        assert_eq!(config.name, "aac");
        assert_eq!(config.max_queue_depth, 2);
        assert_eq!(config.options.get("b").map(String::as_str), Some("128000"));
        assert_eq!(config.audio_buffer_size, DEFAULT_AUDIO_BUFFER_SIZE);
    }

    #[test]
    fn test_zero_depth_rejected() {
        assert!(matches!(
            EncodeConfig::from_json_str(r#"{"max_queue_depth":0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(EncodeConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_metadata() {
        assert_eq!(app_name(), "pipeflow");
        assert!(!version().is_empty());
    }
}
