use bytes::{Bytes, BytesMut};
use log::debug;
use std::collections::VecDeque;

use super::engine::{
    Capabilities, CodecEngine, EngineConfig, EngineFormat, EngineFrame, EngineParams, Packet,
};
use crate::error::EngineError;
use crate::pipeline::flow::{ChannelLayout, PixelFormat, SampleFormat};
use crate::pipeline::types::MediaKind;

/// Options understood by the passthrough engine
const OPTIONS: &[&str] = &["b", "bufsize", "frame_size", "delay", "vbv_delay"];

/// Default samples per audio frame
const DEFAULT_FRAME_SIZE: u32 = 1024;

/// Reference engine that "encodes" by concatenating the input planes.
///
/// Useful to exercise the stage without a real codec: it honours the same
/// open/close discipline, can hold frames back like a codec with delay and
/// reports output parameters taken from its options.
pub struct PassthroughEngine {
    caps: Capabilities,
    config: Option<EngineConfig>,
    params: EngineParams,
    held: VecDeque<Packet>,
}

impl PassthroughEngine {
    pub fn video() -> Self {
        Self::with_capabilities(Capabilities {
            name: String::from("passthrough-video"),
            codec: String::from("raw.pic"),
            kind: MediaKind::Video,
            pixel_formats: vec![PixelFormat::Yuv420p, PixelFormat::Nv12, PixelFormat::Bgra],
            frame_rates: None,
            sample_formats: Vec::new(),
            sample_rates: None,
            channel_layouts: Vec::new(),
            options: OPTIONS.iter().map(|o| o.to_string()).collect(),
            delay: true,
            cbr_buffer_model: false,
        })
    }

    pub fn audio() -> Self {
        Self::with_capabilities(Capabilities {
            name: String::from("passthrough-audio"),
            codec: String::from("pcm"),
            kind: MediaKind::Audio,
            pixel_formats: Vec::new(),
            frame_rates: None,
            sample_formats: vec![SampleFormat::S16, SampleFormat::U8, SampleFormat::F32p],
            sample_rates: Some(vec![32_000, 44_100, 48_000]),
            channel_layouts: vec![
                ChannelLayout::MONO,
                ChannelLayout::STEREO,
                ChannelLayout::SURROUND,
                ChannelLayout::TWO_POINT_ONE,
                ChannelLayout::FIVE_POINT_ONE,
            ],
            options: OPTIONS.iter().map(|o| o.to_string()).collect(),
            delay: true,
            cbr_buffer_model: true,
        })
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            caps,
            config: None,
            params: EngineParams::default(),
            held: VecDeque::new(),
        }
    }

    /// Number of packets held back inside the engine
    pub fn buffered(&self) -> usize {
        self.held.len()
    }

    fn numeric_option(config: &EngineConfig, name: &str) -> Result<Option<u64>, EngineError> {
        match config.options.get(name) {
            None => Ok(None),
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| EngineError::InvalidOption {
                    name: name.to_string(),
                    value: value.clone(),
                }),
        }
    }

    fn resolve_params(&self, config: &EngineConfig) -> Result<EngineParams, EngineError> {
        if let Some(unknown) = config
            .options
            .keys()
            .find(|name| !self.caps.supports_option(name))
        {
            return Err(EngineError::Open(format!("unknown option {}", unknown)));
        }

        let mut params = EngineParams {
            bit_rate: Self::numeric_option(config, "b")?,
            rc_buffer_size: Self::numeric_option(config, "bufsize")?,
            delay: Self::numeric_option(config, "delay")?.unwrap_or(0) as u32,
            vbv_delay: Self::numeric_option(config, "vbv_delay")?,
            time_base: config.time_base,
            ..EngineParams::default()
        };

        match &config.format {
            EngineFormat::Video { .. } => {
                if self.caps.kind != MediaKind::Video {
                    return Err(EngineError::Open("not a video engine".into()));
                }
            }
            EngineFormat::Audio {
                sample_format,
                channel_layout,
                rate,
            } => {
                if self.caps.kind != MediaKind::Audio {
                    return Err(EngineError::Open("not an audio engine".into()));
                }
                let frame_size = Self::numeric_option(config, "frame_size")?
                    .unwrap_or(DEFAULT_FRAME_SIZE as u64) as u32;
                if frame_size == 0 {
                    return Err(EngineError::InvalidOption {
                        name: "frame_size".into(),
                        value: "0".into(),
                    });
                }
                params.frame_size = Some(frame_size);
                // PCM bit rate unless overridden
                if params.bit_rate.is_none() {
                    params.bit_rate = Some(
                        rate * channel_layout.channels() as u64
                            * sample_format.bytes_per_sample() as u64
                            * 8,
                    );
                }
            }
        }
        Ok(params)
    }
}

impl CodecEngine for PassthroughEngine {
    fn capabilities(&self) -> Capabilities {
        self.caps.clone()
    }

    fn open(&mut self, config: &EngineConfig) -> Result<(), EngineError> {
        self.params = self.resolve_params(config)?;
        self.config = Some(config.clone());
        self.held.clear();
        debug!("{}: opened with {:?}", self.caps.name, self.params);
        Ok(())
    }

    fn close(&mut self) -> Result<(), EngineError> {
        if self.config.take().is_none() {
            return Err(EngineError::NotOpen);
        }
        if !self.held.is_empty() {
            debug!(
                "{}: {} packets discarded on close",
                self.caps.name,
                self.held.len()
            );
            self.held.clear();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn params(&self) -> EngineParams {
        self.params
    }

    fn encode(&mut self, frame: Option<EngineFrame>) -> Result<Option<Packet>, EngineError> {
        if self.config.is_none() {
            return Err(EngineError::NotOpen);
        }

        let Some(frame) = frame else {
            return Ok(self.held.pop_front());
        };

        let data = match frame.planes.as_slice() {
            [single] => single.clone(),
            planes => {
                let mut data = BytesMut::with_capacity(planes.iter().map(Bytes::len).sum());
                for plane in planes {
                    data.extend_from_slice(plane);
                }
                data.freeze()
            }
        };
        // one engine frame lasts `samples` time base units for audio
        let duration = frame.samples.map_or(1, i64::from);
        let delay = self.params.delay as i64 * duration;
        self.held.push_back(Packet {
            data,
            pts: frame.pts,
            dts: frame.pts - delay,
            keyframe: true,
        });

        if self.held.len() > self.params.delay as usize {
            Ok(self.held.pop_front())
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Rational;
    use std::collections::BTreeMap;

    fn video_config(options: &[(&str, &str)]) -> EngineConfig {
        EngineConfig {
            format: EngineFormat::Video {
                pixel_format: PixelFormat::Yuv420p,
                width: 4,
                height: 4,
                sar: None,
            },
            time_base: Rational::new(1, 25),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn frame(pts: i64) -> EngineFrame {
        EngineFrame {
            pts,
            planes: vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
            samples: None,
        }
    }

    #[test]
    fn test_encode_requires_open() {
        let mut engine = PassthroughEngine::video();
        assert_eq!(engine.encode(Some(frame(1))), Err(EngineError::NotOpen));
    }

    #[test]
    fn test_immediate_output() {
        let mut engine = PassthroughEngine::video();
        engine.open(&video_config(&[])).unwrap();
        let packet = engine.encode(Some(frame(1))).unwrap().unwrap();
        assert_eq!(packet.data, Bytes::from_static(b"abcd"));
        assert_eq!(packet.pts, 1);
        assert_eq!(packet.dts, 1);
    }

    #[test]
    fn test_delay_holds_frames() {
        let mut engine = PassthroughEngine::video();
        engine.open(&video_config(&[("delay", "2")])).unwrap();
        assert_eq!(engine.encode(Some(frame(1))).unwrap(), None);
        assert_eq!(engine.encode(Some(frame(2))).unwrap(), None);
        let packet = engine.encode(Some(frame(3))).unwrap().unwrap();
        assert_eq!(packet.pts, 1);
        assert_eq!(packet.dts, -1);
        assert_eq!(engine.buffered(), 2);

        assert_eq!(engine.encode(None).unwrap().map(|p| p.pts), Some(2));
        assert_eq!(engine.encode(None).unwrap().map(|p| p.pts), Some(3));
        assert_eq!(engine.encode(None).unwrap(), None);
    }

    #[test]
    fn test_unknown_option_fails_open() {
        let mut engine = PassthroughEngine::video();
        assert!(matches!(
            engine.open(&video_config(&[("crf", "21")])),
            Err(EngineError::Open(_))
        ));
        assert!(!engine.is_open());
    }

    #[test]
    fn test_audio_params() {
        let mut engine = PassthroughEngine::audio();
        let config = EngineConfig {
            format: EngineFormat::Audio {
                sample_format: SampleFormat::S16,
                channel_layout: ChannelLayout::STEREO,
                rate: 48_000,
            },
            time_base: Rational::new(1, 48_000),
            options: BTreeMap::new(),
        };
        engine.open(&config).unwrap();
        let params = engine.params();
        assert_eq!(params.frame_size, Some(1024));
        assert_eq!(params.bit_rate, Some(1_536_000));
        assert_eq!(params.rc_buffer_size, None);
        engine.close().unwrap();
        assert_eq!(engine.close(), Err(EngineError::NotOpen));
    }

    #[test]
    fn test_audio_delay_in_samples() {
        let mut engine = PassthroughEngine::audio();
        let mut options = BTreeMap::new();
        options.insert("delay".to_string(), "1".to_string());
        engine
            .open(&EngineConfig {
                format: EngineFormat::Audio {
                    sample_format: SampleFormat::S16,
                    channel_layout: ChannelLayout::MONO,
                    rate: 48_000,
                },
                time_base: Rational::new(1, 48_000),
                options,
            })
            .unwrap();

        let chunk = |pts| EngineFrame {
            pts,
            planes: vec![Bytes::from(vec![0u8; 2048])],
            samples: Some(1024),
        };
        assert_eq!(engine.encode(Some(chunk(1))).unwrap(), None);
        let packet = engine.encode(Some(chunk(1025))).unwrap().unwrap();
        assert_eq!(packet.pts, 1);
        assert_eq!(packet.pts - packet.dts, 1024);
    }
}
