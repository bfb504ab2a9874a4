//! Input format negotiation and output format derivation

use log::debug;
use std::collections::BTreeMap;

use super::engine::{Capabilities, EngineConfig, EngineFormat, EngineParams};
use crate::error::ConfigError;
use crate::pipeline::flow::{
    BlockFlow, FlowCheck, FlowDescriptor, FlowFormat, PictureFlow, SampleFormat, SoundFlow,
};
use crate::pipeline::types::{MediaKind, Rational};

/// Negotiated formats of one stage
#[derive(Debug, Default)]
pub struct Negotiator {
    input: Option<FlowDescriptor>,
    /// Check attributes the engine was configured for
    check: Option<FlowCheck>,
    format: Option<EngineFormat>,
    time_base: Option<Rational>,
    /// Output descriptor derived from the input, before any packet
    provisional: Option<FlowDescriptor>,
    /// Output descriptor last announced downstream
    announced: Option<FlowDescriptor>,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a new input flow and return the provisional output flow
    ///
    /// While the engine is open only flows with the same check attributes are
    /// accepted. Otherwise the flow is resolved against `caps` and becomes
    /// the configuration used at the next open. A rejected flow leaves every
    /// negotiated value untouched.
    pub fn negotiate(
        &mut self,
        caps: &Capabilities,
        flow: FlowDescriptor,
        engine_open: bool,
    ) -> Result<FlowDescriptor, ConfigError> {
        let kind = flow.media_kind();
        if kind != Some(caps.kind) {
            return Err(ConfigError::UnsupportedFlow {
                engine: caps.name.clone(),
                flow: kind.map_or_else(|| "block".to_string(), |kind| kind.to_string()),
            });
        }

        let check = Self::check_of(&flow)?;

        if engine_open {
            if self.check.as_ref() != Some(&check) {
                return Err(ConfigError::IncompatibleReconfiguration);
            }
        } else {
            let (format, time_base) = match &flow.format {
                FlowFormat::Picture(picture) => Self::resolve_picture(caps, picture)?,
                FlowFormat::Sound(sound) => Self::resolve_sound(caps, sound)?,
                FlowFormat::Block(_) => {
                    return Err(ConfigError::UnsupportedFlow {
                        engine: caps.name.clone(),
                        flow: "block".into(),
                    });
                }
            };
            debug!("negotiated {:?} with time base {}", format, time_base);
            self.format = Some(format);
            self.time_base = Some(time_base);
            self.check = Some(check);
        }

        let provisional = FlowDescriptor {
            format: FlowFormat::Block(BlockFlow {
                codec: caps.codec.clone(),
                octet_rate: None,
                cpb_buffer: None,
                samples: None,
            }),
            latency: flow.latency,
        };
        self.input = Some(flow);
        self.provisional = Some(provisional.clone());
        Ok(provisional)
    }

    fn check_of(flow: &FlowDescriptor) -> Result<FlowCheck, ConfigError> {
        match &flow.format {
            FlowFormat::Picture(picture) => {
                if picture.width == 0 || picture.height == 0 {
                    return Err(ConfigError::MissingAttribute("picture size"));
                }
                if !picture.fps.is_some_and(|fps| fps.is_valid()) {
                    return Err(ConfigError::MissingAttribute("frame rate"));
                }
            }
            FlowFormat::Sound(sound) => {
                if sound.channels == 0 {
                    return Err(ConfigError::MissingAttribute("channels"));
                }
                if sound.rate == 0 {
                    return Err(ConfigError::MissingAttribute("sample rate"));
                }
            }
            FlowFormat::Block(_) => {}
        }
        flow.check()
            .ok_or(ConfigError::MissingAttribute("frame rate"))
    }

    fn resolve_picture(
        caps: &Capabilities,
        picture: &PictureFlow,
    ) -> Result<(EngineFormat, Rational), ConfigError> {
        if !caps.pixel_formats.contains(&picture.pixel_format) {
            return Err(ConfigError::UnsupportedPixelFormat(picture.pixel_format));
        }

        let fps = picture
            .fps
            .ok_or(ConfigError::MissingAttribute("frame rate"))?;
        if let Some(rates) = &caps.frame_rates
            && !rates.contains(&fps)
        {
            return Err(ConfigError::UnsupportedFrameRate(fps));
        }

        Ok((
            EngineFormat::Video {
                pixel_format: picture.pixel_format,
                width: picture.width,
                height: picture.height,
                sar: picture.sar,
            },
            fps.invert(),
        ))
    }

    fn resolve_sound(
        caps: &Capabilities,
        sound: &SoundFlow,
    ) -> Result<(EngineFormat, Rational), ConfigError> {
        let sample_format = Self::resolve_sample_format(caps, sound.sample_format)?;

        if let Some(rates) = &caps.sample_rates
            && !rates.contains(&sound.rate)
        {
            return Err(ConfigError::UnsupportedSampleRate(sound.rate));
        }

        let channel_layout = caps
            .channel_layouts
            .iter()
            .filter(|layout| layout.channels() == sound.channels)
            .min()
            .copied()
            .ok_or(ConfigError::UnsupportedChannels(sound.channels))?;

        Ok((
            EngineFormat::Audio {
                sample_format,
                channel_layout,
                rate: sound.rate,
            },
            Rational::new(1, sound.rate),
        ))
    }

    /// Exact match first, then a planar engine format for packed input
    fn resolve_sample_format(
        caps: &Capabilities,
        input: SampleFormat,
    ) -> Result<SampleFormat, ConfigError> {
        if caps.sample_formats.contains(&input) {
            return Ok(input);
        }
        if !input.is_planar()
            && let Some(planar) = caps
                .sample_formats
                .iter()
                .find(|format| format.is_planar() && format.packed() == input)
        {
            return Ok(*planar);
        }
        Err(ConfigError::UnsupportedSampleFormat(input))
    }

    /// Configuration for the next open
    pub fn engine_config(&self, options: &BTreeMap<String, String>) -> Option<EngineConfig> {
        Some(EngineConfig {
            format: self.format.clone()?,
            time_base: self.time_base?,
            options: options.clone(),
        })
    }

    pub fn input(&self) -> Option<&FlowDescriptor> {
        self.input.as_ref()
    }

    pub fn input_fps(&self) -> Option<Rational> {
        self.input.as_ref().and_then(FlowDescriptor::fps)
    }

    pub fn engine_format(&self) -> Option<&EngineFormat> {
        self.format.as_ref()
    }

    /// Output flow as currently known downstream
    pub fn output(&self) -> Option<&FlowDescriptor> {
        self.announced.as_ref().or(self.provisional.as_ref())
    }

    /// Output flow reflecting what the open engine reports
    pub fn derive_output(
        &self,
        caps: &Capabilities,
        params: &EngineParams,
        audio_buffer_size: u64,
        latency: u64,
    ) -> FlowDescriptor {
        let audio = caps.kind == MediaKind::Audio;
        let cpb_buffer = match (params.bit_rate, params.rc_buffer_size) {
            (Some(_), Some(size)) if size > 0 => Some(size / 8),
            (Some(_), _) if audio && caps.cbr_buffer_model => Some(audio_buffer_size),
            _ => None,
        };
        let samples = if audio {
            params.frame_size.filter(|size| *size > 0)
        } else {
            None
        };

        FlowDescriptor {
            format: FlowFormat::Block(BlockFlow {
                codec: caps.codec.clone(),
                octet_rate: params.bit_rate.map(|rate| rate / 8),
                cpb_buffer,
                samples,
            }),
            latency,
        }
    }

    /// Record `flow` as announced; `false` if downstream already has it
    pub fn announce(&mut self, flow: &FlowDescriptor) -> bool {
        if self.announced.as_ref() == Some(flow) {
            return false;
        }
        self.announced = Some(flow.clone());
        true
    }

    /// Replace the output flow with one set from outside
    pub fn override_output(&mut self, flow: FlowDescriptor) -> Result<(), ConfigError> {
        match &flow.format {
            FlowFormat::Block(_) => {
                self.provisional = Some(flow);
                self.announced = None;
                Ok(())
            }
            _ => Err(ConfigError::UnsupportedFlow {
                engine: String::from("output"),
                flow: flow
                    .media_kind()
                    .map_or_else(|| "block".to_string(), |kind| kind.to_string()),
            }),
        }
    }
}
