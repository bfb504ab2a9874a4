//! Flow descriptors announced between stages
//!
//! A flow descriptor describes the format of the frames that follow it on a
//! stream: raw pictures, raw sound, or encoded blocks.

use super::types::{MediaKind, Rational};

/// Pixel formats understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Nv12,
    Rgb24,
    Bgra,
}

impl PixelFormat {
    /// Number of planes a buffer of this format carries
    pub fn planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Yuv422p | PixelFormat::Yuv444p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgb24 | PixelFormat::Bgra => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv422p => "yuv422p",
            PixelFormat::Yuv444p => "yuv444p",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgra => "bgra",
        }
    }
}

/// Sample formats, packed (interleaved) and planar variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
    U8p,
    S16p,
    S32p,
    F32p,
    F64p,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::U8p => 1,
            SampleFormat::S16 | SampleFormat::S16p => 2,
            SampleFormat::S32 | SampleFormat::S32p | SampleFormat::F32 | SampleFormat::F32p => 4,
            SampleFormat::F64 | SampleFormat::F64p => 8,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            SampleFormat::U8p
                | SampleFormat::S16p
                | SampleFormat::S32p
                | SampleFormat::F32p
                | SampleFormat::F64p
        )
    }

    /// Interleaved equivalent of this format
    pub fn packed(&self) -> SampleFormat {
        match self {
            SampleFormat::U8p => SampleFormat::U8,
            SampleFormat::S16p => SampleFormat::S16,
            SampleFormat::S32p => SampleFormat::S32,
            SampleFormat::F32p => SampleFormat::F32,
            SampleFormat::F64p => SampleFormat::F64,
            packed => *packed,
        }
    }

    /// Byte value representing silence
    pub fn silence(&self) -> u8 {
        match self.packed() {
            SampleFormat::U8 => 0x80,
            _ => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16 => "s16",
            SampleFormat::S32 => "s32",
            SampleFormat::F32 => "f32",
            SampleFormat::F64 => "f64",
            SampleFormat::U8p => "u8p",
            SampleFormat::S16p => "s16p",
            SampleFormat::S32p => "s32p",
            SampleFormat::F32p => "f32p",
            SampleFormat::F64p => "f64p",
        }
    }
}

/// Speaker positions as a bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelLayout(pub u64);

impl ChannelLayout {
    pub const FRONT_LEFT: u64 = 0x1;
    pub const FRONT_RIGHT: u64 = 0x2;
    pub const FRONT_CENTER: u64 = 0x4;
    pub const LOW_FREQUENCY: u64 = 0x8;
    pub const BACK_LEFT: u64 = 0x10;
    pub const BACK_RIGHT: u64 = 0x20;

    pub const MONO: ChannelLayout = ChannelLayout(Self::FRONT_CENTER);
    pub const STEREO: ChannelLayout = ChannelLayout(Self::FRONT_LEFT | Self::FRONT_RIGHT);
    pub const SURROUND: ChannelLayout =
        ChannelLayout(Self::FRONT_LEFT | Self::FRONT_RIGHT | Self::FRONT_CENTER);
    pub const TWO_POINT_ONE: ChannelLayout =
        ChannelLayout(Self::FRONT_LEFT | Self::FRONT_RIGHT | Self::LOW_FREQUENCY);
    pub const QUAD: ChannelLayout = ChannelLayout(
        Self::FRONT_LEFT | Self::FRONT_RIGHT | Self::BACK_LEFT | Self::BACK_RIGHT,
    );
    pub const FIVE_POINT_ONE: ChannelLayout = ChannelLayout(
        Self::FRONT_LEFT
            | Self::FRONT_RIGHT
            | Self::FRONT_CENTER
            | Self::LOW_FREQUENCY
            | Self::BACK_LEFT
            | Self::BACK_RIGHT,
    );

    pub fn channels(&self) -> u8 {
        self.0.count_ones() as u8
    }
}

/// Raw picture flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureFlow {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Visible area, when smaller than the buffer
    pub visible: Option<(u32, u32)>,
    pub fps: Option<Rational>,
    pub sar: Option<Rational>,
}

/// Raw sound flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundFlow {
    pub sample_format: SampleFormat,
    pub channels: u8,
    pub rate: u64,
}

/// Encoded block flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFlow {
    /// Codec name of the elementary stream
    pub codec: String,
    /// Average byte rate
    pub octet_rate: Option<u64>,
    /// Coded picture buffer size in bytes
    pub cpb_buffer: Option<u64>,
    /// Samples per encoded frame (audio)
    pub samples: Option<u32>,
}

/// Format part of a flow descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowFormat {
    Picture(PictureFlow),
    Sound(SoundFlow),
    Block(BlockFlow),
}

/// Format announcement for a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowDescriptor {
    pub format: FlowFormat,
    /// Latency accumulated upstream, in clock ticks
    pub latency: u64,
}

impl FlowDescriptor {
    pub fn picture(flow: PictureFlow) -> Self {
        Self {
            format: FlowFormat::Picture(flow),
            latency: 0,
        }
    }

    pub fn sound(flow: SoundFlow) -> Self {
        Self {
            format: FlowFormat::Sound(flow),
            latency: 0,
        }
    }

    pub fn with_latency(mut self, latency: u64) -> Self {
        self.latency = latency;
        self
    }

    /// Kind of raw media described, `None` for encoded blocks
    pub fn media_kind(&self) -> Option<MediaKind> {
        match self.format {
            FlowFormat::Picture(_) => Some(MediaKind::Video),
            FlowFormat::Sound(_) => Some(MediaKind::Audio),
            FlowFormat::Block(_) => None,
        }
    }

    /// Frame rate of a picture flow
    pub fn fps(&self) -> Option<Rational> {
        match &self.format {
            FlowFormat::Picture(picture) => picture.fps,
            _ => None,
        }
    }

    /// Attributes that must stay stable while an engine is open
    pub fn check(&self) -> Option<FlowCheck> {
        match &self.format {
            FlowFormat::Picture(picture) => {
                let (width, height) = picture.visible.unwrap_or((picture.width, picture.height));
                Some(FlowCheck::Picture {
                    pixel_format: picture.pixel_format,
                    width,
                    height,
                    fps: picture.fps?,
                })
            }
            FlowFormat::Sound(sound) => Some(FlowCheck::Sound {
                sample_format: sound.sample_format,
                channels: sound.channels,
                rate: sound.rate,
            }),
            FlowFormat::Block(_) => None,
        }
    }
}

/// Check-relevant subset of an input flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowCheck {
    Picture {
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
        fps: Rational,
    },
    Sound {
        sample_format: SampleFormat,
        channels: u8,
        rate: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_s16() -> FlowDescriptor {
        FlowDescriptor::sound(SoundFlow {
            sample_format: SampleFormat::S16,
            channels: 2,
            rate: 48_000,
        })
    }

    #[test]
    fn test_sample_format_helpers() {
        assert_eq!(SampleFormat::S16p.packed(), SampleFormat::S16);
        assert!(SampleFormat::F32p.is_planar());
        assert!(!SampleFormat::F32.is_planar());
        assert_eq!(SampleFormat::F64p.bytes_per_sample(), 8);
        assert_eq!(SampleFormat::U8p.silence(), 0x80);
        assert_eq!(SampleFormat::S16.silence(), 0);
    }

    #[test]
    fn test_channel_layout_counts() {
        assert_eq!(ChannelLayout::MONO.channels(), 1);
        assert_eq!(ChannelLayout::STEREO.channels(), 2);
        assert_eq!(ChannelLayout::SURROUND.channels(), 3);
        assert_eq!(ChannelLayout::TWO_POINT_ONE.channels(), 3);
        assert_eq!(ChannelLayout::FIVE_POINT_ONE.channels(), 6);
    }

    #[test]
    fn test_check_ignores_latency() {
        let a = stereo_s16();
        let b = stereo_s16().with_latency(1_000);
        assert_eq!(a.check(), b.check());
    }

    #[test]
    fn test_picture_check_uses_visible_size() {
        let flow = FlowDescriptor::picture(PictureFlow {
            pixel_format: PixelFormat::Yuv420p,
            width: 1920,
            height: 1088,
            visible: Some((1920, 1080)),
            fps: Some(Rational::new(25, 1)),
            sar: None,
        });
        match flow.check() {
            Some(FlowCheck::Picture { height, .. }) => assert_eq!(height, 1080),
            other => panic!("unexpected check {:?}", other),
        }
    }

    #[test]
    fn test_picture_without_fps_has_no_check() {
        let flow = FlowDescriptor::picture(PictureFlow {
            pixel_format: PixelFormat::Nv12,
            width: 640,
            height: 480,
            visible: None,
            fps: None,
            sar: None,
        });
        assert_eq!(flow.check(), None);
        assert_eq!(flow.media_kind(), Some(MediaKind::Video));
    }
}
