//! Core types for the pipeline system

use bytes::Bytes;

use super::clock::FrameClock;

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Rational number used for frame rates, time bases and aspect ratios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: u64,
    pub den: u64,
}

impl Rational {
    pub const fn new(num: u64, den: u64) -> Self {
        Self { num, den }
    }

    /// Swap numerator and denominator (frame rate to time base)
    pub fn invert(&self) -> Self {
        Self {
            num: self.den,
            den: self.num,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }
}

impl std::fmt::Display for Rational {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Dimensions of a picture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureSize {
    pub width: u32,
    pub height: u32,
}

/// Media frame flowing between stages
///
/// A frame is exclusively owned by whoever currently holds it: the sink queue
/// while buffered, the in-flight set while inside the engine, the output
/// channel once emitted.
#[derive(Clone)]
pub struct Frame {
    /// Buffer planes
    ///
    /// Packed audio and encoded blocks use a single plane. Pictures carry one
    /// plane per component and planar audio one plane per channel.
    pub planes: Vec<Bytes>,

    /// Dates and delays attached to this frame
    pub clock: FrameClock,

    /// Picture dimensions (for video only)
    pub picture: Option<PictureSize>,

    /// Whether this is a keyframe (set on encoded output)
    pub is_keyframe: bool,

    /// Correlation token while the frame is inside the engine
    correlation: Option<u64>,
}

impl Frame {
    /// Create a frame from a single contiguous buffer (packed audio, blocks)
    pub fn block(data: Bytes, clock: FrameClock) -> Self {
        Self {
            planes: vec![data],
            clock,
            picture: None,
            is_keyframe: false,
            correlation: None,
        }
    }

    /// Create a planar frame (planar audio)
    pub fn planar(planes: Vec<Bytes>, clock: FrameClock) -> Self {
        Self {
            planes,
            clock,
            picture: None,
            is_keyframe: false,
            correlation: None,
        }
    }

    /// Create a picture frame
    pub fn picture(planes: Vec<Bytes>, width: u32, height: u32, clock: FrameClock) -> Self {
        Self {
            planes,
            clock,
            picture: Some(PictureSize { width, height }),
            is_keyframe: false,
            correlation: None,
        }
    }

    /// Total size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.planes.iter().map(Bytes::len).sum()
    }

    /// Correlation token, if the frame is currently attached to the engine
    pub fn correlation(&self) -> Option<u64> {
        self.correlation
    }

    pub(crate) fn set_correlation(&mut self, token: u64) {
        self.correlation = Some(token);
    }

    pub(crate) fn clear_correlation(&mut self) -> Option<u64> {
        self.correlation.take()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Frame");
        debug
            .field("planes", &self.planes.len())
            .field("size", &self.size())
            .field("clock", &self.clock)
            .field("is_keyframe", &self.is_keyframe);

        if let Some(picture) = self.picture {
            debug.field("picture", &picture);
        }
        if let Some(token) = self.correlation {
            debug.field("correlation", &token);
        }

        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_sums_planes() {
        let frame = Frame::picture(
            vec![Bytes::from(vec![0u8; 16]), Bytes::from(vec![0u8; 8])],
            4,
            4,
            FrameClock::default(),
        );
        assert_eq!(frame.size(), 24);
        assert_eq!(frame.picture, Some(PictureSize { width: 4, height: 4 }));
    }

    #[test]
    fn test_correlation_slot() {
        let mut frame = Frame::block(Bytes::from_static(b"abc"), FrameClock::default());
        assert_eq!(frame.correlation(), None);
        frame.set_correlation(7);
        assert_eq!(frame.correlation(), Some(7));
        assert_eq!(frame.clear_correlation(), Some(7));
        assert_eq!(frame.correlation(), None);
    }

    #[test]
    fn test_rational_invert() {
        let fps = Rational::new(30000, 1001);
        assert_eq!(fps.invert(), Rational::new(1001, 30000));
        assert!(fps.is_valid());
        assert!(!Rational::new(0, 1).is_valid());
    }
}
