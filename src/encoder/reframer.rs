//! Audio reframing
//!
//! Codec engines consume audio in fixed-size frames while upstream delivers
//! chunks of any length. The [`Reframer`] concatenates incoming chunks,
//! cuts them at the engine frame size and keeps the remainder for the next
//! call. Dates of emitted frames are derived from the chunk their first
//! sample came from.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use crate::error::StageError;
use crate::pipeline::allocator::BufferAllocator;
use crate::pipeline::clock::{CLOCK_FREQ, FrameClock};
use crate::pipeline::flow::SampleFormat;
use crate::pipeline::types::Frame;

/// Byte layout of a sound buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    /// One plane for interleaved sound, one per channel for planar sound
    pub planes: usize,
    /// Bytes of one sample in one plane
    pub sample_size: usize,
    /// Byte pattern of silence
    pub silence: u8,
}

impl SampleLayout {
    pub fn of(format: SampleFormat, channels: u8) -> Self {
        let channels = channels.max(1) as usize;
        if format.is_planar() {
            Self {
                planes: channels,
                sample_size: format.bytes_per_sample(),
                silence: format.silence(),
            }
        } else {
            Self {
                planes: 1,
                sample_size: format.bytes_per_sample() * channels,
                silence: format.silence(),
            }
        }
    }

    /// Samples per channel carried by `frame`, if its planes fit this layout
    pub fn samples(&self, frame: &Frame) -> Option<usize> {
        if frame.planes.len() != self.planes {
            return None;
        }
        let len = frame.planes.first()?.len();
        if len % self.sample_size != 0 || frame.planes.iter().any(|p| p.len() != len) {
            return None;
        }
        Some(len / self.sample_size)
    }
}

struct Chunk {
    planes: Vec<Bytes>,
    clock: FrameClock,
    samples: usize,
    /// Samples already handed out
    offset: usize,
}

impl Chunk {
    fn remaining(&self) -> usize {
        self.samples - self.offset
    }
}

/// Accumulates sound chunks into frames of exactly `frame_samples` samples
pub struct Reframer {
    layout: SampleLayout,
    frame_samples: usize,
    rate: u64,
    chunks: VecDeque<Chunk>,
    retained: usize,
}

impl Reframer {
    pub fn new(layout: SampleLayout, frame_samples: u32, rate: u64) -> Self {
        Self {
            layout,
            frame_samples: frame_samples.max(1) as usize,
            rate,
            chunks: VecDeque::new(),
            retained: 0,
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn retained_samples(&self) -> usize {
        self.retained
    }

    pub fn retained_bytes(&self) -> usize {
        self.retained * self.layout.sample_size * self.layout.planes
    }

    fn ticks(&self, samples: usize) -> u64 {
        if self.rate == 0 {
            return 0;
        }
        (samples as u128 * CLOCK_FREQ as u128 / self.rate as u128) as u64
    }

    /// Append a chunk and return every full frame now available
    ///
    /// A chunk that does not hold whole samples is refused and nothing is
    /// retained from it.
    pub fn append(
        &mut self,
        frame: Frame,
        allocator: &dyn BufferAllocator,
    ) -> Result<Vec<Frame>, StageError> {
        let samples = self.layout.samples(&frame).ok_or_else(|| {
            StageError::InvalidBuffer(format!(
                "reframe size mismatch: {} planes of {:?} bytes",
                frame.planes.len(),
                frame.planes.iter().map(Bytes::len).collect::<Vec<_>>()
            ))
        })?;

        if samples > 0 {
            self.chunks.push_back(Chunk {
                planes: frame.planes,
                clock: frame.clock,
                samples,
                offset: 0,
            });
            self.retained += samples;
        }

        let mut frames = Vec::with_capacity(self.retained / self.frame_samples);
        while self.retained >= self.frame_samples {
            frames.push(self.extract(allocator)?);
        }
        Ok(frames)
    }

    /// Emit the remainder padded with silence to a full frame
    pub fn flush(&mut self, allocator: &dyn BufferAllocator) -> Result<Option<Frame>, StageError> {
        if self.retained == 0 {
            return Ok(None);
        }

        let plane_size = self.frame_samples * self.layout.sample_size;
        let mut planes = Vec::with_capacity(self.layout.planes);
        for _ in 0..self.layout.planes {
            planes.push(allocator.allocate(plane_size)?);
        }

        let clock = self.head_clock();
        let remaining = self.retained;
        self.copy_out(remaining, &mut planes);
        for plane in &mut planes {
            plane.resize(plane_size, self.layout.silence);
        }

        let duration = self.ticks(self.frame_samples);
        Ok(Some(Frame::planar(
            planes.into_iter().map(BytesMut::freeze).collect(),
            clock.with_duration(duration),
        )))
    }

    /// Drop the remainder, returning how many samples were dropped
    pub fn clear(&mut self) -> usize {
        let retained = self.retained;
        self.chunks.clear();
        self.retained = 0;
        retained
    }

    /// Clock of the oldest retained sample
    fn head_clock(&self) -> FrameClock {
        match self.chunks.front() {
            Some(chunk) => {
                let mut clock = chunk.clock;
                clock.shift(self.ticks(chunk.offset));
                clock
            }
            None => FrameClock::default(),
        }
    }

    fn extract(&mut self, allocator: &dyn BufferAllocator) -> Result<Frame, StageError> {
        let samples = self.frame_samples;
        let sample_size = self.layout.sample_size;
        let clock = self.head_clock().with_duration(self.ticks(samples));

        // Whole frame inside the oldest chunk: slice without copying
        if let Some(chunk) = self.chunks.front_mut()
            && chunk.remaining() >= samples
        {
            let start = chunk.offset * sample_size;
            let end = start + samples * sample_size;
            let planes = chunk.planes.iter().map(|p| p.slice(start..end)).collect();
            chunk.offset += samples;
            if chunk.remaining() == 0 {
                self.chunks.pop_front();
            }
            self.retained -= samples;
            return Ok(Frame::planar(planes, clock));
        }

        let mut planes = Vec::with_capacity(self.layout.planes);
        for _ in 0..self.layout.planes {
            planes.push(allocator.allocate(samples * sample_size)?);
        }
        self.copy_out(samples, &mut planes);
        Ok(Frame::planar(
            planes.into_iter().map(BytesMut::freeze).collect(),
            clock,
        ))
    }

    /// Move `samples` retained samples into `planes`
    fn copy_out(&mut self, samples: usize, planes: &mut [BytesMut]) {
        let sample_size = self.layout.sample_size;
        let mut needed = samples.min(self.retained);
        self.retained -= needed;

        while needed > 0 {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let take = needed.min(chunk.remaining());
            let start = chunk.offset * sample_size;
            let end = start + take * sample_size;
            for (out, plane) in planes.iter_mut().zip(&chunk.planes) {
                out.extend_from_slice(&plane[start..end]);
            }
            chunk.offset += take;
            needed -= take;
            if chunk.remaining() == 0 {
                self.chunks.pop_front();
            }
        }
    }
}

/// Split an interleaved sound frame into one plane per channel
pub fn deinterleave(
    frame: Frame,
    channels: usize,
    sample_size: usize,
    allocator: &dyn BufferAllocator,
) -> Result<Frame, StageError> {
    let stride = channels * sample_size;
    let data = match frame.planes.as_slice() {
        [data] if stride > 0 && data.len() % stride == 0 => data.clone(),
        _ => {
            return Err(StageError::InvalidBuffer(format!(
                "cannot deinterleave {} planes into {} channels",
                frame.planes.len(),
                channels
            )));
        }
    };

    let samples = data.len() / stride;
    let mut planes = Vec::with_capacity(channels);
    for _ in 0..channels {
        planes.push(allocator.allocate(samples * sample_size)?);
    }
    for sample in data.chunks_exact(stride) {
        for (plane, value) in planes.iter_mut().zip(sample.chunks_exact(sample_size)) {
            plane.extend_from_slice(value);
        }
    }

    let mut out = Frame::planar(
        planes.into_iter().map(BytesMut::freeze).collect(),
        frame.clock,
    );
    out.is_keyframe = frame.is_keyframe;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::allocator::PoolAllocator;

    fn chunk(len: usize, fill: u8) -> Frame {
        Frame::block(Bytes::from(vec![fill; len]), FrameClock::with_pts(0))
    }

    #[test]
    fn test_chunks_of_500_against_1024() {
        let pool = PoolAllocator::default();
        let mut reframer = Reframer::new(SampleLayout::of(SampleFormat::U8, 1), 1024, 48_000);

        assert!(reframer.append(chunk(500, 1), &pool).unwrap().is_empty());
        assert!(reframer.append(chunk(500, 2), &pool).unwrap().is_empty());
        assert_eq!(reframer.retained_bytes(), 1000);

        let frames = reframer.append(chunk(500, 3), &pool).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].size(), 1024);
        assert_eq!(reframer.retained_bytes(), 476);

        let data = &frames[0].planes[0];
        assert_eq!(data[499], 1);
        assert_eq!(data[500], 2);
        assert_eq!(data[1000], 3);
    }

    #[test]
    fn test_emits_k_frames_and_retains_r() {
        let pool = PoolAllocator::default();
        // s16 mono: 512 samples per 1024-byte frame
        let layout = SampleLayout::of(SampleFormat::S16, 1);
        for sizes in [
            vec![1024usize],
            vec![2, 4, 1018, 1026],
            vec![100, 2000, 6, 1024, 3000],
            vec![4096, 10],
        ] {
            let mut reframer = Reframer::new(layout, 512, 48_000);
            let total: usize = sizes.iter().sum();
            let (k, r) = (total / 1024, total % 1024);

            let mut emitted = Vec::new();
            for size in &sizes {
                emitted.extend(reframer.append(chunk(*size, 0x11), &pool).unwrap());
            }
            assert_eq!(emitted.len(), k, "sizes {:?}", sizes);
            assert!(emitted.iter().all(|f| f.size() == 1024));
            assert_eq!(reframer.retained_bytes(), r);

            let last = reframer.flush(&pool).unwrap();
            if r == 0 {
                assert!(last.is_none());
            } else {
                let last = last.unwrap();
                let data = &last.planes[0];
                assert_eq!(data.len(), 1024);
                assert!(data[..r].iter().all(|b| *b == 0x11));
                assert!(data[r..].iter().all(|b| *b == 0));
            }
            assert_eq!(reframer.retained_bytes(), 0);
        }
    }

    #[test]
    fn test_u8_flush_pads_with_midpoint() {
        let pool = PoolAllocator::default();
        let mut reframer = Reframer::new(SampleLayout::of(SampleFormat::U8, 2), 4, 8_000);
        reframer.append(chunk(2, 7), &pool).unwrap();
        let frame = reframer.flush(&pool).unwrap().unwrap();
        assert_eq!(&frame.planes[0][..], &[7, 7, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80]);
    }

    #[test]
    fn test_planar_frames_cut_per_plane() {
        let pool = PoolAllocator::default();
        let mut reframer = Reframer::new(SampleLayout::of(SampleFormat::F32p, 2), 2, 48_000);
        let input = Frame::planar(
            vec![Bytes::from(vec![1u8; 12]), Bytes::from(vec![2u8; 12])],
            FrameClock::with_pts(0),
        );
        let frames = reframer.append(input, &pool).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].planes.len(), 2);
        assert_eq!(frames[0].planes[0].len(), 8);
        assert!(frames[0].planes[1].iter().all(|b| *b == 2));
        assert_eq!(reframer.retained_samples(), 1);
        assert_eq!(reframer.retained_bytes(), 8);
    }

    #[test]
    fn test_dates_follow_samples() {
        let pool = PoolAllocator::default();
        let mut reframer = Reframer::new(SampleLayout::of(SampleFormat::S16, 1), 1024, 48_000);
        let input = Frame::block(Bytes::from(vec![0u8; 4096]), FrameClock::with_pts(1_000));
        let frames = reframer.append(input, &pool).unwrap();
        assert_eq!(frames.len(), 2);

        // 1024 samples at 48 kHz
        let step = 576_000;
        assert_eq!(frames[0].clock.prog.map(|d| d.value), Some(1_000));
        assert_eq!(frames[1].clock.prog.map(|d| d.value), Some(1_000 + step));
        assert_eq!(frames[1].clock.duration, Some(step));
    }

    #[test]
    fn test_partial_sample_rejected() {
        let pool = PoolAllocator::default();
        let mut reframer = Reframer::new(SampleLayout::of(SampleFormat::S16, 2), 16, 48_000);
        let result = reframer.append(chunk(6, 0), &pool);
        assert!(matches!(result, Err(StageError::InvalidBuffer(_))));
        assert_eq!(reframer.retained_bytes(), 0);
    }

    #[test]
    fn test_deinterleave() {
        let pool = PoolAllocator::default();
        let frame = Frame::block(
            Bytes::from_static(&[1, 1, 2, 2, 3, 3, 4, 4]),
            FrameClock::with_pts(5),
        );
        let planar = deinterleave(frame, 2, 2, &pool).unwrap();
        assert_eq!(&planar.planes[0][..], &[1, 1, 3, 3]);
        assert_eq!(&planar.planes[1][..], &[2, 2, 4, 4]);
        assert_eq!(planar.clock, FrameClock::with_pts(5));
    }
}
