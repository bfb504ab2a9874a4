//! Output timing reconstruction
//!
//! Encoded frames are dated by decoding time. The decode-to-presentation
//! delay comes from the engine timestamps, the buffering delay either from
//! the engine or from a leaky bucket model of a constant bitrate buffer.

use crate::encoder::engine::{EngineParams, Packet};
use crate::pipeline::clock::{CLOCK_FREQ, FrameClock, rescale};
use crate::pipeline::types::Rational;

/// Occupancy model of a constant bitrate decoder buffer, in clock ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakyBucket {
    /// Duration of a full buffer
    capacity: i64,
    /// Duration added for every emitted frame
    leakage: i64,
    octet_rate: u64,
    occupancy: i64,
}

impl LeakyBucket {
    /// Bucket of `buffer_size` bytes drained at `octet_rate`, filled by frames
    /// of `frame_samples` samples at `sample_rate`
    ///
    /// Starts full.
    pub fn new(buffer_size: u64, octet_rate: u64, frame_samples: u32, sample_rate: u64) -> Option<Self> {
        if octet_rate == 0 || sample_rate == 0 {
            return None;
        }
        let capacity = (buffer_size as u128 * CLOCK_FREQ as u128 / octet_rate as u128) as i64;
        let leakage = (CLOCK_FREQ as u128 * frame_samples as u128 / sample_rate as u128) as i64;
        Some(Self {
            capacity,
            leakage,
            octet_rate,
            occupancy: capacity,
        })
    }

    /// Account for one emitted frame of `bytes` bytes
    ///
    /// Returns the buffering delay to apply and, on underflow, by how many
    /// ticks the buffer ran dry.
    pub fn drain(&mut self, bytes: usize) -> (u64, Option<u64>) {
        self.occupancy += self.leakage;
        self.occupancy -= (bytes as u128 * CLOCK_FREQ as u128 / self.octet_rate as u128) as i64;

        let mut underflow = None;
        if self.occupancy < 0 {
            underflow = Some(self.occupancy.unsigned_abs());
            self.occupancy = 0;
        } else if self.occupancy > self.capacity {
            self.occupancy = self.capacity;
        }
        (self.occupancy as u64, underflow)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    pub fn occupancy(&self) -> u64 {
        self.occupancy as u64
    }
}

/// Result of dating one encoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stamp {
    pub dts_pts_delay: u64,
    pub cr_dts_delay: Option<u64>,
    /// Ticks the buffer model ran dry by, if it underflowed
    pub underflow: Option<u64>,
}

/// Timing state of an open engine
#[derive(Debug, Default)]
pub struct TimingModel {
    input_latency: u64,
    bucket: Option<LeakyBucket>,
}

impl TimingModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the buffer model; called whenever the engine opens
    pub fn reset(&mut self) {
        self.bucket = None;
    }

    pub fn set_input_latency(&mut self, latency: u64) {
        self.input_latency = latency;
    }

    pub fn input_latency(&self) -> u64 {
        self.input_latency
    }

    /// Enable the buffer model unless one is already running
    pub fn arm_bucket(&mut self, bucket: LeakyBucket) {
        if self.bucket.is_none() {
            self.bucket = Some(bucket);
        }
    }

    pub fn bucket(&self) -> Option<&LeakyBucket> {
        self.bucket.as_ref()
    }

    /// Latency of the output: input latency plus the engine delay in frames
    pub fn output_latency(&self, delay_frames: u32, fps: Option<Rational>) -> u64 {
        match fps {
            Some(fps) if fps.is_valid() && delay_frames > 0 => {
                self.input_latency
                    + (delay_frames as u128 * CLOCK_FREQ as u128 * fps.den as u128
                        / fps.num as u128) as u64
            }
            _ => self.input_latency,
        }
    }

    /// Date an encoded frame from the packet the engine produced for it
    ///
    /// The clock is rebased to decoding time.
    pub fn stamp(
        &mut self,
        clock: &mut FrameClock,
        packet: &Packet,
        params: &EngineParams,
    ) -> Stamp {
        let delta = (packet.pts - packet.dts).max(0) as u64;
        let dts_pts_delay = rescale(delta, params.time_base);
        clock.dts_pts_delay = Some(dts_pts_delay);
        clock.rebase_dts();

        let mut stamp = Stamp {
            dts_pts_delay,
            ..Stamp::default()
        };
        if let Some(vbv_delay) = params.vbv_delay.filter(|delay| *delay > 0) {
            stamp.cr_dts_delay = Some(vbv_delay);
        } else if let Some(bucket) = self.bucket.as_mut() {
            let (delay, underflow) = bucket.drain(packet.data.len());
            stamp.cr_dts_delay = Some(delay);
            stamp.underflow = underflow;
        }
        clock.cr_dts_delay = stamp.cr_dts_delay;
        stamp
    }
}
