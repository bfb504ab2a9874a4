//! Health metrics for pipeline stages

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for a stage
///
/// Tracks various counters to monitor stage health.
/// All fields use atomic operations for thread-safe access.
#[derive(Debug, Default)]
pub struct PipelineHealth {
    /// Number of frames accepted on the input
    pub frames_in: AtomicU64,

    /// Number of encoded frames emitted downstream
    pub frames_out: AtomicU64,

    /// Number of frames dropped (invalid buffers, failed opens, teardown)
    pub frame_drops: AtomicU64,

    /// Number of encode calls that returned an engine error
    pub encode_failures: AtomicU64,

    /// Total bytes of encoded data emitted
    pub bytes_out: AtomicU64,

    /// Number of buffer model underflows
    pub buffer_underflows: AtomicU64,

    /// Number of times upstream was told to stop pushing
    pub backpressure_events: AtomicU64,

    /// Number of in-flight frames freed at teardown without output
    pub leaked_frames: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_input(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an emitted encoded frame
    pub fn record_output(&self, size: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_frame_drop(&self) {
        self.record_frame_drops(1);
    }

    pub fn record_frame_drops(&self, count: usize) {
        self.frame_drops.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underflow(&self) {
        self.buffer_underflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leaks(&self, count: usize) {
        self.leaked_frames.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    pub fn encode_failures(&self) -> u64 {
        self.encode_failures.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn buffer_underflows(&self) -> u64 {
        self.buffer_underflows.load(Ordering::Relaxed)
    }

    pub fn backpressure_events(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }

    pub fn leaked_frames(&self) -> u64 {
        self.leaked_frames.load(Ordering::Relaxed)
    }

    /// Calculate the frame drop rate as a percentage of accepted input
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frame_drops();
        let accepted = self.frames_in();
        if accepted == 0 {
            return 0.0;
        }
        (drops as f64 / accepted as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_in: self.frames_in(),
            frames_out: self.frames_out(),
            frame_drops: self.frame_drops(),
            encode_failures: self.encode_failures(),
            bytes_out: self.bytes_out(),
            buffer_underflows: self.buffer_underflows(),
            backpressure_events: self.backpressure_events(),
            leaked_frames: self.leaked_frames(),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub frames_in: u64,
    pub frames_out: u64,
    pub frame_drops: u64,
    pub encode_failures: u64,
    pub bytes_out: u64,
    pub buffer_underflows: u64,
    pub backpressure_events: u64,
    pub leaked_frames: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} in, {} out ({} bytes), {} drops ({:.2}%), {} encode failures, {} underflows, {} blocked, {} leaked",
            self.frames_in,
            self.frames_out,
            self.bytes_out,
            self.frame_drops,
            self.frame_drop_rate,
            self.encode_failures,
            self.buffer_underflows,
            self.backpressure_events,
            self.leaked_frames
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = PipelineHealth::new();

        health.record_input();
        health.record_input();
        health.record_input();
        health.record_input();
        health.record_output(1000);
        health.record_output(2000);

        assert_eq!(health.frames_in(), 4);
        assert_eq!(health.frames_out(), 2);
        assert_eq!(health.bytes_out(), 3000);
        assert_eq!(health.frame_drops(), 0);

        health.record_frame_drop();
        assert_eq!(health.frame_drops(), 1);
        assert!((health.frame_drop_rate() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary_display() {
        let health = PipelineHealth::new();
        health.record_leaks(2);
        health.record_underflow();
        let summary = health.summary();
        assert_eq!(summary.leaked_frames, 2);
        let text = summary.to_string();
        assert!(text.contains("1 underflows"));
        assert!(text.contains("2 leaked"));
    }
}
