use std::collections::BTreeMap;

use crate::pipeline::types::Frame;

/// Frames currently inside the engine, keyed by correlation token
///
/// Tokens start at 1 and are never reused for the lifetime of the stage.
/// Each frame also carries the engine timestamp it was submitted with, which
/// is what the engine echoes back. Each token leaves the set exactly once:
/// through [`Correlator::resolve`] when the engine reports output for it, or
/// through [`Correlator::drain_leaks`] at teardown.
#[derive(Debug)]
pub struct Correlator {
    next_token: u64,
    in_flight: BTreeMap<u64, Frame>,
    tokens: BTreeMap<i64, u64>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_token: 1,
            in_flight: BTreeMap::new(),
            tokens: BTreeMap::new(),
        }
    }

    /// Take ownership of a frame entering the engine with timestamp `pts`
    /// and return its token
    pub fn attach(&mut self, mut frame: Frame, pts: i64) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        frame.set_correlation(token);
        self.in_flight.insert(token, frame);
        self.tokens.insert(pts, token);
        token
    }

    /// Hand back the frame that entered the engine with timestamp `pts`
    pub fn resolve(&mut self, pts: i64) -> Option<Frame> {
        let token = self.tokens.remove(&pts)?;
        let mut frame = self.in_flight.remove(&token)?;
        frame.clear_correlation();
        Some(frame)
    }

    /// Remove every frame still in flight, oldest first
    pub fn drain_leaks(&mut self) -> Vec<(u64, Frame)> {
        self.tokens.clear();
        std::mem::take(&mut self.in_flight).into_iter().collect()
    }

    pub fn contains(&self, token: u64) -> bool {
        self.in_flight.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Token the next attached frame will get
    pub fn next_token(&self) -> u64 {
        self.next_token
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::FrameClock;
    use bytes::Bytes;

    fn frame(pts: u64) -> Frame {
        Frame::block(Bytes::from_static(b"raw"), FrameClock::with_pts(pts))
    }

    #[test]
    fn test_tokens_are_monotonic() {
        let mut correlator = Correlator::new();
        assert_eq!(correlator.attach(frame(10), 1), 1);
        assert_eq!(correlator.attach(frame(20), 2), 2);
        assert_eq!(correlator.len(), 2);
        assert!(correlator.contains(2));
        assert_eq!(correlator.next_token(), 3);
    }

    #[test]
    fn test_resolve_once() {
        let mut correlator = Correlator::new();
        correlator.attach(frame(10), 1);

        let frame = correlator.resolve(1).unwrap();
        assert_eq!(frame.clock, FrameClock::with_pts(10));
        assert_eq!(frame.correlation(), None);

        assert!(correlator.resolve(1).is_none());
        assert!(correlator.resolve(99).is_none());
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_resolve_by_engine_timestamp() {
        let mut correlator = Correlator::new();
        // audio timestamps advance by the samples of each engine frame
        let first = correlator.attach(frame(10), 1);
        let second = correlator.attach(frame(20), 1025);

        let frame = correlator.resolve(1025).unwrap();
        assert_eq!(frame.clock, FrameClock::with_pts(20));
        assert!(correlator.contains(first));
        assert!(!correlator.contains(second));
        assert!(correlator.resolve(2).is_none());
    }

    #[test]
    fn test_resolve_after_teardown() {
        let mut correlator = Correlator::new();
        let first = correlator.attach(frame(1), 1);
        let second = correlator.attach(frame(2), 2);

        let leaks = correlator.drain_leaks();
        assert_eq!(
            leaks.iter().map(|(token, _)| *token).collect::<Vec<_>>(),
            vec![first, second]
        );
        assert_eq!(leaks[1].1.correlation(), Some(second));

        assert!(correlator.resolve(1).is_none());
        assert!(correlator.is_empty());
        // tokens are not reused
        assert_eq!(correlator.attach(frame(3), 1), 3);
    }
}
