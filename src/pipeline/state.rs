//! Stage state management

use std::time::Instant;

/// Stage state machine
///
/// Tracks whether the engine wrapped by a stage is usable. State transitions
/// are validated to ensure consistent behavior across all stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Engine is closed, input triggers an open request
    Closed,

    /// An open request is pending on the arbiter
    Opening,

    /// Engine is open and encoding
    Open {
        /// When the engine was opened
        opened_at: Instant,
    },

    /// Engine is being drained and closed
    Closing,

    /// Stage has been released and cannot be used again
    Dead,
}

impl StageState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &StageState) -> bool {
        use StageState::*;

        match (self, target) {
            // From Closed
            (Closed, Opening) => true,
            (Closed, Open { .. }) => true, // direct open without scheduler
            (Closed, Closing) => true,

            // From Opening
            (Opening, Open { .. }) => true,
            (Opening, Closed) => true, // open failed
            (Opening, Closing) => true, // teardown aborts the request

            // From Open
            (Open { .. }, Closing) => true,

            // From Closing
            (Closing, Closed) => true,
            (Closing, Dead) => true,

            // From Dead - no transitions allowed
            (Dead, _) => false,

            // Self-transitions
            (a, b) if a == b => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            StageState::Closed => "Closed",
            StageState::Opening => "Opening",
            StageState::Open { .. } => "Open",
            StageState::Closing => "Closing",
            StageState::Dead => "Dead",
        }
    }

    /// Check if the engine is open
    pub fn is_open(&self) -> bool {
        matches!(self, StageState::Open { .. })
    }

    /// Check if the stage is shutting down or gone
    pub fn is_terminating(&self) -> bool {
        matches!(self, StageState::Closing | StageState::Dead)
    }

    /// Get the duration since the engine was opened (if open)
    pub fn open_duration(&self) -> Option<std::time::Duration> {
        if let StageState::Open { opened_at } = self {
            Some(opened_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let open = StageState::Open {
            opened_at: Instant::now(),
        };

        assert!(StageState::Closed.can_transition_to(&StageState::Opening));
        assert!(StageState::Opening.can_transition_to(&open));
        assert!(StageState::Opening.can_transition_to(&StageState::Closed));
        assert!(open.can_transition_to(&StageState::Closing));
        assert!(StageState::Closing.can_transition_to(&StageState::Closed));
        assert!(StageState::Closing.can_transition_to(&StageState::Dead));

        // Self-transitions
        assert!(StageState::Opening.can_transition_to(&StageState::Opening));
    }

    #[test]
    fn test_invalid_transitions() {
        let open = StageState::Open {
            opened_at: Instant::now(),
        };

        assert!(!open.can_transition_to(&StageState::Opening));
        assert!(!StageState::Closed.can_transition_to(&StageState::Dead));
        assert!(!StageState::Dead.can_transition_to(&StageState::Closed));
        assert!(!StageState::Dead.can_transition_to(&StageState::Dead));
    }

    #[test]
    fn test_state_checks() {
        let open = StageState::Open {
            opened_at: Instant::now(),
        };
        assert!(open.is_open());
        assert!(open.open_duration().is_some());
        assert!(!StageState::Opening.is_open());
        assert!(StageState::Closing.is_terminating());
        assert!(StageState::Dead.is_terminating());
        assert_eq!(StageState::Opening.to_string(), "Opening");
    }
}
