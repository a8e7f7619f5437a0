//! Session State Machines
//!
//! Total transition functions for modification sessions and retirement
//! requests:
//!
//! ```text
//! Pending → Validating → Applying → Completed
//!        ↘            ↘          ↘ Failed
//!         Cancelled / Expired (from any non-terminal state)
//!
//! Initiated → Blocked → Resolving → Retired
//!          ↘ Resolving          ↘ Cancelled (apply failed)
//! Initiated/Blocked → Cancelled
//! ```

use std::fmt::Debug;

use thiserror::Error;

use crate::session::{ModificationState, RetirementState};

/// Error when an invalid state transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition<S: Debug> {
    pub from: S,
    pub to: S,
    pub reason: &'static str,
}

impl ModificationState {
    /// Attempt a transition to a new state.
    pub fn try_transition(
        self,
        to: ModificationState,
    ) -> Result<ModificationState, InvalidTransition<ModificationState>> {
        use ModificationState::*;

        let valid = match (self, to) {
            (Pending, Validating) => true,
            (Validating, Applying) => true,
            (Validating, Failed) => true,
            (Applying, Completed) => true,
            (Applying, Failed) => true,

            // User cancel and cleanup reach every non-terminal state
            (Pending | Validating | Applying, Cancelled) => true,
            (Pending | Validating | Applying, Expired) => true,

            // Terminal states are immutable
            (Completed | Failed | Cancelled | Expired, _) => false,

            _ => false,
        };

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    /// Check if a transition is valid without performing it
    pub fn can_transition_to(self, to: ModificationState) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: ModificationState, to: ModificationState) -> &'static str {
        use ModificationState::*;

        match (from, to) {
            (Completed | Failed | Cancelled | Expired, _) => "Session is terminal",
            (Pending, Applying) => "Cannot apply before validation",
            (Pending | Validating, Completed) => "Cannot complete without an apply",
            (Pending, Failed) => "Failures are recorded once validation has started",
            (Applying, Validating | Pending) => "Apply in progress, cannot go back",
            _ => "Invalid state transition",
        }
    }
}

impl RetirementState {
    /// Attempt a transition to a new state.
    pub fn try_transition(
        self,
        to: RetirementState,
    ) -> Result<RetirementState, InvalidTransition<RetirementState>> {
        use RetirementState::*;

        let valid = match (self, to) {
            (Initiated, Blocked) => true,
            (Initiated, Resolving) => true,
            // Resumed after blocking edges were removed
            (Blocked, Resolving) => true,
            (Initiated | Blocked, Cancelled) => true,
            (Resolving, Retired) => true,
            (Resolving, Cancelled) => true,

            (Retired | Cancelled, _) => false,

            _ => false,
        };

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    pub fn can_transition_to(self, to: RetirementState) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: RetirementState, to: RetirementState) -> &'static str {
        use RetirementState::*;

        match (from, to) {
            (Retired, _) => "Retired is terminal - restore a backup to recover",
            (Cancelled, _) => "Cancelled is terminal",
            (Initiated | Blocked, Retired) => "Cannot retire without resolving",
            (Resolving, Blocked | Initiated) => "Resolution in progress, cannot go back",
            _ => "Invalid state transition",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod modification {
        use super::*;
        use ModificationState::*;

        #[test]
        fn test_happy_path() {
            assert_eq!(Pending.try_transition(Validating), Ok(Validating));
            assert_eq!(Validating.try_transition(Applying), Ok(Applying));
            assert_eq!(Applying.try_transition(Completed), Ok(Completed));
        }

        #[test]
        fn test_failures() {
            assert!(Validating.can_transition_to(Failed));
            assert!(Applying.can_transition_to(Failed));
        }

        #[test]
        fn test_cancel_and_expire_from_non_terminal() {
            for state in [Pending, Validating, Applying] {
                assert!(state.can_transition_to(Cancelled), "{state:?}");
                assert!(state.can_transition_to(Expired), "{state:?}");
            }
        }

        #[test]
        fn test_cannot_skip_validation() {
            let err = Pending.try_transition(Applying).unwrap_err();
            assert_eq!(err.from, Pending);
            assert_eq!(err.to, Applying);
            assert!(err.reason.contains("validation"));
        }

        #[test]
        fn test_terminal_states_are_immutable() {
            for terminal in [Completed, Failed, Cancelled, Expired] {
                for to in [
                    Pending, Validating, Applying, Completed, Failed, Cancelled, Expired,
                ] {
                    let result = terminal.try_transition(to);
                    assert!(result.is_err(), "{terminal:?} -> {to:?}");
                    assert_eq!(result.unwrap_err().reason, "Session is terminal");
                }
            }
        }

        #[test]
        fn test_apply_cannot_go_back() {
            assert!(!Applying.can_transition_to(Validating));
            assert!(!Applying.can_transition_to(Pending));
        }

        #[test]
        fn test_error_display() {
            let err = Completed.try_transition(Pending).unwrap_err();
            let msg = format!("{}", err);
            assert!(msg.contains("Completed"));
            assert!(msg.contains("Pending"));
        }
    }

    mod retirement {
        use super::*;
        use RetirementState::*;

        #[test]
        fn test_unblocked_path() {
            assert_eq!(Initiated.try_transition(Resolving), Ok(Resolving));
            assert_eq!(Resolving.try_transition(Retired), Ok(Retired));
        }

        #[test]
        fn test_blocked_then_resumed() {
            assert!(Initiated.can_transition_to(Blocked));
            assert!(Blocked.can_transition_to(Resolving));
        }

        #[test]
        fn test_cancel_only_while_open() {
            assert!(Initiated.can_transition_to(Cancelled));
            assert!(Blocked.can_transition_to(Cancelled));
            // Apply failure path
            assert!(Resolving.can_transition_to(Cancelled));
            assert!(!Retired.can_transition_to(Cancelled));
        }

        #[test]
        fn test_retired_is_irreversible() {
            for to in [Initiated, Blocked, Resolving, Cancelled] {
                let err = Retired.try_transition(to).unwrap_err();
                assert!(err.reason.contains("restore a backup"));
            }
        }

        #[test]
        fn test_cannot_retire_without_resolving() {
            assert!(!Initiated.can_transition_to(Retired));
            assert!(!Blocked.can_transition_to(Retired));
        }
    }
}
