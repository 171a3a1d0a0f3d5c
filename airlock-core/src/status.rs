//! Request status, turn ownership, and the legal transition table.
//!
//! The transition table is data; `check_transition` is the single evaluator.
//! Nothing in here mutates state - callers consult the table and then persist
//! the change themselves.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AirlockError;

/// Lifecycle status of a release request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Submitted,
    PartiallyReviewed,
    Reviewed,
    Returned,
    Approved,
    Released,
    Rejected,
    Withdrawn,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::PartiallyReviewed => "PARTIALLY_REVIEWED",
            Self::Reviewed => "REVIEWED",
            Self::Returned => "RETURNED",
            Self::Approved => "APPROVED",
            Self::Released => "RELEASED",
            Self::Rejected => "REJECTED",
            Self::Withdrawn => "WITHDRAWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUBMITTED" => Some(Self::Submitted),
            "PARTIALLY_REVIEWED" => Some(Self::PartiallyReviewed),
            "REVIEWED" => Some(Self::Reviewed),
            "RETURNED" => Some(Self::Returned),
            "APPROVED" => Some(Self::Approved),
            "RELEASED" => Some(Self::Released),
            "REJECTED" => Some(Self::Rejected),
            "WITHDRAWN" => Some(Self::Withdrawn),
            _ => None,
        }
    }

    /// Who may write to a request in this status.
    pub fn owner(&self) -> StatusOwner {
        match self {
            Self::Pending | Self::Returned => StatusOwner::Author,
            Self::Submitted | Self::PartiallyReviewed | Self::Reviewed => StatusOwner::Reviewer,
            Self::Approved | Self::Released | Self::Rejected | Self::Withdrawn => {
                StatusOwner::System
            }
        }
    }

    /// The review-turn phase implied by this status.
    pub fn phase(&self) -> TurnPhase {
        match self {
            Self::Pending | Self::Returned => TurnPhase::Author,
            Self::Submitted | Self::PartiallyReviewed => TurnPhase::Independent,
            Self::Reviewed => TurnPhase::Consolidating,
            Self::Approved | Self::Released | Self::Rejected | Self::Withdrawn => {
                TurnPhase::Complete
            }
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Rejected | Self::Withdrawn)
    }

    /// Active statuses count against the one-active-request-per-author rule.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The author may edit files, groups, and comments in these statuses.
    pub fn is_editing(&self) -> bool {
        self.owner() == StatusOwner::Author
    }

    /// Reviewers may vote and comment in these statuses.
    pub fn is_under_review(&self) -> bool {
        self.owner() == StatusOwner::Reviewer
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which side of the table owns a request in a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusOwner {
    Author,
    Reviewer,
    System,
}

/// What phase of a review turn the request is in, derived from status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Author is editing; reviewers' previous-turn output is visible.
    Author,
    /// Blinded review: each reviewer sees only their own turn-T activity.
    Independent,
    /// All reviewers see each other's votes and comments.
    Consolidating,
    /// Terminal; everything visible to reviewers.
    Complete,
}

/// Role an actor must hold to drive a given transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRole {
    /// The request author.
    Author,
    /// Any output checker other than the author.
    Checker,
    /// Driven by the system (review submission tally, upload completion).
    System,
}

/// The legal transition table: (from, to, required role).
pub const TRANSITIONS: &[(RequestStatus, RequestStatus, TransitionRole)] = &[
    (
        RequestStatus::Pending,
        RequestStatus::Submitted,
        TransitionRole::Author,
    ),
    (
        RequestStatus::Pending,
        RequestStatus::Withdrawn,
        TransitionRole::Author,
    ),
    (
        RequestStatus::Submitted,
        RequestStatus::PartiallyReviewed,
        TransitionRole::System,
    ),
    (
        RequestStatus::Submitted,
        RequestStatus::Returned,
        TransitionRole::Checker,
    ),
    (
        RequestStatus::PartiallyReviewed,
        RequestStatus::Reviewed,
        TransitionRole::System,
    ),
    (
        RequestStatus::PartiallyReviewed,
        RequestStatus::Returned,
        TransitionRole::Checker,
    ),
    (
        RequestStatus::Reviewed,
        RequestStatus::Approved,
        TransitionRole::Checker,
    ),
    (
        RequestStatus::Reviewed,
        RequestStatus::Rejected,
        TransitionRole::Checker,
    ),
    (
        RequestStatus::Reviewed,
        RequestStatus::Returned,
        TransitionRole::Checker,
    ),
    (
        RequestStatus::Returned,
        RequestStatus::Submitted,
        TransitionRole::Author,
    ),
    (
        RequestStatus::Returned,
        RequestStatus::Withdrawn,
        TransitionRole::Author,
    ),
    (
        RequestStatus::Approved,
        RequestStatus::Released,
        TransitionRole::System,
    ),
];

/// Look up a transition in the table.
///
/// Returns the role required to drive it, or `InvalidTransition`.
pub fn check_transition(
    from: RequestStatus,
    to: RequestStatus,
) -> Result<TransitionRole, AirlockError> {
    TRANSITIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == to)
        .map(|(_, _, role)| *role)
        .ok_or(AirlockError::InvalidTransition { from, to })
}

/// Whether a transition starts a new review turn.
///
/// The first submission continues the turn the request was created in, so
/// the whole first review round is turn 1. After that, every return hands a
/// fresh turn to the author and every resubmission hands a fresh turn to the
/// reviewers.
pub fn increments_turn(from: RequestStatus, to: RequestStatus) -> bool {
    matches!(
        (from, to),
        (RequestStatus::Returned, RequestStatus::Submitted) | (_, RequestStatus::Returned)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_status_has_an_owner() {
        // The owner partition must cover every status; phase likewise.
        for status in all_statuses() {
            let _ = status.owner();
            let _ = status.phase();
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RequestStatus::Released.is_terminal());
        assert!(RequestStatus::Rejected.is_terminal());
        assert!(RequestStatus::Withdrawn.is_terminal());
        assert!(!RequestStatus::Approved.is_terminal());
        assert!(!RequestStatus::Pending.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        assert_eq!(
            check_transition(RequestStatus::Pending, RequestStatus::Submitted).unwrap(),
            TransitionRole::Author
        );
        assert_eq!(
            check_transition(RequestStatus::Submitted, RequestStatus::PartiallyReviewed).unwrap(),
            TransitionRole::System
        );
        assert_eq!(
            check_transition(RequestStatus::PartiallyReviewed, RequestStatus::Reviewed).unwrap(),
            TransitionRole::System
        );
        assert_eq!(
            check_transition(RequestStatus::Reviewed, RequestStatus::Approved).unwrap(),
            TransitionRole::Checker
        );
        assert_eq!(
            check_transition(RequestStatus::Approved, RequestStatus::Released).unwrap(),
            TransitionRole::System
        );
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(check_transition(RequestStatus::Pending, RequestStatus::Released).is_err());
        assert!(check_transition(RequestStatus::Submitted, RequestStatus::Approved).is_err());
        assert!(check_transition(RequestStatus::Released, RequestStatus::Pending).is_err());
        assert!(check_transition(RequestStatus::Rejected, RequestStatus::Approved).is_err());
        assert!(check_transition(RequestStatus::Withdrawn, RequestStatus::Submitted).is_err());
    }

    #[test]
    fn test_turn_increments_on_returns_and_resubmissions() {
        // the initial submission stays in turn 1
        assert!(!increments_turn(
            RequestStatus::Pending,
            RequestStatus::Submitted
        ));
        assert!(increments_turn(
            RequestStatus::Returned,
            RequestStatus::Submitted
        ));
        assert!(increments_turn(
            RequestStatus::Reviewed,
            RequestStatus::Returned
        ));
        assert!(increments_turn(
            RequestStatus::Submitted,
            RequestStatus::Returned
        ));
        assert!(!increments_turn(
            RequestStatus::Pending,
            RequestStatus::Withdrawn
        ));
        assert!(!increments_turn(
            RequestStatus::Approved,
            RequestStatus::Released
        ));
        assert!(!increments_turn(
            RequestStatus::Submitted,
            RequestStatus::PartiallyReviewed
        ));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in all_statuses() {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("NOT_A_STATUS"), None);
    }

    fn all_statuses() -> Vec<RequestStatus> {
        vec![
            RequestStatus::Pending,
            RequestStatus::Submitted,
            RequestStatus::PartiallyReviewed,
            RequestStatus::Reviewed,
            RequestStatus::Returned,
            RequestStatus::Approved,
            RequestStatus::Released,
            RequestStatus::Rejected,
            RequestStatus::Withdrawn,
        ]
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_status() -> impl Strategy<Value = RequestStatus> {
            prop_oneof![
                Just(RequestStatus::Pending),
                Just(RequestStatus::Submitted),
                Just(RequestStatus::PartiallyReviewed),
                Just(RequestStatus::Reviewed),
                Just(RequestStatus::Returned),
                Just(RequestStatus::Approved),
                Just(RequestStatus::Released),
                Just(RequestStatus::Rejected),
                Just(RequestStatus::Withdrawn),
            ]
        }

        proptest! {
            /// No transition ever leaves a terminal status.
            #[test]
            fn terminal_states_have_no_exits(from in arb_status(), to in arb_status()) {
                if from.is_terminal() {
                    prop_assert!(check_transition(from, to).is_err());
                }
            }

            /// Turn increments only happen on transitions that are legal and
            /// that actually change the owning side.
            #[test]
            fn turn_increment_implies_ownership_flip(from in arb_status(), to in arb_status()) {
                if increments_turn(from, to) && check_transition(from, to).is_ok() {
                    prop_assert_ne!(from.owner(), to.owner());
                }
            }

            /// Author-role transitions start from author-owned statuses and
            /// checker-role transitions from reviewer-owned statuses.
            #[test]
            fn transition_roles_match_ownership(from in arb_status(), to in arb_status()) {
                if let Ok(role) = check_transition(from, to) {
                    match role {
                        TransitionRole::Author => prop_assert_eq!(from.owner(), StatusOwner::Author),
                        TransitionRole::Checker => prop_assert_eq!(from.owner(), StatusOwner::Reviewer),
                        TransitionRole::System => {}
                    }
                }
            }
        }
    }
}
