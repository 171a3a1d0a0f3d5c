//! Computed visibility for comments and votes.
//!
//! Visibility is never stored. The PRIVATE/PUBLIC flag on a comment stays
//! pure in the store; whether a given viewer sees a given item is decided
//! here from the current turn and phase.

use serde::{Deserialize, Serialize};

use crate::status::TurnPhase;

/// Comment visibility, chosen by the comment author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    /// Output checkers only, until promoted or the turn completes.
    Private,
    /// Everyone with access to the request.
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "PRIVATE",
            Self::Public => "PUBLIC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRIVATE" => Some(Self::Private),
            "PUBLIC" => Some(Self::Public),
            _ => None,
        }
    }
}

/// Can `viewer` see a comment authored by `item_author` with the given
/// visibility in turn `item_turn`?
///
/// Rules, in order:
/// - authors always see their own items;
/// - PUBLIC items are visible once their turn has ended (or phase is
///   COMPLETE), and during CONSOLIDATING to anyone who can review;
/// - PRIVATE items are only ever visible to reviewers, and within the current
///   turn only outside the INDEPENDENT (blinded) phase.
pub fn comment_visible(
    item_author: &str,
    item_visibility: Visibility,
    item_turn: u32,
    current_turn: u32,
    phase: TurnPhase,
    viewer: &str,
    viewer_can_review: bool,
) -> bool {
    if item_author == viewer {
        return true;
    }

    let turn_over = item_turn < current_turn || phase == TurnPhase::Complete;

    match item_visibility {
        Visibility::Public => {
            turn_over || (phase == TurnPhase::Consolidating && viewer_can_review)
        }
        Visibility::Private => {
            viewer_can_review && (turn_over || phase != TurnPhase::Independent)
        }
    }
}

/// Can `viewer` see a vote cast by `vote_reviewer` in turn `vote_turn`?
///
/// Own votes are always visible. Others' votes are only ever shown to
/// reviewers, and current-turn votes stay hidden during the blinded phase.
/// The author never sees raw votes; they see the aggregated decision.
pub fn vote_visible(
    vote_reviewer: &str,
    vote_turn: u32,
    current_turn: u32,
    phase: TurnPhase,
    viewer: &str,
    viewer_can_review: bool,
) -> bool {
    if vote_reviewer == viewer {
        return true;
    }
    if !viewer_can_review {
        return false;
    }
    vote_turn < current_turn || phase != TurnPhase::Independent
}
