//! Vote aggregation and review gates.
//!
//! All functions here are pure: they take snapshots of vote/comment state
//! assembled by the controller and decide whether a review action is allowed
//! or what the per-file decision is. Disclosure risk is judged across a whole
//! release, so decisions only count votes from reviewers who have submitted
//! their review for the relevant turn.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::AirlockError;

/// An individual reviewer's current position on one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteChoice {
    Approve,
    RequestChanges,
    /// Explicit reset; also applied by the system to stale change requests
    /// when a returned request is resubmitted.
    Undecided,
}

impl VoteChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::RequestChanges => "REQUEST_CHANGES",
            Self::Undecided => "UNDECIDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVE" => Some(Self::Approve),
            "REQUEST_CHANGES" => Some(Self::RequestChanges),
            "UNDECIDED" => Some(Self::Undecided),
            _ => None,
        }
    }

    /// A decided vote counts toward the submit-review gate.
    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::Undecided)
    }
}

/// The aggregated outcome for one file, derived from submitted votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileDecision {
    Approved,
    ChangesRequested,
    Conflicted,
    Incomplete,
}

impl FileDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::ChangesRequested => "CHANGES_REQUESTED",
            Self::Conflicted => "CONFLICTED",
            Self::Incomplete => "INCOMPLETE",
        }
    }

    /// Decisions that block a plain return-with-comments.
    pub fn requires_return_comment(&self) -> bool {
        matches!(self, Self::ChangesRequested | Self::Conflicted)
    }
}

/// Derive the decision for one file from the votes of submitted reviewers.
///
/// UNDECIDED votes carry no weight. Two decided votes are required before the
/// decision leaves INCOMPLETE.
pub fn file_decision(votes: &[VoteChoice]) -> FileDecision {
    let approvals = votes.iter().filter(|v| **v == VoteChoice::Approve).count();
    let change_requests = votes
        .iter()
        .filter(|v| **v == VoteChoice::RequestChanges)
        .count();

    if approvals >= 1 && change_requests >= 1 {
        FileDecision::Conflicted
    } else if approvals >= 2 {
        FileDecision::Approved
    } else if change_requests >= 2 {
        FileDecision::ChangesRequested
    } else {
        FileDecision::Incomplete
    }
}

/// One output file as seen by a particular reviewer, for gate evaluation.
#[derive(Debug, Clone)]
pub struct ReviewerFileView {
    pub relpath: String,
    pub group: String,
    /// The reviewer's own current vote, if any.
    pub vote: Option<VoteChoice>,
}

/// Submit-review gate for one reviewer at the current turn.
///
/// The reviewer must have a decided vote on every non-withdrawn output file,
/// and must have commented this turn on every group where they requested
/// changes. Submission is recorded at most once per turn.
pub fn check_submit_review(
    files: &[ReviewerFileView],
    commented_groups: &BTreeSet<String>,
    already_submitted: bool,
) -> Result<(), AirlockError> {
    if already_submitted {
        return Err(AirlockError::Precondition(
            "review already submitted for this turn".to_string(),
        ));
    }

    let unvoted: Vec<&str> = files
        .iter()
        .filter(|f| !f.vote.map(|v| v.is_decided()).unwrap_or(false))
        .map(|f| f.relpath.as_str())
        .collect();
    if !unvoted.is_empty() {
        return Err(AirlockError::Precondition(format!(
            "all output files must be reviewed before submitting; missing: {}",
            unvoted.join(", ")
        )));
    }

    let mut missing_comments: Vec<&str> = files
        .iter()
        .filter(|f| f.vote == Some(VoteChoice::RequestChanges))
        .filter(|f| !commented_groups.contains(&f.group))
        .map(|f| f.group.as_str())
        .collect();
    missing_comments.sort_unstable();
    missing_comments.dedup();
    if !missing_comments.is_empty() {
        return Err(AirlockError::Precondition(format!(
            "groups with requested changes need a comment before submitting: {}",
            missing_comments.join(", ")
        )));
    }

    Ok(())
}

/// A file group's state relevant to the return gate.
#[derive(Debug, Clone)]
pub struct GroupReturnView {
    pub name: String,
    /// Decisions of the group's non-withdrawn output files.
    pub decisions: Vec<FileDecision>,
    /// Whether any PUBLIC comment was authored on this group in the current turn.
    pub has_public_comment_this_turn: bool,
}

/// Return gate when leaving REVIEWED: every group holding a file with changes
/// requested (or conflicted votes) must carry a public comment from this turn.
///
/// Early return (from SUBMITTED / PARTIALLY_REVIEWED) bypasses this gate
/// entirely; the caller only invokes it for the consolidated return.
pub fn check_return(groups: &[GroupReturnView]) -> Result<(), AirlockError> {
    let mut missing: Vec<&str> = groups
        .iter()
        .filter(|g| g.decisions.iter().any(|d| d.requires_return_comment()))
        .filter(|g| !g.has_public_comment_this_turn)
        .map(|g| g.name.as_str())
        .collect();
    missing.sort_unstable();
    if !missing.is_empty() {
        return Err(AirlockError::Precondition(format!(
            "file groups are missing a public comment: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Release gate: every non-withdrawn output file must be APPROVED.
pub fn check_release(output_decisions: &[(String, FileDecision)]) -> Result<(), AirlockError> {
    if output_decisions.is_empty() {
        return Err(AirlockError::Precondition(
            "request contains no output files".to_string(),
        ));
    }
    let unapproved: Vec<&str> = output_decisions
        .iter()
        .filter(|(_, d)| *d != FileDecision::Approved)
        .map(|(path, _)| path.as_str())
        .collect();
    if !unapproved.is_empty() {
        return Err(AirlockError::Precondition(format!(
            "not all output files are approved: {}",
            unapproved.join(", ")
        )));
    }
    Ok(())
}

/// Submit gate for the author: at least one output file, and every group that
/// contains output files must have both context and controls filled in.
pub fn check_submit(
    output_file_count: usize,
    incomplete_groups_with_outputs: &[String],
) -> Result<(), AirlockError> {
    if output_file_count == 0 {
        return Err(AirlockError::Precondition(
            "cannot submit a request with no output files".to_string(),
        ));
    }
    if !incomplete_groups_with_outputs.is_empty() {
        return Err(AirlockError::Precondition(format!(
            "incomplete context and/or controls for file group(s): {}",
            incomplete_groups_with_outputs.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_two_approvals() {
        assert_eq!(
            file_decision(&[VoteChoice::Approve, VoteChoice::Approve]),
            FileDecision::Approved
        );
    }

    #[test]
    fn test_decision_two_change_requests() {
        assert_eq!(
            file_decision(&[VoteChoice::RequestChanges, VoteChoice::RequestChanges]),
            FileDecision::ChangesRequested
        );
    }

    #[test]
    fn test_decision_conflicted() {
        assert_eq!(
            file_decision(&[VoteChoice::Approve, VoteChoice::RequestChanges]),
            FileDecision::Conflicted
        );
        // A third approval does not rescue a conflicted file.
        assert_eq!(
            file_decision(&[
                VoteChoice::Approve,
                VoteChoice::Approve,
                VoteChoice::RequestChanges
            ]),
            FileDecision::Conflicted
        );
    }

    #[test]
    fn test_decision_incomplete() {
        assert_eq!(file_decision(&[]), FileDecision::Incomplete);
        assert_eq!(file_decision(&[VoteChoice::Approve]), FileDecision::Incomplete);
        assert_eq!(
            file_decision(&[VoteChoice::Undecided, VoteChoice::Undecided]),
            FileDecision::Incomplete
        );
        // One decided + one undecided is still incomplete.
        assert_eq!(
            file_decision(&[VoteChoice::Approve, VoteChoice::Undecided]),
            FileDecision::Incomplete
        );
    }

    fn file(relpath: &str, group: &str, vote: Option<VoteChoice>) -> ReviewerFileView {
        ReviewerFileView {
            relpath: relpath.to_string(),
            group: group.to_string(),
            vote,
        }
    }

    #[test]
    fn test_submit_review_requires_all_votes() {
        let files = vec![
            file("a.csv", "g1", Some(VoteChoice::Approve)),
            file("b.csv", "g1", None),
        ];
        let err = check_submit_review(&files, &BTreeSet::new(), false).unwrap_err();
        assert!(err.to_string().contains("b.csv"));
    }

    #[test]
    fn test_submit_review_undecided_blocks() {
        let files = vec![file("a.csv", "g1", Some(VoteChoice::Undecided))];
        assert!(check_submit_review(&files, &BTreeSet::new(), false).is_err());
    }

    #[test]
    fn test_submit_review_changes_need_comment() {
        let files = vec![file("a.csv", "g1", Some(VoteChoice::RequestChanges))];
        let err = check_submit_review(&files, &BTreeSet::new(), false).unwrap_err();
        assert!(err.to_string().contains("g1"));

        let commented: BTreeSet<String> = ["g1".to_string()].into();
        assert!(check_submit_review(&files, &commented, false).is_ok());
    }

    #[test]
    fn test_submit_review_idempotence_guard() {
        let files = vec![file("a.csv", "g1", Some(VoteChoice::Approve))];
        assert!(check_submit_review(&files, &BTreeSet::new(), true).is_err());
    }

    #[test]
    fn test_return_gate() {
        let groups = vec![
            GroupReturnView {
                name: "g1".into(),
                decisions: vec![FileDecision::ChangesRequested],
                has_public_comment_this_turn: false,
            },
            GroupReturnView {
                name: "g2".into(),
                decisions: vec![FileDecision::Approved],
                has_public_comment_this_turn: false,
            },
        ];
        let err = check_return(&groups).unwrap_err();
        assert!(err.to_string().contains("g1"));
        assert!(!err.to_string().contains("g2"));
    }

    #[test]
    fn test_return_gate_conflicted_needs_comment() {
        let groups = vec![GroupReturnView {
            name: "g1".into(),
            decisions: vec![FileDecision::Conflicted],
            has_public_comment_this_turn: true,
        }];
        assert!(check_return(&groups).is_ok());
    }

    #[test]
    fn test_release_gate() {
        assert!(check_release(&[]).is_err());
        assert!(check_release(&[("a.csv".into(), FileDecision::Approved)]).is_ok());
        let err = check_release(&[
            ("a.csv".into(), FileDecision::Approved),
            ("b.csv".into(), FileDecision::Conflicted),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("b.csv"));
    }

    #[test]
    fn test_submit_gate() {
        assert!(check_submit(0, &[]).is_err());
        assert!(check_submit(1, &[]).is_ok());
        let err = check_submit(1, &["g1".to_string()]).unwrap_err();
        assert!(err.to_string().contains("g1"));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_vote() -> impl Strategy<Value = VoteChoice> {
            prop_oneof![
                Just(VoteChoice::Approve),
                Just(VoteChoice::RequestChanges),
                Just(VoteChoice::Undecided),
            ]
        }

        proptest! {
            /// A decision is APPROVED only when no changes were requested,
            /// and CHANGES_REQUESTED only when nothing was approved.
            #[test]
            fn approved_and_changes_are_exclusive(votes in proptest::collection::vec(arb_vote(), 0..8)) {
                let approvals = votes.iter().filter(|v| **v == VoteChoice::Approve).count();
                let changes = votes.iter().filter(|v| **v == VoteChoice::RequestChanges).count();
                match file_decision(&votes) {
                    FileDecision::Approved => {
                        prop_assert!(approvals >= 2);
                        prop_assert_eq!(changes, 0);
                    }
                    FileDecision::ChangesRequested => {
                        prop_assert!(changes >= 2);
                        prop_assert_eq!(approvals, 0);
                    }
                    FileDecision::Conflicted => {
                        prop_assert!(approvals >= 1 && changes >= 1);
                    }
                    FileDecision::Incomplete => {
                        prop_assert!(approvals + changes < 2 || (approvals == 0 && changes < 2) || (changes == 0 && approvals < 2));
                    }
                }
            }

            /// Undecided votes never change the outcome.
            #[test]
            fn undecided_votes_are_inert(votes in proptest::collection::vec(arb_vote(), 0..8)) {
                let decided: Vec<VoteChoice> =
                    votes.iter().copied().filter(|v| v.is_decided()).collect();
                prop_assert_eq!(file_decision(&votes), file_decision(&decided));
            }
        }
    }
}
