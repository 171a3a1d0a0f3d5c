//! Persistent request store.
//!
//! The store is the only component that touches the database. Every mutating
//! operation appends its audit entry inside the same transaction, so the
//! audit log can never disagree with committed state.

mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use airlock_core::review::{file_decision, FileDecision};
use airlock_core::{
    AirlockError, CommentId, ContentHash, FileType, RelPath, RequestId, RequestStatus, Visibility,
    VoteChoice,
};

/// Error type for store operations.
///
/// Domain failures (not found, conflicts, invariant violations) are
/// distinguished from storage faults so callers can surface the former to
/// users and treat the latter as internal errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// A user-visible domain error (NotFound, Conflict, Invariant, ...).
    Domain(AirlockError),
    /// Storage backend is unavailable or failed.
    Storage(String),
    /// Data is corrupted or invalid.
    Corruption(String),
}

impl StoreError {
    pub fn storage(operation: &str, detail: impl fmt::Display) -> Self {
        Self::Storage(format!("{operation}: {detail}"))
    }

    pub fn corruption(what: impl fmt::Display) -> Self {
        Self::Corruption(what.to_string())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(err) => write!(f, "{err}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
            Self::Corruption(msg) => write!(f, "data corruption: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<AirlockError> for StoreError {
    fn from(err: AirlockError) -> Self {
        Self::Domain(err)
    }
}

/// Top-level request row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub workspace: String,
    pub author: String,
    pub status: RequestStatus,
    pub review_turn: u32,
    /// Release id assigned by the Jobs site once uploads begin.
    pub jobs_release_id: Option<String>,
    /// The checker who triggered release-files.
    pub released_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One file on a request. Withdrawn files keep their row as a tombstone once
/// the request has been through review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestFileRecord {
    pub relpath: RelPath,
    pub group: String,
    pub filetype: FileType,
    pub content_hash: ContentHash,
    pub size: u64,
    pub added_at: DateTime<Utc>,
    pub added_by: String,
    pub added_in_turn: u32,
    pub withdrawn_at: Option<DateTime<Utc>>,
    pub withdrawn_in_turn: Option<u32>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl RequestFileRecord {
    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn_at.is_some()
    }

    pub fn is_active_output(&self) -> bool {
        self.filetype == FileType::Output && !self.is_withdrawn()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileGroupRecord {
    pub name: String,
    pub context: String,
    pub controls: String,
    pub created_at: DateTime<Utc>,
}

impl FileGroupRecord {
    /// A group is complete when both narrative fields are filled in.
    pub fn is_complete(&self) -> bool {
        !self.context.trim().is_empty() && !self.controls.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteRecord {
    pub relpath: RelPath,
    pub reviewer: String,
    pub choice: VoteChoice,
    pub review_turn: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentRecord {
    pub id: CommentId,
    pub group: String,
    pub author: String,
    pub body: String,
    pub visibility: Visibility,
    pub review_turn: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedReview {
    pub reviewer: String,
    pub review_turn: u32,
    pub submitted_at: DateTime<Utc>,
}

/// Persistent upload job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadJobStatus {
    Pending,
    Failed,
    Done,
}

impl UploadJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadJobRecord {
    pub request: RequestId,
    pub relpath: RelPath,
    pub content_hash: ContentHash,
    pub status: UploadJobStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub deadline_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Fully-assembled request: the record plus all child rows.
///
/// Controllers evaluate gates against this snapshot; the store rebuilds it
/// after each mutation.
#[derive(Debug, Clone, Serialize)]
pub struct RequestDetail {
    pub record: RequestRecord,
    pub groups: Vec<FileGroupRecord>,
    pub files: Vec<RequestFileRecord>,
    pub votes: Vec<VoteRecord>,
    pub comments: Vec<CommentRecord>,
    pub submitted_reviews: Vec<SubmittedReview>,
}

impl RequestDetail {
    pub fn file(&self, relpath: &RelPath) -> Option<&RequestFileRecord> {
        self.files.iter().find(|f| &f.relpath == relpath)
    }

    pub fn group(&self, name: &str) -> Option<&FileGroupRecord> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Non-withdrawn output files.
    pub fn output_files(&self) -> Vec<&RequestFileRecord> {
        self.files.iter().filter(|f| f.is_active_output()).collect()
    }

    /// Reviewers who submitted a review in the given turn.
    pub fn submitted_reviewers(&self, turn: u32) -> BTreeSet<String> {
        self.submitted_reviews
            .iter()
            .filter(|r| r.review_turn == turn)
            .map(|r| r.reviewer.clone())
            .collect()
    }

    pub fn has_submitted_review(&self, reviewer: &str, turn: u32) -> bool {
        self.submitted_reviews
            .iter()
            .any(|r| r.reviewer == reviewer && r.review_turn == turn)
    }

    pub fn vote_by(&self, relpath: &RelPath, reviewer: &str) -> Option<&VoteRecord> {
        self.votes
            .iter()
            .find(|v| &v.relpath == relpath && v.reviewer == reviewer)
    }

    /// The turn whose submitted reviews feed decisions.
    ///
    /// While reviewers hold the request (and after it completes review into
    /// APPROVED/RELEASED/REJECTED, which does not flip the turn) that is the
    /// current turn. Once it returns to the author - or is withdrawn from an
    /// author-owned status - the relevant reviews are the previous turn's.
    pub fn decision_turn(&self) -> u32 {
        match self.record.status {
            RequestStatus::Pending | RequestStatus::Returned | RequestStatus::Withdrawn => {
                self.record.review_turn.saturating_sub(1)
            }
            _ => self.record.review_turn,
        }
    }

    /// The aggregated decision for one file, counting only votes from
    /// reviewers with a submitted review in `turn`.
    pub fn decision_for(&self, relpath: &RelPath, turn: u32) -> FileDecision {
        let reviewers = self.submitted_reviewers(turn);
        let votes: Vec<VoteChoice> = self
            .votes
            .iter()
            .filter(|v| &v.relpath == relpath && reviewers.contains(&v.reviewer))
            .map(|v| v.choice)
            .collect();
        file_decision(&votes)
    }

    /// Decisions for all active output files at the decision turn.
    pub fn output_decisions(&self) -> Vec<(RelPath, FileDecision)> {
        let turn = self.decision_turn();
        self.output_files()
            .iter()
            .map(|f| (f.relpath.clone(), self.decision_for(&f.relpath, turn)))
            .collect()
    }

    pub fn comment(&self, id: &CommentId) -> Option<&CommentRecord> {
        self.comments.iter().find(|c| &c.id == id)
    }

    /// Groups containing output files whose context/controls are incomplete.
    pub fn incomplete_groups_with_outputs(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .iter()
            .filter(|g| !g.is_complete())
            .filter(|g| {
                self.files
                    .iter()
                    .any(|f| f.group == g.name && f.is_active_output())
            })
            .map(|g| g.name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Filters for audit log queries.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub workspace: Option<String>,
    pub request: Option<RequestId>,
    pub group: Option<String>,
    pub limit: Option<usize>,
}
