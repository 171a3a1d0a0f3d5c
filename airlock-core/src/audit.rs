//! Audit log event kinds and records.
//!
//! Every mutating controller operation appends exactly one entry. The string
//! values of `AuditKind` are persisted; changing one requires a migration.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RelPath, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    WorkspaceFileView,
    RequestCreate,
    RequestSubmit,
    RequestWithdraw,
    RequestReview,
    RequestApprove,
    RequestReject,
    RequestReturn,
    RequestEarlyReturn,
    RequestRelease,
    RequestRerelease,
    GroupEdit,
    CommentCreate,
    CommentDelete,
    CommentVisibilityPublic,
    FileAdd,
    FileUpdate,
    FileWithdraw,
    FileApprove,
    FileRequestChanges,
    FileResetReview,
    FileUndecided,
    FileChangeProperties,
    FileUpload,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkspaceFileView => "WORKSPACE_FILE_VIEW",
            Self::RequestCreate => "REQUEST_CREATE",
            Self::RequestSubmit => "REQUEST_SUBMIT",
            Self::RequestWithdraw => "REQUEST_WITHDRAW",
            Self::RequestReview => "REQUEST_REVIEW",
            Self::RequestApprove => "REQUEST_APPROVE",
            Self::RequestReject => "REQUEST_REJECT",
            Self::RequestReturn => "REQUEST_RETURN",
            Self::RequestEarlyReturn => "REQUEST_EARLY_RETURN",
            Self::RequestRelease => "REQUEST_RELEASE",
            Self::RequestRerelease => "REQUEST_RERELEASE",
            Self::GroupEdit => "GROUP_EDIT",
            Self::CommentCreate => "COMMENT_CREATE",
            Self::CommentDelete => "COMMENT_DELETE",
            Self::CommentVisibilityPublic => "COMMENT_VISIBILITY_PUBLIC",
            Self::FileAdd => "FILE_ADD",
            Self::FileUpdate => "FILE_UPDATE",
            Self::FileWithdraw => "FILE_WITHDRAW",
            Self::FileApprove => "FILE_APPROVE",
            Self::FileRequestChanges => "FILE_REQUEST_CHANGES",
            Self::FileResetReview => "FILE_RESET_REVIEW",
            Self::FileUndecided => "FILE_UNDECIDED",
            Self::FileChangeProperties => "FILE_CHANGE_PROPERTIES",
            Self::FileUpload => "FILE_UPLOAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WORKSPACE_FILE_VIEW" => Some(Self::WorkspaceFileView),
            "REQUEST_CREATE" => Some(Self::RequestCreate),
            "REQUEST_SUBMIT" => Some(Self::RequestSubmit),
            "REQUEST_WITHDRAW" => Some(Self::RequestWithdraw),
            "REQUEST_REVIEW" => Some(Self::RequestReview),
            "REQUEST_APPROVE" => Some(Self::RequestApprove),
            "REQUEST_REJECT" => Some(Self::RequestReject),
            "REQUEST_RETURN" => Some(Self::RequestReturn),
            "REQUEST_EARLY_RETURN" => Some(Self::RequestEarlyReturn),
            "REQUEST_RELEASE" => Some(Self::RequestRelease),
            "REQUEST_RERELEASE" => Some(Self::RequestRerelease),
            "GROUP_EDIT" => Some(Self::GroupEdit),
            "COMMENT_CREATE" => Some(Self::CommentCreate),
            "COMMENT_DELETE" => Some(Self::CommentDelete),
            "COMMENT_VISIBILITY_PUBLIC" => Some(Self::CommentVisibilityPublic),
            "FILE_ADD" => Some(Self::FileAdd),
            "FILE_UPDATE" => Some(Self::FileUpdate),
            "FILE_WITHDRAW" => Some(Self::FileWithdraw),
            "FILE_APPROVE" => Some(Self::FileApprove),
            "FILE_REQUEST_CHANGES" => Some(Self::FileRequestChanges),
            "FILE_RESET_REVIEW" => Some(Self::FileResetReview),
            "FILE_UNDECIDED" => Some(Self::FileUndecided),
            "FILE_CHANGE_PROPERTIES" => Some(Self::FileChangeProperties),
            "FILE_UPLOAD" => Some(Self::FileUpload),
            _ => None,
        }
    }

    /// Short human description for activity panels.
    pub fn description(&self) -> &'static str {
        match self {
            Self::WorkspaceFileView => "Viewed file",
            Self::RequestCreate => "Created request",
            Self::RequestSubmit => "Submitted request",
            Self::RequestWithdraw => "Withdrew request",
            Self::RequestReview => "Submitted review",
            Self::RequestApprove => "Approved request",
            Self::RequestReject => "Rejected request",
            Self::RequestReturn => "Returned request",
            Self::RequestEarlyReturn => "Returned request early",
            Self::RequestRelease => "Released files",
            Self::RequestRerelease => "Re-queued failed uploads",
            Self::GroupEdit => "Edited the context/controls",
            Self::CommentCreate => "Commented",
            Self::CommentDelete => "Comment deleted",
            Self::CommentVisibilityPublic => "Private comment made public",
            Self::FileAdd => "Added file",
            Self::FileUpdate => "Updated file",
            Self::FileWithdraw => "Withdrew file from group",
            Self::FileApprove => "Approved file",
            Self::FileRequestChanges => "Changes requested to file",
            Self::FileResetReview => "Reset review of file",
            Self::FileUndecided => "Stale change request moved to undecided",
            Self::FileChangeProperties => "Changed file group or type",
            Self::FileUpload => "File uploaded",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub actor: String,
    pub workspace: String,
    /// Absent for workspace-only events (file views).
    pub request: Option<RequestId>,
    pub path: Option<RelPath>,
    /// Free-form key/value extras; request events always carry `review_turn`.
    pub extra: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        kind: AuditKind,
        actor: impl Into<String>,
        workspace: impl Into<String>,
        request: RequestId,
        review_turn: u32,
    ) -> Self {
        let mut extra = BTreeMap::new();
        extra.insert("review_turn".to_string(), review_turn.to_string());
        Self {
            kind,
            actor: actor.into(),
            workspace: workspace.into(),
            request: Some(request),
            path: None,
            extra,
            created_at: Utc::now(),
        }
    }

    /// An event scoped to a workspace rather than a request.
    pub fn for_workspace(
        kind: AuditKind,
        actor: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            actor: actor.into(),
            workspace: workspace.into(),
            request: None,
            path: None,
            extra: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_path(mut self, path: RelPath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn review_turn(&self) -> u32 {
        self.extra
            .get("review_turn")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:<26} user={} workspace={}",
            self.created_at.format("%Y-%m-%dT%H:%M:%S"),
            self.kind.as_str(),
            self.actor,
            self.workspace,
        )?;
        if let Some(request) = &self.request {
            write!(f, " request={request}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " path={path}")?;
        }
        for (k, v) in &self.extra {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_round_trip() {
        for kind in [
            AuditKind::WorkspaceFileView,
            AuditKind::RequestCreate,
            AuditKind::RequestEarlyReturn,
            AuditKind::CommentVisibilityPublic,
            AuditKind::FileUndecided,
            AuditKind::FileUpload,
        ] {
            assert_eq!(AuditKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AuditKind::parse("NOPE"), None);
    }

    #[test]
    fn test_workspace_scoped_event_has_no_request() {
        let event = AuditEvent::for_workspace(AuditKind::WorkspaceFileView, "alice", "ws1")
            .with_path(RelPath::new("output/a.csv").unwrap());
        assert!(event.request.is_none());
        assert_eq!(event.review_turn(), 0);
        let line = event.to_string();
        assert!(line.contains("WORKSPACE_FILE_VIEW"));
        assert!(!line.contains("request="));
    }

    #[test]
    fn test_event_records_turn_and_extras() {
        let event = AuditEvent::new(
            AuditKind::FileAdd,
            "alice",
            "ws1",
            RequestId::from("r1"),
            2,
        )
        .with_path(RelPath::new("output/a.csv").unwrap())
        .with_extra("group", "g1");

        assert_eq!(event.review_turn(), 2);
        let line = event.to_string();
        assert!(line.contains("FILE_ADD"));
        assert!(line.contains("user=alice"));
        assert!(line.contains("path=output/a.csv"));
        assert!(line.contains("group=g1"));
    }
}
