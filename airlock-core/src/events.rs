//! Lifecycle events delivered to the external notifier sink.
//!
//! Delivery is at-least-once and best-effort; the sink never feeds back into
//! the state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Submitted,
    ReviewSubmitted,
    Returned,
    Resubmitted,
    Rejected,
    Withdrawn,
    Approved,
    Released,
    UploadFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::ReviewSubmitted => "review_submitted",
            Self::Returned => "returned",
            Self::Resubmitted => "resubmitted",
            Self::Rejected => "rejected",
            Self::Withdrawn => "withdrawn",
            Self::Approved => "approved",
            Self::Released => "released",
            Self::UploadFailed => "upload_failed",
        }
    }
}

/// Payload handed to the event sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub request: RequestId,
    pub workspace: String,
    pub author: String,
    /// The user whose action produced the event ("system" for SYS moves).
    pub actor: String,
    pub turn: u32,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        kind: EventKind,
        request: RequestId,
        workspace: impl Into<String>,
        author: impl Into<String>,
        actor: impl Into<String>,
        turn: u32,
    ) -> Self {
        Self {
            kind,
            request,
            workspace: workspace.into(),
            author: author.into(),
            actor: actor.into(),
            turn,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_snake_case_kind() {
        let event = LifecycleEvent::new(
            EventKind::ReviewSubmitted,
            RequestId::from("r1"),
            "ws1",
            "alice",
            "carol",
            2,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "review_submitted");
        assert_eq!(json["workspace"], "ws1");
        assert_eq!(json["turn"], 2);
    }
}
