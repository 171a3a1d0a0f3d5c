//! Error kinds surfaced by controller operations.
//!
//! Every variant carries a stable machine-readable code (used in API error
//! bodies and CLI exit-code mapping) and a human message.

use std::fmt;

use crate::status::RequestStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AirlockError {
    /// Actor lacks the capability for this operation.
    PermissionDenied(String),
    /// The state machine rejects the requested transition.
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
    /// A gate failed: missing comment, incomplete group, unapproved file.
    Precondition(String),
    /// Concurrent modification; the caller must refresh and retry.
    Conflict(String),
    /// Entity missing.
    NotFound(String),
    /// Would violate a structural invariant (U1/F1/V1).
    Invariant(String),
    /// Outbound Jobs API failure. Carries the HTTP status when there was one.
    Upstream {
        status: Option<u16>,
        message: String,
    },
    /// Operation deadline expired.
    Timeout(String),
}

impl AirlockError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "permission_denied",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Precondition(_) => "precondition",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Invariant(_) => "invariant",
            Self::Upstream { .. } => "upstream",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl fmt::Display for AirlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid transition from {from} to {to}")
            }
            Self::Precondition(msg) => write!(f, "precondition failed: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Invariant(msg) => write!(f, "invariant violation: {msg}"),
            Self::Upstream { status, message } => match status {
                Some(code) => write!(f, "upstream error (HTTP {code}): {message}"),
                None => write!(f, "upstream error: {message}"),
            },
            Self::Timeout(msg) => write!(f, "timed out: {msg}"),
        }
    }
}

impl std::error::Error for AirlockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            AirlockError::PermissionDenied("x".into()).code(),
            "permission_denied"
        );
        assert_eq!(
            AirlockError::InvalidTransition {
                from: RequestStatus::Pending,
                to: RequestStatus::Released,
            }
            .code(),
            "invalid_transition"
        );
        assert_eq!(AirlockError::Timeout("x".into()).code(), "timeout");
    }

    #[test]
    fn test_display_includes_http_status() {
        let err = AirlockError::Upstream {
            status: Some(400),
            message: "bad request".into(),
        };
        assert_eq!(err.to_string(), "upstream error (HTTP 400): bad request");

        let err = AirlockError::Upstream {
            status: None,
            message: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "upstream error: connection refused");
    }
}
