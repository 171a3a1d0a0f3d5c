//! Authenticated principals and capability checks.
//!
//! A `Principal` is resolved once per request from the identity layer and
//! passed explicitly to every operation; each check is a free function that
//! either returns `Ok(())` or `PermissionDenied`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::AirlockError;

/// An authenticated user with their resolved role set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    /// Trained output checker: may vote, return, reject, release.
    #[serde(default)]
    pub output_checker: bool,
    /// Workspaces this user may author requests in.
    #[serde(default)]
    pub workspaces: BTreeSet<String>,
    /// Workspaces this user has read-only copilot access to.
    #[serde(default)]
    pub copiloted_workspaces: BTreeSet<String>,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            output_checker: false,
            workspaces: BTreeSet::new(),
            copiloted_workspaces: BTreeSet::new(),
        }
    }

    pub fn is_author_of(&self, request_author: &str) -> bool {
        self.username == request_author
    }
}

/// Output checkers can view all workspaces; everyone else needs explicit
/// access or copilot access.
pub fn check_can_view_workspace(principal: &Principal, workspace: &str) -> Result<(), AirlockError> {
    if principal.output_checker
        || principal.workspaces.contains(workspace)
        || principal.copiloted_workspaces.contains(workspace)
    {
        Ok(())
    } else {
        Err(AirlockError::PermissionDenied(format!(
            "{} may not view workspace {}",
            principal.username, workspace
        )))
    }
}

/// Authoring requires an explicit role on the workspace; copilot access is
/// not enough.
pub fn check_can_author(principal: &Principal, workspace: &str) -> Result<(), AirlockError> {
    if principal.workspaces.contains(workspace) {
        Ok(())
    } else {
        Err(AirlockError::PermissionDenied(format!(
            "{} may not author requests for workspace {}",
            principal.username, workspace
        )))
    }
}

/// Reviewing a request requires the output-checker role and forbids
/// self-review (invariant V1).
pub fn check_can_review(principal: &Principal, request_author: &str) -> Result<(), AirlockError> {
    if !principal.output_checker {
        return Err(AirlockError::PermissionDenied(format!(
            "{} is not an output checker",
            principal.username
        )));
    }
    if principal.is_author_of(request_author) {
        return Err(AirlockError::PermissionDenied(
            "authors may not review their own request".to_string(),
        ));
    }
    Ok(())
}

/// Only the request author may perform author operations.
pub fn check_is_author(principal: &Principal, request_author: &str) -> Result<(), AirlockError> {
    if principal.is_author_of(request_author) {
        Ok(())
    } else {
        Err(AirlockError::PermissionDenied(format!(
            "only author {request_author} may modify this request"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn researcher() -> Principal {
        Principal {
            username: "alice".into(),
            output_checker: false,
            workspaces: ["ws1".to_string()].into(),
            copiloted_workspaces: ["ws2".to_string()].into(),
        }
    }

    fn checker() -> Principal {
        Principal {
            username: "carol".into(),
            output_checker: true,
            workspaces: BTreeSet::new(),
            copiloted_workspaces: BTreeSet::new(),
        }
    }

    #[test]
    fn test_workspace_view_access() {
        assert!(check_can_view_workspace(&researcher(), "ws1").is_ok());
        // copilot grants view but not author
        assert!(check_can_view_workspace(&researcher(), "ws2").is_ok());
        assert!(check_can_view_workspace(&researcher(), "ws3").is_err());
        // checkers see everything
        assert!(check_can_view_workspace(&checker(), "ws3").is_ok());
    }

    #[test]
    fn test_author_requires_explicit_role() {
        assert!(check_can_author(&researcher(), "ws1").is_ok());
        assert!(check_can_author(&researcher(), "ws2").is_err());
        assert!(check_can_author(&checker(), "ws1").is_err());
    }

    #[test]
    fn test_self_review_forbidden() {
        let mut author_checker = checker();
        author_checker.username = "alice".into();
        let err = check_can_review(&author_checker, "alice").unwrap_err();
        assert_eq!(err.code(), "permission_denied");

        assert!(check_can_review(&checker(), "alice").is_ok());
        assert!(check_can_review(&researcher(), "bob").is_err());
    }

    #[test]
    fn test_is_author() {
        assert!(check_is_author(&researcher(), "alice").is_ok());
        assert!(check_is_author(&researcher(), "bob").is_err());
    }
}
