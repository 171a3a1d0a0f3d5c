//! Domain model and lifecycle rules for the airlock release-request service.
//!
//! Everything in this crate is pure: no I/O, no clocks beyond timestamping
//! freshly-built records, no storage. The server crate supplies persistence
//! and transport and calls into these rules.

pub mod audit;
pub mod error;
pub mod events;
pub mod principal;
pub mod review;
pub mod status;
pub mod types;
pub mod visibility;

pub use audit::{AuditEvent, AuditKind};
pub use error::AirlockError;
pub use events::{EventKind, LifecycleEvent};
pub use principal::Principal;
pub use review::{FileDecision, VoteChoice};
pub use status::{RequestStatus, StatusOwner, TransitionRole, TurnPhase};
pub use types::{
    CommentId, ContentHash, FileMetadata, FileType, RelPath, RequestId, WorkspaceFileStatus,
};
pub use visibility::Visibility;
