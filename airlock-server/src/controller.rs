//! Request controller: the public operations of the lifecycle engine.
//!
//! Every operation follows the same shape: resolve capability, check the
//! status gate, apply the change in one store transaction (which also writes
//! the audit entry), then emit a lifecycle event. Events are emitted after
//! commit; a sink failure never fails the operation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use airlock_core::principal::{
    check_can_author, check_can_review, check_can_view_workspace, check_is_author,
};
use airlock_core::review::{self, GroupReturnView, ReviewerFileView};
use airlock_core::status::{check_transition, increments_turn};
use airlock_core::visibility::{comment_visible, vote_visible};
use airlock_core::{
    AirlockError, AuditEvent, AuditKind, CommentId, ContentHash, EventKind, FileDecision,
    FileType, LifecycleEvent, Principal, RelPath, RequestId, RequestStatus, TurnPhase, Visibility,
    VoteChoice,
};

use crate::notify::EventSink;
use crate::store::{
    AuditQuery, CommentRecord, RequestDetail, SqliteStore, StoreError, UploadJobRecord,
};
use crate::workspace::{status_relative_to, SnapshotStore, WorkspaceEntry, WorkspaceStore};

/// A file to add to a request.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AddFileSpec {
    pub relpath: String,
    pub filetype: FileType,
    pub group: String,
}

pub struct RequestController {
    store: Arc<SqliteStore>,
    workspaces: WorkspaceStore,
    snapshots: SnapshotStore,
    sink: Arc<dyn EventSink>,
    upload_job_deadline: Duration,
}

impl RequestController {
    pub fn new(
        store: Arc<SqliteStore>,
        workspaces: WorkspaceStore,
        snapshots: SnapshotStore,
        sink: Arc<dyn EventSink>,
        upload_job_deadline: Duration,
    ) -> Self {
        Self {
            store,
            workspaces,
            snapshots,
            sink,
            upload_job_deadline,
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn audit(&self, detail: &RequestDetail, kind: AuditKind, actor: &str) -> AuditEvent {
        AuditEvent::new(
            kind,
            actor,
            detail.record.workspace.clone(),
            detail.record.id.clone(),
            detail.record.review_turn,
        )
    }

    fn emit(&self, kind: EventKind, detail: &RequestDetail, actor: &str) {
        let event = LifecycleEvent::new(
            kind,
            detail.record.id.clone(),
            detail.record.workspace.clone(),
            detail.record.author.clone(),
            actor,
            detail.record.review_turn,
        );
        self.sink.deliver(&event);
    }

    async fn load(&self, id: &RequestId) -> Result<RequestDetail, StoreError> {
        self.store.get_request(id.clone()).await
    }

    /// The request is author-owned and the caller is the author.
    fn check_editable(principal: &Principal, detail: &RequestDetail) -> Result<(), AirlockError> {
        check_is_author(principal, &detail.record.author)?;
        if !detail.record.status.is_editing() {
            return Err(AirlockError::Precondition(format!(
                "cannot edit request in state {}",
                detail.record.status
            )));
        }
        Ok(())
    }

    /// The request is reviewer-owned and the caller may review it.
    fn check_reviewable(principal: &Principal, detail: &RequestDetail) -> Result<(), AirlockError> {
        check_can_review(principal, &detail.record.author)?;
        if !detail.record.status.is_under_review() {
            return Err(AirlockError::Precondition(format!(
                "cannot review request in state {}",
                detail.record.status
            )));
        }
        Ok(())
    }

    /// Validate against the transition table and apply.
    #[allow(clippy::too_many_arguments)]
    async fn apply_transition(
        &self,
        detail: &RequestDetail,
        to: RequestStatus,
        actor: &str,
        kind: AuditKind,
        released_by: Option<String>,
        reset_stale_votes: bool,
    ) -> Result<RequestDetail, StoreError> {
        let from = detail.record.status;
        check_transition(from, to)?;
        let increment = increments_turn(from, to);
        let audit_turn = if increment {
            detail.record.review_turn + 1
        } else {
            detail.record.review_turn
        };
        let audit = AuditEvent::new(
            kind,
            actor,
            detail.record.workspace.clone(),
            detail.record.id.clone(),
            audit_turn,
        )
        .with_extra("from", from.as_str())
        .with_extra("to", to.as_str());

        let updated = self
            .store
            .transition(
                detail.record.id.clone(),
                from,
                to,
                increment,
                reset_stale_votes,
                released_by,
                audit,
            )
            .await?;
        info!(
            request = %updated.record.id,
            from = from.as_str(),
            to = to.as_str(),
            turn = updated.record.review_turn,
            actor,
            "request transitioned"
        );
        Ok(updated)
    }

    /// Snapshot a workspace file on the blocking pool, returning its hash
    /// and size.
    async fn snapshot(
        &self,
        workspace: &str,
        request: &RequestId,
        relpath: &RelPath,
    ) -> Result<(ContentHash, u64), StoreError> {
        let workspaces = self.workspaces.clone();
        let snapshots = self.snapshots.clone();
        let workspace = workspace.to_string();
        let request = request.clone();
        let relpath = relpath.clone();
        tokio::task::spawn_blocking(move || {
            let src = workspaces.abspath(&workspace, &relpath)?;
            snapshots.store(&workspace, &request, &src)
        })
        .await
        .map_err(|e| StoreError::storage("snapshot", e))?
    }

    // =========================================================================
    // Request lifecycle
    // =========================================================================

    pub async fn create_request(
        &self,
        principal: &Principal,
        workspace: &str,
    ) -> Result<RequestDetail, StoreError> {
        check_can_author(principal, workspace)?;
        if !self.workspaces.exists(workspace) {
            return Err(AirlockError::NotFound(format!("workspace {workspace}")).into());
        }

        let id = RequestId::generate();
        let audit = AuditEvent::new(
            AuditKind::RequestCreate,
            principal.username.clone(),
            workspace,
            id.clone(),
            1,
        );
        let detail = self
            .store
            .create_request(
                id,
                workspace.to_string(),
                principal.username.clone(),
                audit,
            )
            .await?;
        info!(request = %detail.record.id, workspace, author = %principal.username, "request created");
        Ok(detail)
    }

    pub async fn submit(
        &self,
        principal: &Principal,
        id: &RequestId,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        Self::check_editable(principal, &detail)?;

        review::check_submit(
            detail.output_files().len(),
            &detail.incomplete_groups_with_outputs(),
        )?;

        let resubmission = detail.record.status == RequestStatus::Returned;
        let updated = self
            .apply_transition(
                &detail,
                RequestStatus::Submitted,
                &principal.username,
                AuditKind::RequestSubmit,
                None,
                resubmission,
            )
            .await?;

        let kind = if resubmission {
            EventKind::Resubmitted
        } else {
            EventKind::Submitted
        };
        self.emit(kind, &updated, &principal.username);
        Ok(updated)
    }

    pub async fn withdraw_request(
        &self,
        principal: &Principal,
        id: &RequestId,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        check_is_author(principal, &detail.record.author)?;
        let updated = self
            .apply_transition(
                &detail,
                RequestStatus::Withdrawn,
                &principal.username,
                AuditKind::RequestWithdraw,
                None,
                false,
            )
            .await?;
        self.emit(EventKind::Withdrawn, &updated, &principal.username);
        Ok(updated)
    }

    /// Return the request to the author. From REVIEWED this applies the
    /// comment gate; from SUBMITTED / PARTIALLY_REVIEWED it is an early
    /// return and the gate is waived.
    pub async fn return_request(
        &self,
        principal: &Principal,
        id: &RequestId,
        confirmed: bool,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        Self::check_reviewable(principal, &detail)?;
        if !confirmed {
            return Err(AirlockError::Precondition(
                "returning a request must be confirmed".to_string(),
            )
            .into());
        }

        let kind = match detail.record.status {
            RequestStatus::Reviewed => {
                let turn = detail.record.review_turn;
                let groups: Vec<GroupReturnView> = detail
                    .groups
                    .iter()
                    .map(|g| GroupReturnView {
                        name: g.name.clone(),
                        decisions: detail
                            .files
                            .iter()
                            .filter(|f| f.group == g.name && f.is_active_output())
                            .map(|f| detail.decision_for(&f.relpath, turn))
                            .collect(),
                        has_public_comment_this_turn: detail.comments.iter().any(|c| {
                            c.group == g.name
                                && c.visibility == Visibility::Public
                                && c.review_turn == turn
                        }),
                    })
                    .collect();
                review::check_return(&groups)?;
                AuditKind::RequestReturn
            }
            _ => AuditKind::RequestEarlyReturn,
        };

        let updated = self
            .apply_transition(
                &detail,
                RequestStatus::Returned,
                &principal.username,
                kind,
                None,
                false,
            )
            .await?;
        self.emit(EventKind::Returned, &updated, &principal.username);
        Ok(updated)
    }

    pub async fn reject(
        &self,
        principal: &Principal,
        id: &RequestId,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        check_can_review(principal, &detail.record.author)?;
        let updated = self
            .apply_transition(
                &detail,
                RequestStatus::Rejected,
                &principal.username,
                AuditKind::RequestReject,
                None,
                false,
            )
            .await?;
        self.emit(EventKind::Rejected, &updated, &principal.username);
        Ok(updated)
    }

    /// REVIEWED -> APPROVED, then queue every unreleased output file for
    /// upload. The scheduler drives the rest.
    pub async fn release_files(
        &self,
        principal: &Principal,
        id: &RequestId,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        check_can_review(principal, &detail.record.author)?;

        let decisions: Vec<(String, FileDecision)> = detail
            .output_decisions()
            .into_iter()
            .map(|(path, decision)| (path.to_string(), decision))
            .collect();
        review::check_release(&decisions)?;

        let updated = self
            .apply_transition(
                &detail,
                RequestStatus::Approved,
                &principal.username,
                AuditKind::RequestApprove,
                Some(principal.username.clone()),
                false,
            )
            .await?;

        let files: Vec<(RelPath, ContentHash)> = updated
            .output_files()
            .iter()
            .filter(|f| f.uploaded_at.is_none())
            .map(|f| (f.relpath.clone(), f.content_hash.clone()))
            .collect();
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.upload_job_deadline)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        self.store
            .enqueue_upload_jobs(id.clone(), files, deadline)
            .await?;

        self.emit(EventKind::Approved, &updated, &principal.username);
        Ok(updated)
    }

    /// Re-queue FAILED upload jobs without leaving APPROVED.
    pub async fn re_release(
        &self,
        principal: &Principal,
        id: &RequestId,
    ) -> Result<Vec<UploadJobRecord>, StoreError> {
        let detail = self.load(id).await?;
        check_can_review(principal, &detail.record.author)?;
        if detail.record.status != RequestStatus::Approved {
            return Err(AirlockError::Precondition(format!(
                "can only re-release an APPROVED request, not {}",
                detail.record.status
            ))
            .into());
        }

        let deadline = Utc::now()
            + chrono::Duration::from_std(self.upload_job_deadline)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let reset = self
            .store
            .reset_failed_jobs(
                id.clone(),
                deadline,
                self.audit(&detail, AuditKind::RequestRerelease, &principal.username),
            )
            .await?;
        info!(request = %id, reset, "failed upload jobs re-queued");
        self.store.upload_jobs_for(id.clone()).await
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub async fn add_files(
        &self,
        principal: &Principal,
        id: &RequestId,
        specs: Vec<AddFileSpec>,
    ) -> Result<RequestDetail, StoreError> {
        let mut detail = self.load(id).await?;
        Self::check_editable(principal, &detail)?;

        let workspace = detail.record.workspace.clone();
        let released = self
            .store
            .released_hashes_for_workspace(workspace.clone())
            .await?;

        for spec in specs {
            let relpath = RelPath::new(spec.relpath)?;
            if !relpath.has_releasable_extension() {
                return Err(AirlockError::Precondition(format!(
                    "cannot add file of type {} to request",
                    relpath.extension().unwrap_or("(none)")
                ))
                .into());
            }
            let meta = {
                let workspaces = self.workspaces.clone();
                let workspace = workspace.clone();
                let relpath = relpath.clone();
                tokio::task::spawn_blocking(move || workspaces.file_metadata(&workspace, &relpath))
                    .await
                    .map_err(|e| StoreError::storage("file_metadata", e))??
            };
            if released.contains(meta.content_hash.as_str()) {
                return Err(AirlockError::Precondition(format!(
                    "cannot add already-released file {relpath} to request"
                ))
                .into());
            }

            let (content_hash, size) = self.snapshot(&workspace, id, &relpath).await?;

            let audit = self
                .audit(&detail, AuditKind::FileAdd, &principal.username)
                .with_path(relpath.clone())
                .with_extra("group", spec.group.clone())
                .with_extra("filetype", spec.filetype.as_str());
            detail = self
                .store
                .add_file(
                    id.clone(),
                    spec.group,
                    relpath,
                    spec.filetype,
                    content_hash,
                    size,
                    principal.username.clone(),
                    detail.record.review_turn,
                    audit,
                )
                .await?;
        }
        Ok(detail)
    }

    /// Re-snapshot a file whose workspace content has changed. All votes on
    /// the file are reset; they were cast against the old bytes.
    pub async fn update_file(
        &self,
        principal: &Principal,
        id: &RequestId,
        relpath: &RelPath,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        Self::check_editable(principal, &detail)?;

        let file = detail
            .file(relpath)
            .filter(|f| !f.is_withdrawn())
            .ok_or_else(|| AirlockError::NotFound(format!("file {relpath} not on request {id}")))?;

        let workspace = detail.record.workspace.clone();
        let meta = {
            let workspaces = self.workspaces.clone();
            let workspace = workspace.clone();
            let relpath = relpath.clone();
            tokio::task::spawn_blocking(move || workspaces.file_metadata(&workspace, &relpath))
                .await
                .map_err(|e| StoreError::storage("file_metadata", e))??
        };
        if meta.content_hash == file.content_hash {
            return Err(AirlockError::Precondition(format!(
                "file {relpath} has not changed in the workspace"
            ))
            .into());
        }

        let (content_hash, size) = self.snapshot(&workspace, id, relpath).await?;
        let audit = self
            .audit(&detail, AuditKind::FileUpdate, &principal.username)
            .with_path(relpath.clone());
        self.store
            .update_file(
                id.clone(),
                relpath.clone(),
                content_hash,
                size,
                detail.record.review_turn,
                audit,
            )
            .await
    }

    /// Withdraw a file. In PENDING the row disappears; in RETURNED it is
    /// tombstoned so the review record survives.
    pub async fn withdraw_file(
        &self,
        principal: &Principal,
        id: &RequestId,
        relpath: &RelPath,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        Self::check_editable(principal, &detail)?;

        let file = detail
            .file(relpath)
            .ok_or_else(|| AirlockError::NotFound(format!("file {relpath} not on request {id}")))?;
        if file.is_withdrawn() {
            return Err(AirlockError::Precondition(format!(
                "file {relpath} has already been withdrawn"
            ))
            .into());
        }

        let audit = self
            .audit(&detail, AuditKind::FileWithdraw, &principal.username)
            .with_path(relpath.clone())
            .with_extra("group", file.group.clone());

        match detail.record.status {
            RequestStatus::Pending => {
                self.store
                    .remove_file(id.clone(), relpath.clone(), audit)
                    .await
            }
            RequestStatus::Returned => {
                self.store
                    .withdraw_file(
                        id.clone(),
                        relpath.clone(),
                        detail.record.review_turn,
                        audit,
                    )
                    .await
            }
            // check_editable already restricts to the two author-owned states
            _ => unreachable!("editable statuses are PENDING and RETURNED"),
        }
    }

    pub async fn change_file_properties(
        &self,
        principal: &Principal,
        id: &RequestId,
        relpath: &RelPath,
        new_group: Option<String>,
        new_type: Option<FileType>,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        Self::check_editable(principal, &detail)?;

        let file = detail
            .file(relpath)
            .filter(|f| !f.is_withdrawn())
            .ok_or_else(|| AirlockError::NotFound(format!("file {relpath} not on request {id}")))?;

        let group_changes = new_group.as_deref().is_some_and(|g| g != file.group);
        let type_changes = new_type.is_some_and(|t| t != file.filetype);
        if !group_changes && !type_changes {
            return Err(AirlockError::Precondition(format!(
                "no property change requested for {relpath}"
            ))
            .into());
        }

        let mut audit = self
            .audit(
                &detail,
                AuditKind::FileChangeProperties,
                &principal.username,
            )
            .with_path(relpath.clone());
        if let Some(group) = &new_group {
            audit = audit.with_extra("group", group.clone());
        }
        if let Some(filetype) = new_type {
            audit = audit.with_extra("filetype", filetype.as_str());
        }

        self.store
            .change_file_properties(id.clone(), relpath.clone(), new_group, new_type, audit)
            .await
    }

    pub async fn edit_group(
        &self,
        principal: &Principal,
        id: &RequestId,
        group: &str,
        context: Option<String>,
        controls: Option<String>,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        Self::check_editable(principal, &detail)?;

        let audit = self
            .audit(&detail, AuditKind::GroupEdit, &principal.username)
            .with_extra("group", group);
        self.store
            .edit_group(id.clone(), group.to_string(), context, controls, audit)
            .await
    }

    // =========================================================================
    // Comments
    // =========================================================================

    pub async fn create_comment(
        &self,
        principal: &Principal,
        id: &RequestId,
        group: &str,
        text: &str,
        visibility: Visibility,
    ) -> Result<CommentRecord, StoreError> {
        let detail = self.load(id).await?;

        if text.trim().is_empty() {
            return Err(AirlockError::Precondition("comment text is empty".to_string()).into());
        }

        if principal.is_author_of(&detail.record.author) {
            // authors comment while they hold the request, and only publicly
            Self::check_editable(principal, &detail)?;
            if visibility != Visibility::Public {
                return Err(AirlockError::PermissionDenied(
                    "authors may only write public comments".to_string(),
                )
                .into());
            }
        } else {
            Self::check_reviewable(principal, &detail)?;
        }

        let comment = CommentRecord {
            id: CommentId::generate(),
            group: group.to_string(),
            author: principal.username.clone(),
            body: text.to_string(),
            visibility,
            review_turn: detail.record.review_turn,
            created_at: Utc::now(),
        };
        let audit = self
            .audit(&detail, AuditKind::CommentCreate, &principal.username)
            .with_extra("group", group)
            .with_extra("visibility", visibility.as_str());
        self.store
            .create_comment(id.clone(), comment, audit)
            .await
    }

    /// PRIVATE -> PUBLIC, only by the comment's author, only while the turn
    /// that produced it is still current.
    pub async fn promote_comment(
        &self,
        principal: &Principal,
        id: &RequestId,
        comment_id: &CommentId,
    ) -> Result<(), StoreError> {
        let detail = self.load(id).await?;
        let comment = detail
            .comment(comment_id)
            .ok_or_else(|| AirlockError::NotFound(format!("comment {comment_id}")))?;

        if comment.author != principal.username {
            return Err(AirlockError::PermissionDenied(
                "only the comment author may change its visibility".to_string(),
            )
            .into());
        }
        if comment.review_turn != detail.record.review_turn {
            return Err(AirlockError::Precondition(
                "comment visibility cannot be changed after the turn ends".to_string(),
            )
            .into());
        }
        if comment.visibility == Visibility::Public {
            return Err(
                AirlockError::Precondition("comment is already public".to_string()).into(),
            );
        }

        let audit = self
            .audit(
                &detail,
                AuditKind::CommentVisibilityPublic,
                &principal.username,
            )
            .with_extra("group", comment.group.clone());
        self.store
            .promote_comment(id.clone(), comment_id.clone(), audit)
            .await
    }

    pub async fn delete_comment(
        &self,
        principal: &Principal,
        id: &RequestId,
        comment_id: &CommentId,
    ) -> Result<(), StoreError> {
        let detail = self.load(id).await?;
        let comment = detail
            .comment(comment_id)
            .ok_or_else(|| AirlockError::NotFound(format!("comment {comment_id}")))?;

        if comment.author != principal.username {
            return Err(AirlockError::PermissionDenied(
                "only the comment author may delete it".to_string(),
            )
            .into());
        }
        if comment.review_turn != detail.record.review_turn {
            return Err(AirlockError::Precondition(
                "comments cannot be deleted after the turn ends".to_string(),
            )
            .into());
        }

        let audit = self
            .audit(&detail, AuditKind::CommentDelete, &principal.username)
            .with_extra("group", comment.group.clone());
        self.store
            .delete_comment(id.clone(), comment_id.clone(), audit)
            .await
    }

    // =========================================================================
    // Votes and reviews
    // =========================================================================

    /// Upsert this reviewer's vote on a file. UNDECIDED resets a previous
    /// position and is only allowed before the reviewer submits their review.
    pub async fn vote(
        &self,
        principal: &Principal,
        id: &RequestId,
        relpath: &RelPath,
        choice: VoteChoice,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        Self::check_reviewable(principal, &detail)?;

        let file = detail
            .file(relpath)
            .ok_or_else(|| AirlockError::NotFound(format!("file {relpath} not on request {id}")))?;
        if !file.is_active_output() {
            return Err(AirlockError::Precondition(format!(
                "{relpath} is not an output file on this request"
            ))
            .into());
        }

        let turn = detail.record.review_turn;
        if choice == VoteChoice::Undecided
            && detail.has_submitted_review(&principal.username, turn)
        {
            return Err(AirlockError::Precondition(
                "cannot reset a vote after submitting your review".to_string(),
            )
            .into());
        }

        let kind = match choice {
            VoteChoice::Approve => AuditKind::FileApprove,
            VoteChoice::RequestChanges => AuditKind::FileRequestChanges,
            VoteChoice::Undecided => AuditKind::FileResetReview,
        };
        let audit = self
            .audit(&detail, kind, &principal.username)
            .with_path(relpath.clone());
        self.store
            .upsert_vote(
                id.clone(),
                relpath.clone(),
                principal.username.clone(),
                choice,
                turn,
                audit,
            )
            .await?;
        self.load(id).await
    }

    /// Submit this reviewer's review for the current turn, and advance the
    /// request when enough reviews are in.
    pub async fn submit_review(
        &self,
        principal: &Principal,
        id: &RequestId,
    ) -> Result<RequestDetail, StoreError> {
        let detail = self.load(id).await?;
        Self::check_reviewable(principal, &detail)?;

        let turn = detail.record.review_turn;
        let files: Vec<ReviewerFileView> = detail
            .output_files()
            .iter()
            .map(|f| ReviewerFileView {
                relpath: f.relpath.to_string(),
                group: f.group.clone(),
                vote: detail
                    .vote_by(&f.relpath, &principal.username)
                    .map(|v| v.choice),
            })
            .collect();
        let commented: BTreeSet<String> = detail
            .comments
            .iter()
            .filter(|c| c.author == principal.username && c.review_turn == turn)
            .map(|c| c.group.clone())
            .collect();
        review::check_submit_review(
            &files,
            &commented,
            detail.has_submitted_review(&principal.username, turn),
        )?;

        let audit = self.audit(&detail, AuditKind::RequestReview, &principal.username);
        self.store
            .record_review_submission(id.clone(), principal.username.clone(), turn, audit)
            .await?;

        let mut detail = self.load(id).await?;
        let submitted = detail.submitted_reviewers(turn).len();
        if detail.record.status == RequestStatus::Submitted && submitted >= 1 {
            detail = self
                .apply_transition(
                    &detail,
                    RequestStatus::PartiallyReviewed,
                    &principal.username,
                    AuditKind::RequestReview,
                    None,
                    false,
                )
                .await?;
        }
        if detail.record.status == RequestStatus::PartiallyReviewed && submitted >= 2 {
            detail = self
                .apply_transition(
                    &detail,
                    RequestStatus::Reviewed,
                    &principal.username,
                    AuditKind::RequestReview,
                    None,
                    false,
                )
                .await?;
        }

        self.emit(EventKind::ReviewSubmitted, &detail, &principal.username);
        Ok(detail)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The request as a given principal is allowed to see it.
    pub async fn get_request_view(
        &self,
        principal: &Principal,
        id: &RequestId,
    ) -> Result<RequestView, StoreError> {
        let detail = self.load(id).await?;
        if !principal.output_checker {
            check_can_view_workspace(principal, &detail.record.workspace)?;
        }
        Ok(build_view(&detail, principal))
    }

    /// Workspace listing with per-path status relative to the caller's
    /// current request.
    pub async fn workspace_listing(
        &self,
        principal: &Principal,
        workspace: &str,
        path: Option<&RelPath>,
    ) -> Result<Vec<WorkspaceEntry>, StoreError> {
        check_can_view_workspace(principal, workspace)?;

        let current = match self
            .store
            .active_request_for(workspace.to_string(), principal.username.clone())
            .await?
        {
            Some(record) => Some(self.load(&record.id).await?),
            None => None,
        };
        let released = self
            .store
            .released_hashes_for_workspace(workspace.to_string())
            .await?;

        let mut entries = {
            let workspaces = self.workspaces.clone();
            let workspace = workspace.to_string();
            let path = path.cloned();
            tokio::task::spawn_blocking(move || workspaces.list(&workspace, path.as_ref()))
                .await
                .map_err(|e| StoreError::storage("workspace list", e))??
        };

        for entry in &mut entries {
            if let Some(meta) = &entry.metadata {
                let rel = RelPath::new(entry.relpath.clone()).map_err(StoreError::Domain)?;
                entry.status = status_relative_to(meta, &rel, current.as_ref(), &released);
            }
        }
        Ok(entries)
    }

    /// Raw bytes of a workspace file, for the file browser. Every read is
    /// audited.
    pub async fn workspace_file_bytes(
        &self,
        principal: &Principal,
        workspace: &str,
        relpath: &RelPath,
    ) -> Result<Vec<u8>, StoreError> {
        check_can_view_workspace(principal, workspace)?;
        let bytes = {
            let workspaces = self.workspaces.clone();
            let workspace = workspace.to_string();
            let relpath = relpath.clone();
            tokio::task::spawn_blocking(move || workspaces.read_bytes(&workspace, &relpath))
                .await
                .map_err(|e| StoreError::storage("workspace read", e))??
        };
        let audit = AuditEvent::for_workspace(
            AuditKind::WorkspaceFileView,
            principal.username.clone(),
            workspace,
        )
        .with_path(relpath.clone());
        self.store.append_audit(audit).await?;
        Ok(bytes)
    }

    /// Requests awaiting review, for the checker dashboard. Checkers never
    /// see their own requests here.
    pub async fn outstanding_for_review(
        &self,
        principal: &Principal,
    ) -> Result<Vec<crate::store::RequestRecord>, StoreError> {
        if !principal.output_checker {
            return Err(AirlockError::PermissionDenied(
                "only output checkers may list outstanding reviews".to_string(),
            )
            .into());
        }
        let records = self.store.outstanding_for_review().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.author != principal.username)
            .collect())
    }

    /// The per-request activity feed, newest first.
    pub async fn request_audit(
        &self,
        principal: &Principal,
        id: &RequestId,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let detail = self.load(id).await?;
        if !principal.output_checker {
            check_can_view_workspace(principal, &detail.record.workspace)?;
        }
        self.store
            .query_audit(AuditQuery {
                request: Some(id.clone()),
                ..Default::default()
            })
            .await
    }
}

// =============================================================================
// Visibility-filtered views
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    pub id: RequestId,
    pub workspace: String,
    pub author: String,
    pub status: RequestStatus,
    pub review_turn: u32,
    pub groups: Vec<GroupView>,
    /// Number of reviews submitted in the decision turn.
    pub submitted_review_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupView {
    pub name: String,
    pub context: String,
    pub controls: String,
    pub files: Vec<FileView>,
    pub comments: Vec<CommentView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileView {
    pub relpath: RelPath,
    pub filetype: FileType,
    pub size: u64,
    pub content_hash: ContentHash,
    pub withdrawn: bool,
    pub uploaded_at: Option<chrono::DateTime<Utc>>,
    /// Aggregated decision, when the phase makes it visible to this viewer.
    pub decision: Option<FileDecision>,
    /// The viewer's own vote.
    pub my_vote: Option<VoteChoice>,
    /// Other reviewers' votes this viewer is allowed to see.
    pub votes: Vec<VoteView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteView {
    pub reviewer: String,
    pub choice: VoteChoice,
    pub review_turn: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommentView {
    pub id: CommentId,
    pub author: String,
    pub body: String,
    pub visibility: Visibility,
    pub review_turn: u32,
    pub created_at: chrono::DateTime<Utc>,
}

/// Assemble the view of a request for one principal, applying blinding and
/// comment visibility.
fn build_view(detail: &RequestDetail, principal: &Principal) -> RequestView {
    let phase = detail.record.status.phase();
    let turn = detail.record.review_turn;
    let can_review = principal.output_checker && principal.username != detail.record.author;
    let decision_turn = detail.decision_turn();

    let decision_visible = match phase {
        TurnPhase::Independent => false,
        TurnPhase::Consolidating => can_review,
        TurnPhase::Author | TurnPhase::Complete => true,
    };

    let groups = detail
        .groups
        .iter()
        .map(|g| {
            let files = detail
                .files
                .iter()
                .filter(|f| f.group == g.name)
                .map(|f| {
                    let votes = detail
                        .votes
                        .iter()
                        .filter(|v| v.relpath == f.relpath)
                        .filter(|v| v.reviewer != principal.username)
                        .filter(|v| {
                            vote_visible(
                                &v.reviewer,
                                v.review_turn,
                                turn,
                                phase,
                                &principal.username,
                                can_review,
                            )
                        })
                        .map(|v| VoteView {
                            reviewer: v.reviewer.clone(),
                            choice: v.choice,
                            review_turn: v.review_turn,
                        })
                        .collect();
                    FileView {
                        relpath: f.relpath.clone(),
                        filetype: f.filetype,
                        size: f.size,
                        content_hash: f.content_hash.clone(),
                        withdrawn: f.is_withdrawn(),
                        uploaded_at: f.uploaded_at,
                        decision: decision_visible
                            .then(|| detail.decision_for(&f.relpath, decision_turn)),
                        my_vote: detail
                            .vote_by(&f.relpath, &principal.username)
                            .map(|v| v.choice),
                        votes,
                    }
                })
                .collect();

            let comments = detail
                .comments
                .iter()
                .filter(|c| c.group == g.name)
                .filter(|c| {
                    comment_visible(
                        &c.author,
                        c.visibility,
                        c.review_turn,
                        turn,
                        phase,
                        &principal.username,
                        can_review,
                    )
                })
                .map(|c| CommentView {
                    id: c.id.clone(),
                    author: c.author.clone(),
                    body: c.body.clone(),
                    visibility: c.visibility,
                    review_turn: c.review_turn,
                    created_at: c.created_at,
                })
                .collect();

            GroupView {
                name: g.name.clone(),
                context: g.context.clone(),
                controls: g.controls.clone(),
                files,
                comments,
            }
        })
        .collect();

    RequestView {
        id: detail.record.id.clone(),
        workspace: detail.record.workspace.clone(),
        author: detail.record.author.clone(),
        status: detail.record.status,
        review_turn: turn,
        groups,
        submitted_review_count: detail.submitted_reviewers(decision_turn).len(),
    }
}
