//! Upload scheduler: drives approved requests' files to the Jobs site.
//!
//! Jobs are persistent rows keyed by (request, relpath); the scheduler polls
//! for due jobs and works them with bounded concurrency. Transient failures
//! back off exponentially with jitter up to `max_attempts`; permanent
//! failures (and exhausted or expired jobs) are marked FAILED and leave the
//! request in APPROVED until a re-release. Because the queue is the database,
//! a restart resumes exactly where it left off - the next poll finds
//! whatever was pending.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{error, info, warn};

use airlock_core::{
    AuditEvent, AuditKind, EventKind, LifecycleEvent, RequestStatus,
};

use crate::jobs_api::{ApiFailure, JobsApiClient, ReleaseFileEntry};
use crate::notify::EventSink;
use crate::store::{RequestDetail, SqliteStore, StoreError, UploadJobRecord};
use crate::workspace::SnapshotStore;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const CLAIM_BATCH: usize = 32;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Actor recorded on system-driven transitions and audit entries.
const SYSTEM_ACTOR: &str = "system";

#[derive(Clone)]
pub struct UploadScheduler {
    store: Arc<SqliteStore>,
    snapshots: SnapshotStore,
    client: JobsApiClient,
    sink: Arc<dyn EventSink>,
    permits: Arc<Semaphore>,
    max_attempts: u32,
}

impl UploadScheduler {
    pub fn new(
        store: Arc<SqliteStore>,
        snapshots: SnapshotStore,
        client: JobsApiClient,
        sink: Arc<dyn EventSink>,
        max_in_flight: usize,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            snapshots,
            client,
            sink,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            max_attempts,
        }
    }

    /// Poll forever. Run as a background task.
    pub async fn run(&self) {
        let mut ticker = interval(POLL_INTERVAL);
        info!("upload scheduler started");
        loop {
            ticker.tick().await;
            if let Err(e) = self.drive_once().await {
                error!("upload scheduler poll failed: {e}");
            }
        }
    }

    /// Claim every due job and work through them with bounded concurrency.
    /// Returns once the claimed batch is finished, so each job has at most
    /// one upload in flight.
    pub async fn drive_once(&self) -> Result<(), StoreError> {
        let due = self.store.due_upload_jobs(Utc::now(), CLAIM_BATCH).await?;
        if due.is_empty() {
            return Ok(());
        }
        info!(count = due.len(), "processing due upload jobs");

        let mut tasks = JoinSet::new();
        for job in due {
            let scheduler = self.clone();
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .expect("upload semaphore closed");
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = scheduler.process_job(job).await {
                    error!("upload job processing failed: {e}");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn process_job(&self, job: UploadJobRecord) -> Result<(), StoreError> {
        let detail = self.store.get_request(job.request.clone()).await?;
        if detail.record.status != RequestStatus::Approved {
            // A stale job for a request that is no longer uploading.
            warn!(request = %job.request, status = %detail.record.status,
                  "dropping upload job for non-approved request");
            return self
                .store
                .record_upload_failed(
                    job.request.clone(),
                    job.relpath.clone(),
                    format!("request is {}", detail.record.status),
                )
                .await;
        }

        if Utc::now() > job.deadline_at {
            self.fail_job(&detail, &job, "job deadline exceeded".to_string())
                .await?;
            return Ok(());
        }

        let attempts = self
            .store
            .record_upload_attempt(job.request.clone(), job.relpath.clone())
            .await?;
        if attempts > self.max_attempts {
            self.fail_job(&detail, &job, format!("exceeded {} attempts", self.max_attempts))
                .await?;
            return Ok(());
        }

        let released_by = detail
            .record
            .released_by
            .clone()
            .unwrap_or_else(|| SYSTEM_ACTOR.to_string());

        let release_id = match self.ensure_release(&detail, &released_by).await {
            Ok(id) => id,
            Err(failure) => {
                self.handle_failure(&detail, &job, attempts, failure).await?;
                return Ok(());
            }
        };

        // Bytes come from the snapshot taken at add/update time; the
        // workspace is never re-read here.
        let bytes = {
            let snapshots = self.snapshots.clone();
            let workspace = detail.record.workspace.clone();
            let request = job.request.clone();
            let hash = job.content_hash.clone();
            tokio::task::spawn_blocking(move || snapshots.read(&workspace, &request, &hash))
                .await
                .map_err(|e| StoreError::storage("read snapshot", e))??
        };

        match self
            .client
            .upload_file(&release_id, &job.relpath, bytes, &released_by)
            .await
        {
            Ok(()) => {
                info!(request = %job.request, path = %job.relpath, attempts,
                      "file uploaded");
                let audit = AuditEvent::new(
                    AuditKind::FileUpload,
                    released_by,
                    detail.record.workspace.clone(),
                    job.request.clone(),
                    detail.record.review_turn,
                )
                .with_path(job.relpath.clone());
                self.store
                    .record_upload_success(job.request.clone(), job.relpath.clone(), audit)
                    .await?;
                self.maybe_finalize(&job).await
            }
            Err(failure) => self.handle_failure(&detail, &job, attempts, failure).await,
        }
    }

    async fn ensure_release(
        &self,
        detail: &RequestDetail,
        released_by: &str,
    ) -> Result<String, ApiFailure> {
        if let Some(id) = &detail.record.jobs_release_id {
            return Ok(id.clone());
        }

        let files: Vec<ReleaseFileEntry> = detail
            .output_files()
            .iter()
            .map(|f| {
                ReleaseFileEntry::new(&f.relpath, f.size, &f.content_hash, released_by, f.added_at)
            })
            .collect();
        let release_id = self
            .client
            .create_release(&detail.record.workspace, &files, released_by)
            .await?;

        if let Err(e) = self
            .store
            .set_jobs_release_id(detail.record.id.clone(), release_id.clone())
            .await
        {
            // Next attempt will re-create; the Jobs site treats that as
            // already-exists.
            warn!("failed to persist release id: {e}");
        }
        Ok(release_id)
    }

    async fn handle_failure(
        &self,
        detail: &RequestDetail,
        job: &UploadJobRecord,
        attempts: u32,
        failure: ApiFailure,
    ) -> Result<(), StoreError> {
        if failure.is_permanent() {
            self.fail_job(detail, job, failure.message().to_string())
                .await
        } else if attempts >= self.max_attempts {
            self.fail_job(
                detail,
                job,
                format!(
                    "exhausted {} attempts; last error: {}",
                    self.max_attempts,
                    failure.message()
                ),
            )
            .await
        } else {
            let delay = backoff_delay(attempts);
            warn!(request = %job.request, path = %job.relpath, attempts,
                  delay_ms = delay.as_millis() as u64,
                  "transient upload failure, retrying: {}", failure.message());
            self.store
                .record_upload_retry(
                    job.request.clone(),
                    job.relpath.clone(),
                    Utc::now() + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(1)),
                    failure.message().to_string(),
                )
                .await
        }
    }

    async fn fail_job(
        &self,
        detail: &RequestDetail,
        job: &UploadJobRecord,
        error: String,
    ) -> Result<(), StoreError> {
        error!(request = %job.request, path = %job.relpath, "upload failed: {error}");
        self.store
            .record_upload_failed(job.request.clone(), job.relpath.clone(), error)
            .await?;
        self.sink.deliver(&LifecycleEvent::new(
            EventKind::UploadFailed,
            job.request.clone(),
            detail.record.workspace.clone(),
            detail.record.author.clone(),
            SYSTEM_ACTOR,
            detail.record.review_turn,
        ));
        Ok(())
    }

    /// When every output file has been uploaded, move the request to
    /// RELEASED. The expected-status guard makes the transition (and the
    /// released event) fire exactly once even with concurrent workers.
    async fn maybe_finalize(&self, job: &UploadJobRecord) -> Result<(), StoreError> {
        let detail = self.store.get_request(job.request.clone()).await?;
        if detail.record.status != RequestStatus::Approved {
            return Ok(());
        }
        let all_uploaded = detail
            .output_files()
            .iter()
            .all(|f| f.uploaded_at.is_some());
        if !all_uploaded {
            return Ok(());
        }

        let audit = AuditEvent::new(
            AuditKind::RequestRelease,
            SYSTEM_ACTOR,
            detail.record.workspace.clone(),
            detail.record.id.clone(),
            detail.record.review_turn,
        );
        match self
            .store
            .transition(
                detail.record.id.clone(),
                RequestStatus::Approved,
                RequestStatus::Released,
                false,
                false,
                None,
                audit,
            )
            .await
        {
            Ok(released) => {
                info!(request = %released.record.id, "all files uploaded, request released");
                self.sink.deliver(&LifecycleEvent::new(
                    EventKind::Released,
                    released.record.id.clone(),
                    released.record.workspace.clone(),
                    released.record.author.clone(),
                    SYSTEM_ACTOR,
                    released.record.review_turn,
                ));
                Ok(())
            }
            // another worker finalized first
            Err(StoreError::Domain(airlock_core::AirlockError::Conflict(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Exponential backoff with jitter: base * 2^(attempt-1), capped, plus up to
/// 50% random jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.0..0.5);
    base.mul_f64(1.0 + jitter)
}
