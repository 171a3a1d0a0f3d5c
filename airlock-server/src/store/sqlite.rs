//! SQLite implementation of the request store.
//!
//! # Schema versioning
//!
//! The database has a `schema_version` table tracking the schema version.
//! When the schema changes, increment `CURRENT_SCHEMA_VERSION` and add a
//! migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! # Concurrency
//!
//! A single connection behind a mutex, driven via
//! `tokio::task::spawn_blocking`. This serializes all writes, which is what
//! gives per-request linearizability; reads ride along on the same lock.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::warn;

use airlock_core::{
    AirlockError, AuditEvent, AuditKind, CommentId, ContentHash, FileType, RelPath, RequestId,
    RequestStatus, Visibility, VoteChoice,
};

use super::{
    AuditQuery, CommentRecord, FileGroupRecord, RequestDetail, RequestFileRecord, RequestRecord,
    StoreError, SubmittedReview, UploadJobRecord, UploadJobStatus, VoteRecord,
};

/// Current schema version. Increment when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed request store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (and migrate) the database at the given path.
    ///
    /// The database is configured with `journal_mode = WAL`,
    /// `synchronous = FULL` and a busy timeout, matching the durability
    /// needs of an audit-bearing store.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::storage("create database directory", e))?;
                }
            }
        }

        let conn =
            Connection::open(path_ref).map_err(|e| StoreError::storage("open database", e))?;

        // WAL can silently fail on filesystems without shared-memory support;
        // verify it actually took effect.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!("expected 'wal', SQLite returned '{journal_mode}'"),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "database schema version {from_version} is newer than supported \
                     version {CURRENT_SCHEMA_VERSION}; upgrade the application"
                ),
            ));
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE requests (
                    id TEXT PRIMARY KEY,
                    workspace TEXT NOT NULL,
                    author TEXT NOT NULL,
                    status TEXT NOT NULL,
                    review_turn INTEGER NOT NULL,
                    jobs_release_id TEXT,
                    released_by TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE UNIQUE INDEX idx_one_active_request
                    ON requests(workspace, author)
                    WHERE status NOT IN ('RELEASED', 'REJECTED', 'WITHDRAWN');

                CREATE TABLE file_groups (
                    request_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    context TEXT NOT NULL DEFAULT '',
                    controls TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (request_id, name)
                );

                CREATE TABLE request_files (
                    request_id TEXT NOT NULL,
                    relpath TEXT NOT NULL,
                    group_name TEXT NOT NULL,
                    filetype TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    added_at TEXT NOT NULL,
                    added_by TEXT NOT NULL,
                    added_in_turn INTEGER NOT NULL,
                    withdrawn_at TEXT,
                    withdrawn_in_turn INTEGER,
                    uploaded_at TEXT,
                    PRIMARY KEY (request_id, relpath)
                );

                CREATE INDEX idx_files_hash ON request_files(content_hash);

                CREATE TABLE file_votes (
                    request_id TEXT NOT NULL,
                    relpath TEXT NOT NULL,
                    reviewer TEXT NOT NULL,
                    choice TEXT NOT NULL,
                    review_turn INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (request_id, relpath, reviewer)
                );

                CREATE TABLE submitted_reviews (
                    request_id TEXT NOT NULL,
                    reviewer TEXT NOT NULL,
                    review_turn INTEGER NOT NULL,
                    submitted_at TEXT NOT NULL,
                    PRIMARY KEY (request_id, reviewer, review_turn)
                );

                CREATE TABLE group_comments (
                    id TEXT PRIMARY KEY,
                    request_id TEXT NOT NULL,
                    group_name TEXT NOT NULL,
                    author TEXT NOT NULL,
                    body TEXT NOT NULL,
                    visibility TEXT NOT NULL,
                    review_turn INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX idx_comments_request
                    ON group_comments(request_id, group_name);

                CREATE TABLE audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    actor TEXT NOT NULL,
                    workspace TEXT NOT NULL,
                    request_id TEXT,
                    path TEXT,
                    extra TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX idx_audit_request
                    ON audit_log(request_id, created_at DESC);
                CREATE INDEX idx_audit_workspace
                    ON audit_log(workspace, created_at DESC);

                CREATE TABLE upload_jobs (
                    request_id TEXT NOT NULL,
                    relpath TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    next_attempt_at TEXT NOT NULL,
                    last_error TEXT,
                    deadline_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (request_id, relpath)
                );

                CREATE INDEX idx_jobs_due ON upload_jobs(status, next_attempt_at);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e))?;

        Ok(())
    }

    /// Run a closure against the connection on the blocking pool.
    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::storage(op, e))?
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Create a new request in PENDING at turn 1, enforcing the
    /// one-active-request-per-(workspace, author) rule.
    pub async fn create_request(
        &self,
        id: RequestId,
        workspace: String,
        author: String,
        audit: AuditEvent,
    ) -> Result<RequestDetail, StoreError> {
        self.call("create_request", move |conn| {
            let tx = begin(conn)?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM requests
                     WHERE workspace = ?1 AND author = ?2
                       AND status NOT IN ('RELEASED', 'REJECTED', 'WITHDRAWN')",
                    params![workspace, author],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("create_request", e))?;
            if let Some(existing_id) = existing {
                return Err(AirlockError::Invariant(format!(
                    "user {author} already has an active request ({existing_id}) \
                     for workspace {workspace}"
                ))
                .into());
            }

            let now = ts_now();
            tx.execute(
                "INSERT INTO requests
                     (id, workspace, author, status, review_turn, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'PENDING', 1, ?4, ?4)",
                params![id.as_str(), workspace, author, now],
            )
            .map_err(|e| StoreError::storage("create_request", e))?;

            insert_audit(&tx, &audit)?;
            let detail = load_detail(&tx, id.as_str())?;
            commit(tx)?;
            Ok(detail)
        })
        .await
    }

    pub async fn get_request(&self, id: RequestId) -> Result<RequestDetail, StoreError> {
        self.call("get_request", move |conn| {
            let tx = begin(conn)?;
            let detail = load_detail(&tx, id.as_str())?;
            commit(tx)?;
            Ok(detail)
        })
        .await
    }

    /// The author's current active request for a workspace, if any.
    pub async fn active_request_for(
        &self,
        workspace: String,
        author: String,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.call("active_request_for", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {REQUEST_COLS} FROM requests
                     WHERE workspace = ?1 AND author = ?2
                       AND status NOT IN ('RELEASED', 'REJECTED', 'WITHDRAWN')"
                ),
                params![workspace, author],
                row_to_record,
            )
            .optional()
            .map_err(|e| StoreError::storage("active_request_for", e))?
            .map(|r| r.map_err(StoreError::from_row))
            .transpose()
        })
        .await
    }

    pub async fn list_requests(
        &self,
        workspace: Option<String>,
        author: Option<String>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        self.call("list_requests", move |conn| {
            let mut sql = format!("SELECT {REQUEST_COLS} FROM requests WHERE 1=1");
            let mut args: Vec<String> = Vec::new();
            if let Some(ws) = workspace {
                sql.push_str(&format!(" AND workspace = ?{}", args.len() + 1));
                args.push(ws);
            }
            if let Some(a) = author {
                sql.push_str(&format!(" AND author = ?{}", args.len() + 1));
                args.push(a);
            }
            if let Some(s) = status {
                sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
                args.push(s.as_str().to_string());
            }
            sql.push_str(" ORDER BY created_at");

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::storage("list_requests", e))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), row_to_record)
                .map_err(|e| StoreError::storage("list_requests", e))?;

            let mut out = Vec::new();
            for row in rows {
                match row {
                    Ok(Ok(record)) => out.push(record),
                    Ok(Err(e)) => warn!("skipping corrupt request row: {e}"),
                    Err(e) => warn!("failed to read request row: {e}"),
                }
            }
            Ok(out)
        })
        .await
    }

    /// All requests needing review (reviewer-owned statuses).
    pub async fn outstanding_for_review(&self) -> Result<Vec<RequestRecord>, StoreError> {
        self.call("outstanding_for_review", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {REQUEST_COLS} FROM requests
                     WHERE status IN ('SUBMITTED', 'PARTIALLY_REVIEWED', 'REVIEWED')
                     ORDER BY updated_at"
                ))
                .map_err(|e| StoreError::storage("outstanding_for_review", e))?;
            let rows = stmt
                .query_map([], row_to_record)
                .map_err(|e| StoreError::storage("outstanding_for_review", e))?;
            let mut out = Vec::new();
            for row in rows {
                match row {
                    Ok(Ok(record)) => out.push(record),
                    Ok(Err(e)) => warn!("skipping corrupt request row: {e}"),
                    Err(e) => warn!("failed to read request row: {e}"),
                }
            }
            Ok(out)
        })
        .await
    }

    /// Apply a status transition.
    ///
    /// `expected_from` guards against concurrent modification: if the stored
    /// status has moved on, the caller gets `Conflict` and must refresh.
    /// When `reset_stale_votes` is set (resubmission), every
    /// CHANGES_REQUESTED vote is rewritten to UNDECIDED at the new turn and a
    /// FILE_UNDECIDED audit entry is recorded per rewritten vote.
    pub async fn transition(
        &self,
        id: RequestId,
        expected_from: RequestStatus,
        to: RequestStatus,
        increment_turn: bool,
        reset_stale_votes: bool,
        released_by: Option<String>,
        audit: AuditEvent,
    ) -> Result<RequestDetail, StoreError> {
        self.call("transition", move |conn| {
            let tx = begin(conn)?;
            let record = load_record(&tx, id.as_str())?;
            if record.status != expected_from {
                return Err(AirlockError::Conflict(format!(
                    "request {id} is now {}, expected {}",
                    record.status, expected_from
                ))
                .into());
            }

            let new_turn = if increment_turn {
                record.review_turn + 1
            } else {
                record.review_turn
            };

            tx.execute(
                "UPDATE requests
                 SET status = ?2, review_turn = ?3, updated_at = ?4,
                     released_by = COALESCE(?5, released_by)
                 WHERE id = ?1",
                params![id.as_str(), to.as_str(), new_turn, ts_now(), released_by],
            )
            .map_err(|e| StoreError::storage("transition", e))?;

            if reset_stale_votes {
                let stale: Vec<(String, String)> = {
                    let mut stmt = tx
                        .prepare(
                            "SELECT relpath, reviewer FROM file_votes
                             WHERE request_id = ?1 AND choice = 'REQUEST_CHANGES'",
                        )
                        .map_err(|e| StoreError::storage("transition", e))?;
                    let rows = stmt
                        .query_map(params![id.as_str()], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                        })
                        .map_err(|e| StoreError::storage("transition", e))?;
                    rows.collect::<Result<_, _>>()
                        .map_err(|e| StoreError::storage("transition", e))?
                };

                for (relpath, reviewer) in stale {
                    tx.execute(
                        "UPDATE file_votes
                         SET choice = 'UNDECIDED', review_turn = ?4, created_at = ?5
                         WHERE request_id = ?1 AND relpath = ?2 AND reviewer = ?3",
                        params![id.as_str(), relpath, reviewer, new_turn, ts_now()],
                    )
                    .map_err(|e| StoreError::storage("transition", e))?;

                    let path = RelPath::new(relpath.clone())
                        .map_err(|_| StoreError::corruption("relpath in file_votes"))?;
                    let undecided = AuditEvent::new(
                        AuditKind::FileUndecided,
                        audit.actor.clone(),
                        audit.workspace.clone(),
                        id.clone(),
                        new_turn,
                    )
                    .with_path(path)
                    .with_extra("reviewer", reviewer);
                    insert_audit(&tx, &undecided)?;
                }
            }

            insert_audit(&tx, &audit)?;
            let detail = load_detail(&tx, id.as_str())?;
            commit(tx)?;
            Ok(detail)
        })
        .await
    }

    // =========================================================================
    // Files and groups
    // =========================================================================

    /// Add a file to the request, creating its group if needed.
    ///
    /// A tombstoned (withdrawn) row for the same path is revived in place;
    /// an active row is an F1 violation.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_file(
        &self,
        id: RequestId,
        group: String,
        relpath: RelPath,
        filetype: FileType,
        content_hash: ContentHash,
        size: u64,
        added_by: String,
        turn: u32,
        audit: AuditEvent,
    ) -> Result<RequestDetail, StoreError> {
        self.call("add_file", move |conn| {
            let tx = begin(conn)?;
            let size = u64_to_i64(size, "add_file")?;
            ensure_group(&tx, id.as_str(), &group)?;

            let existing: Option<Option<String>> = tx
                .query_row(
                    "SELECT withdrawn_at FROM request_files
                     WHERE request_id = ?1 AND relpath = ?2",
                    params![id.as_str(), relpath.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("add_file", e))?;

            match existing {
                Some(None) => {
                    return Err(AirlockError::Invariant(format!(
                        "file {relpath} is already on this request"
                    ))
                    .into());
                }
                Some(Some(_)) => {
                    // Revive the tombstone with the fresh snapshot.
                    tx.execute(
                        "UPDATE request_files
                         SET group_name = ?3, filetype = ?4, content_hash = ?5,
                             size = ?6, added_at = ?7, added_by = ?8, added_in_turn = ?9,
                             withdrawn_at = NULL, withdrawn_in_turn = NULL
                         WHERE request_id = ?1 AND relpath = ?2",
                        params![
                            id.as_str(),
                            relpath.as_str(),
                            group,
                            filetype.as_str(),
                            content_hash.as_str(),
                            size,
                            ts_now(),
                            added_by,
                            turn
                        ],
                    )
                    .map_err(|e| StoreError::storage("add_file", e))?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO request_files
                             (request_id, relpath, group_name, filetype, content_hash,
                              size, added_at, added_by, added_in_turn)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            id.as_str(),
                            relpath.as_str(),
                            group,
                            filetype.as_str(),
                            content_hash.as_str(),
                            size,
                            ts_now(),
                            added_by,
                            turn
                        ],
                    )
                    .map_err(|e| StoreError::storage("add_file", e))?;
                }
            }

            insert_audit(&tx, &audit)?;
            let detail = load_detail(&tx, id.as_str())?;
            commit(tx)?;
            Ok(detail)
        })
        .await
    }

    /// Replace a file's snapshot with current workspace content. All existing
    /// votes on the file are deleted; they no longer apply.
    pub async fn update_file(
        &self,
        id: RequestId,
        relpath: RelPath,
        content_hash: ContentHash,
        size: u64,
        turn: u32,
        audit: AuditEvent,
    ) -> Result<RequestDetail, StoreError> {
        self.call("update_file", move |conn| {
            let tx = begin(conn)?;
            let size = u64_to_i64(size, "update_file")?;
            let updated = tx
                .execute(
                    "UPDATE request_files
                     SET content_hash = ?3, size = ?4, added_at = ?5, added_in_turn = ?6
                     WHERE request_id = ?1 AND relpath = ?2 AND withdrawn_at IS NULL",
                    params![
                        id.as_str(),
                        relpath.as_str(),
                        content_hash.as_str(),
                        size,
                        ts_now(),
                        turn
                    ],
                )
                .map_err(|e| StoreError::storage("update_file", e))?;
            if updated == 0 {
                return Err(AirlockError::NotFound(format!(
                    "file {relpath} not on request {id}"
                ))
                .into());
            }

            tx.execute(
                "DELETE FROM file_votes WHERE request_id = ?1 AND relpath = ?2",
                params![id.as_str(), relpath.as_str()],
            )
            .map_err(|e| StoreError::storage("update_file", e))?;

            insert_audit(&tx, &audit)?;
            let detail = load_detail(&tx, id.as_str())?;
            commit(tx)?;
            Ok(detail)
        })
        .await
    }

    /// Withdraw in PENDING: the row is removed outright.
    pub async fn remove_file(
        &self,
        id: RequestId,
        relpath: RelPath,
        audit: AuditEvent,
    ) -> Result<RequestDetail, StoreError> {
        self.call("remove_file", move |conn| {
            let tx = begin(conn)?;
            let deleted = tx
                .execute(
                    "DELETE FROM request_files
                     WHERE request_id = ?1 AND relpath = ?2",
                    params![id.as_str(), relpath.as_str()],
                )
                .map_err(|e| StoreError::storage("remove_file", e))?;
            if deleted == 0 {
                return Err(AirlockError::NotFound(format!(
                    "file {relpath} not on request {id}"
                ))
                .into());
            }
            tx.execute(
                "DELETE FROM file_votes WHERE request_id = ?1 AND relpath = ?2",
                params![id.as_str(), relpath.as_str()],
            )
            .map_err(|e| StoreError::storage("remove_file", e))?;

            insert_audit(&tx, &audit)?;
            let detail = load_detail(&tx, id.as_str())?;
            commit(tx)?;
            Ok(detail)
        })
        .await
    }

    /// Withdraw in RETURNED: the row is tombstoned and persists.
    pub async fn withdraw_file(
        &self,
        id: RequestId,
        relpath: RelPath,
        turn: u32,
        audit: AuditEvent,
    ) -> Result<RequestDetail, StoreError> {
        self.call("withdraw_file", move |conn| {
            let tx = begin(conn)?;
            let updated = tx
                .execute(
                    "UPDATE request_files
                     SET withdrawn_at = ?3, withdrawn_in_turn = ?4
                     WHERE request_id = ?1 AND relpath = ?2 AND withdrawn_at IS NULL",
                    params![id.as_str(), relpath.as_str(), ts_now(), turn],
                )
                .map_err(|e| StoreError::storage("withdraw_file", e))?;
            if updated == 0 {
                return Err(AirlockError::NotFound(format!(
                    "file {relpath} not active on request {id}"
                ))
                .into());
            }

            insert_audit(&tx, &audit)?;
            let detail = load_detail(&tx, id.as_str())?;
            commit(tx)?;
            Ok(detail)
        })
        .await
    }

    /// Move a file to another group and/or change its type.
    pub async fn change_file_properties(
        &self,
        id: RequestId,
        relpath: RelPath,
        new_group: Option<String>,
        new_type: Option<FileType>,
        audit: AuditEvent,
    ) -> Result<RequestDetail, StoreError> {
        self.call("change_file_properties", move |conn| {
            let tx = begin(conn)?;
            if let Some(group) = &new_group {
                ensure_group(&tx, id.as_str(), group)?;
            }
            let updated = tx
                .execute(
                    "UPDATE request_files
                     SET group_name = COALESCE(?3, group_name),
                         filetype = COALESCE(?4, filetype)
                     WHERE request_id = ?1 AND relpath = ?2 AND withdrawn_at IS NULL",
                    params![
                        id.as_str(),
                        relpath.as_str(),
                        new_group,
                        new_type.map(|t| t.as_str())
                    ],
                )
                .map_err(|e| StoreError::storage("change_file_properties", e))?;
            if updated == 0 {
                return Err(AirlockError::NotFound(format!(
                    "file {relpath} not active on request {id}"
                ))
                .into());
            }

            insert_audit(&tx, &audit)?;
            let detail = load_detail(&tx, id.as_str())?;
            commit(tx)?;
            Ok(detail)
        })
        .await
    }

    pub async fn edit_group(
        &self,
        id: RequestId,
        group: String,
        context: Option<String>,
        controls: Option<String>,
        audit: AuditEvent,
    ) -> Result<RequestDetail, StoreError> {
        self.call("edit_group", move |conn| {
            let tx = begin(conn)?;
            let updated = tx
                .execute(
                    "UPDATE file_groups
                     SET context = COALESCE(?3, context),
                         controls = COALESCE(?4, controls)
                     WHERE request_id = ?1 AND name = ?2",
                    params![id.as_str(), group, context, controls],
                )
                .map_err(|e| StoreError::storage("edit_group", e))?;
            if updated == 0 {
                return Err(AirlockError::NotFound(format!(
                    "file group {group} not found on request {id}"
                ))
                .into());
            }

            insert_audit(&tx, &audit)?;
            let detail = load_detail(&tx, id.as_str())?;
            commit(tx)?;
            Ok(detail)
        })
        .await
    }

    // =========================================================================
    // Comments
    // =========================================================================

    pub async fn create_comment(
        &self,
        id: RequestId,
        comment: CommentRecord,
        audit: AuditEvent,
    ) -> Result<CommentRecord, StoreError> {
        self.call("create_comment", move |conn| {
            let tx = begin(conn)?;

            let group_exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM file_groups WHERE request_id = ?1 AND name = ?2",
                    params![id.as_str(), comment.group],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("create_comment", e))?;
            if group_exists.is_none() {
                return Err(AirlockError::NotFound(format!(
                    "file group {} not found on request {id}",
                    comment.group
                ))
                .into());
            }

            tx.execute(
                "INSERT INTO group_comments
                     (id, request_id, group_name, author, body, visibility,
                      review_turn, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    comment.id.as_str(),
                    id.as_str(),
                    comment.group,
                    comment.author,
                    comment.body,
                    comment.visibility.as_str(),
                    comment.review_turn,
                    ts(&comment.created_at)
                ],
            )
            .map_err(|e| StoreError::storage("create_comment", e))?;

            insert_audit(&tx, &audit)?;
            commit(tx)?;
            Ok(comment)
        })
        .await
    }

    pub async fn delete_comment(
        &self,
        id: RequestId,
        comment_id: CommentId,
        audit: AuditEvent,
    ) -> Result<(), StoreError> {
        self.call("delete_comment", move |conn| {
            let tx = begin(conn)?;
            let deleted = tx
                .execute(
                    "DELETE FROM group_comments WHERE id = ?1 AND request_id = ?2",
                    params![comment_id.as_str(), id.as_str()],
                )
                .map_err(|e| StoreError::storage("delete_comment", e))?;
            if deleted == 0 {
                return Err(
                    AirlockError::NotFound(format!("comment {comment_id} not found")).into(),
                );
            }
            insert_audit(&tx, &audit)?;
            commit(tx)?;
            Ok(())
        })
        .await
    }

    pub async fn promote_comment(
        &self,
        id: RequestId,
        comment_id: CommentId,
        audit: AuditEvent,
    ) -> Result<(), StoreError> {
        self.call("promote_comment", move |conn| {
            let tx = begin(conn)?;
            let updated = tx
                .execute(
                    "UPDATE group_comments SET visibility = 'PUBLIC'
                     WHERE id = ?1 AND request_id = ?2",
                    params![comment_id.as_str(), id.as_str()],
                )
                .map_err(|e| StoreError::storage("promote_comment", e))?;
            if updated == 0 {
                return Err(
                    AirlockError::NotFound(format!("comment {comment_id} not found")).into(),
                );
            }
            insert_audit(&tx, &audit)?;
            commit(tx)?;
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Votes and reviews
    // =========================================================================

    /// Upsert a reviewer's vote. Re-sending the identical choice is a no-op
    /// and records no audit entry.
    ///
    /// Returns whether anything changed.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_vote(
        &self,
        id: RequestId,
        relpath: RelPath,
        reviewer: String,
        choice: VoteChoice,
        turn: u32,
        audit: AuditEvent,
    ) -> Result<bool, StoreError> {
        self.call("upsert_vote", move |conn| {
            let tx = begin(conn)?;

            let existing: Option<(String, u32)> = tx
                .query_row(
                    "SELECT choice, review_turn FROM file_votes
                     WHERE request_id = ?1 AND relpath = ?2 AND reviewer = ?3",
                    params![id.as_str(), relpath.as_str(), reviewer],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| StoreError::storage("upsert_vote", e))?;

            if let Some((current, current_turn)) = &existing {
                if current == choice.as_str() && *current_turn == turn {
                    commit(tx)?;
                    return Ok(false);
                }
            }

            tx.execute(
                "INSERT INTO file_votes
                     (request_id, relpath, reviewer, choice, review_turn, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(request_id, relpath, reviewer) DO UPDATE SET
                     choice = excluded.choice,
                     review_turn = excluded.review_turn,
                     created_at = excluded.created_at",
                params![
                    id.as_str(),
                    relpath.as_str(),
                    reviewer,
                    choice.as_str(),
                    turn,
                    ts_now()
                ],
            )
            .map_err(|e| StoreError::storage("upsert_vote", e))?;

            insert_audit(&tx, &audit)?;
            commit(tx)?;
            Ok(true)
        })
        .await
    }

    /// Record a submitted review. Idempotent per (reviewer, turn); the
    /// duplicate path records no audit entry.
    ///
    /// Returns whether the submission was newly recorded.
    pub async fn record_review_submission(
        &self,
        id: RequestId,
        reviewer: String,
        turn: u32,
        audit: AuditEvent,
    ) -> Result<bool, StoreError> {
        self.call("record_review_submission", move |conn| {
            let tx = begin(conn)?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO submitted_reviews
                         (request_id, reviewer, review_turn, submitted_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id.as_str(), reviewer, turn, ts_now()],
                )
                .map_err(|e| StoreError::storage("record_review_submission", e))?;
            if inserted > 0 {
                insert_audit(&tx, &audit)?;
            }
            commit(tx)?;
            Ok(inserted > 0)
        })
        .await
    }

    // =========================================================================
    // Audit
    // =========================================================================

    /// Append a standalone audit entry (file views, downloads).
    pub async fn append_audit(&self, audit: AuditEvent) -> Result<(), StoreError> {
        self.call("append_audit", move |conn| {
            let tx = begin(conn)?;
            insert_audit(&tx, &audit)?;
            commit(tx)?;
            Ok(())
        })
        .await
    }

    pub async fn query_audit(&self, query: AuditQuery) -> Result<Vec<AuditEvent>, StoreError> {
        self.call("query_audit", move |conn| {
            let mut sql = String::from(
                "SELECT kind, actor, workspace, request_id, path, extra, created_at
                 FROM audit_log WHERE 1=1",
            );
            let mut args: Vec<String> = Vec::new();
            if let Some(actor) = query.actor {
                sql.push_str(&format!(" AND actor = ?{}", args.len() + 1));
                args.push(actor);
            }
            if let Some(workspace) = query.workspace {
                sql.push_str(&format!(" AND workspace = ?{}", args.len() + 1));
                args.push(workspace);
            }
            if let Some(request) = query.request {
                sql.push_str(&format!(" AND request_id = ?{}", args.len() + 1));
                args.push(request.0);
            }
            if let Some(group) = query.group {
                sql.push_str(&format!(
                    " AND json_extract(extra, '$.group') = ?{}",
                    args.len() + 1
                ));
                args.push(group);
            }
            sql.push_str(" ORDER BY id DESC");
            if let Some(limit) = query.limit {
                let limit = i64::try_from(limit)
                    .map_err(|_| StoreError::storage("query_audit", "limit out of range"))?;
                sql.push_str(&format!(" LIMIT {limit}"));
            }

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::storage("query_audit", e))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })
                .map_err(|e| StoreError::storage("query_audit", e))?;

            let mut out = Vec::new();
            for row in rows {
                let (kind, actor, workspace, request_id, path, extra, created_at) =
                    row.map_err(|e| StoreError::storage("query_audit", e))?;
                let Some(kind) = AuditKind::parse(&kind) else {
                    warn!("skipping audit row with unknown kind {kind}");
                    continue;
                };
                let extra: BTreeMap<String, String> = serde_json::from_str(&extra)
                    .map_err(|_| StoreError::corruption("audit extra JSON"))?;
                let path = match path {
                    Some(p) => Some(
                        RelPath::new(p).map_err(|_| StoreError::corruption("audit path"))?,
                    ),
                    None => None,
                };
                out.push(AuditEvent {
                    kind,
                    actor,
                    workspace,
                    request: request_id.map(RequestId),
                    path,
                    extra,
                    created_at: parse_ts(&created_at)?,
                });
            }
            Ok(out)
        })
        .await
    }

    // =========================================================================
    // Released files
    // =========================================================================

    /// Content hashes already released from this workspace by previous
    /// requests. Used for the RELEASED workspace-file status and the
    /// no-re-adding-released-files policy.
    pub async fn released_hashes_for_workspace(
        &self,
        workspace: String,
    ) -> Result<std::collections::BTreeSet<String>, StoreError> {
        self.call("released_hashes_for_workspace", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT f.content_hash
                     FROM request_files f JOIN requests r ON r.id = f.request_id
                     WHERE r.workspace = ?1 AND r.status = 'RELEASED'
                       AND f.filetype = 'output' AND f.withdrawn_at IS NULL",
                )
                .map_err(|e| StoreError::storage("released_hashes_for_workspace", e))?;
            let rows = stmt
                .query_map(params![workspace], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::storage("released_hashes_for_workspace", e))?;
            let mut out = std::collections::BTreeSet::new();
            for row in rows {
                out.insert(row.map_err(|e| StoreError::storage("released_hashes", e))?);
            }
            Ok(out)
        })
        .await
    }

    // =========================================================================
    // Upload jobs
    // =========================================================================

    /// Queue upload jobs for the given files. Already-queued paths are left
    /// alone so re-entry is harmless.
    pub async fn enqueue_upload_jobs(
        &self,
        id: RequestId,
        files: Vec<(RelPath, ContentHash)>,
        deadline_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.call("enqueue_upload_jobs", move |conn| {
            let tx = begin(conn)?;
            let now = ts_now();
            for (relpath, content_hash) in files {
                tx.execute(
                    "INSERT OR IGNORE INTO upload_jobs
                         (request_id, relpath, content_hash, status, attempts,
                          next_attempt_at, deadline_at, created_at)
                     VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?4)",
                    params![
                        id.as_str(),
                        relpath.as_str(),
                        content_hash.as_str(),
                        now,
                        ts(&deadline_at)
                    ],
                )
                .map_err(|e| StoreError::storage("enqueue_upload_jobs", e))?;
            }
            commit(tx)?;
            Ok(())
        })
        .await
    }

    /// Pending jobs whose next attempt is due.
    pub async fn due_upload_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UploadJobRecord>, StoreError> {
        self.call("due_upload_jobs", move |conn| {
            let limit = i64::try_from(limit)
                .map_err(|_| StoreError::storage("due_upload_jobs", "limit out of range"))?;
            let mut stmt = conn
                .prepare(
                    "SELECT request_id, relpath, content_hash, status, attempts,
                            next_attempt_at, last_error, deadline_at, created_at
                     FROM upload_jobs
                     WHERE status = 'pending' AND next_attempt_at <= ?1
                     ORDER BY next_attempt_at
                     LIMIT ?2",
                )
                .map_err(|e| StoreError::storage("due_upload_jobs", e))?;
            let rows = stmt
                .query_map(params![ts(&now), limit], row_to_job)
                .map_err(|e| StoreError::storage("due_upload_jobs", e))?;
            let mut out = Vec::new();
            for row in rows {
                match row {
                    Ok(Ok(job)) => out.push(job),
                    Ok(Err(e)) => warn!("skipping corrupt upload job row: {e}"),
                    Err(e) => warn!("failed to read upload job row: {e}"),
                }
            }
            Ok(out)
        })
        .await
    }

    /// Increment the attempt counter before trying an upload, so a crash
    /// mid-attempt still counts it.
    pub async fn record_upload_attempt(
        &self,
        id: RequestId,
        relpath: RelPath,
    ) -> Result<u32, StoreError> {
        self.call("record_upload_attempt", move |conn| {
            let tx = begin(conn)?;
            tx.execute(
                "UPDATE upload_jobs SET attempts = attempts + 1
                 WHERE request_id = ?1 AND relpath = ?2",
                params![id.as_str(), relpath.as_str()],
            )
            .map_err(|e| StoreError::storage("record_upload_attempt", e))?;
            let attempts: u32 = tx
                .query_row(
                    "SELECT attempts FROM upload_jobs
                     WHERE request_id = ?1 AND relpath = ?2",
                    params![id.as_str(), relpath.as_str()],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::storage("record_upload_attempt", e))?;
            commit(tx)?;
            Ok(attempts)
        })
        .await
    }

    /// Mark an upload job done and stamp `uploaded_at` on the file.
    pub async fn record_upload_success(
        &self,
        id: RequestId,
        relpath: RelPath,
        audit: AuditEvent,
    ) -> Result<(), StoreError> {
        self.call("record_upload_success", move |conn| {
            let tx = begin(conn)?;
            let now = ts_now();
            tx.execute(
                "UPDATE upload_jobs SET status = 'done', last_error = NULL
                 WHERE request_id = ?1 AND relpath = ?2",
                params![id.as_str(), relpath.as_str()],
            )
            .map_err(|e| StoreError::storage("record_upload_success", e))?;
            tx.execute(
                "UPDATE request_files SET uploaded_at = ?3
                 WHERE request_id = ?1 AND relpath = ?2",
                params![id.as_str(), relpath.as_str(), now],
            )
            .map_err(|e| StoreError::storage("record_upload_success", e))?;
            insert_audit(&tx, &audit)?;
            commit(tx)?;
            Ok(())
        })
        .await
    }

    /// Schedule a retry for a transient failure.
    pub async fn record_upload_retry(
        &self,
        id: RequestId,
        relpath: RelPath,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), StoreError> {
        self.call("record_upload_retry", move |conn| {
            conn.execute(
                "UPDATE upload_jobs SET next_attempt_at = ?3, last_error = ?4
                 WHERE request_id = ?1 AND relpath = ?2",
                params![id.as_str(), relpath.as_str(), ts(&next_attempt_at), error],
            )
            .map_err(|e| StoreError::storage("record_upload_retry", e))?;
            Ok(())
        })
        .await
    }

    /// Mark a job FAILED (permanent failure, exhausted attempts, or deadline).
    pub async fn record_upload_failed(
        &self,
        id: RequestId,
        relpath: RelPath,
        error: String,
    ) -> Result<(), StoreError> {
        self.call("record_upload_failed", move |conn| {
            conn.execute(
                "UPDATE upload_jobs SET status = 'failed', last_error = ?3
                 WHERE request_id = ?1 AND relpath = ?2",
                params![id.as_str(), relpath.as_str(), error],
            )
            .map_err(|e| StoreError::storage("record_upload_failed", e))?;
            Ok(())
        })
        .await
    }

    /// Reset FAILED jobs back to pending with fresh attempts and deadline.
    /// Used by re-release.
    pub async fn reset_failed_jobs(
        &self,
        id: RequestId,
        deadline_at: DateTime<Utc>,
        audit: AuditEvent,
    ) -> Result<usize, StoreError> {
        self.call("reset_failed_jobs", move |conn| {
            let tx = begin(conn)?;
            let reset = tx
                .execute(
                    "UPDATE upload_jobs
                     SET status = 'pending', attempts = 0, next_attempt_at = ?2,
                         deadline_at = ?3, last_error = NULL
                     WHERE request_id = ?1 AND status = 'failed'",
                    params![id.as_str(), ts_now(), ts(&deadline_at)],
                )
                .map_err(|e| StoreError::storage("reset_failed_jobs", e))?;
            insert_audit(&tx, &audit)?;
            commit(tx)?;
            Ok(reset)
        })
        .await
    }

    /// All jobs for one request, any status.
    pub async fn upload_jobs_for(
        &self,
        id: RequestId,
    ) -> Result<Vec<UploadJobRecord>, StoreError> {
        self.call("upload_jobs_for", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT request_id, relpath, content_hash, status, attempts,
                            next_attempt_at, last_error, deadline_at, created_at
                     FROM upload_jobs WHERE request_id = ?1 ORDER BY relpath",
                )
                .map_err(|e| StoreError::storage("upload_jobs_for", e))?;
            let rows = stmt
                .query_map(params![id.as_str()], row_to_job)
                .map_err(|e| StoreError::storage("upload_jobs_for", e))?;
            let mut out = Vec::new();
            for row in rows {
                match row {
                    Ok(Ok(job)) => out.push(job),
                    Ok(Err(e)) => warn!("skipping corrupt upload job row: {e}"),
                    Err(e) => warn!("failed to read upload job row: {e}"),
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn set_jobs_release_id(
        &self,
        id: RequestId,
        release_id: String,
    ) -> Result<(), StoreError> {
        self.call("set_jobs_release_id", move |conn| {
            conn.execute(
                "UPDATE requests SET jobs_release_id = ?2 WHERE id = ?1",
                params![id.as_str(), release_id],
            )
            .map_err(|e| StoreError::storage("set_jobs_release_id", e))?;
            Ok(())
        })
        .await
    }
}

impl StoreError {
    /// Adapt row-mapping corruption errors out of rusqlite's error space.
    fn from_row(err: String) -> Self {
        Self::Corruption(err)
    }
}

// =============================================================================
// Sync helpers
// =============================================================================

const REQUEST_COLS: &str =
    "id, workspace, author, status, review_turn, jobs_release_id, released_by, \
     created_at, updated_at";

fn begin(conn: &mut Connection) -> Result<Transaction<'_>, StoreError> {
    conn.transaction()
        .map_err(|e| StoreError::storage("begin transaction", e))
}

fn commit(tx: Transaction<'_>) -> Result<(), StoreError> {
    tx.commit()
        .map_err(|e| StoreError::storage("commit transaction", e))
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn ts_now() -> String {
    ts(&Utc::now())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| StoreError::corruption(format!("timestamp {s}")))
}

/// Convert a size (u64) to i64 for SQLite storage. Errors rather than
/// silently wrapping.
fn u64_to_i64(value: u64, operation: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::storage(operation, format!("value {value} exceeds i64::MAX")))
}

fn ensure_group(tx: &Transaction<'_>, request_id: &str, name: &str) -> Result<(), StoreError> {
    tx.execute(
        "INSERT OR IGNORE INTO file_groups (request_id, name, created_at)
         VALUES (?1, ?2, ?3)",
        params![request_id, name, ts_now()],
    )
    .map_err(|e| StoreError::storage("ensure_group", e))?;
    Ok(())
}

fn insert_audit(tx: &Transaction<'_>, audit: &AuditEvent) -> Result<(), StoreError> {
    let extra = serde_json::to_string(&audit.extra)
        .map_err(|e| StoreError::storage("serialize audit extra", e))?;
    tx.execute(
        "INSERT INTO audit_log (kind, actor, workspace, request_id, path, extra, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            audit.kind.as_str(),
            audit.actor,
            audit.workspace,
            audit.request.as_ref().map(|r| r.as_str()),
            audit.path.as_ref().map(|p| p.as_str()),
            extra,
            ts(&audit.created_at)
        ],
    )
    .map_err(|e| StoreError::storage("insert audit", e))?;
    Ok(())
}

/// Map a request row; corruption is reported as an inner error string so
/// scans can skip bad rows while point lookups fail loudly.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<RequestRecord, String>> {
    let id: String = row.get(0)?;
    let workspace: String = row.get(1)?;
    let author: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let review_turn: u32 = row.get(4)?;
    let jobs_release_id: Option<String> = row.get(5)?;
    let released_by: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok((|| {
        let status = RequestStatus::parse(&status_str)
            .ok_or_else(|| format!("unknown status {status_str}"))?;
        Ok(RequestRecord {
            id: RequestId(id),
            workspace,
            author,
            status,
            review_turn,
            jobs_release_id,
            released_by,
            created_at: parse_ts(&created_at).map_err(|e| e.to_string())?,
            updated_at: parse_ts(&updated_at).map_err(|e| e.to_string())?,
        })
    })())
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<UploadJobRecord, String>> {
    let request_id: String = row.get(0)?;
    let relpath: String = row.get(1)?;
    let content_hash: String = row.get(2)?;
    let status: String = row.get(3)?;
    let attempts: u32 = row.get(4)?;
    let next_attempt_at: String = row.get(5)?;
    let last_error: Option<String> = row.get(6)?;
    let deadline_at: String = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok((|| {
        Ok(UploadJobRecord {
            request: RequestId(request_id),
            relpath: RelPath::new(relpath).map_err(|e| e.to_string())?,
            content_hash: ContentHash(content_hash),
            status: UploadJobStatus::parse(&status)
                .ok_or_else(|| format!("unknown job status {status}"))?,
            attempts,
            next_attempt_at: parse_ts(&next_attempt_at).map_err(|e| e.to_string())?,
            last_error,
            deadline_at: parse_ts(&deadline_at).map_err(|e| e.to_string())?,
            created_at: parse_ts(&created_at).map_err(|e| e.to_string())?,
        })
    })())
}

fn load_record(tx: &Transaction<'_>, id: &str) -> Result<RequestRecord, StoreError> {
    tx.query_row(
        &format!("SELECT {REQUEST_COLS} FROM requests WHERE id = ?1"),
        params![id],
        row_to_record,
    )
    .optional()
    .map_err(|e| StoreError::storage("load request", e))?
    .ok_or_else(|| AirlockError::NotFound(format!("request {id}")).into())
    .and_then(|r| r.map_err(StoreError::from_row))
}

fn load_detail(tx: &Transaction<'_>, id: &str) -> Result<RequestDetail, StoreError> {
    let record = load_record(tx, id)?;

    let groups = {
        let mut stmt = tx
            .prepare(
                "SELECT name, context, controls, created_at FROM file_groups
                 WHERE request_id = ?1 ORDER BY name",
            )
            .map_err(|e| StoreError::storage("load groups", e))?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| StoreError::storage("load groups", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (name, context, controls, created_at) =
                row.map_err(|e| StoreError::storage("load groups", e))?;
            out.push(FileGroupRecord {
                name,
                context,
                controls,
                created_at: parse_ts(&created_at)?,
            });
        }
        out
    };

    let files = {
        let mut stmt = tx
            .prepare(
                "SELECT relpath, group_name, filetype, content_hash, size, added_at,
                        added_by, added_in_turn, withdrawn_at, withdrawn_in_turn, uploaded_at
                 FROM request_files WHERE request_id = ?1 ORDER BY relpath",
            )
            .map_err(|e| StoreError::storage("load files", e))?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, u32>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<u32>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .map_err(|e| StoreError::storage("load files", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (
                relpath,
                group,
                filetype,
                content_hash,
                size,
                added_at,
                added_by,
                added_in_turn,
                withdrawn_at,
                withdrawn_in_turn,
                uploaded_at,
            ) = row.map_err(|e| StoreError::storage("load files", e))?;
            out.push(RequestFileRecord {
                relpath: RelPath::new(relpath)
                    .map_err(|_| StoreError::corruption("relpath in request_files"))?,
                group,
                filetype: FileType::parse(&filetype)
                    .ok_or_else(|| StoreError::corruption("filetype in request_files"))?,
                content_hash: ContentHash(content_hash),
                size: u64::try_from(size)
                    .map_err(|_| StoreError::corruption("negative size in request_files"))?,
                added_at: parse_ts(&added_at)?,
                added_by,
                added_in_turn,
                withdrawn_at: withdrawn_at.as_deref().map(parse_ts).transpose()?,
                withdrawn_in_turn,
                uploaded_at: uploaded_at.as_deref().map(parse_ts).transpose()?,
            });
        }
        out
    };

    let votes = {
        let mut stmt = tx
            .prepare(
                "SELECT relpath, reviewer, choice, review_turn, created_at
                 FROM file_votes WHERE request_id = ?1 ORDER BY relpath, reviewer",
            )
            .map_err(|e| StoreError::storage("load votes", e))?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| StoreError::storage("load votes", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (relpath, reviewer, choice, review_turn, created_at) =
                row.map_err(|e| StoreError::storage("load votes", e))?;
            out.push(VoteRecord {
                relpath: RelPath::new(relpath)
                    .map_err(|_| StoreError::corruption("relpath in file_votes"))?,
                reviewer,
                choice: VoteChoice::parse(&choice)
                    .ok_or_else(|| StoreError::corruption("choice in file_votes"))?,
                review_turn,
                created_at: parse_ts(&created_at)?,
            });
        }
        out
    };

    let comments = {
        let mut stmt = tx
            .prepare(
                "SELECT id, group_name, author, body, visibility, review_turn, created_at
                 FROM group_comments WHERE request_id = ?1 ORDER BY created_at, id",
            )
            .map_err(|e| StoreError::storage("load comments", e))?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(|e| StoreError::storage("load comments", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (cid, group, author, body, visibility, review_turn, created_at) =
                row.map_err(|e| StoreError::storage("load comments", e))?;
            out.push(CommentRecord {
                id: CommentId(cid),
                group,
                author,
                body,
                visibility: Visibility::parse(&visibility)
                    .ok_or_else(|| StoreError::corruption("visibility in group_comments"))?,
                review_turn,
                created_at: parse_ts(&created_at)?,
            });
        }
        out
    };

    let submitted_reviews = {
        let mut stmt = tx
            .prepare(
                "SELECT reviewer, review_turn, submitted_at
                 FROM submitted_reviews WHERE request_id = ?1 ORDER BY submitted_at",
            )
            .map_err(|e| StoreError::storage("load submitted reviews", e))?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| StoreError::storage("load submitted reviews", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (reviewer, review_turn, submitted_at) =
                row.map_err(|e| StoreError::storage("load submitted reviews", e))?;
            out.push(SubmittedReview {
                reviewer,
                review_turn,
                submitted_at: parse_ts(&submitted_at)?,
            });
        }
        out
    };

    Ok(RequestDetail {
        record,
        groups,
        files,
        votes,
        comments,
        submitted_reviews,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit(kind: AuditKind, id: &RequestId) -> AuditEvent {
        AuditEvent::new(kind, "alice", "ws1", id.clone(), 1)
    }

    async fn store_with_request() -> (SqliteStore, RequestId) {
        let store = SqliteStore::new_in_memory().unwrap();
        let id = RequestId::generate();
        store
            .create_request(
                id.clone(),
                "ws1".into(),
                "alice".into(),
                audit(AuditKind::RequestCreate, &id),
            )
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_create_request_starts_pending_turn_one() {
        let (store, id) = store_with_request().await;
        let detail = store.get_request(id).await.unwrap();
        assert_eq!(detail.record.status, RequestStatus::Pending);
        assert_eq!(detail.record.review_turn, 1);
    }

    #[tokio::test]
    async fn test_one_active_request_per_author_workspace() {
        let (store, id) = store_with_request().await;

        // second active request for (ws1, alice) violates U1
        let dup = RequestId::generate();
        let err = store
            .create_request(
                dup.clone(),
                "ws1".into(),
                "alice".into(),
                audit(AuditKind::RequestCreate, &dup),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(AirlockError::Invariant(_))
        ));

        // a different workspace is fine
        let other = RequestId::generate();
        store
            .create_request(
                other.clone(),
                "ws2".into(),
                "alice".into(),
                audit(AuditKind::RequestCreate, &other),
            )
            .await
            .unwrap();

        // withdrawing the first frees the slot
        store
            .transition(
                id.clone(),
                RequestStatus::Pending,
                RequestStatus::Withdrawn,
                false,
                false,
                None,
                audit(AuditKind::RequestWithdraw, &id),
            )
            .await
            .unwrap();
        let again = RequestId::generate();
        store
            .create_request(
                again.clone(),
                "ws1".into(),
                "alice".into(),
                audit(AuditKind::RequestCreate, &again),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transition_conflict_on_stale_expectation() {
        let (store, id) = store_with_request().await;
        let err = store
            .transition(
                id.clone(),
                RequestStatus::Submitted,
                RequestStatus::Returned,
                true,
                false,
                None,
                audit(AuditKind::RequestReturn, &id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(AirlockError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_add_file_enforces_uniqueness_and_revives_tombstones() {
        let (store, id) = store_with_request().await;
        let path = RelPath::new("output/a.csv").unwrap();

        store
            .add_file(
                id.clone(),
                "g1".into(),
                path.clone(),
                FileType::Output,
                ContentHash::from("h1"),
                10,
                "alice".into(),
                1,
                audit(AuditKind::FileAdd, &id),
            )
            .await
            .unwrap();

        // duplicate active path is an invariant violation, even in another group
        let err = store
            .add_file(
                id.clone(),
                "g2".into(),
                path.clone(),
                FileType::Supporting,
                ContentHash::from("h2"),
                10,
                "alice".into(),
                1,
                audit(AuditKind::FileAdd, &id),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(AirlockError::Invariant(_))
        ));

        // tombstone, then re-add revives with the new snapshot
        store
            .withdraw_file(id.clone(), path.clone(), 2, audit(AuditKind::FileWithdraw, &id))
            .await
            .unwrap();
        let detail = store
            .add_file(
                id.clone(),
                "g2".into(),
                path.clone(),
                FileType::Output,
                ContentHash::from("h3"),
                20,
                "alice".into(),
                3,
                audit(AuditKind::FileAdd, &id),
            )
            .await
            .unwrap();
        let file = detail.file(&path).unwrap();
        assert!(!file.is_withdrawn());
        assert_eq!(file.group, "g2");
        assert_eq!(file.content_hash.as_str(), "h3");
        assert_eq!(file.added_in_turn, 3);
    }

    #[tokio::test]
    async fn test_update_file_resets_votes() {
        let (store, id) = store_with_request().await;
        let path = RelPath::new("output/a.csv").unwrap();
        store
            .add_file(
                id.clone(),
                "g1".into(),
                path.clone(),
                FileType::Output,
                ContentHash::from("h1"),
                10,
                "alice".into(),
                1,
                audit(AuditKind::FileAdd, &id),
            )
            .await
            .unwrap();
        store
            .upsert_vote(
                id.clone(),
                path.clone(),
                "carol".into(),
                VoteChoice::Approve,
                2,
                audit(AuditKind::FileApprove, &id),
            )
            .await
            .unwrap();

        let detail = store
            .update_file(
                id.clone(),
                path.clone(),
                ContentHash::from("h2"),
                12,
                3,
                audit(AuditKind::FileUpdate, &id),
            )
            .await
            .unwrap();
        assert!(detail.votes.is_empty());
        assert_eq!(detail.file(&path).unwrap().content_hash.as_str(), "h2");
    }

    #[tokio::test]
    async fn test_vote_upsert_is_idempotent() {
        let (store, id) = store_with_request().await;
        let path = RelPath::new("output/a.csv").unwrap();
        store
            .add_file(
                id.clone(),
                "g1".into(),
                path.clone(),
                FileType::Output,
                ContentHash::from("h1"),
                10,
                "alice".into(),
                1,
                audit(AuditKind::FileAdd, &id),
            )
            .await
            .unwrap();

        let changed = store
            .upsert_vote(
                id.clone(),
                path.clone(),
                "carol".into(),
                VoteChoice::Approve,
                2,
                audit(AuditKind::FileApprove, &id),
            )
            .await
            .unwrap();
        assert!(changed);

        // identical vote: single row, no extra audit entry
        let changed = store
            .upsert_vote(
                id.clone(),
                path.clone(),
                "carol".into(),
                VoteChoice::Approve,
                2,
                audit(AuditKind::FileApprove, &id),
            )
            .await
            .unwrap();
        assert!(!changed);

        let detail = store.get_request(id.clone()).await.unwrap();
        assert_eq!(detail.votes.len(), 1);

        let approvals = store
            .query_audit(AuditQuery {
                request: Some(id.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == AuditKind::FileApprove)
            .count();
        assert_eq!(approvals, 1);
    }

    #[tokio::test]
    async fn test_review_submission_idempotent() {
        let (store, id) = store_with_request().await;
        let first = store
            .record_review_submission(
                id.clone(),
                "carol".into(),
                2,
                audit(AuditKind::RequestReview, &id),
            )
            .await
            .unwrap();
        assert!(first);
        let second = store
            .record_review_submission(
                id.clone(),
                "carol".into(),
                2,
                audit(AuditKind::RequestReview, &id),
            )
            .await
            .unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn test_resubmit_rewrites_stale_change_requests() {
        let (store, id) = store_with_request().await;
        let path = RelPath::new("output/a.csv").unwrap();
        store
            .add_file(
                id.clone(),
                "g1".into(),
                path.clone(),
                FileType::Output,
                ContentHash::from("h1"),
                10,
                "alice".into(),
                1,
                audit(AuditKind::FileAdd, &id),
            )
            .await
            .unwrap();
        store
            .upsert_vote(
                id.clone(),
                path.clone(),
                "carol".into(),
                VoteChoice::RequestChanges,
                1,
                audit(AuditKind::FileRequestChanges, &id),
            )
            .await
            .unwrap();
        store
            .upsert_vote(
                id.clone(),
                path.clone(),
                "bob".into(),
                VoteChoice::Approve,
                1,
                audit(AuditKind::FileApprove, &id),
            )
            .await
            .unwrap();

        // walk the record into RETURNED, then resubmit with vote reset
        store
            .transition(
                id.clone(),
                RequestStatus::Pending,
                RequestStatus::Submitted,
                false,
                false,
                None,
                audit(AuditKind::RequestSubmit, &id),
            )
            .await
            .unwrap();
        store
            .transition(
                id.clone(),
                RequestStatus::Submitted,
                RequestStatus::Returned,
                true,
                false,
                None,
                audit(AuditKind::RequestReturn, &id),
            )
            .await
            .unwrap();
        let detail = store
            .transition(
                id.clone(),
                RequestStatus::Returned,
                RequestStatus::Submitted,
                true,
                true,
                None,
                audit(AuditKind::RequestSubmit, &id),
            )
            .await
            .unwrap();

        assert_eq!(detail.record.review_turn, 3);
        let carol = detail.vote_by(&path, "carol").unwrap();
        assert_eq!(carol.choice, VoteChoice::Undecided);
        assert_eq!(carol.review_turn, 3);
        // approvals are left alone
        let bob = detail.vote_by(&path, "bob").unwrap();
        assert_eq!(bob.choice, VoteChoice::Approve);

        let undecided_audits = store
            .query_audit(AuditQuery {
                request: Some(id.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == AuditKind::FileUndecided)
            .count();
        assert_eq!(undecided_audits, 1);
    }

    #[tokio::test]
    async fn test_upload_job_lifecycle() {
        let (store, id) = store_with_request().await;
        let path = RelPath::new("output/a.csv").unwrap();
        store
            .add_file(
                id.clone(),
                "g1".into(),
                path.clone(),
                FileType::Output,
                ContentHash::from("h1"),
                10,
                "alice".into(),
                1,
                audit(AuditKind::FileAdd, &id),
            )
            .await
            .unwrap();

        let deadline = Utc::now() + chrono::Duration::hours(1);
        store
            .enqueue_upload_jobs(
                id.clone(),
                vec![(path.clone(), ContentHash::from("h1"))],
                deadline,
            )
            .await
            .unwrap();
        // double enqueue is harmless
        store
            .enqueue_upload_jobs(
                id.clone(),
                vec![(path.clone(), ContentHash::from("h1"))],
                deadline,
            )
            .await
            .unwrap();

        let due = store.due_upload_jobs(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 0);

        let attempts = store
            .record_upload_attempt(id.clone(), path.clone())
            .await
            .unwrap();
        assert_eq!(attempts, 1);

        // transient failure: not due until the backoff expires
        let next = Utc::now() + chrono::Duration::hours(2);
        store
            .record_upload_retry(id.clone(), path.clone(), next, "503".into())
            .await
            .unwrap();
        assert!(store.due_upload_jobs(Utc::now(), 10).await.unwrap().is_empty());

        // permanent failure, then re-release resets it
        store
            .record_upload_failed(id.clone(), path.clone(), "400".into())
            .await
            .unwrap();
        let jobs = store.upload_jobs_for(id.clone()).await.unwrap();
        assert_eq!(jobs[0].status, UploadJobStatus::Failed);

        let reset = store
            .reset_failed_jobs(id.clone(), deadline, audit(AuditKind::RequestRerelease, &id))
            .await
            .unwrap();
        assert_eq!(reset, 1);
        let due = store.due_upload_jobs(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 0);

        // success stamps the file
        store
            .record_upload_success(id.clone(), path.clone(), audit(AuditKind::FileUpload, &id))
            .await
            .unwrap();
        let detail = store.get_request(id.clone()).await.unwrap();
        assert!(detail.file(&path).unwrap().uploaded_at.is_some());
        let jobs = store.upload_jobs_for(id.clone()).await.unwrap();
        assert_eq!(jobs[0].status, UploadJobStatus::Done);
    }

    #[tokio::test]
    async fn test_released_hashes_for_workspace() {
        let (store, id) = store_with_request().await;
        let path = RelPath::new("output/a.csv").unwrap();
        store
            .add_file(
                id.clone(),
                "g1".into(),
                path.clone(),
                FileType::Output,
                ContentHash::from("h1"),
                10,
                "alice".into(),
                1,
                audit(AuditKind::FileAdd, &id),
            )
            .await
            .unwrap();
        assert!(store
            .released_hashes_for_workspace("ws1".into())
            .await
            .unwrap()
            .is_empty());

        // drive to RELEASED via the table's path
        for (from, to, turn) in [
            (RequestStatus::Pending, RequestStatus::Submitted, false),
            (
                RequestStatus::Submitted,
                RequestStatus::PartiallyReviewed,
                false,
            ),
            (
                RequestStatus::PartiallyReviewed,
                RequestStatus::Reviewed,
                false,
            ),
            (RequestStatus::Reviewed, RequestStatus::Approved, false),
            (RequestStatus::Approved, RequestStatus::Released, false),
        ] {
            store
                .transition(
                    id.clone(),
                    from,
                    to,
                    turn,
                    false,
                    None,
                    audit(AuditKind::RequestSubmit, &id),
                )
                .await
                .unwrap();
        }

        let hashes = store
            .released_hashes_for_workspace("ws1".into())
            .await
            .unwrap();
        assert!(hashes.contains("h1"));
    }

    #[tokio::test]
    async fn test_audit_query_filters() {
        let (store, id) = store_with_request().await;
        store
            .append_audit(
                AuditEvent::new(AuditKind::GroupEdit, "alice", "ws1", id.clone(), 1)
                    .with_extra("group", "g1"),
            )
            .await
            .unwrap();
        store
            .append_audit(
                AuditEvent::new(AuditKind::GroupEdit, "bob", "ws1", id.clone(), 1)
                    .with_extra("group", "g2"),
            )
            .await
            .unwrap();

        let all = store
            .query_audit(AuditQuery {
                request: Some(id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3); // create + two edits
        // newest first
        assert_eq!(all[0].kind, AuditKind::GroupEdit);

        let g1 = store
            .query_audit(AuditQuery {
                group: Some("g1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(g1.len(), 1);
        assert_eq!(g1[0].actor, "alice");

        let limited = store
            .query_audit(AuditQuery {
                request: Some(id.clone()),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
