//! Inbound HTTP API.
//!
//! One POST route per controller operation, JSON in and out. Mutating
//! responses carry the request's new status; detail reads go through the
//! visibility-filtered view. Errors use a structured `{kind, message}` body.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use airlock_core::{
    AirlockError, CommentId, FileType, Principal, RelPath, RequestId, RequestStatus, Visibility,
    VoteChoice,
};

use crate::controller::{AddFileSpec, RequestController};
use crate::identity::UserDirectory;
use crate::store::{RequestDetail, StoreError};

/// Header carrying the authenticated username, set by the login layer in
/// front of this service.
pub const USER_HEADER: &str = "x-airlock-user";

pub struct AppState {
    pub controller: Arc<RequestController>,
    pub users: Arc<UserDirectory>,
    /// Deadline applied to each controller operation.
    pub request_timeout: Duration,
}

/// Error envelope returned to clients.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
    #[serde(skip)]
    status: StatusCode,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            status,
        }
    }

    pub fn status_for(err: &AirlockError) -> StatusCode {
        match err {
            AirlockError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AirlockError::NotFound(_) => StatusCode::NOT_FOUND,
            AirlockError::InvalidTransition { .. } | AirlockError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            AirlockError::Precondition(_) | AirlockError::Invariant(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AirlockError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AirlockError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(domain) => {
                Self::new(Self::status_for(&domain), domain.code(), domain.to_string())
            }
            StoreError::Storage(msg) | StoreError::Corruption(msg) => {
                error!("internal store error: {msg}");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal storage error",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(json!({"kind": self.kind, "message": self.message}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Resolve the authenticated principal from the user header.
fn principal(state: &AppState, headers: &HeaderMap) -> ApiResult<Principal> {
    let username = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "permission_denied",
                format!("missing {USER_HEADER} header"),
            )
        })?;
    state.users.resolve(username).ok_or_else(|| {
        ApiError::new(
            StatusCode::FORBIDDEN,
            "permission_denied",
            format!("unknown user {username}"),
        )
    })
}

/// Run a controller operation under the request deadline.
async fn bounded<T, F>(state: &AppState, fut: F) -> ApiResult<T>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(state.request_timeout, fut).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(_) => Err(StoreError::Domain(AirlockError::Timeout(
            "operation deadline expired".to_string(),
        ))
        .into()),
    }
}

/// New-status summary returned from every mutating operation.
#[derive(Debug, Serialize)]
struct RequestSummary {
    id: RequestId,
    workspace: String,
    status: RequestStatus,
    review_turn: u32,
}

impl From<RequestDetail> for RequestSummary {
    fn from(detail: RequestDetail) -> Self {
        Self {
            id: detail.record.id,
            workspace: detail.record.workspace,
            status: detail.record.status,
            review_turn: detail.record.review_turn,
        }
    }
}

fn parse_relpath(raw: &str) -> ApiResult<RelPath> {
    RelPath::new(raw).map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.code(), e.to_string()))
}

// =============================================================================
// Handlers
// =============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "service": "airlock"}))
}

async fn create_request(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let detail = bounded(&state, state.controller.create_request(&user, &workspace)).await?;
    Ok(Json(detail.into()))
}

#[derive(Deserialize)]
struct ListingQuery {
    path: Option<String>,
}

async fn workspace_listing(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
    Query(query): Query<ListingQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = principal(&state, &headers)?;
    let path = match query.path.as_deref() {
        Some(raw) => Some(parse_relpath(raw)?),
        None => None,
    };
    let entries = bounded(
        &state,
        state
            .controller
            .workspace_listing(&user, &workspace, path.as_ref()),
    )
    .await?;
    Ok(Json(entries).into_response())
}

async fn outstanding_reviews(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = principal(&state, &headers)?;
    let records = bounded(&state, state.controller.outstanding_for_review(&user)).await?;
    Ok(Json(records).into_response())
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = principal(&state, &headers)?;
    let view = bounded(
        &state,
        state.controller.get_request_view(&user, &RequestId(id)),
    )
    .await?;
    Ok(Json(view).into_response())
}

async fn request_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = principal(&state, &headers)?;
    let log = bounded(
        &state,
        state.controller.request_audit(&user, &RequestId(id)),
    )
    .await?;
    let entries: Vec<serde_json::Value> = log
        .into_iter()
        .map(|e| {
            json!({
                "kind": e.kind.as_str(),
                "description": e.kind.description(),
                "actor": e.actor,
                "path": e.path,
                "extra": e.extra,
                "created_at": e.created_at,
            })
        })
        .collect();
    Ok(Json(entries).into_response())
}

async fn workspace_contents(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
    Query(query): Query<ListingQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = principal(&state, &headers)?;
    let raw = query.path.as_deref().ok_or_else(|| {
        ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "precondition",
            "path query parameter is required",
        )
    })?;
    let relpath = parse_relpath(raw)?;
    let bytes = bounded(
        &state,
        state
            .controller
            .workspace_file_bytes(&user, &workspace, &relpath),
    )
    .await?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

#[derive(Deserialize)]
struct AddFilesBody {
    files: Vec<AddFileSpec>,
}

async fn add_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AddFilesBody>,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let detail = bounded(
        &state,
        state.controller.add_files(&user, &RequestId(id), body.files),
    )
    .await?;
    Ok(Json(detail.into()))
}

#[derive(Deserialize)]
struct FileBody {
    relpath: String,
}

async fn update_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FileBody>,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let relpath = parse_relpath(&body.relpath)?;
    let detail = bounded(
        &state,
        state.controller.update_file(&user, &RequestId(id), &relpath),
    )
    .await?;
    Ok(Json(detail.into()))
}

async fn withdraw_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FileBody>,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let relpath = parse_relpath(&body.relpath)?;
    let detail = bounded(
        &state,
        state
            .controller
            .withdraw_file(&user, &RequestId(id), &relpath),
    )
    .await?;
    Ok(Json(detail.into()))
}

#[derive(Deserialize)]
struct FilePropertiesBody {
    relpath: String,
    group: Option<String>,
    filetype: Option<FileType>,
}

async fn change_file_properties(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FilePropertiesBody>,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let relpath = parse_relpath(&body.relpath)?;
    let detail = bounded(
        &state,
        state.controller.change_file_properties(
            &user,
            &RequestId(id),
            &relpath,
            body.group,
            body.filetype,
        ),
    )
    .await?;
    Ok(Json(detail.into()))
}

#[derive(Deserialize)]
struct GroupEditBody {
    context: Option<String>,
    controls: Option<String>,
}

async fn edit_group(
    State(state): State<Arc<AppState>>,
    Path((id, group)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<GroupEditBody>,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let detail = bounded(
        &state,
        state.controller.edit_group(
            &user,
            &RequestId(id),
            &group,
            body.context,
            body.controls,
        ),
    )
    .await?;
    Ok(Json(detail.into()))
}

#[derive(Deserialize)]
struct CommentBody {
    text: String,
    visibility: Visibility,
}

async fn create_comment(
    State(state): State<Arc<AppState>>,
    Path((id, group)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<CommentBody>,
) -> ApiResult<Response> {
    let user = principal(&state, &headers)?;
    let comment = bounded(
        &state,
        state.controller.create_comment(
            &user,
            &RequestId(id),
            &group,
            &body.text,
            body.visibility,
        ),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(comment)).into_response())
}

async fn promote_comment(
    State(state): State<Arc<AppState>>,
    Path((id, comment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user = principal(&state, &headers)?;
    bounded(
        &state,
        state
            .controller
            .promote_comment(&user, &RequestId(id), &CommentId(comment_id)),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_comment(
    State(state): State<Arc<AppState>>,
    Path((id, comment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user = principal(&state, &headers)?;
    bounded(
        &state,
        state
            .controller
            .delete_comment(&user, &RequestId(id), &CommentId(comment_id)),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct VoteBody {
    relpath: String,
    choice: VoteChoice,
}

async fn vote(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<VoteBody>,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let relpath = parse_relpath(&body.relpath)?;
    let detail = bounded(
        &state,
        state
            .controller
            .vote(&user, &RequestId(id), &relpath, body.choice),
    )
    .await?;
    Ok(Json(detail.into()))
}

async fn submit_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let detail = bounded(&state, state.controller.submit_review(&user, &RequestId(id))).await?;
    Ok(Json(detail.into()))
}

async fn submit_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let detail = bounded(&state, state.controller.submit(&user, &RequestId(id))).await?;
    Ok(Json(detail.into()))
}

#[derive(Deserialize, Default)]
struct ReturnBody {
    #[serde(default)]
    confirmed: bool,
}

async fn return_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReturnBody>,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let detail = bounded(
        &state,
        state
            .controller
            .return_request(&user, &RequestId(id), body.confirmed),
    )
    .await?;
    Ok(Json(detail.into()))
}

async fn reject_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let detail = bounded(&state, state.controller.reject(&user, &RequestId(id))).await?;
    Ok(Json(detail.into()))
}

async fn release_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let detail = bounded(&state, state.controller.release_files(&user, &RequestId(id))).await?;
    Ok(Json(detail.into()))
}

async fn re_release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user = principal(&state, &headers)?;
    let jobs = bounded(&state, state.controller.re_release(&user, &RequestId(id))).await?;
    Ok(Json(jobs).into_response())
}

async fn withdraw_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<RequestSummary>> {
    let user = principal(&state, &headers)?;
    let detail = bounded(
        &state,
        state.controller.withdraw_request(&user, &RequestId(id)),
    )
    .await?;
    Ok(Json(detail.into()))
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workspaces/:workspace/requests", post(create_request))
        .route("/workspaces/:workspace/files", get(workspace_listing))
        .route("/workspaces/:workspace/contents", get(workspace_contents))
        .route("/reviews/outstanding", get(outstanding_reviews))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/audit", get(request_audit))
        .route("/requests/:id/files", post(add_files))
        .route("/requests/:id/files/update", post(update_file))
        .route("/requests/:id/files/withdraw", post(withdraw_file))
        .route(
            "/requests/:id/files/properties",
            post(change_file_properties),
        )
        .route("/requests/:id/groups/:group", post(edit_group))
        .route("/requests/:id/groups/:group/comments", post(create_comment))
        .route(
            "/requests/:id/comments/:comment_id/promote",
            post(promote_comment),
        )
        .route(
            "/requests/:id/comments/:comment_id/delete",
            post(delete_comment),
        )
        .route("/requests/:id/votes", post(vote))
        .route("/requests/:id/review", post(submit_review))
        .route("/requests/:id/submit", post(submit_request))
        .route("/requests/:id/return", post(return_request))
        .route("/requests/:id/reject", post(reject_request))
        .route("/requests/:id/release", post(release_files))
        .route("/requests/:id/re-release", post(re_release))
        .route("/requests/:id/withdraw", post(withdraw_request))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError::status_for(&AirlockError::PermissionDenied("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::status_for(&AirlockError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::status_for(&AirlockError::Conflict("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::status_for(&AirlockError::InvalidTransition {
                from: RequestStatus::Pending,
                to: RequestStatus::Released,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::status_for(&AirlockError::Precondition("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::status_for(&AirlockError::Timeout("x".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::status_for(&AirlockError::Upstream {
                status: Some(503),
                message: "x".into()
            }),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_store_errors_do_not_leak_details() {
        let api_err = ApiError::from(StoreError::Storage("secret path /db".into()));
        assert_eq!(api_err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api_err.kind, "internal");
        assert!(!api_err.message.contains("/db"));
    }

    #[test]
    fn test_domain_error_kind_in_body() {
        let api_err = ApiError::from(StoreError::Domain(AirlockError::Precondition(
            "group g1 incomplete".into(),
        )));
        assert_eq!(api_err.kind, "precondition");
        assert!(api_err.message.contains("g1"));
    }
}
