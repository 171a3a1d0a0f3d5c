//! Client for the external Jobs-site release API.
//!
//! Two calls: create a release for a workspace (returning the release id),
//! then upload each file's bytes to that release. Responses are classified
//! into success / already-uploaded / permanent / transient so the scheduler
//! can decide whether to retry.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use airlock_core::{ContentHash, FileType, RelPath};

/// How an outbound call ended, from the scheduler's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiFailure {
    /// 4xx other than 409/303: retrying will not help.
    Permanent { status: u16, message: String },
    /// 5xx, network error, or timeout: retry with backoff.
    Transient {
        status: Option<u16>,
        message: String,
    },
}

impl ApiFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::Permanent { message, .. } => message,
            Self::Transient { message, .. } => message,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Classify a non-2xx upload response status.
///
/// 303 and 409 mean the file is already there and are success from our side.
/// Other 4xx are permanent; everything else is worth retrying.
pub fn classify_failure_status(status: StatusCode, body: String) -> Option<ApiFailure> {
    if status == StatusCode::SEE_OTHER || status == StatusCode::CONFLICT {
        return None;
    }
    let message = format!("{}: {}", status.as_u16(), body);
    if status.is_client_error() {
        Some(ApiFailure::Permanent {
            status: status.as_u16(),
            message,
        })
    } else {
        Some(ApiFailure::Transient {
            status: Some(status.as_u16()),
            message,
        })
    }
}

/// One entry in the release file list sent when creating a release.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseFileEntry {
    pub name: String,
    pub url: String,
    pub size: u64,
    pub sha256: String,
    pub filetype: String,
    pub released_by: String,
    pub date: String,
    pub metadata: serde_json::Value,
}

impl ReleaseFileEntry {
    pub fn new(
        relpath: &RelPath,
        size: u64,
        sha256: &ContentHash,
        released_by: &str,
        date: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            name: relpath.as_str().to_string(),
            // not used by the server but must be set
            url: relpath.as_str().to_string(),
            size,
            sha256: sha256.as_str().to_string(),
            filetype: FileType::Output.as_str().to_string(),
            released_by: released_by.to_string(),
            date: date.to_rfc3339(),
            metadata: serde_json::json!({"tool": "airlock"}),
        }
    }
}

#[derive(Debug, Serialize)]
struct FileList<'a> {
    files: &'a [ReleaseFileEntry],
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CreateReleaseResponse {
    release_id: String,
}

/// HTTP client for the Jobs site, carrying the endpoint and backend token.
#[derive(Clone)]
pub struct JobsApiClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl JobsApiClient {
    pub fn new(
        endpoint: String,
        token: Option<String>,
        attempt_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            token,
        })
    }

    fn auth(&self, req: reqwest::RequestBuilder, username: &str) -> reqwest::RequestBuilder {
        let req = req.header("OS-User", username);
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {token}")),
            None => req,
        }
    }

    /// Create a release for a workspace. Returns the Jobs-site release id.
    pub async fn create_release(
        &self,
        workspace: &str,
        files: &[ReleaseFileEntry],
        released_by: &str,
    ) -> Result<String, ApiFailure> {
        let url = format!("{}/releases/workspace/{workspace}", self.endpoint);
        let body = FileList {
            files,
            metadata: serde_json::json!({"tool": "airlock"}),
        };

        let response = self
            .auth(self.http.post(&url).json(&body), released_by)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(request_failure)?;

        let status = response.status();
        if status.is_success() {
            let parsed: CreateReleaseResponse =
                response.json().await.map_err(|e| ApiFailure::Transient {
                    status: Some(status.as_u16()),
                    message: format!("bad create-release response: {e}"),
                })?;
            return Ok(parsed.release_id);
        }

        let body = response.text().await.unwrap_or_default();
        // 409 on create means the release already exists upstream; the id is
        // carried in the body the same way as on success.
        if status == StatusCode::CONFLICT {
            if let Ok(parsed) = serde_json::from_str::<CreateReleaseResponse>(&body) {
                return Ok(parsed.release_id);
            }
        }
        Err(classify_failure_status(status, body).unwrap_or(ApiFailure::Transient {
            status: Some(status.as_u16()),
            message: "unclassified create-release response".to_string(),
        }))
    }

    /// Upload one file's bytes to an existing release. `Ok(())` covers both a
    /// fresh upload and an already-uploaded (303/409) response.
    pub async fn upload_file(
        &self,
        release_id: &str,
        relpath: &RelPath,
        bytes: Vec<u8>,
        released_by: &str,
    ) -> Result<(), ApiFailure> {
        let url = format!("{}/releases/release/{release_id}", self.endpoint);
        let response = self
            .auth(self.http.post(&url), released_by)
            .header(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", relpath),
            )
            .header("Content-Type", "application/octet-stream")
            .header("Accept", "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(request_failure)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        match classify_failure_status(status, body) {
            None => Ok(()),
            Some(failure) => Err(failure),
        }
    }
}

fn request_failure(err: reqwest::Error) -> ApiFailure {
    // Timeouts and connection errors are transient by definition; a 4xx can
    // only arrive with a response, which is handled above.
    ApiFailure::Transient {
        status: None,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success_variants() {
        assert_eq!(
            classify_failure_status(StatusCode::SEE_OTHER, String::new()),
            None
        );
        assert_eq!(
            classify_failure_status(StatusCode::CONFLICT, String::new()),
            None
        );
    }

    #[test]
    fn test_classify_permanent() {
        let failure =
            classify_failure_status(StatusCode::BAD_REQUEST, "nope".to_string()).unwrap();
        assert!(failure.is_permanent());
        assert!(failure.message().contains("400"));

        let failure =
            classify_failure_status(StatusCode::UNAUTHORIZED, String::new()).unwrap();
        assert!(failure.is_permanent());

        let failure = classify_failure_status(StatusCode::FORBIDDEN, String::new()).unwrap();
        assert!(failure.is_permanent());
    }

    #[test]
    fn test_classify_transient() {
        let failure =
            classify_failure_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).unwrap();
        assert!(!failure.is_permanent());

        let failure =
            classify_failure_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()).unwrap();
        assert!(!failure.is_permanent());
    }

    #[test]
    fn test_release_file_entry_shape() {
        let entry = ReleaseFileEntry::new(
            &RelPath::new("output/a.csv").unwrap(),
            6,
            &ContentHash::from("abc123"),
            "carol",
            chrono::Utc::now(),
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["name"], "output/a.csv");
        assert_eq!(json["sha256"], "abc123");
        assert_eq!(json["filetype"], "output");
        assert_eq!(json["released_by"], "carol");
        assert_eq!(json["metadata"]["tool"], "airlock");
    }
}
