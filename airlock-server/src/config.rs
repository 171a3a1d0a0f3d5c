use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once at startup.
#[derive(Clone)]
pub struct Config {
    /// Base URL of the external Jobs-site API.
    pub jobs_api_endpoint: String,
    /// Bearer token for backend auth against the Jobs site.
    /// When unset, the service runs in dev mode and resolves logins from
    /// `dev_users_file` instead of the Jobs site.
    pub jobs_api_token: Option<String>,
    /// Root for service state (SQLite database lives here).
    pub work_dir: PathBuf,
    /// Root containing one directory per workspace.
    pub workspace_dir: PathBuf,
    /// Root for per-request snapshot directories.
    pub request_dir: PathBuf,
    /// JSON file mapping usernames to roles, used when no API token is set.
    pub dev_users_file: Option<PathBuf>,
    pub upload_max_in_flight: usize,
    pub upload_max_attempts: u32,
    pub upload_attempt_timeout: Duration,
    pub upload_job_deadline: Duration,
    /// Event sink hints for the external output-checking tracker.
    pub output_checking_org: Option<String>,
    pub output_checking_repo: Option<String>,
    pub port: u16,
    /// Directory for the state database. Defaults to `work_dir`.
    pub state_dir: PathBuf,
}

/// Read an optional setting that may arrive as a secret mounted into the
/// enclave: `{KEY}_FILE` names a file holding the value and wins over a
/// plain `{KEY}` variable. Blank values count as unset, so a cleared
/// `AIRLOCK_API_TOKEN` drops the service into dev-mode login resolution
/// rather than sending an empty bearer token upstream.
fn optional_env(key: &str) -> Result<Option<String>> {
    let raw = match env::var(format!("{key}_FILE")) {
        Ok(path) => fs::read_to_string(&path).with_context(|| {
            format!("{key}_FILE names a file that could not be read: {path}")
        })?,
        Err(_) => match env::var(key) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

fn read_duration_secs(key: &str, default_secs: u64) -> Result<Duration> {
    let secs = match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .with_context(|| format!("{} must be a number of seconds", key))?,
        Err(_) => default_secs,
    };
    Ok(Duration::from_secs(secs))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let jobs_api_endpoint = env::var("AIRLOCK_API_ENDPOINT")
            .context("AIRLOCK_API_ENDPOINT environment variable is required")?
            .trim_end_matches('/')
            .to_string();

        let jobs_api_token = optional_env("AIRLOCK_API_TOKEN")?;

        let work_dir = env::var("AIRLOCK_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let workspace_dir = env::var("AIRLOCK_WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("workspaces"));

        let request_dir = env::var("AIRLOCK_REQUEST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("requests"));

        let dev_users_file = env::var("AIRLOCK_DEV_USERS_FILE").ok().map(PathBuf::from);

        if jobs_api_token.is_none() && dev_users_file.is_none() {
            anyhow::bail!(
                "AIRLOCK_DEV_USERS_FILE is required when AIRLOCK_API_TOKEN is not set"
            );
        }

        let upload_max_in_flight = env::var("AIRLOCK_UPLOAD_MAX_INFLIGHT")
            .unwrap_or_else(|_| "4".to_string())
            .parse::<usize>()
            .context("AIRLOCK_UPLOAD_MAX_INFLIGHT must be a number")?;
        if upload_max_in_flight == 0 {
            anyhow::bail!("AIRLOCK_UPLOAD_MAX_INFLIGHT must be at least 1");
        }

        let upload_max_attempts = env::var("AIRLOCK_UPLOAD_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u32>()
            .context("AIRLOCK_UPLOAD_MAX_ATTEMPTS must be a number")?;

        let upload_attempt_timeout = read_duration_secs("AIRLOCK_UPLOAD_ATTEMPT_TIMEOUT_SECS", 30)?;
        let upload_job_deadline = read_duration_secs("AIRLOCK_UPLOAD_JOB_DEADLINE_SECS", 3600)?;

        let output_checking_org = env::var("AIRLOCK_OUTPUT_CHECKING_ORG").ok();
        let output_checking_repo = env::var("AIRLOCK_OUTPUT_CHECKING_REPO").ok();

        let port = env::var("PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("AIRLOCK_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.clone());

        Ok(Config {
            jobs_api_endpoint,
            jobs_api_token,
            work_dir,
            workspace_dir,
            request_dir,
            dev_users_file,
            upload_max_in_flight,
            upload_max_attempts,
            upload_attempt_timeout,
            upload_job_deadline,
            output_checking_org,
            output_checking_repo,
            port,
            state_dir,
        })
    }
}
