use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, Level};

use airlock_server::api::AppState;
use airlock_server::config::Config;
use airlock_server::identity::UserDirectory;
use airlock_server::jobs_api::JobsApiClient;
use airlock_server::notify::LogSink;
use airlock_server::workspace::{SnapshotStore, WorkspaceStore};
use airlock_server::{router, RequestController, SqliteStore, UploadScheduler};

/// Deadline for a single inbound controller operation.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("starting airlock {}", airlock_server::version());

    let config = Config::from_env().context("failed to load configuration")?;

    let db_path = config.state_dir.join("airlock.db");
    info!("using state database: {}", db_path.display());
    let store = Arc::new(SqliteStore::new(&db_path).context("failed to open state database")?);

    let users = Arc::new(match &config.dev_users_file {
        Some(path) => {
            info!("resolving users from {}", path.display());
            UserDirectory::load(path)?
        }
        None => UserDirectory::empty(),
    });

    let sink = Arc::new(LogSink::new(
        config.output_checking_org.clone(),
        config.output_checking_repo.clone(),
    ));
    let workspaces = WorkspaceStore::new(config.workspace_dir.clone());
    let snapshots = SnapshotStore::new(config.request_dir.clone());

    let controller = Arc::new(RequestController::new(
        Arc::clone(&store),
        workspaces,
        snapshots.clone(),
        sink.clone(),
        config.upload_job_deadline,
    ));

    let jobs_client = JobsApiClient::new(
        config.jobs_api_endpoint.clone(),
        config.jobs_api_token.clone(),
        config.upload_attempt_timeout,
    )
    .context("failed to build Jobs API client")?;

    // The scheduler resumes any jobs left pending by a previous run as soon
    // as it starts polling.
    let scheduler = UploadScheduler::new(
        Arc::clone(&store),
        snapshots,
        jobs_client,
        sink,
        config.upload_max_in_flight,
        config.upload_max_attempts,
    );
    tokio::spawn(async move { scheduler.run().await });

    let state = Arc::new(AppState {
        controller,
        users,
        request_timeout: REQUEST_TIMEOUT,
    });
    let app = router(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("server listening on port {}", config.port);
    axum::serve(listener, app).await?;

    Ok(())
}
