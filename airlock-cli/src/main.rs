//! Administrative CLI for the airlock service.
//!
//! Operates directly on the state database; intended for operators inside
//! the enclave, not end users. Exit codes: 0 success, 1 validation error,
//! 2 state error, 3 I/O error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use airlock_core::{AirlockError, AuditKind, RequestId, RequestStatus};
use airlock_server::store::{AuditQuery, StoreError};
use airlock_server::SqliteStore;

const EXIT_VALIDATION: u8 = 1;
const EXIT_STATE: u8 = 2;
const EXIT_IO: u8 = 3;

/// Airlock enclave administration
#[derive(Parser, Debug)]
#[command(name = "airlock-admin")]
#[command(about = "Administrative commands for the airlock service", long_about = None)]
struct Cli {
    /// Path to the state database
    #[arg(long, default_value = "airlock.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Query the audit log
    Audit(AuditArgs),
    /// List release requests
    Requests(RequestsArgs),
    /// Re-queue failed upload jobs for an approved request
    ReRelease(ReReleaseArgs),
}

#[derive(Parser, Debug)]
struct AuditArgs {
    /// Filter by acting user
    #[arg(long)]
    user: Option<String>,

    /// Filter by workspace
    #[arg(long)]
    workspace: Option<String>,

    /// Filter by request id
    #[arg(long)]
    request: Option<String>,

    /// Filter by file group
    #[arg(long)]
    group: Option<String>,

    /// Maximum number of entries to show
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

#[derive(Parser, Debug)]
struct RequestsArgs {
    /// Filter by workspace
    #[arg(long)]
    workspace: Option<String>,

    /// Filter by author
    #[arg(long)]
    author: Option<String>,

    /// Filter by status (e.g. APPROVED)
    #[arg(long)]
    status: Option<String>,
}

#[derive(Parser, Debug)]
struct ReReleaseArgs {
    /// Request id to re-queue
    request: String,

    /// Operator username recorded in the audit log
    #[arg(long, default_value = "admin")]
    user: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let store = match SqliteStore::new(&cli.db) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("failed to open database {}: {e}", cli.db.display());
            return ExitCode::from(EXIT_IO);
        }
    };

    let result = match cli.command {
        Commands::Audit(args) => audit(&store, args).await,
        Commands::Requests(args) => requests(&store, args).await,
        Commands::ReRelease(args) => re_release(&store, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Validation(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(EXIT_VALIDATION)
        }
        Err(CliError::State(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(EXIT_STATE)
        }
        Err(CliError::Io(msg)) => {
            eprintln!("{msg}");
            ExitCode::from(EXIT_IO)
        }
    }
}

enum CliError {
    Validation(String),
    State(String),
    Io(String),
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(
                domain @ (AirlockError::InvalidTransition { .. }
                | AirlockError::Conflict(_)
                | AirlockError::Precondition(_)
                | AirlockError::Invariant(_)),
            ) => Self::State(domain.to_string()),
            StoreError::Domain(domain) => Self::Validation(domain.to_string()),
            StoreError::Storage(msg) | StoreError::Corruption(msg) => Self::Io(msg),
        }
    }
}

async fn audit(store: &Arc<SqliteStore>, args: AuditArgs) -> Result<(), CliError> {
    let entries = store
        .query_audit(AuditQuery {
            actor: args.user,
            workspace: args.workspace,
            request: args.request.map(RequestId::from),
            group: args.group,
            limit: Some(args.limit),
        })
        .await?;
    for entry in entries {
        println!("{entry}");
    }
    Ok(())
}

async fn requests(store: &Arc<SqliteStore>, args: RequestsArgs) -> Result<(), CliError> {
    let status = match args.status.as_deref() {
        Some(raw) => Some(RequestStatus::parse(raw).ok_or_else(|| {
            CliError::Validation(format!("unknown status {raw}"))
        })?),
        None => None,
    };

    let records = store
        .list_requests(args.workspace, args.author, status)
        .await?;
    for record in records {
        println!(
            "{}  {:<20} workspace={} author={} turn={} created={}",
            record.id,
            record.status.as_str(),
            record.workspace,
            record.author,
            record.review_turn,
            record.created_at.format("%Y-%m-%dT%H:%M:%S"),
        );
    }
    Ok(())
}

async fn re_release(store: &Arc<SqliteStore>, args: ReReleaseArgs) -> Result<(), CliError> {
    let id = RequestId::from(args.request);
    let detail = store.get_request(id.clone()).await?;
    if detail.record.status != RequestStatus::Approved {
        return Err(CliError::State(format!(
            "request {id} is {}, only APPROVED requests can be re-released",
            detail.record.status
        )));
    }

    let audit = airlock_core::AuditEvent::new(
        AuditKind::RequestRerelease,
        args.user,
        detail.record.workspace.clone(),
        id.clone(),
        detail.record.review_turn,
    );
    let deadline = chrono::Utc::now() + chrono::Duration::hours(1);
    let reset = store.reset_failed_jobs(id.clone(), deadline, audit).await?;
    println!("re-queued {reset} failed upload job(s) for request {id}");
    Ok(())
}
