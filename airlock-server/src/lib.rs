pub mod api;
pub mod config;
pub mod controller;
pub mod identity;
pub mod jobs_api;
pub mod notify;
pub mod store;
pub mod uploader;
pub mod workspace;

pub use api::{router, AppState};
pub use config::Config;
pub use controller::RequestController;
pub use store::SqliteStore;
pub use uploader::UploadScheduler;

/// Service version, from the crate metadata.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
