//! Principal resolution.
//!
//! The Jobs site owns identity; in deployment the single-use login token
//! exchange happens before traffic reaches this service, and requests arrive
//! with an authenticated username. Role data comes from the dev users file
//! when no backend token is configured.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use airlock_core::Principal;

#[derive(Debug, Deserialize)]
struct UserEntry {
    #[serde(default)]
    output_checker: bool,
    #[serde(default)]
    workspaces: Vec<String>,
    #[serde(default)]
    copiloted_workspaces: Vec<String>,
}

/// Username -> role-set directory, loaded once at startup.
pub struct UserDirectory {
    users: BTreeMap<String, UserEntry>,
}

impl UserDirectory {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read users file {}", path.display()))?;
        let users: BTreeMap<String, UserEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse users file {}", path.display()))?;
        Ok(Self { users })
    }

    pub fn empty() -> Self {
        Self {
            users: BTreeMap::new(),
        }
    }

    /// Deterministic lookup; unknown usernames resolve to no principal.
    pub fn resolve(&self, username: &str) -> Option<Principal> {
        let entry = self.users.get(username)?;
        Some(Principal {
            username: username.to_string(),
            output_checker: entry.output_checker,
            workspaces: entry.workspaces.iter().cloned().collect(),
            copiloted_workspaces: entry.copiloted_workspaces.iter().cloned().collect(),
        })
    }
}
