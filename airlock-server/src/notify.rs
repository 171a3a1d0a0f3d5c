//! Lifecycle event sink.
//!
//! The controller emits typed events after each successful operation; a sink
//! forwards them to whatever notifier is wired up. Delivery is best-effort
//! and never blocks or fails a controller operation.

use std::sync::Mutex;

use tracing::info;

use airlock_core::LifecycleEvent;

pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &LifecycleEvent);
}

/// Sink that writes events to the structured log. The external notifier
/// tails these; org/repo identify the output-checking tracker to file
/// issues against.
pub struct LogSink {
    org: Option<String>,
    repo: Option<String>,
}

impl LogSink {
    pub fn new(org: Option<String>, repo: Option<String>) -> Self {
        Self { org, repo }
    }
}

impl EventSink for LogSink {
    fn deliver(&self, event: &LifecycleEvent) {
        info!(
            kind = event.kind.as_str(),
            request = %event.request,
            workspace = %event.workspace,
            author = %event.author,
            actor = %event.actor,
            turn = event.turn,
            org = self.org.as_deref().unwrap_or(""),
            repo = self.repo.as_deref().unwrap_or(""),
            "lifecycle event"
        );
    }
}

/// Test sink that records every delivered event.
pub struct CollectingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for CollectingSink {
    fn deliver(&self, event: &LifecycleEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
