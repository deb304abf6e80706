use std::fmt;
use std::sync::Arc;

use warden_core::{Action, ResourceSnapshot};

/// Identifies the event source an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    pub controller: String,
    pub gvk_key: String,
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.controller, self.gvk_key)
    }
}

/// Reconciliation entry point. Called synchronously from a session's delivery
/// task; the next event of that session waits until `handle` returns.
pub trait Dispatcher: Send + Sync + 'static {
    fn handle(&self, action: Action, snapshot: &Arc<ResourceSnapshot>, source: &SourceHandle);
}

impl<F> Dispatcher for F
where
    F: Fn(Action, &Arc<ResourceSnapshot>, &SourceHandle) + Send + Sync + 'static,
{
    fn handle(&self, action: Action, snapshot: &Arc<ResourceSnapshot>, source: &SourceHandle) {
        self(action, snapshot, source)
    }
}
