//! Warden core types: resource identities, snapshots and watch events.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod settings;
mod transport;

pub use settings::Settings;
pub use transport::{StreamFault, Subscription, SubscriptionHandle, WatchStream, WatchTransport};

pub type Uid = [u8; 16];

/// Hyphenated UUID form of a uid, for logs and error messages.
pub fn uid_string(uid: &Uid) -> String {
    uuid::Uuid::from_bytes(*uid).hyphenated().to_string()
}

/// Identity of a resource as assigned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    pub uid: Uid,
    pub namespace: Option<String>,
    pub name: String,
    pub kind: String,
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{} ({})", self.kind, ns, self.name, uid_string(&self.uid)),
            None => write!(f, "{}/{} ({})", self.kind, self.name, uid_string(&self.uid)),
        }
    }
}

/// Latest observed state of a resource. Replaced wholesale on every delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub identity: ResourceIdentity,
    pub generation: u64,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub finalizers: SmallVec<[String; 2]>,
    /// Raw object with `metadata.managedFields` stripped.
    pub payload: serde_json::Value,
}

impl ResourceSnapshot {
    pub fn uid(&self) -> &Uid {
        &self.identity.uid
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Action {
    Added,
    Modified,
    Deleted,
    Error,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Added => "ADDED",
            Action::Modified => "MODIFIED",
            Action::Deleted => "DELETED",
            Action::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: Action,
    pub snapshot: ResourceSnapshot,
}

/// Namespace selection of a single watch subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchScope {
    AllNamespaces,
    DefaultNamespace,
    Namespace(String),
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchScope::AllNamespaces => f.write_str("(all)"),
            WatchScope::DefaultNamespace => f.write_str("(default)"),
            WatchScope::Namespace(ns) => f.write_str(ns),
        }
    }
}

/// Marker accepted in namespace lists meaning "the client's default namespace".
///
/// Namespace names are DNS-1123 labels (lowercase alphanumerics and `-`), so
/// this value can never name a real namespace.
pub const WATCH_CURRENT_NAMESPACE: &str = "WATCH_CURRENT";

/// Namespace selection of a controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TargetScope {
    #[default]
    All,
    DefaultNamespace,
    /// An empty set behaves like `DefaultNamespace`.
    Namespaces(BTreeSet<String>),
}

impl TargetScope {
    /// Build a scope from a namespace list: empty means all namespaces,
    /// a list holding only [`WATCH_CURRENT_NAMESPACE`] means the default one.
    pub fn from_namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = namespaces
            .into_iter()
            .map(Into::into)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if set.is_empty() {
            TargetScope::All
        } else if set.len() == 1 && set.contains(WATCH_CURRENT_NAMESPACE) {
            TargetScope::DefaultNamespace
        } else {
            TargetScope::Namespaces(set)
        }
    }

    /// One watch scope per subscription the controller needs.
    pub fn watch_scopes(&self) -> Vec<WatchScope> {
        match self {
            TargetScope::All => vec![WatchScope::AllNamespaces],
            TargetScope::DefaultNamespace => vec![WatchScope::DefaultNamespace],
            TargetScope::Namespaces(set) if set.is_empty() => vec![WatchScope::DefaultNamespace],
            TargetScope::Namespaces(set) => set.iter().cloned().map(WatchScope::Namespace).collect(),
        }
    }
}

pub mod prelude {
    pub use super::{
        Action, ResourceIdentity, ResourceSnapshot, StreamFault, Subscription, SubscriptionHandle,
        TargetScope, Uid, WatchEvent, WatchScope, WatchStream, WatchTransport,
    };
}
