//! Boundary to the remote watch API.

use std::fmt;

use futures::stream::BoxStream;

use crate::{WatchEvent, WatchScope};

/// Faults surfaced by a watch stream.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StreamFault {
    /// Server-initiated expiry (HTTP 410 Gone, resource version too old).
    /// Recoverable by resubscribing from a fresh baseline.
    #[error("watch expired: {0}")]
    Expired(String),
    /// Any other termination. Not recoverable locally.
    #[error("watch failed: {0}")]
    Unclassified(String),
}

impl StreamFault {
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamFault::Expired(_))
    }
}

/// Opaque handle identifying one live subscription of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub scope: WatchScope,
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}[{}]", self.id, self.scope)
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StreamFault>>;

pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: WatchStream,
}

/// Remote watch API consumed by watch sessions.
#[async_trait::async_trait]
pub trait WatchTransport: Send + Sync + 'static {
    /// Open a subscription starting from a fresh baseline.
    async fn subscribe(&self, scope: &WatchScope) -> Result<Subscription, StreamFault>;

    /// Release server-side resources held for `handle`.
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StreamFault>;
}
