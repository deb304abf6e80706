//! Warden store: latest snapshot per resource and last processed generation per resource.
//!
//! Both maps are shared by every watch session of an event source. They are
//! sharded (`dashmap`) so deliveries for different resources never wait on a
//! single lock.

#![forbid(unsafe_code)]

use std::hash::BuildHasherDefault;
use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxHasher;
use tracing::trace;
use warden_core::{uid_string, ResourceSnapshot, Uid};

type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<FxHasher>>;

/// Latest delivered snapshot per resource uid. Last write wins.
#[derive(Debug, Default)]
pub struct ResourceCache {
    map: FxDashMap<Uid, Arc<ResourceSnapshot>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `snapshot`, replacing any previous one for the same uid.
    pub fn upsert(&self, snapshot: Arc<ResourceSnapshot>) {
        let uid = *snapshot.uid();
        trace!(uid = %uid_string(&uid), generation = snapshot.generation, "cache upsert");
        self.map.insert(uid, snapshot);
    }

    pub fn get(&self, uid: &Uid) -> Option<Arc<ResourceSnapshot>> {
        self.map.get(uid).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, uid: &Uid) -> Option<Arc<ResourceSnapshot>> {
        self.map.remove(uid).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Point-in-time copy of all cached snapshots (unordered).
    pub fn snapshots(&self) -> Vec<Arc<ResourceSnapshot>> {
        self.map.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

/// Last generation dispatched to completion, per resource uid.
#[derive(Debug, Default)]
pub struct GenerationGate {
    processed: FxDashMap<Uid, u64>,
}

impl GenerationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a delivery can be dropped because its generation was already handled.
    ///
    /// Resources marked for deletion are never skipped: their generation does not
    /// move while finalizers are being removed.
    pub fn should_skip(&self, snapshot: &ResourceSnapshot, generation_aware: bool) -> bool {
        if !generation_aware || snapshot.is_marked_for_deletion() {
            return false;
        }
        match self.processed.get(snapshot.uid()) {
            None => false,
            Some(last) => snapshot.generation <= *last.value(),
        }
    }

    /// Record the snapshot's generation if the controller tracks generations and
    /// the resource carries its finalizer. Otherwise leave the entry as it was.
    pub fn mark_processed(&self, snapshot: &ResourceSnapshot, generation_aware: bool, finalizer: &str) {
        if generation_aware && snapshot.has_finalizer(finalizer) {
            self.processed.insert(*snapshot.uid(), snapshot.generation);
        }
    }

    pub fn evict(&self, uid: &Uid) -> Option<u64> {
        self.processed.remove(uid).map(|(_, g)| g)
    }

    pub fn last_processed(&self, uid: &Uid) -> Option<u64> {
        self.processed.get(uid).map(|g| *g.value())
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}
