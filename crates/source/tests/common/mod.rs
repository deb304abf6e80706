#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use rustc_hash::{FxHashMap, FxHashSet};
use warden_config::{ControllerConfiguration, ControllerIdentity};
use warden_core::{
    Action, ResourceIdentity, ResourceSnapshot, StreamFault, Subscription, SubscriptionHandle, TargetScope, Uid,
    WatchEvent, WatchScope, WatchTransport,
};
use warden_source::{Dispatcher, SourceHandle};

pub const FINALIZER: &str = "f";

type Feed = mpsc::UnboundedSender<Result<WatchEvent, StreamFault>>;

/// In-memory watch API: tests push events into the live feed of a scope.
#[derive(Default)]
pub struct FakeTransport {
    next_id: AtomicU64,
    feeds: Mutex<FxHashMap<WatchScope, Feed>>,
    subscribed: Mutex<Vec<SubscriptionHandle>>,
    unsubscribed: Mutex<Vec<SubscriptionHandle>>,
    fail_unsubscribe: Mutex<FxHashSet<WatchScope>>,
    refuse_subscribe: Mutex<FxHashSet<WatchScope>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, scope: &WatchScope, item: Result<WatchEvent, StreamFault>) {
        let feeds = self.feeds.lock().unwrap();
        let feed = feeds.get(scope).expect("scope subscribed");
        feed.unbounded_send(item).expect("feed open");
    }

    pub fn send(&self, scope: &WatchScope, action: Action, snapshot: ResourceSnapshot) {
        self.push(scope, Ok(WatchEvent { action, snapshot }));
    }

    /// End the live stream of `scope` without a fault.
    pub fn end(&self, scope: &WatchScope) {
        self.feeds.lock().unwrap().remove(scope);
    }

    pub fn fail_unsubscribe_for(&self, scope: WatchScope) {
        self.fail_unsubscribe.lock().unwrap().insert(scope);
    }

    pub fn refuse_subscribe_for(&self, scope: WatchScope) {
        self.refuse_subscribe.lock().unwrap().insert(scope);
    }

    pub fn subscribed(&self) -> Vec<SubscriptionHandle> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn subscribe_count(&self, scope: &WatchScope) -> usize {
        self.subscribed.lock().unwrap().iter().filter(|h| &h.scope == scope).count()
    }

    pub fn unsubscribed(&self) -> Vec<SubscriptionHandle> {
        self.unsubscribed.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl WatchTransport for FakeTransport {
    async fn subscribe(&self, scope: &WatchScope) -> Result<Subscription, StreamFault> {
        if self.refuse_subscribe.lock().unwrap().contains(scope) {
            return Err(StreamFault::Unclassified(format!("forbidden: {}", scope)));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = SubscriptionHandle { id, scope: scope.clone() };
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().unwrap().insert(scope.clone(), tx);
        self.subscribed.lock().unwrap().push(handle.clone());
        Ok(Subscription { handle, events: rx.boxed() })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StreamFault> {
        self.unsubscribed.lock().unwrap().push(handle.clone());
        if self.fail_unsubscribe.lock().unwrap().contains(&handle.scope) {
            return Err(StreamFault::Unclassified(format!("connection reset closing {}", handle)));
        }
        Ok(())
    }
}

/// Dispatcher recording `(action, name, generation)` per call.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<(Action, String, u64)>>>,
}

impl Recorder {
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        let calls = Arc::clone(&self.calls);
        Arc::new(move |action: Action, snap: &Arc<ResourceSnapshot>, _src: &SourceHandle| {
            calls.lock().unwrap().push((action, snap.identity.name.clone(), snap.generation));
        })
    }

    pub fn calls(&self) -> Vec<(Action, String, u64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub fn uid(n: u8) -> Uid {
    let mut u = [0u8; 16];
    u[0] = n;
    u
}

pub fn snap(id: u8, name: &str, generation: u64, finalizers: &[&str]) -> ResourceSnapshot {
    ResourceSnapshot {
        identity: ResourceIdentity { uid: uid(id), namespace: Some("ns".into()), name: name.into(), kind: "Widget".into() },
        generation,
        deletion_timestamp: None,
        finalizers: finalizers.iter().map(|s| s.to_string()).collect(),
        payload: serde_json::json!({ "spec": { "generation": generation } }),
    }
}

pub fn deleting(mut s: ResourceSnapshot) -> ResourceSnapshot {
    s.deletion_timestamp = Some(chrono::Utc::now());
    s
}

pub fn config(scope: TargetScope, generation_aware: bool) -> Arc<ControllerConfiguration> {
    let cfg = ControllerConfiguration::builder(ControllerIdentity::new("tests::WidgetController"), "widgets.example.com", "example.com/v1/Widget")
        .finalizer(FINALIZER)
        .generation_aware(generation_aware)
        .scope(scope)
        .build()
        .expect("valid configuration");
    Arc::new(cfg)
}

pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
