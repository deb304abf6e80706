//! Warden kubehub: discovery and the kube-backed watch transport.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{Api, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};
use warden_core::{
    Action, ResourceIdentity, ResourceSnapshot, Settings, StreamFault, Subscription, SubscriptionHandle,
    WatchScope, WatchTransport,
};

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_uid(uid_str: &str) -> Result<warden_core::Uid> {
    let u = uuid::Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

/// Decode a watched object into a snapshot. `fallback_kind` is used when the
/// object carries no type meta.
pub fn snapshot_from(obj: &DynamicObject, fallback_kind: &str) -> Result<ResourceSnapshot> {
    let meta = &obj.metadata;
    let uid_str = meta.uid.as_deref().ok_or_else(|| anyhow!("object missing metadata.uid"))?;
    let uid = to_uid(uid_str)?;
    let name = meta.name.clone().ok_or_else(|| anyhow!("object {} missing metadata.name", uid_str))?;
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| fallback_kind.to_string());
    let mut payload = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut payload);
    Ok(ResourceSnapshot {
        identity: ResourceIdentity { uid, namespace: meta.namespace.clone(), name, kind },
        generation: meta.generation.unwrap_or(0).max(0) as u64,
        deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0),
        finalizers: meta.finalizers.iter().flatten().cloned().collect(),
        payload,
    })
}

/// 410 Gone is the server telling us our resource version is too old.
pub fn classify_error_response(resp: &ErrorResponse) -> StreamFault {
    if resp.code == 410 {
        StreamFault::Expired(format!("{} ({})", resp.message, resp.reason))
    } else {
        StreamFault::Unclassified(format!("watch error {}: {} ({})", resp.code, resp.message, resp.reason))
    }
}

pub fn classify_kube_error(err: &kube::Error) -> StreamFault {
    match err {
        kube::Error::Api(resp) => classify_error_response(resp),
        other => StreamFault::Unclassified(other.to_string()),
    }
}

/// Watch transport over the Kubernetes API for one resource kind.
pub struct KubeTransport {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
    params: WatchParams,
    next_id: AtomicU64,
    live: Mutex<FxHashSet<u64>>,
}

impl KubeTransport {
    /// Resolve `gvk_key` through discovery using the default client configuration.
    pub async fn connect(gvk_key: &str, settings: &Settings) -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Self::with_client(client, gvk_key, settings).await
    }

    pub async fn with_client(client: Client, gvk_key: &str, settings: &Settings) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (resource, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        info!(gvk = %gvk_key, namespaced, plural = %resource.plural, "watch transport ready");
        Ok(Self::new(client, resource, namespaced, settings))
    }

    pub fn new(client: Client, resource: ApiResource, namespaced: bool, settings: &Settings) -> Self {
        Self {
            client,
            resource,
            namespaced,
            params: watch_params(settings),
            next_id: AtomicU64::new(1),
            live: Mutex::new(FxHashSet::default()),
        }
    }

    /// CRD-style name of the watched resource, e.g. `widgets.example.com`.
    pub fn crd_name(&self) -> String {
        if self.resource.group.is_empty() {
            self.resource.plural.clone()
        } else {
            format!("{}.{}", self.resource.plural, self.resource.group)
        }
    }

    fn api_for(&self, scope: &WatchScope) -> Api<DynamicObject> {
        if !self.namespaced {
            return Api::all_with(self.client.clone(), &self.resource);
        }
        match scope {
            WatchScope::AllNamespaces => Api::all_with(self.client.clone(), &self.resource),
            WatchScope::DefaultNamespace => Api::default_namespaced_with(self.client.clone(), &self.resource),
            WatchScope::Namespace(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
        }
    }
}

fn watch_params(settings: &Settings) -> WatchParams {
    let wp = WatchParams::default().timeout(settings.watch_timeout_secs);
    if settings.watch_bookmarks {
        wp
    } else {
        wp.disable_bookmarks()
    }
}

type RawStream = BoxStream<'static, kube::Result<WatchEvent<DynamicObject>>>;

struct WatchCursor {
    api: Api<DynamicObject>,
    params: WatchParams,
    kind: String,
    resource_version: String,
    inner: Option<RawStream>,
    done: bool,
}

impl WatchCursor {
    fn emit(&mut self, action: Action, obj: DynamicObject) -> Result<warden_core::WatchEvent, StreamFault> {
        if let Some(rv) = obj.metadata.resource_version.as_ref() {
            self.resource_version = rv.clone();
        }
        match snapshot_from(&obj, &self.kind) {
            Ok(snapshot) => Ok(warden_core::WatchEvent { action, snapshot }),
            Err(e) => {
                self.done = true;
                Err(StreamFault::Unclassified(format!("decoding {} event: {:#}", action, e)))
            }
        }
    }

    /// Next decoded event. Server-side timeouts are resumed from the last seen
    /// resource version; any error ends the stream after being yielded.
    async fn next(&mut self) -> Option<Result<warden_core::WatchEvent, StreamFault>> {
        loop {
            if self.done {
                return None;
            }
            if self.inner.is_none() {
                match self.api.watch(&self.params, &self.resource_version).await {
                    Ok(s) => self.inner = Some(s.boxed()),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(classify_kube_error(&e)));
                    }
                }
            }
            let Some(inner) = self.inner.as_mut() else { continue };
            match inner.next().await {
                None => {
                    debug!(kind = %self.kind, rv = %self.resource_version, "watch request ended; resuming");
                    self.inner = None;
                }
                Some(Ok(WatchEvent::Added(o))) => return Some(self.emit(Action::Added, o)),
                Some(Ok(WatchEvent::Modified(o))) => return Some(self.emit(Action::Modified, o)),
                Some(Ok(WatchEvent::Deleted(o))) => return Some(self.emit(Action::Deleted, o)),
                Some(Ok(WatchEvent::Bookmark(b))) => {
                    self.resource_version = b.metadata.resource_version;
                }
                Some(Ok(WatchEvent::Error(resp))) => {
                    self.done = true;
                    return Some(Err(classify_error_response(&resp)));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(classify_kube_error(&e)));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl WatchTransport for KubeTransport {
    async fn subscribe(&self, scope: &WatchScope) -> Result<Subscription, StreamFault> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = SubscriptionHandle { id, scope: scope.clone() };
        let api = self.api_for(scope);
        // Resource version "0" lists current objects as synthetic ADDED events first.
        let mut cursor = WatchCursor {
            api,
            params: self.params.clone(),
            kind: self.resource.kind.clone(),
            resource_version: "0".to_string(),
            inner: None,
            done: false,
        };
        // Open eagerly so subscribe failures surface here rather than as the first event.
        let first = cursor.api.watch(&cursor.params, &cursor.resource_version).await.map_err(|e| classify_kube_error(&e))?;
        cursor.inner = Some(first.boxed());
        let events = futures::stream::unfold(cursor, |mut c| async move { c.next().await.map(|item| (item, c)) }).boxed();

        self.live.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
        info!(kind = %self.resource.kind, handle = %handle, "watch subscribed");
        Ok(Subscription { handle, events })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StreamFault> {
        let removed = self.live.lock().unwrap_or_else(|e| e.into_inner()).remove(&handle.id);
        if removed {
            debug!(kind = %self.resource.kind, handle = %handle, "watch unsubscribed");
            Ok(())
        } else {
            warn!(kind = %self.resource.kind, handle = %handle, "unsubscribe for unknown watch");
            Err(StreamFault::Unclassified(format!("{} is not an active subscription", handle)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(v: serde_json::Value) -> DynamicObject {
        serde_json::from_value(v).expect("valid object")
    }

    #[test]
    fn parse_gvk_key_parses_core_and_group() {
        let gvk = parse_gvk_key("v1/ConfigMap").expect("ok");
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("", "v1", "ConfigMap"));
        let gvk = parse_gvk_key("example.com/v1/Widget").expect("ok");
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("example.com", "v1", "Widget"));
    }

    #[test]
    fn parse_gvk_key_invalid_returns_err() {
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    #[test]
    fn snapshot_from_reads_metadata_and_strips_managed_fields() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {
                "name": "w1",
                "namespace": "prod",
                "uid": "00000000-0000-0000-0000-000000000001",
                "generation": 4,
                "resourceVersion": "120",
                "deletionTimestamp": "2024-05-01T10:00:00Z",
                "finalizers": ["widgets.example.com/finalizer"],
                "managedFields": [{ "manager": "kubectl" }]
            },
            "spec": { "size": 3 }
        }));
        let snap = snapshot_from(&obj, "Fallback").expect("decoded");
        assert_eq!(snap.identity.name, "w1");
        assert_eq!(snap.identity.namespace.as_deref(), Some("prod"));
        assert_eq!(snap.identity.kind, "Widget");
        assert_eq!(snap.identity.uid[15], 1);
        assert_eq!(snap.generation, 4);
        assert!(snap.is_marked_for_deletion());
        assert!(snap.has_finalizer("widgets.example.com/finalizer"));
        assert!(snap.payload["metadata"].get("managedFields").is_none());
        assert_eq!(snap.payload["spec"]["size"], 3);
    }

    #[test]
    fn snapshot_from_defaults_generation_and_kind() {
        let mut obj = dynamic(serde_json::json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": { "name": "w2", "uid": "00000000-0000-0000-0000-000000000002" }
        }));
        obj.types = None;
        let snap = snapshot_from(&obj, "Widget").expect("decoded");
        assert_eq!(snap.generation, 0);
        assert_eq!(snap.identity.kind, "Widget");
        assert!(snap.finalizers.is_empty());
        assert!(snap.identity.namespace.is_none());
    }

    #[test]
    fn snapshot_from_requires_uid() {
        let obj = dynamic(serde_json::json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w3" } }));
        assert!(snapshot_from(&obj, "Widget").is_err());
        let obj = dynamic(serde_json::json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "w3", "uid": "not-a-uuid" } }));
        assert!(snapshot_from(&obj, "Widget").is_err());
    }

    #[test]
    fn gone_is_transient_everything_else_is_not() {
        let gone = ErrorResponse { status: "Failure".into(), message: "too old resource version: 1 (5)".into(), reason: "Expired".into(), code: 410 };
        assert!(classify_error_response(&gone).is_transient());
        let forbidden = ErrorResponse { status: "Failure".into(), message: "forbidden".into(), reason: "Forbidden".into(), code: 403 };
        assert!(!classify_error_response(&forbidden).is_transient());
        assert!(classify_kube_error(&kube::Error::Api(gone)).is_transient());
    }
}
