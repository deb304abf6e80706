use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use warden_config::{ConfigurationRegistry, ControllerConfiguration, ControllerIdentity};
use warden_core::{uid_string, Action, ResourceSnapshot, StreamFault, Uid, WatchScope, WatchTransport};
use warden_store::{GenerationGate, ResourceCache};

use crate::dispatch::{Dispatcher, SourceHandle};
use crate::session::{EventSink, SessionState, WatchSession};
use crate::supervisor::FaultReporter;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("event source already started")]
    AlreadyStarted,
    #[error("no configuration registered for controller '{0}'")]
    UnknownController(String),
    #[error("subscribing watch for {scope}: {source}")]
    Subscribe { scope: WatchScope, source: StreamFault },
    #[error("closing watch for {scope}: {source}")]
    Unsubscribe { scope: WatchScope, source: StreamFault },
    #[error("watch delivery for {scope} aborted: {reason}")]
    DeliveryAborted { scope: WatchScope, reason: String },
}

/// Cache, gate and dispatcher shared by every session of one source.
struct Pipeline {
    config: Arc<ControllerConfiguration>,
    handle: SourceHandle,
    cache: Arc<ResourceCache>,
    gate: Arc<GenerationGate>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl EventSink for Pipeline {
    fn on_event(&self, action: Action, snapshot: ResourceSnapshot) {
        let snapshot = Arc::new(snapshot);
        let uid = uid_string(snapshot.uid());
        debug!(controller = %self.handle.controller, %action, name = %snapshot.identity.name, %uid, "event received");

        // Readers must see the latest state even for events filtered below.
        self.cache.upsert(Arc::clone(&snapshot));

        if action == Action::Error {
            debug!(%action, %uid, generation = snapshot.generation, "skipping error event");
            return;
        }
        let generation_aware = self.config.generation_aware;
        if self.gate.should_skip(&snapshot, generation_aware) {
            debug!(%action, %uid, generation = snapshot.generation, "skipping event for already processed generation");
            return;
        }
        self.dispatcher.handle(action, &snapshot, &self.handle);
        self.gate.mark_processed(&snapshot, generation_aware, &self.config.finalizer_name);
    }
}

/// Watches one resource kind for one controller and forwards meaningful changes
/// to its dispatcher.
pub struct EventSource {
    pipeline: Arc<Pipeline>,
    transport: Arc<dyn WatchTransport>,
    faults: FaultReporter,
    sessions: Vec<WatchSession>,
}

impl EventSource {
    pub fn new(
        config: Arc<ControllerConfiguration>,
        transport: Arc<dyn WatchTransport>,
        dispatcher: Arc<dyn Dispatcher>,
        faults: FaultReporter,
    ) -> Self {
        let handle = SourceHandle { controller: config.name.clone(), gvk_key: config.gvk_key.clone() };
        let pipeline = Pipeline {
            config,
            handle,
            cache: Arc::new(ResourceCache::new()),
            gate: Arc::new(GenerationGate::new()),
            dispatcher,
        };
        Self { pipeline: Arc::new(pipeline), transport, faults, sessions: Vec::new() }
    }

    /// Build a source for a controller registered in `registry`.
    pub fn for_controller(
        registry: &ConfigurationRegistry,
        controller: &ControllerIdentity,
        transport: Arc<dyn WatchTransport>,
        dispatcher: Arc<dyn Dispatcher>,
        faults: FaultReporter,
    ) -> Result<Self, SourceError> {
        let config = registry
            .get_configuration_for(controller)
            .ok_or_else(|| SourceError::UnknownController(controller.controller_name()))?;
        Ok(Self::new(config, transport, dispatcher, faults))
    }

    pub fn configuration(&self) -> &ControllerConfiguration {
        &self.pipeline.config
    }

    pub fn handle(&self) -> &SourceHandle {
        &self.pipeline.handle
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.pipeline.cache
    }

    pub fn gate(&self) -> &Arc<GenerationGate> {
        &self.pipeline.gate
    }

    pub fn session_states(&self) -> Vec<(WatchScope, SessionState)> {
        self.sessions.iter().map(|s| (s.scope().clone(), s.state())).collect()
    }

    /// Open one session per scope of the controller's target scope.
    pub async fn start(&mut self) -> Result<(), SourceError> {
        if !self.sessions.is_empty() {
            return Err(SourceError::AlreadyStarted);
        }
        let gvk_key = self.pipeline.config.gvk_key.clone();
        for scope in self.pipeline.config.target_scope.watch_scopes() {
            let sink: Arc<dyn EventSink> = self.pipeline.clone();
            match WatchSession::open(&gvk_key, scope.clone(), Arc::clone(&self.transport), sink, self.faults.clone()).await {
                Ok(session) => {
                    info!(controller = %self.pipeline.handle.controller, gvk = %gvk_key, ns = %scope, "registered watch");
                    self.sessions.push(session);
                }
                Err(source) => {
                    warn!(gvk = %gvk_key, ns = %scope, error = %source, "subscribe failed; closing opened watches");
                    self.close().await;
                    return Err(SourceError::Subscribe { scope, source });
                }
            }
        }
        Ok(())
    }

    /// Close every session. All sessions are told to stop before any is
    /// awaited, so a slow dispatch on one scope does not hold the others open.
    /// A failure closing one is logged and the rest are still closed. Returns
    /// the number of sessions that failed to close.
    pub async fn close(&mut self) -> usize {
        let mut sessions: Vec<WatchSession> = self.sessions.drain(..).collect();
        for session in sessions.iter_mut() {
            debug!(gvk = %self.pipeline.handle.gvk_key, ns = %session.scope(), "closing watch session");
            session.request_stop();
        }
        let results = join_all(sessions.iter_mut().map(|s| s.finish())).await;
        let mut failed = 0;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                warn!(gvk = %self.pipeline.handle.gvk_key, ns = %session.scope(), error = %e, "error closing watch session");
                failed += 1;
            }
        }
        failed
    }

    /// Run one delivery through cache, gate and dispatcher, exactly as a
    /// session would.
    pub fn on_event(&self, action: Action, snapshot: ResourceSnapshot) {
        self.pipeline.on_event(action, snapshot);
    }

    /// Forget a resource once its deletion completed upstream.
    pub fn on_resource_deregistered(&self, uid: &Uid) {
        let generation = self.pipeline.gate.evict(uid);
        self.pipeline.cache.remove(uid);
        debug!(uid = %uid_string(uid), ?generation, "resource deregistered");
    }
}
