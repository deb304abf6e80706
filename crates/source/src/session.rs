//! One watch subscription for one namespace scope.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_core::{Action, ResourceSnapshot, StreamFault, Subscription, SubscriptionHandle, WatchScope, WatchTransport};

use crate::source::SourceError;
use crate::supervisor::{FatalFault, FaultReporter};

/// Receiver of a session's deliveries. Called sequentially per session.
pub trait EventSink: Send + Sync + 'static {
    fn on_event(&self, action: Action, snapshot: ResourceSnapshot);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Closed,
}

pub struct WatchSession {
    scope: WatchScope,
    state_rx: watch::Receiver<SessionState>,
    state_tx: Arc<watch::Sender<SessionState>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), StreamFault>>>,
}

struct Delivery {
    gvk_key: String,
    scope: WatchScope,
    transport: Arc<dyn WatchTransport>,
    sink: Arc<dyn EventSink>,
    faults: FaultReporter,
    state: Arc<watch::Sender<SessionState>>,
}

impl WatchSession {
    /// Subscribe for `scope` and start delivering events to `sink`.
    ///
    /// The session is `Active` once this returns `Ok`.
    pub async fn open(
        gvk_key: &str,
        scope: WatchScope,
        transport: Arc<dyn WatchTransport>,
        sink: Arc<dyn EventSink>,
        faults: FaultReporter,
    ) -> Result<Self, StreamFault> {
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let state_tx = Arc::new(state_tx);
        let sub = transport.subscribe(&scope).await?;
        info!(gvk = %gvk_key, ns = %scope, handle = %sub.handle, "watch session active");
        state_tx.send_replace(SessionState::Active);

        let (stop_tx, stop_rx) = oneshot::channel();
        let delivery = Delivery {
            gvk_key: gvk_key.to_string(),
            scope: scope.clone(),
            transport,
            sink,
            faults,
            state: Arc::clone(&state_tx),
        };
        let task = tokio::spawn(delivery.run(sub, stop_rx));
        Ok(Self { scope, state_rx, state_tx, stop_tx: Some(stop_tx), task: Some(task) })
    }

    pub fn scope(&self) -> &WatchScope {
        &self.scope
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Ask the delivery task to stop. It releases the subscription as soon as
    /// the event being dispatched, if any, returns. Does not wait.
    pub fn request_stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
    }

    /// Wait for the delivery task to end after [`WatchSession::request_stop`].
    /// The session is `Closed` afterwards even if releasing the subscription failed.
    pub async fn finish(&mut self) -> Result<(), SourceError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let joined = task.await;
        self.state_tx.send_replace(SessionState::Closed);
        match joined {
            Ok(released) => released.map_err(|source| SourceError::Unsubscribe { scope: self.scope.clone(), source }),
            Err(e) => Err(SourceError::DeliveryAborted { scope: self.scope.clone(), reason: e.to_string() }),
        }
    }

    pub async fn close(&mut self) -> Result<(), SourceError> {
        self.request_stop();
        self.finish().await
    }
}

impl Delivery {
    /// Runs until stopped or a fatal fault. Returns the outcome of releasing
    /// the subscription when stopped; fatal paths have already reported.
    async fn run(self, mut sub: Subscription, mut stop_rx: oneshot::Receiver<()>) -> Result<(), StreamFault> {
        loop {
            let next = tokio::select! {
                biased;
                stopped = &mut stop_rx => {
                    // An error means the session was dropped without close.
                    if stopped.is_err() {
                        debug!(gvk = %self.gvk_key, ns = %self.scope, "watch session dropped; releasing");
                    }
                    self.state.send_replace(SessionState::Closed);
                    return self.release(&sub.handle);
                }
                item = sub.events.next() => item,
            };
            match next {
                Some(Ok(ev)) => {
                    let sink = &self.sink;
                    let delivered = panic::catch_unwind(AssertUnwindSafe(|| sink.on_event(ev.action, ev.snapshot)));
                    if let Err(payload) = delivered {
                        let _ = self.release(&sub.handle);
                        self.fatal(StreamFault::Unclassified(format!("dispatcher panicked: {}", panic_message(&payload))));
                        return Ok(());
                    }
                }
                Some(Err(StreamFault::Expired(reason))) => {
                    warn!(gvk = %self.gvk_key, ns = %self.scope, handle = %sub.handle, %reason, "watch expired; resubscribing");
                    self.state.send_replace(SessionState::Starting);
                    let _ = self.release(&sub.handle);
                    let resubscribed = tokio::select! {
                        biased;
                        _ = &mut stop_rx => {
                            self.state.send_replace(SessionState::Closed);
                            return Ok(());
                        }
                        res = self.transport.subscribe(&self.scope) => res,
                    };
                    match resubscribed {
                        Ok(fresh) => {
                            info!(gvk = %self.gvk_key, ns = %self.scope, handle = %fresh.handle, "watch resubscribed");
                            sub = fresh;
                            self.state.send_replace(SessionState::Active);
                        }
                        Err(e) => {
                            self.fatal(StreamFault::Unclassified(format!("resubscribe after expiry failed: {}", e)));
                            return Ok(());
                        }
                    }
                }
                Some(Err(fault)) => {
                    let _ = self.release(&sub.handle);
                    self.fatal(fault);
                    return Ok(());
                }
                None => {
                    let _ = self.release(&sub.handle);
                    self.fatal(StreamFault::Unclassified("watch stream ended unexpectedly".to_string()));
                    return Ok(());
                }
            }
        }
    }

    fn release(&self, handle: &SubscriptionHandle) -> Result<(), StreamFault> {
        debug!(gvk = %self.gvk_key, ns = %self.scope, handle = %handle, "releasing watch");
        self.transport.unsubscribe(handle).map_err(|e| {
            warn!(gvk = %self.gvk_key, ns = %self.scope, handle = %handle, error = %e, "failed to release watch");
            e
        })
    }

    fn fatal(&self, fault: StreamFault) {
        self.state.send_replace(SessionState::Closed);
        self.faults.report(FatalFault { gvk_key: self.gvk_key.clone(), scope: self.scope.clone(), fault });
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
