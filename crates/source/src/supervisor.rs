//! Fatal fault reporting. Sessions never end the process themselves; they
//! report to the [`Supervisor`] owned by the top level.

use std::fmt;

use tokio::sync::mpsc;
use tracing::error;
use warden_core::{StreamFault, WatchScope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalFault {
    pub gvk_key: String,
    pub scope: WatchScope,
    pub fault: StreamFault,
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.gvk_key, self.scope, self.fault)
    }
}

#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<FatalFault>,
}

impl FaultReporter {
    pub fn report(&self, fault: FatalFault) {
        error!(gvk = %fault.gvk_key, ns = %fault.scope, error = %fault.fault, "unrecoverable watch fault");
        if self.tx.send(fault).is_err() {
            error!("supervisor is gone; fatal fault not delivered");
        }
    }
}

/// Receives fatal faults from every event source of the process.
#[derive(Debug)]
pub struct Supervisor {
    rx: mpsc::UnboundedReceiver<FatalFault>,
}

impl Supervisor {
    pub fn channel() -> (FaultReporter, Supervisor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FaultReporter { tx }, Supervisor { rx })
    }

    /// Wait for the next fatal fault. `None` once every reporter is dropped.
    pub async fn wait(&mut self) -> Option<FatalFault> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<FatalFault> {
        self.rx.try_recv().ok()
    }
}
