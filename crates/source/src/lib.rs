//! Warden event source: watch sessions per namespace scope, resource cache and
//! generation filtering in front of the controller's dispatcher.

#![forbid(unsafe_code)]

mod dispatch;
mod session;
mod source;
mod supervisor;

pub use dispatch::{Dispatcher, SourceHandle};
pub use session::{EventSink, SessionState, WatchSession};
pub use source::{EventSource, SourceError};
pub use supervisor::{FatalFault, FaultReporter, Supervisor};
