//! Subscriber contracts and fan-out.
//!
//! A session notifies, for each change, every [`Cache`] (in registration
//! order) and then every [`Listener`] (in registration order). A failing or
//! panicking subscriber is logged and skipped; the rest still see the event.

use crate::types::ChangeRecord;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Something holding data keyed by document id that must be dropped when the
/// document changes.
pub trait Cache: Send + Sync {
    /// Forget anything stored for `id`.
    fn invalidate(&self, id: &str) -> anyhow::Result<()>;
}

/// Application-level consumer of the feed.
pub trait Listener: Send + Sync {
    /// Called once per change, after all caches were invalidated.
    fn on_change(&self, change: &ChangeRecord) -> anyhow::Result<()>;

    /// Called exactly once when the feed ends, for any reason.
    fn on_disconnect(&self, reason: &DisconnectReason);
}

/// Why a running feed ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The owner called `stop()`
    Stopped,
    /// The server ended the response body
    Closed,
    /// The connection failed mid-stream
    ConnectionLost(String),
    /// No data arrived within the configured heartbeat timeout
    HeartbeatTimeout(Duration),
}

impl DisconnectReason {
    /// Whether the owner asked for this disconnect.
    pub fn is_requested(&self) -> bool {
        matches!(self, DisconnectReason::Stopped)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Stopped => write!(f, "stopped by owner"),
            DisconnectReason::Closed => write!(f, "closed by server"),
            DisconnectReason::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            DisconnectReason::HeartbeatTimeout(after) => {
                write!(f, "no heartbeat for {after:?}")
            }
        }
    }
}

/// Registered subscribers, cheap to clone into the feed task.
#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    pub(crate) caches: Vec<Arc<dyn Cache>>,
    pub(crate) listeners: Vec<Arc<dyn Listener>>,
}

impl Subscribers {
    /// Invalidate every cache, then notify every listener.
    pub(crate) fn dispatch(&self, change: &ChangeRecord) {
        for (index, cache) in self.caches.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| cache.invalidate(&change.id))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(cache = index, id = %change.id, "Cache invalidation failed: {:#}", e)
                }
                Err(_) => {
                    tracing::warn!(cache = index, id = %change.id, "Cache panicked during invalidation")
                }
            }
        }

        for (index, listener) in self.listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_change(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(listener = index, id = %change.id, "Listener failed on change: {:#}", e)
                }
                Err(_) => {
                    tracing::warn!(listener = index, id = %change.id, "Listener panicked on change")
                }
            }
        }
    }

    /// Tell every listener the feed ended.
    pub(crate) fn disconnect(&self, reason: &DisconnectReason) {
        for (index, listener) in self.listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener.on_disconnect(reason))).is_err() {
                tracing::warn!(listener = index, "Listener panicked on disconnect");
            }
        }
    }
}
