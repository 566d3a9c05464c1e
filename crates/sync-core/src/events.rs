//! Event surface for host UIs.
//!
//! The engine reports through `SyncEvent`; hosts subscribe on the
//! `EventBus` and render however they like. Subscriptions follow the
//! disposer pattern: hold the returned `Subscription` to keep receiving,
//! drop it to unsubscribe.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::ResolutionStrategy;

/// Engine lifecycle states. Published with every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// Sync is turned off in settings.
    Disabled,
    /// Waiting for a password (stored credential unreadable or absent).
    Unlocking,
    /// Ready; between cycles.
    Idle,
    /// A cycle is running.
    Syncing,
    /// Content key unusable; the user must re-enter the password.
    Locked,
    /// Session irrecoverably rejected; the user must log in again.
    LoggedOut,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Disabled => "disabled",
            SyncState::Unlocking => "unlocking",
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Locked => "locked",
            SyncState::LoggedOut => "logged out",
        };
        write!(f, "{name}")
    }
}

/// Events emitted during sync operations.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// Both sides changed a file; remote stayed canonical and the local
    /// version was preserved under `conflict_copy`.
    #[serde(rename = "sync-conflict")]
    Conflict {
        path: String,
        resolution: ResolutionStrategy,
        #[serde(rename = "conflictCopy")]
        conflict_copy: String,
        timestamp: DateTime<Utc>,
    },
    /// The stored credential could not be decrypted; sync stays locked
    /// until the user re-enters the password.
    #[serde(rename = "sync-unlock-required")]
    UnlockRequired,
    /// The engine moved to a new lifecycle state.
    #[serde(rename = "sync-state-changed")]
    StateChanged { state: SyncState },
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing sync events to subscribers.
///
/// Thread-safe for the multi-threaded Tokio runtime. Wrap in `Arc` to
/// enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(SyncEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns a `Subscription` that unsubscribes on
    /// drop. Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic
        // unwinding while a read lock is held (e.g. during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the callback list so a callback may subscribe without
        // deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
