//! Per-user connection tracking.
//!
//! Connection tasks register themselves here once authorized, enabling
//! enumeration and forced termination of all of a user's connections, and
//! event connections register here to receive pushes. Both maps are
//! mutated from many connection tasks and are mutex-guarded; guards are
//! never held across an await.

use crate::server::connection::EventConnection;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Registry-side handle to one authorized request connection. The serve
/// loop waits on [`closed`](Self::closed) so a forced termination can wake
/// it out of a blocking read.
pub struct ConnectionHandle {
    id: u64,
    user: String,
    close_signal: Notify,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Ask the owning serve loop to shut this connection down.
    pub fn request_close(&self) {
        self.close_signal.notify_one();
    }

    /// Resolves once [`request_close`](Self::request_close) has been called.
    pub async fn closed(&self) {
        self.close_signal.notified().await;
    }
}

/// Tracks authenticated request connections and live event connections,
/// keyed by user.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    requests: Mutex<HashMap<String, Vec<Arc<ConnectionHandle>>>>,
    events: Mutex<HashMap<String, Vec<Arc<EventConnection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authorized request connection and hand back its handle.
    pub fn register(&self, user: &str) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            user: user.to_string(),
            close_signal: Notify::new(),
        });
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user.to_string())
            .or_default()
            .push(handle.clone());
        debug!(user, id = handle.id, "request connection registered");
        handle
    }

    pub fn unregister(&self, handle: &Arc<ConnectionHandle>) {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = requests.get_mut(&handle.user) {
            list.retain(|other| other.id != handle.id);
            if list.is_empty() {
                requests.remove(&handle.user);
            }
        }
    }

    /// Snapshot of a user's authenticated request connections.
    pub fn connections_for(&self, user: &str) -> Vec<Arc<ConnectionHandle>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of authenticated request connections across all users.
    pub fn authenticated_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Force-terminate every connection of `user`: wake all request serve
    /// loops and close all event connections. Returns how many connections
    /// were told to die.
    pub async fn close_user(&self, user: &str) -> usize {
        let handles = self.connections_for(user);
        for handle in &handles {
            handle.request_close();
        }

        let event_conns = {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            events.remove(user).unwrap_or_default()
        };
        for conn in &event_conns {
            conn.close().await;
        }

        handles.len() + event_conns.len()
    }

    pub fn register_event(&self, conn: Arc<EventConnection>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conn.user().to_string())
            .or_default()
            .push(conn);
    }

    /// Push an event to every live event connection of `user`; connections
    /// whose transport has died are dropped from the registry. Returns the
    /// number of successful deliveries.
    pub async fn push_event(&self, user: &str, name: &str, payload: &Value) -> usize {
        let conns: Vec<Arc<EventConnection>> = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for conn in conns {
            match conn.send_event(name, payload).await {
                Ok(()) => delivered += 1,
                Err(e) if e.is_fatal() => {
                    debug!(user, error = %e, "dropping dead event connection");
                    dead.push(conn);
                }
                Err(e) => warn!(user, error = %e, "event delivery failed"),
            }
        }

        if !dead.is_empty() {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = events.get_mut(user) {
                list.retain(|live| !dead.iter().any(|d| Arc::ptr_eq(live, d)));
                if list.is_empty() {
                    events.remove(user);
                }
            }
        }
        delivered
    }
}
