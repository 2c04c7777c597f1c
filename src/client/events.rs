//! Server-push event subscription.
//!
//! A dedicated background task owns the read loop on a push connection and
//! dispatches every received event to the registered listeners *on that
//! task*, never on a caller task. Listeners needing UI-thread affinity
//! must redispatch themselves. The subscriber list is owned and explicit;
//! dropping a subscription means unsubscribing, not waiting for a garbage
//! collector.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::protocol::Connection;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type EventListener = Box<dyn Fn(&str, &Value) + Send + Sync + 'static>;

/// Owns the background read loop of an event (push) connection.
pub struct EventSubscriber {
    listeners: Arc<Mutex<Vec<EventListener>>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for EventSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscriber").finish_non_exhaustive()
    }
}

impl EventSubscriber {
    /// Take ownership of a push connection and start the read loop.
    pub fn spawn(connection: Connection) -> Self {
        let listeners: Arc<Mutex<Vec<EventListener>>> = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(read_loop(connection, listeners.clone()));
        Self { listeners, task }
    }

    /// Register a listener. Called for every event, with the event name and
    /// the full payload object, on the subscriber's background task.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Whether the read loop is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the read loop. The connection is dropped with it.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_loop(mut connection: Connection, listeners: Arc<Mutex<Vec<EventListener>>>) {
    loop {
        match connection.recv_json(Some(MAX_PAYLOAD_SIZE)).await {
            Ok(payload) => {
                let Some(name) = payload.get("event").and_then(Value::as_str) else {
                    warn!("push payload without string 'event' field, discarding");
                    continue;
                };
                let listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
                for listener in listeners.iter() {
                    listener(name, &payload);
                }
            }
            Err(e) if e.is_fatal() => {
                debug!(error = %e, "event connection ended");
                connection.close().await;
                break;
            }
            Err(e) => {
                warn!(error = %e, "discarding undecodable event payload");
            }
        }
    }
}
