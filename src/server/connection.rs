//! Server-side connection roles.
//!
//! A [`RequestConnection`] starts unauthenticated and listening. A login or
//! auth handler calls [`ConnectionCtl::authorize`]; a handler that wants to
//! turn the transport into a push channel calls
//! [`ConnectionCtl::stop_listening`], which ends request dispatch without
//! closing the socket so the same TCP connection can be promoted to an
//! [`EventConnection`] without a second handshake.

use crate::error::{ProtocolError, Result};
use crate::protocol::Connection;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

/// The dispatch-visible control surface of a request connection: who it is
/// authorized as and whether it still handles requests. Handlers receive
/// this, never the connection's streams.
pub struct ConnectionCtl {
    user: Option<String>,
    listening: bool,
}

impl ConnectionCtl {
    pub(crate) fn new() -> Self {
        Self {
            user: None,
            listening: true,
        }
    }

    /// Mark the connection as belonging to `user`.
    pub fn authorize(&mut self, user: impl Into<String>) {
        let user = user.into();
        debug!(user, "connection authorized");
        self.user = Some(user);
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn is_authorized(&self) -> bool {
        self.user.is_some()
    }

    /// Deactivate request dispatch without closing the socket; precursor to
    /// promotion into an event connection.
    pub fn stop_listening(&mut self) {
        self.listening = false;
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }
}

/// A connection in request/response mode.
pub struct RequestConnection {
    conn: Connection,
    ctl: ConnectionCtl,
}

impl RequestConnection {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            ctl: ConnectionCtl::new(),
        }
    }

    pub fn ctl(&self) -> &ConnectionCtl {
        &self.ctl
    }

    pub fn ctl_mut(&mut self) -> &mut ConnectionCtl {
        &mut self.ctl
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub async fn close(mut self) {
        self.conn.close().await;
    }

    /// Promote the transport into a push-only event connection. The
    /// connection must be authorized; the user id of an event connection is
    /// fixed at construction and never empty.
    pub fn into_event_connection(self) -> Result<EventConnection> {
        match self.ctl.user {
            Some(user) if !user.is_empty() => Ok(EventConnection::new(self.conn, user)),
            _ => Err(ProtocolError::Custom(
                "cannot promote an unauthorized connection".into(),
            )),
        }
    }
}

/// A connection used solely to push asynchronous events to one user.
pub struct EventConnection {
    user: String,
    conn: Mutex<Connection>,
}

impl EventConnection {
    pub fn new(conn: Connection, user: String) -> Self {
        Self {
            user,
            conn: Mutex::new(conn),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Push one event. The payload's top-level fields are merged alongside
    /// the `event` discriminator; a non-object payload lands under `data`.
    pub async fn send_event(&self, name: &str, payload: &Value) -> Result<()> {
        let mut message = match payload {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                let mut fields = Map::new();
                fields.insert("data".to_string(), other.clone());
                fields
            }
        };
        message.insert("event".to_string(), Value::String(name.to_string()));

        let mut conn = self.conn.lock().await;
        conn.send_json(&Value::Object(message)).await
    }

    pub async fn close(&self) {
        self.conn.lock().await.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::connection::loopback_pair;
    use serde_json::json;

    #[test]
    fn ctl_lifecycle() {
        let mut ctl = ConnectionCtl::new();
        assert!(ctl.is_listening());
        assert!(!ctl.is_authorized());

        ctl.authorize("ada");
        assert_eq!(ctl.user(), Some("ada"));

        ctl.stop_listening();
        assert!(!ctl.is_listening());
    }

    #[tokio::test]
    async fn promotion_requires_authorization() {
        let (server_side, _client) = loopback_pair();
        let rc = RequestConnection::new(server_side);
        assert!(rc.into_event_connection().is_err());

        let (server_side, _client) = loopback_pair();
        let mut rc = RequestConnection::new(server_side);
        rc.ctl_mut().authorize("ada");
        let ec = rc.into_event_connection().unwrap();
        assert_eq!(ec.user(), "ada");
    }

    #[tokio::test]
    async fn send_event_merges_payload() {
        let (server_side, mut client) = loopback_pair();
        let mut rc = RequestConnection::new(server_side);
        rc.ctl_mut().authorize("ada");
        let ec = rc.into_event_connection().unwrap();

        ec.send_event("message-posted", &json!({"thread": "t9"}))
            .await
            .unwrap();
        let seen = client.recv_json(None).await.unwrap();
        assert_eq!(seen["event"], "message-posted");
        assert_eq!(seen["thread"], "t9");

        ec.send_event("tick", &json!(42)).await.unwrap();
        let seen = client.recv_json(None).await.unwrap();
        assert_eq!(seen["event"], "tick");
        assert_eq!(seen["data"], 42);
    }
}
