//! Single-connection request multiplexing with transparent reconnection.
//!
//! N application tasks each perform one "send request, read response"
//! exchange against exactly one live [`Connection`]. A mutex over the
//! connection slot is the pending-exchange queue: one exchange occupies
//! the connection at any instant, so request/response correlation is
//! implicit in program order and no request identifiers exist on the wire.
//!
//! When an exchange fails fatally, the dead connection is discarded, the
//! caller-supplied factory builds a replacement (dial, handshake,
//! re-authenticate), and the failed exchange is retried exactly once. A
//! factory failure is a [`ProtocolError::ConnectionStartup`] and is never
//! retried automatically: hammering a server that is actively rejecting us
//! helps nobody.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};
use crate::protocol::Connection;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Builds a ready-to-use connection: open the socket, run the handshake,
/// and replay any stored credentials. Invoked on first use and on every
/// reconnect attempt.
pub type ConnectionFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Connection>> + Send + Sync>;

/// Serializes concurrent callers onto one live connection.
pub struct RequestChannel {
    live: Mutex<Option<Connection>>,
    factory: ConnectionFactory,
}

impl RequestChannel {
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            live: Mutex::new(None),
            factory,
        }
    }

    /// Perform one request/response exchange.
    ///
    /// Blocks (asynchronously) while another caller's exchange is in
    /// flight; no fairness is guaranteed beyond the mutex's own. A caller
    /// that abandons an exchange mid-flight (timeout, `select!`) discards
    /// the connection with it: a request may have been sent whose response
    /// was never read, and a stale response surfacing in a later caller's
    /// exchange would silently break correlation. The next exchange
    /// reconnects instead.
    ///
    /// # Errors
    /// - [`ProtocolError::Remote`] if the server answered with an error
    ///   response; the connection stays usable.
    /// - [`ProtocolError::ConnectionStartup`] if no replacement connection
    ///   could be established; not retried.
    /// - Any fatal error from the retried exchange on the fresh connection.
    pub async fn submit(&self, request: &Value) -> Result<Value> {
        let mut slot = self.live.lock().await;

        // The connection leaves the slot for the duration of the exchange
        // and is restored only on clean completion. Dropping this future
        // mid-exchange therefore drops the connection too, instead of
        // leaving one with an unread response in the slot.
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.prepare_connection().await?,
        };

        match exchange(&mut conn, request).await {
            Ok(response) => {
                *slot = Some(conn);
                Ok(response)
            }
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "exchange failed on live connection, rebuilding");
                conn.close().await;
                let mut fresh = self.prepare_connection().await?;
                match exchange(&mut fresh, request).await {
                    Ok(response) => {
                        debug!("exchange retried successfully after reconnect");
                        *slot = Some(fresh);
                        Ok(response)
                    }
                    Err(retry_err) => {
                        if retry_err.is_fatal() {
                            fresh.close().await;
                        } else {
                            // Payload-level failure: the new connection is fine.
                            *slot = Some(fresh);
                        }
                        Err(retry_err)
                    }
                }
            }
            Err(e) => {
                // Payload-level failure: response was read, alignment holds.
                *slot = Some(conn);
                Err(e)
            }
        }
    }

    /// Drop the live connection, if any. The next exchange reconnects.
    pub async fn disconnect(&self) {
        if let Some(mut conn) = self.live.lock().await.take() {
            conn.close().await;
        }
    }

    async fn prepare_connection(&self) -> Result<Connection> {
        (self.factory)().await.map_err(|e| match e {
            startup @ ProtocolError::ConnectionStartup(_) => startup,
            other => ProtocolError::ConnectionStartup(other.to_string()),
        })
    }
}

/// One atomic send-then-receive pair. An `error` field in the response is
/// an application-level failure, surfaced as [`ProtocolError::Remote`]
/// with the connection left usable.
async fn exchange(conn: &mut Connection, request: &Value) -> Result<Value> {
    conn.send_json(request).await?;
    let response = conn.recv_json(Some(MAX_PAYLOAD_SIZE)).await?;

    if let Some(code) = response.get("error").and_then(Value::as_str) {
        let message = response
            .get("error-message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(ProtocolError::Remote {
            code: code.to_string(),
            message,
        });
    }
    Ok(response)
}
