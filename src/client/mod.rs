//! # Client Side
//!
//! The request channel, reconnection/re-authentication plumbing, and
//! server-push event subscription.
//!
//! ## Components
//! - **Channel**: serializes concurrent callers onto one live connection,
//!   with one transparent reconnect-and-retry on transport failure
//! - **Events**: background read loop for server-pushed events
//! - **Client**: convenience wrapper wiring a TCP connection factory, the
//!   stored auth token, and the channel together
//!
//! The connect timeout from [`ClientConfig`] is advisory and applies only
//! to the initial socket connect, never to in-flight exchanges.

pub mod channel;
pub mod events;

pub use channel::{ConnectionFactory, RequestChannel};
pub use events::EventSubscriber;

use crate::config::{ClientConfig, MAX_PAYLOAD_SIZE};
use crate::core::token::AuthToken;
use crate::error::{ProtocolError, Result};
use crate::protocol::Connection;
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// Client-held session state shared with the connection factory.
#[derive(Default)]
struct Session {
    token: Mutex<Option<AuthToken>>,
}

impl Session {
    fn token(&self) -> Option<AuthToken> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_token(&self, token: Option<AuthToken>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }
}

/// High-level client: one request channel over one server address, plus
/// the stored token used to restore the session on every (re)connect.
pub struct Client {
    channel: RequestChannel,
    factory: ConnectionFactory,
    session: Arc<Session>,
}

impl Client {
    /// Build a client dialing the configured address. The configuration is
    /// an explicit value; there is no process-wide preferred address.
    pub fn new(config: ClientConfig) -> Self {
        let session = Arc::new(Session::default());
        let factory = tcp_factory(config, session.clone());
        Self {
            channel: RequestChannel::new(factory.clone()),
            factory,
            session,
        }
    }

    /// Perform one exchange through the shared channel.
    pub async fn request(&self, request: &Value) -> Result<Value> {
        self.channel.submit(request).await
    }

    /// Log in with credentials; on success the returned token is stored
    /// for transparent re-authentication.
    #[instrument(skip(self, password))]
    pub async fn login(&self, user: &str, password: &str) -> Result<Value> {
        let response = self
            .channel
            .submit(&json!({"request": "login", "user": user, "password": password}))
            .await?;
        if let Some(token_hex) = response.get("token").and_then(Value::as_str) {
            self.session.set_token(Some(AuthToken::from_hex(token_hex)?));
            debug!("login succeeded, session token stored");
        }
        Ok(response)
    }

    /// Token currently stored for session restoration.
    pub fn stored_token(&self) -> Option<AuthToken> {
        self.session.token()
    }

    /// Replace the stored token (e.g. one restored from disk), or clear it.
    pub fn set_token(&self, token: Option<AuthToken>) {
        self.session.set_token(token);
    }

    /// Drop the live connection; the next request reconnects.
    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    /// Open a dedicated push connection: dial and authenticate via the
    /// factory, send `request` to convert it server-side into an event
    /// connection, then hand it to a background subscriber.
    pub async fn subscribe_events(&self, request: &Value) -> Result<EventSubscriber> {
        let mut conn = (self.factory)().await?;
        conn.send_json(request).await?;
        let response = conn.recv_json(Some(MAX_PAYLOAD_SIZE)).await?;
        if let Some(code) = response.get("error").and_then(Value::as_str) {
            let message = response
                .get("error-message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            conn.close().await;
            return Err(ProtocolError::Remote {
                code: code.to_string(),
                message,
            });
        }
        Ok(EventSubscriber::spawn(conn))
    }
}

/// Factory dialing TCP, negotiating the encrypted channel, and replaying
/// the stored token as an `auth` request. Any failure here, including a
/// rejected re-authentication, is a startup error and is never retried
/// automatically.
fn tcp_factory(config: ClientConfig, session: Arc<Session>) -> ConnectionFactory {
    Arc::new(move || {
        let config = config.clone();
        let session = session.clone();
        async move {
            let stream = tokio::time::timeout(
                config.connect_timeout,
                TcpStream::connect(&config.address),
            )
            .await
            .map_err(|_| {
                ProtocolError::ConnectionStartup(format!(
                    "connect to {} timed out",
                    config.address
                ))
            })?
            .map_err(|e| {
                ProtocolError::ConnectionStartup(format!(
                    "connect to {} failed: {e}",
                    config.address
                ))
            })?;

            let mut conn = Connection::negotiate(stream)
                .await
                .map_err(|e| ProtocolError::ConnectionStartup(format!("handshake failed: {e}")))?;

            if let Some(token) = session.token() {
                conn.send_json(&json!({"request": "auth", "token": token.to_hex()}))
                    .await?;
                let response = conn.recv_json(Some(MAX_PAYLOAD_SIZE)).await?;
                if let Some(code) = response.get("error").and_then(Value::as_str) {
                    conn.close().await;
                    return Err(ProtocolError::ConnectionStartup(format!(
                        "re-authentication rejected: {code}"
                    )));
                }
                debug!("session restored with stored token");
            }
            Ok(conn)
        }
        .boxed()
    })
}
