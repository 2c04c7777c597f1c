//! # Server Side
//!
//! Connection lifecycle, authentication bookkeeping, and request dispatch.
//!
//! ## Components
//! - **Auth**: token↔user store backing password-less session restoration
//! - **Connection**: the request/event connection roles
//! - **Registry**: per-user connection lists for enumeration, forced
//!   termination, and event pushing
//! - **Dispatcher**: request-name routing to registered handlers
//! - **Server**: TCP accept loop, one task per socket, graceful shutdown
//!
//! Requests on a given connection are handled sequentially for that
//! connection's lifetime. Any error escaping a handler that is not an
//! application-level protocol error is fatal to its connection: the client
//! gets a generic error, the details stay in the local log, and the
//! connection is closed. Internals never leak and the wire is never left
//! in an ambiguous framing state.

pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod registry;

pub use auth::AuthTokenStore;
pub use connection::{ConnectionCtl, EventConnection, RequestConnection};
pub use dispatcher::Dispatcher;
pub use registry::{ConnectionHandle, ConnectionRegistry};

use crate::config::{ServerConfig, MAX_PAYLOAD_SIZE};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::Connection;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// The accepting server: owns the listener, the dispatcher, and the
/// connection registry.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    active: Arc<AtomicUsize>,
}

impl Server {
    /// Bind the configured address. The dispatcher is frozen here; all
    /// handler registration happens before.
    pub async fn bind(config: ServerConfig, dispatcher: Dispatcher) -> Result<Self> {
        let listener = TcpListener::bind(&config.address).await?;
        info!(address = %config.address, "listening");
        Ok(Self {
            listener,
            config,
            dispatcher: Arc::new(dispatcher),
            registry: Arc::new(ConnectionRegistry::new()),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the connection registry, e.g. for pushing events
    /// from application code.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Run until CTRL+C.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received CTRL+C, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.run_with_shutdown(shutdown_rx).await
    }

    /// Accept loop with an external shutdown channel.
    pub async fn run_with_shutdown(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutting down, waiting for connections to close");
                    let deadline = tokio::time::sleep(self.config.shutdown_timeout);
                    tokio::pin!(deadline);
                    loop {
                        tokio::select! {
                            _ = &mut deadline => {
                                warn!("shutdown timeout reached, forcing exit");
                                break;
                            }
                            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                                if self.active.load(Ordering::SeqCst) == 0 {
                                    info!("all connections closed");
                                    break;
                                }
                            }
                        }
                    }
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.accept(stream, peer),
                        Err(e) => error!(error = %e, "error accepting connection"),
                    }
                }
            }
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
            warn!(peer = %peer, "at connection capacity, refusing");
            return;
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(peer = %peer, "connection accepted");

        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            match Connection::negotiate(stream).await {
                Ok(conn) => {
                    serve_connection(RequestConnection::new(conn), dispatcher, registry).await;
                }
                Err(e) => warn!(peer = %peer, error = %e, "handshake failed"),
            }
            active.fetch_sub(1, Ordering::SeqCst);
            debug!(peer = %peer, "connection finished");
        });
    }
}

enum Outcome {
    /// Transport dead or teardown mandated; close and unregister.
    Teardown,
    /// Dispatch was deactivated with the socket healthy; promote.
    Promote,
}

/// Drive one request connection to completion: read requests, dispatch
/// them sequentially, write responses, and apply the error rules.
///
/// Returns once the connection is torn down or promoted to an event
/// connection (which this function registers itself).
#[instrument(skip_all)]
pub async fn serve_connection(
    mut rc: RequestConnection,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
) {
    let mut handle: Option<Arc<ConnectionHandle>> = None;

    let outcome = loop {
        if !rc.ctl().is_listening() {
            break Outcome::Promote;
        }

        // A registered connection can be woken out of the read by a forced
        // termination request.
        let request = match &handle {
            Some(h) => {
                tokio::select! {
                    _ = h.closed() => {
                        info!(user = h.user(), "connection force-closed");
                        break Outcome::Teardown;
                    }
                    r = rc.conn_mut().recv_json(Some(MAX_PAYLOAD_SIZE)) => r,
                }
            }
            None => rc.conn_mut().recv_json(Some(MAX_PAYLOAD_SIZE)).await,
        };

        match request {
            Ok(request) => match dispatcher.dispatch(rc.ctl_mut(), &request) {
                Ok(response) => {
                    if let Err(e) = rc.conn_mut().send_json(&response).await {
                        warn!(error = %e, "failed to write response");
                        break Outcome::Teardown;
                    }
                }
                Err(e) if !e.is_fatal() => {
                    let (code, message) = wire_error(&e);
                    if send_wire_error(rc.conn_mut(), &code, &message).await.is_err() {
                        break Outcome::Teardown;
                    }
                }
                Err(e) => {
                    // Never leak internals: generic response out, full
                    // detail into the local log, connection gone.
                    error!(error = %e, "handler failed, tearing down connection");
                    let _ = send_wire_error(
                        rc.conn_mut(),
                        constants::CODE_INTERNAL_ERROR,
                        "internal server error",
                    )
                    .await;
                    break Outcome::Teardown;
                }
            },
            Err(e) if e.is_fatal() => {
                debug!(error = %e, "connection ended");
                break Outcome::Teardown;
            }
            Err(e) => {
                // Undecodable payload with alignment intact: report and
                // keep serving.
                let (code, message) = wire_error(&e);
                if send_wire_error(rc.conn_mut(), &code, &message).await.is_err() {
                    break Outcome::Teardown;
                }
            }
        }

        // A handler may have just authorized this connection.
        if handle.is_none() {
            if let Some(user) = rc.ctl().user() {
                handle = Some(registry.register(user));
            }
        }
    };

    if let Some(handle) = handle {
        registry.unregister(&handle);
    }

    match outcome {
        Outcome::Teardown => rc.close().await,
        Outcome::Promote => match rc.into_event_connection() {
            Ok(event_conn) => {
                debug!(user = event_conn.user(), "connection promoted to event push");
                registry.register_event(Arc::new(event_conn));
            }
            Err(e) => warn!(error = %e, "promotion failed, dropping connection"),
        },
    }
}

/// Map a recoverable error to its wire error code and message.
fn wire_error(e: &ProtocolError) -> (String, String) {
    match e {
        ProtocolError::MalformedRequest(message) => {
            (constants::CODE_MALFORMED_REQUEST.into(), message.clone())
        }
        ProtocolError::Json(_) | ProtocolError::InvalidUtf8 | ProtocolError::CorruptBlock => {
            (constants::CODE_MALFORMED_REQUEST.into(), e.to_string())
        }
        ProtocolError::UnsupportedRequest(name) => (
            constants::CODE_UNSUPPORTED_REQUEST.into(),
            format!("no handler for '{name}'"),
        ),
        ProtocolError::Remote { code, message } => (code.clone(), message.clone()),
        other => (constants::CODE_INTERNAL_ERROR.into(), other.to_string()),
    }
}

async fn send_wire_error(conn: &mut Connection, code: &str, message: &str) -> Result<()> {
    conn.send_json(&json!({ "error": code, "error-message": message }))
        .await
}
