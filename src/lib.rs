//! # chatwire
//!
//! Encrypted transport and request/event protocol core for a client-server
//! chat application. No TLS: the channel is bootstrapped by an ephemeral
//! RSA key exchange that yields one AES-128-CBC cipher context per
//! direction, and everything above it travels in encrypted blocks.
//!
//! ## Layers
//! - [`protocol`]: handshake, block framing (length-prefixed and
//!   self-delimiting frames), and the [`protocol::Connection`] facade
//! - [`client`]: the single-connection request channel with transparent
//!   reconnection/re-authentication, and server-push event subscription
//! - [`server`]: accept loop, per-user connection registry, request
//!   dispatch, and authentication-token bookkeeping
//! - [`core`]: shared primitives ([`core::AuthToken`])
//!
//! ## Guarantees
//! - Exchanges on one request channel never interleave; request/response
//!   correlation is implicit in program order on the single connection
//! - Errors are two-tier: payload-level failures leave a connection
//!   usable, transport-level failures always discard it
//! - Every length-prefixed read is bounded before allocation
//!
//! ## Example
//! ```no_run
//! use chatwire::client::Client;
//! use chatwire::config::ClientConfig;
//! use serde_json::json;
//!
//! # async fn run() -> chatwire::Result<()> {
//! let client = Client::new(ClientConfig::default());
//! client.login("ada", "correct horse").await?;
//! let response = client.request(&json!({"request": "list-threads"})).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod server;
pub mod utils;

pub use crate::core::AuthToken;
pub use error::{ProtocolError, Result};
pub use protocol::Connection;
