//! The connection facade: handshake + framing + payload convenience.
//!
//! A [`Connection`] owns one negotiated duplex stream and its cipher pair.
//! Exactly one entity (a request-channel exchange or a server connection
//! task) performs its reads and writes at a time. Lifecycle is
//! open → active → closed; closed is terminal and a connection can never
//! be reopened.

use crate::error::{ProtocolError, Result};
use crate::protocol::framing::FrameCodec;
use crate::protocol::handshake::{self, CipherPair};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::debug;

/// Object-safe bound for the transports a connection can run over:
/// `TcpStream` in production, `tokio::io::duplex` pipes in tests.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// An encrypted duplex channel speaking the block protocol.
pub struct Connection {
    codec: FrameCodec<BufStream<Box<dyn SessionStream>>>,
    closed: bool,
}

impl Connection {
    /// Run the handshake over a fresh stream and wrap it.
    ///
    /// # Errors
    /// Any handshake failure is fatal; the stream must be discarded.
    pub async fn negotiate<S>(stream: S) -> Result<Self>
    where
        S: SessionStream + 'static,
    {
        let mut buffered = BufStream::new(Box::new(stream) as Box<dyn SessionStream>);
        let ciphers = handshake::negotiate(&mut buffered).await?;
        Ok(Self {
            codec: FrameCodec::new(buffered, ciphers),
            closed: false,
        })
    }

    /// Wrap a stream whose cipher state was established elsewhere.
    pub fn from_parts<S>(stream: S, ciphers: CipherPair) -> Self
    where
        S: SessionStream + 'static,
    {
        Self {
            codec: FrameCodec::new(
                BufStream::new(Box::new(stream) as Box<dyn SessionStream>),
                ciphers,
            ),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ProtocolError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    pub async fn send_short_block(&mut self, plaintext: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.codec.write_short_block(plaintext).await
    }

    pub async fn recv_short_block(&mut self, max: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.codec.read_short_block(max).await
    }

    pub async fn send_long_block(&mut self, plaintext: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.codec.write_long_block(plaintext).await
    }

    pub async fn recv_long_block(&mut self, max: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.codec.read_long_block(max).await
    }

    pub async fn send_variable_block(&mut self, plaintext: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.codec.write_variable_block(plaintext).await
    }

    pub async fn recv_variable_block(&mut self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.codec.read_variable_block().await
    }

    /// Stream a payload of unknown length as one variable block, reading
    /// `source` until EOF without buffering the payload whole.
    pub async fn send_variable_from<R>(&mut self, source: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_open()?;
        self.codec.write_variable_from(source).await
    }

    /// UTF-8 string over a long block.
    pub async fn send_str(&mut self, text: &str) -> Result<()> {
        self.send_long_block(text.as_bytes()).await
    }

    /// Invalid UTF-8 is a payload-level (recoverable) failure.
    pub async fn recv_str(&mut self, max: Option<usize>) -> Result<String> {
        let bytes = self.recv_long_block(max).await?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// JSON object over a UTF-8 long block.
    pub async fn send_json(&mut self, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send_str(&text).await
    }

    pub async fn recv_json(&mut self, max: Option<usize>) -> Result<Value> {
        let text = self.recv_str(max).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Close the connection. Idempotent and always succeeds from the
    /// caller's perspective; shutdown errors on the underlying stream are
    /// logged and swallowed. Any later operation fails with
    /// [`ProtocolError::ConnectionClosed`].
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.codec.stream_mut().shutdown().await {
            debug!(error = %e, "stream shutdown failed during close");
        }
    }
}

/// Connected in-memory pair with mirrored ciphers, skipping the RSA
/// exchange. Unit-test helper shared across the crate.
#[cfg(test)]
pub(crate) fn loopback_pair() -> (Connection, Connection) {
    use crate::protocol::handshake::BlockCipher;

    let (a, b) = tokio::io::duplex(1 << 20);
    let (key_a, iv_a) = ([11u8; 16], [12u8; 16]);
    let (key_b, iv_b) = ([13u8; 16], [14u8; 16]);
    let conn_a = Connection::from_parts(
        a,
        CipherPair {
            outbound: BlockCipher::new(key_a, iv_a),
            inbound: BlockCipher::new(key_b, iv_b),
        },
    );
    let conn_b = Connection::from_parts(
        b,
        CipherPair {
            outbound: BlockCipher::new(key_b, iv_b),
            inbound: BlockCipher::new(key_a, iv_a),
        },
    );
    (conn_a, conn_b)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn string_and_json_roundtrip() {
        let (mut a, mut b) = loopback_pair();
        a.send_str("héllo wörld").await.unwrap();
        assert_eq!(b.recv_str(None).await.unwrap(), "héllo wörld");

        b.send_json(&json!({"request": "ping", "seq": 7}))
            .await
            .unwrap();
        let value = a.recv_json(None).await.unwrap();
        assert_eq!(value["request"], "ping");
        assert_eq!(value["seq"], 7);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let (mut a, _b) = loopback_pair();
        a.close().await;
        a.close().await;
        assert!(a.is_closed());
        let err = a.send_str("late").await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
        let err = a.recv_json(None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn malformed_json_is_recoverable() {
        let (mut a, mut b) = loopback_pair();
        a.send_str("{not json").await.unwrap();
        let err = b.recv_json(None).await.unwrap_err();
        assert!(!err.is_fatal());

        // Connection still aligned and usable afterwards.
        a.send_json(&json!({"ok": true})).await.unwrap();
        assert_eq!(b.recv_json(None).await.unwrap()["ok"], true);
    }
}
