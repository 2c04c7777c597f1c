//! Block framing over the negotiated ciphers.
//!
//! Cipher output is opaque binary that may contain any byte value, so a
//! frame must either carry its length up front or be made self-delimiting.
//! Fixed blocks use a u16 ("short") or u32 ("long") big-endian ciphertext
//! length prefix. Variable blocks exist for payloads whose length is not
//! known until fully produced: the ciphertext is byte-stuffed so that one
//! unescaped [`TERMINATOR`] byte can end the frame unambiguously.
//!
//! Read guards reject a declared length above the caller's bound *before*
//! allocating the buffer. That rejection is fatal: the unread body leaves
//! the stream misaligned, so the connection must be discarded.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::CipherPair;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ends a variable block when it appears unescaped.
pub const TERMINATOR: u8 = 0x00;

/// Prefixes a literal [`TERMINATOR`] or [`ESCAPE`] byte inside a variable
/// block.
pub const ESCAPE: u8 = 0x7F;

/// Reads and writes encrypted blocks over a byte stream.
///
/// Owns the stream and the per-direction cipher contexts. Exactly one
/// owner performs reads and writes at a time; the types above this layer
/// (client channel, server serve loop) enforce that.
pub struct FrameCodec<S> {
    stream: S,
    ciphers: CipherPair,
}

impl<S> FrameCodec<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, ciphers: CipherPair) -> Self {
        Self { stream, ciphers }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Write a u16-length-prefixed encrypted block.
    ///
    /// # Errors
    /// Fails if the ciphertext does not fit a u16 prefix.
    pub async fn write_short_block(&mut self, plaintext: &[u8]) -> Result<()> {
        let ciphertext = self.ciphers.outbound.encrypt(plaintext);
        if ciphertext.len() > u16::MAX as usize {
            return Err(ProtocolError::Custom(constants::ERR_BLOCK_TOO_LARGE.into()));
        }
        self.stream.write_u16(ciphertext.len() as u16).await?;
        self.stream.write_all(&ciphertext).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write a u32-length-prefixed encrypted block.
    pub async fn write_long_block(&mut self, plaintext: &[u8]) -> Result<()> {
        let ciphertext = self.ciphers.outbound.encrypt(plaintext);
        self.stream.write_u32(ciphertext.len() as u32).await?;
        self.stream.write_all(&ciphertext).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read a u16-length-prefixed block. `max` bounds the declared
    /// ciphertext length before any allocation.
    pub async fn read_short_block(&mut self, max: Option<usize>) -> Result<Vec<u8>> {
        let declared = map_eof(self.stream.read_u16().await)? as usize;
        self.read_body(declared, max).await
    }

    /// Read a u32-length-prefixed block. `max` bounds the declared
    /// ciphertext length before any allocation.
    pub async fn read_long_block(&mut self, max: Option<usize>) -> Result<Vec<u8>> {
        let declared = map_eof(self.stream.read_u32().await)? as usize;
        self.read_body(declared, max).await
    }

    async fn read_body(&mut self, declared: usize, max: Option<usize>) -> Result<Vec<u8>> {
        if let Some(limit) = max {
            if declared > limit {
                return Err(ProtocolError::OversizedBlock { declared, limit });
            }
        }
        let mut ciphertext = vec![0u8; declared];
        map_eof(self.stream.read_exact(&mut ciphertext).await)?;
        self.ciphers.inbound.decrypt(&ciphertext)
    }

    /// Write a self-delimiting encrypted block: ciphertext byte-stuffed
    /// (`0x00` → `0x7F 0x00`, `0x7F` → `0x7F 0x7F`) plus one unescaped
    /// terminator.
    pub async fn write_variable_block(&mut self, plaintext: &[u8]) -> Result<()> {
        let ciphertext = self.ciphers.outbound.encrypt(plaintext);
        self.write_stuffed(&ciphertext).await?;
        self.stream.write_u8(TERMINATOR).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Stream a payload of unknown length as one variable block, reading
    /// `source` until EOF. Ciphertext is produced, stuffed, and written
    /// chunk by chunk, so the payload is never buffered whole. The peer
    /// reads it with [`read_variable_block`](Self::read_variable_block).
    /// Returns the number of plaintext bytes consumed.
    pub async fn write_variable_from<R>(&mut self, source: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut encryptor = self.ciphers.outbound.begin_encrypt();
        let mut chunk = vec![0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            let ciphertext = encryptor.update(&chunk[..n]);
            self.write_stuffed(&ciphertext).await?;
        }
        let ciphertext = encryptor.finish();
        self.write_stuffed(&ciphertext).await?;
        self.stream.write_u8(TERMINATOR).await?;
        self.stream.flush().await?;
        Ok(total)
    }

    async fn write_stuffed(&mut self, ciphertext: &[u8]) -> Result<()> {
        // Worst case every byte needs escaping.
        let mut framed = Vec::with_capacity(ciphertext.len() * 2);
        for &byte in ciphertext {
            if byte == TERMINATOR || byte == ESCAPE {
                framed.push(ESCAPE);
            }
            framed.push(byte);
        }
        self.stream.write_all(&framed).await?;
        Ok(())
    }

    /// Read a self-delimiting encrypted block, unstuffing until the
    /// unescaped terminator.
    pub async fn read_variable_block(&mut self) -> Result<Vec<u8>> {
        let mut ciphertext = Vec::new();
        loop {
            match map_eof(self.stream.read_u8().await)? {
                TERMINATOR => break,
                ESCAPE => {
                    // Whatever follows the escape is a literal.
                    let literal = map_eof(self.stream.read_u8().await)?;
                    ciphertext.push(literal);
                }
                byte => ciphertext.push(byte),
            }
        }
        self.ciphers.inbound.decrypt(&ciphertext)
    }
}

/// A truncated read means the peer vanished mid-frame; alignment is gone.
fn map_eof<T>(result: io::Result<T>) -> Result<T> {
    result.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::ConnectionClosed
        } else {
            ProtocolError::Io(e)
        }
    })
}
