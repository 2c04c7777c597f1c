//! # Wire Protocol
//!
//! The encrypted transport stack, layered bottom-up:
//!
//! - **Handshake**: ephemeral RSA key exchange bootstrapping one AES cipher
//!   context per direction over a raw byte stream
//! - **Framing**: length-prefixed and self-delimiting encrypted blocks atop
//!   the negotiated ciphers
//! - **Connection**: the facade combining both, with UTF-8 string and JSON
//!   convenience and idempotent close semantics
//!
//! ## Wire Format
//! ```text
//! handshake:  [u16 len][RSA public key DER]
//!             [u16 len][OAEP-wrapped AES key] [u16 len][OAEP-wrapped IV]
//! short frame: [u16 len][AES-CBC ciphertext]
//! long frame:  [u32 len][AES-CBC ciphertext]
//! variable:    byte-stuffed ciphertext, escape 0x7F, terminator 0x00
//! ```
//!
//! ## Security
//! - Handshake fields bounded (10,000 bytes) before allocation
//! - Length guards on fixed frames reject before allocating
//! - Key material zeroized on drop

pub mod connection;
pub mod framing;
pub mod handshake;

pub use connection::Connection;
pub use framing::FrameCodec;
pub use handshake::{negotiate, BlockCipher, CipherPair, StreamEncryptor};
