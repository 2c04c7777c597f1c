//! # Core Protocol Components
//!
//! Shared primitives used by both the client and server halves.
//!
//! ## Components
//! - **Token**: server-issued 128-byte authentication tokens with hex and
//!   signed-decimal textual forms
//!
//! ## Security
//! - Tokens are minted from the OS CSPRNG and compared by content
//! - `Debug` output redacts token material

pub mod token;

pub use token::AuthToken;
