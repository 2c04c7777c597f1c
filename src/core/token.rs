//! Server-issued authentication tokens.
//!
//! A token is a fixed-size random value minted on successful login or
//! account creation. The client stores it and replays it to re-authenticate
//! a fresh connection without a password. Minting a new token for a user
//! implicitly invalidates the previous one (see `server::auth`).
//!
//! Three textual forms exist for interchange with stored sessions:
//! lowercase hex (the canonical string form), and a signed big-integer
//! decimal string (the 128 bytes interpreted as a big-endian two's
//! complement integer).

use crate::error::{ProtocolError, Result};
use num_bigint::{BigInt, Sign};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

/// Size of a token in bytes.
pub const TOKEN_LEN: usize = 128;

/// A fixed-size, cryptographically random authentication credential.
///
/// Immutable; equality and hashing are by content.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthToken {
    bytes: [u8; TOKEN_LEN],
}

impl AuthToken {
    /// Mint a fresh token from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Raw token material.
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.bytes
    }

    /// Construct from raw bytes. Fails unless exactly [`TOKEN_LEN`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; TOKEN_LEN] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidToken(format!(
                "expected {TOKEN_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Lowercase hex encoding (the canonical string form).
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse from hex. Accepts upper or lower case, requires exactly
    /// [`TOKEN_LEN`] bytes worth of digits.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ProtocolError::InvalidToken(format!("bad hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Signed decimal encoding: the 128 bytes as a big-endian two's
    /// complement integer.
    pub fn to_decimal(&self) -> String {
        BigInt::from_signed_bytes_be(&self.bytes).to_string()
    }

    /// Parse from the signed decimal form, sign-extending back to exactly
    /// [`TOKEN_LEN`] bytes.
    pub fn from_decimal(s: &str) -> Result<Self> {
        let value = BigInt::from_str(s)
            .map_err(|e| ProtocolError::InvalidToken(format!("bad decimal: {e}")))?;
        let minimal = value.to_signed_bytes_be();
        if minimal.len() > TOKEN_LEN {
            return Err(ProtocolError::InvalidToken(format!(
                "decimal value needs {} bytes, token is {TOKEN_LEN}",
                minimal.len()
            )));
        }
        let fill = if value.sign() == Sign::Minus { 0xFF } else { 0x00 };
        let mut bytes = [fill; TOKEN_LEN];
        bytes[TOKEN_LEN - minimal.len()..].copy_from_slice(&minimal);
        Ok(Self { bytes })
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for AuthToken {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for AuthToken {
    /// Redacted: tokens are credentials and must not land in logs whole.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken({}…)", hex::encode(&self.bytes[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let token = AuthToken::generate();
        let parsed = AuthToken::from_hex(&token.to_hex()).unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn canonical_string_roundtrip() {
        let token = AuthToken::generate();
        let parsed: AuthToken = token.to_string().parse().unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn decimal_roundtrip() {
        // Random tokens cover both signs of the two's complement form over
        // repeated runs; force both explicitly as well.
        for _ in 0..8 {
            let token = AuthToken::generate();
            let parsed = AuthToken::from_decimal(&token.to_decimal()).unwrap();
            assert_eq!(token, parsed);
        }

        let mut positive = [0u8; TOKEN_LEN];
        positive[0] = 0x01;
        positive[TOKEN_LEN - 1] = 0xFE;
        let token = AuthToken::from_bytes(&positive).unwrap();
        assert_eq!(token, AuthToken::from_decimal(&token.to_decimal()).unwrap());

        let mut negative = [0xFFu8; TOKEN_LEN];
        negative[TOKEN_LEN - 1] = 0x03;
        let token = AuthToken::from_bytes(&negative).unwrap();
        assert_eq!(token, AuthToken::from_decimal(&token.to_decimal()).unwrap());
    }

    #[test]
    fn all_zero_token_decimal() {
        let token = AuthToken::from_bytes(&[0u8; TOKEN_LEN]).unwrap();
        assert_eq!(token.to_decimal(), "0");
        assert_eq!(token, AuthToken::from_decimal("0").unwrap());
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(AuthToken::from_hex("abcd").is_err());
        assert!(AuthToken::from_bytes(&[0u8; 64]).is_err());
    }

    #[test]
    fn tokens_are_distinct() {
        assert_ne!(AuthToken::generate(), AuthToken::generate());
    }

    #[test]
    fn debug_redacts() {
        let token = AuthToken::generate();
        let shown = format!("{token:?}");
        assert!(!shown.contains(&token.to_hex()));
    }
}
