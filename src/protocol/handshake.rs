//! Encrypted-channel negotiation via ephemeral RSA key exchange.
//!
//! Both peers run the identical procedure over a duplex byte stream: each
//! generates a throwaway RSA-2048 key pair, trades public keys, then sends
//! its locally generated AES-128 key and IV wrapped with RSA-OAEP(SHA-256)
//! under the *peer's* public key. Because the steps are symmetric, A's
//! outbound cipher is B's inbound cipher and vice versa.
//!
//! Every received field carries a u16 length prefix checked against
//! [`MAX_HANDSHAKE_FIELD`] before any allocation, so a hostile or buggy
//! peer cannot force an unbounded buffer.
//!
//! The exchange performs no peer authentication (no certificate pinning):
//! an active attacker who substitutes keys can read the channel. This is
//! the protocol's inherited trust model and is deliberately left unchanged
//! here.
//!
//! Any failure aborts the handshake; the connection must be treated as a
//! hard connect failure and never reused in a partial state.

use crate::error::{constants, ProtocolError, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Modulus size of the ephemeral handshake key pair.
pub const RSA_KEY_BITS: usize = 2048;

/// Sanity bound on any length-prefixed handshake field. A peer declaring
/// more than this is malformed or hostile.
pub const MAX_HANDSHAKE_FIELD: usize = 10_000;

/// AES-128 key and CBC IV size.
pub const SECRET_LEN: usize = 16;

/// One direction's symmetric cipher context.
///
/// Each block operation re-initializes the CBC chain from the negotiated
/// key and IV, so blocks are independently decryptable and a corrupted
/// block does not poison later ones.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BlockCipher {
    key: [u8; SECRET_LEN],
    iv: [u8; SECRET_LEN],
}

impl BlockCipher {
    pub fn new(key: [u8; SECRET_LEN], iv: [u8; SECRET_LEN]) -> Self {
        Self { key, iv }
    }

    /// Encrypt a whole payload in one pass (PKCS7 padded). Empty payloads
    /// produce a single padding block.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Begin encrypting one block's payload incrementally. The resulting
    /// ciphertext is identical to a single [`encrypt`](Self::encrypt) pass
    /// over the concatenated chunks.
    pub fn begin_encrypt(&self) -> StreamEncryptor {
        StreamEncryptor {
            inner: Aes128CbcEnc::new(&self.key.into(), &self.iv.into()),
            pending: Vec::new(),
        }
    }

    /// Decrypt a whole ciphertext. A padding failure is the recoverable
    /// block-level error: the frame was consumed whole, so stream alignment
    /// still holds.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(ProtocolError::CorruptBlock);
        }
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| ProtocolError::CorruptBlock)
    }
}

/// Incremental encryption state for one block's payload, for payloads too
/// large or too slowly produced to buffer whole. Feed plaintext chunks
/// with [`update`](Self::update); [`finish`](Self::finish) pads and emits
/// the final block.
pub struct StreamEncryptor {
    inner: Aes128CbcEnc,
    pending: Vec<u8>,
}

impl StreamEncryptor {
    /// Absorb a plaintext chunk, returning the whole ciphertext blocks it
    /// completes. Up to 15 trailing bytes are carried to the next call.
    pub fn update(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(chunk);
        let full = self.pending.len() - self.pending.len() % 16;
        let mut out: Vec<u8> = self.pending.drain(..full).collect();
        for block in out.chunks_exact_mut(16) {
            self.inner
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    /// Pad and encrypt whatever remains, consuming the encryptor.
    pub fn finish(mut self) -> Vec<u8> {
        let tail = std::mem::take(&mut self.pending);
        self.inner.encrypt_padded_vec_mut::<Pkcs7>(&tail)
    }
}

/// The two independent cipher contexts a handshake yields.
pub struct CipherPair {
    /// Encrypts with the locally generated key/IV.
    pub outbound: BlockCipher,
    /// Decrypts with the key/IV received from the peer.
    pub inbound: BlockCipher,
}

impl std::fmt::Debug for CipherPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherPair").finish_non_exhaustive()
    }
}

/// Run the key exchange over `stream`, producing the per-direction ciphers.
///
/// # Errors
/// [`ProtocolError::Handshake`] on any size-bound violation or cryptographic
/// failure; I/O errors pass through. All are fatal.
#[instrument(skip(stream), level = "debug")]
pub async fn negotiate<S>(stream: &mut S) -> Result<CipherPair>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| ProtocolError::Handshake(format!("ephemeral key generation failed: {e}")))?;
    let public_der = private_key
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| ProtocolError::Handshake(format!("public key encoding failed: {e}")))?;

    write_field(stream, public_der.as_bytes()).await?;
    stream.flush().await?;

    let peer_der = read_field(stream).await?;
    let peer_public = RsaPublicKey::from_public_key_der(&peer_der)
        .map_err(|_| ProtocolError::Handshake(constants::ERR_HANDSHAKE_BAD_KEY.into()))?;
    debug!(peer_key_len = peer_der.len(), "peer public key received");

    let mut key = [0u8; SECRET_LEN];
    let mut iv = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut key);
    OsRng.fill_bytes(&mut iv);

    let wrapped_key = wrap(&peer_public, &key)?;
    let wrapped_iv = wrap(&peer_public, &iv)?;
    write_field(stream, &wrapped_key).await?;
    write_field(stream, &wrapped_iv).await?;
    stream.flush().await?;

    let peer_wrapped_key = read_field(stream).await?;
    let peer_wrapped_iv = read_field(stream).await?;
    let peer_key = unwrap(&private_key, &peer_wrapped_key)?;
    let peer_iv = unwrap(&private_key, &peer_wrapped_iv)?;

    let pair = CipherPair {
        outbound: BlockCipher::new(key, iv),
        inbound: BlockCipher::new(peer_key, peer_iv),
    };

    // The ciphers hold their own copies; scrub the locals.
    key.zeroize();
    iv.zeroize();

    debug!("session ciphers established");
    Ok(pair)
}

/// RSA-OAEP(SHA-256)-encrypt a secret under the peer's public key.
fn wrap(peer: &RsaPublicKey, secret: &[u8; SECRET_LEN]) -> Result<Vec<u8>> {
    peer.encrypt(&mut OsRng, Oaep::new::<Sha256>(), secret)
        .map_err(|_| ProtocolError::Handshake(constants::ERR_HANDSHAKE_WRAP_FAILED.into()))
}

/// Decrypt a peer-wrapped secret; must yield exactly [`SECRET_LEN`] bytes.
fn unwrap(private: &RsaPrivateKey, wrapped: &[u8]) -> Result<[u8; SECRET_LEN]> {
    let mut plain = private
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|_| ProtocolError::Handshake(constants::ERR_HANDSHAKE_UNWRAP_FAILED.into()))?;
    let secret: [u8; SECRET_LEN] = plain.as_slice().try_into().map_err(|_| {
        ProtocolError::Handshake(constants::ERR_HANDSHAKE_BAD_SECRET_LEN.into())
    })?;
    plain.zeroize();
    Ok(secret)
}

async fn write_field<S: AsyncWrite + Unpin>(stream: &mut S, field: &[u8]) -> Result<()> {
    debug_assert!(field.len() <= u16::MAX as usize);
    stream.write_u16(field.len() as u16).await?;
    stream.write_all(field).await?;
    Ok(())
}

async fn read_field<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let declared = stream.read_u16().await? as usize;
    if declared > MAX_HANDSHAKE_FIELD {
        return Err(ProtocolError::Handshake(
            constants::ERR_HANDSHAKE_KEY_TOO_LARGE.into(),
        ));
    }
    let mut field = vec![0u8; declared];
    stream.read_exact(&mut field).await?;
    Ok(field)
}
