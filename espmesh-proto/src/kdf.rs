//! Derivation of per-direction AEAD key material
//!
//! Each SA direction gets its own 36-byte key (a 32-byte AES-GCM-128 key
//! followed by the 4-byte salt of `rfc4106(gcm(aes))`), derived with
//! HKDF-SHA256 from the pair's session key. The nonce carried in `CREATE_SA`
//! is the salt, and the name of the peer that initiated the direction is the
//! info, so the two directions of a tunnel never share a key.

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::Nonce;
use crate::PeerName;
use crate::SessionKey;

/// Size in bytes of the derived key material: AES-GCM-128 key plus salt
pub const AEAD_KEY_SIZE: usize = 36;

/// Key material for one SA direction
pub type AeadKey = [u8; AEAD_KEY_SIZE];

/// Derive the AEAD key for one SA direction
///
/// `initiator` is the peer that installed the inbound SA this key protects,
/// i.e. the side that generated `nonce`. Both ends of the exchange pass the
/// same value and arrive at the same key.
pub fn derive_key(
    session_key: &SessionKey,
    nonce: &Nonce,
    initiator: PeerName,
) -> Result<AeadKey, KdfError> {
    let hk = Hkdf::<Sha256>::new(Some(nonce.as_slice()), session_key.as_slice());

    let mut okm = [0u8; AEAD_KEY_SIZE];
    hk.expand(&initiator.to_be_bytes(), &mut okm)
        .map_err(|_| KdfError::InvalidLength)?;

    Ok(okm)
}

/// The errors that can occur while deriving key material
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum KdfError {
    #[error("requested key material exceeds the HKDF output limit")]
    InvalidLength,
}
