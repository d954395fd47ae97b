//! # espmesh-proto
//!
//! The protocol-level pieces of the espmesh SA exchange: the single
//! `CREATE_SA` control message and the HKDF-based derivation of per-direction
//! AEAD key material.

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

pub mod kdf;
pub mod message;
mod peer;

pub use crate::peer::PeerName;

/// Size in bytes of the session key the enclosing mesh runtime agrees on
/// for each peer pair
pub const SESSION_KEY_SIZE: usize = 32;

/// Size in bytes of the nonce generated for every inbound SA and carried
/// in [message::CreateSa]
pub const NONCE_SIZE: usize = 32;

/// The shared session key for one peer pair, treated as opaque bytes
pub type SessionKey = [u8; SESSION_KEY_SIZE];

/// The per-SA nonce, used as the key-derivation salt
pub type Nonce = [u8; NONCE_SIZE];
