//! The `CREATE_SA` control message
//!
//! The only message of the exchange. It announces a freshly installed inbound
//! SA to the peer, carrying the nonce the peer needs to derive the matching
//! key and the SPI the kernel picked.
//!
//! ```text
//!      0                   1                   2                   3
//!      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     |  Version = 1  |                                               |
//!     +-+-+-+-+-+-+-+-+                                               +
//!     |                                                               |
//!     ~                         Nonce (32 bytes)                      ~
//!     |                                                               |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     |                              SPI                              |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!     |                                                               |
//!     ~                    Reserved (28 bytes, zero)                  ~
//!     |                                                               |
//!     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The reserved tail is emitted as zero and ignored on read.

use log::debug;
use thiserror::Error;
use zerocopy::network_endian::U32;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;
use zerocopy::Unaligned;

use crate::Nonce;
use crate::NONCE_SIZE;

/// The protocol version this implementation speaks
pub const VERSION: u8 = 1;

/// Exact size of a serialized [CreateSa]: version, nonce, and a 32-byte
/// trailing field whose first four bytes hold the SPI
pub const MESSAGE_SIZE: usize = 1 + NONCE_SIZE + 32;

const RESERVED_SIZE: usize = 28;

/// Network representation of [CreateSa]
#[derive(FromBytes, FromZeroes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C, packed)]
struct RawCreateSa {
    version: u8,
    nonce: [u8; NONCE_SIZE],
    spi: U32,
    reserved: [u8; RESERVED_SIZE],
}

/// Announcement of a freshly installed inbound SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateSa {
    /// Key-derivation salt generated by the announcing side
    pub nonce: Nonce,
    /// Kernel-assigned SPI of the announced SA
    pub spi: u32,
}

impl CreateSa {
    /// Serialize into the fixed 65-byte wire form
    pub fn compose(&self) -> Vec<u8> {
        let raw = RawCreateSa {
            version: VERSION,
            nonce: self.nonce,
            spi: U32::from(self.spi),
            reserved: [0; RESERVED_SIZE],
        };
        raw.as_bytes().to_vec()
    }

    /// Parse a peer-delivered buffer
    ///
    /// The buffer must be exactly [MESSAGE_SIZE] bytes and carry [VERSION];
    /// these are the only validations performed.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let Some(raw) = RawCreateSa::ref_from(buf) else {
            debug!("rejecting control message of {} bytes", buf.len());
            return Err(WireError::MalformedMessage { len: buf.len() });
        };
        if raw.version != VERSION {
            debug!("rejecting control message with version {}", raw.version);
            return Err(WireError::UnsupportedVersion(raw.version));
        }

        Ok(Self {
            nonce: raw.nonce,
            spi: raw.spi.get(),
        })
    }
}

/// The errors that can occur while reading a `CREATE_SA` message
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum WireError {
    #[error("message has {len} bytes, expected {MESSAGE_SIZE}")]
    MalformedMessage { len: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}
