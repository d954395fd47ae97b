use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Opaque identifier of a mesh peer
///
/// Peer names have no structure beyond equality, total order and their
/// big-endian byte encoding. They are assigned by the enclosing mesh runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerName(pub u64);

impl PeerName {
    /// The big-endian byte encoding, used in registry keys and as
    /// key-derivation info
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl From<u64> for PeerName {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
