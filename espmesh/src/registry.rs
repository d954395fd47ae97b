//! SPI bookkeeping
//!
//! Two structures, both living behind the engine lock: the per-direction
//! reference counters that coalesce overlapping establishment attempts, and
//! the dual-index registry of every SA this process has created. The registry
//! is indexed both ways because caller operations identify an SA by its peer
//! pair while kernel events identify it by SPI.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use espmesh_proto::PeerName;

/// Directed peer-pair key: big-endian source peer followed by big-endian
/// destination peer
///
/// Directed means `SpiKey::new(a, b) != SpiKey::new(b, a)`; the two
/// directions of a tunnel are tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpiKey([u8; 16]);

impl SpiKey {
    /// Key of the direction whose traffic flows `src` to `dst`
    pub fn new(src: PeerName, dst: PeerName) -> Self {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&src.to_be_bytes());
        key[8..].copy_from_slice(&dst.to_be_bytes());
        Self(key)
    }
}

/// Callback held by outbound entries to start the local half of a rekey
///
/// Invoked under the engine lock on soft expiry; it must hand the work to the
/// upper layer rather than re-enter the engine.
pub type RekeyCallback = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// Which way an SA carries traffic, with the rekey trigger on the
/// outbound side
pub enum SaDirection {
    /// SA decrypting traffic arriving from the peer
    In,
    /// SA encrypting traffic leaving for the peer
    Out {
        /// Rekey trigger, fired on soft expiry
        on_soft_expiry: RekeyCallback,
    },
}

impl fmt::Debug for SaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => write!(f, "In"),
            Self::Out { .. } => write!(f, "Out"),
        }
    }
}

/// Metadata of one live SA created by this process
#[derive(Debug)]
pub struct SpiEntry {
    /// Directed peer pair the SA belongs to
    pub key: SpiKey,
    /// Kernel-assigned SPI
    pub spi: u32,
    /// Sender of the protected traffic
    pub src: Ipv4Addr,
    /// Receiver of the protected traffic
    pub dst: Ipv4Addr,
    /// Traffic direction and, outbound, the rekey trigger
    pub direction: SaDirection,
}

impl SpiEntry {
    /// Whether this SA decrypts traffic from the peer
    pub fn is_inbound(&self) -> bool {
        matches!(self.direction, SaDirection::In)
    }
}

/// Signed per-direction counters over concurrent establishment requests
#[derive(Debug, Default)]
pub struct ConnRefCounts {
    counts: HashMap<SpiKey, i32>,
}

impl ConnRefCounts {
    /// Pre-increment the counter of `key` and return the new value
    pub fn get(&mut self, key: SpiKey) -> i32 {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Pre-decrement the counter of `key` and return the new value
    ///
    /// A negative result means a teardown without a matching establishment,
    /// which the engine reports as an invariant violation.
    pub fn put(&mut self, key: SpiKey) -> i32 {
        let count = self.counts.entry(key).or_insert(0);
        *count -= 1;
        *count
    }
}

/// The by-key and by-SPI indices over the live SAs
///
/// Both maps hold the same [Arc]ed entries. `add` replaces the by-key row of
/// a rekeyed pair while the superseded SPI stays reachable by SPI, so the
/// hard-expiry handler can still clean it up.
#[derive(Debug, Default)]
pub struct SpiRegistry {
    by_key: HashMap<SpiKey, Arc<SpiEntry>>,
    by_spi: HashMap<u32, Arc<SpiEntry>>,
}

impl SpiRegistry {
    /// Insert an entry, replacing any prior one at the same key
    pub fn add(&mut self, entry: SpiEntry) {
        let entry = Arc::new(entry);
        self.by_key.insert(entry.key, entry.clone());
        self.by_spi.insert(entry.spi, entry);
    }

    /// Current entry of a directed peer pair
    pub fn get(&self, key: SpiKey) -> Option<&Arc<SpiEntry>> {
        self.by_key.get(&key)
    }

    /// Entry owning `spi`, current or superseded
    pub fn get_spi(&self, spi: u32) -> Option<&Arc<SpiEntry>> {
        self.by_spi.get(&spi)
    }

    /// Whether `spi` belongs to this process
    pub fn contains_spi(&self, spi: u32) -> bool {
        self.by_spi.contains_key(&spi)
    }

    /// Remove a pair's current entry from both indices
    pub fn remove(&mut self, key: SpiKey) -> Option<Arc<SpiEntry>> {
        let entry = self.by_key.remove(&key)?;
        self.by_spi.remove(&entry.spi);
        Some(entry)
    }

    /// Remove the rows of `spi`
    ///
    /// The by-key row goes too only while it still points at `spi`; after a
    /// rekey it already points at the replacement and is left alone.
    pub fn remove_spi(&mut self, spi: u32) -> Option<Arc<SpiEntry>> {
        let entry = self.by_spi.remove(&spi)?;
        if self.by_key.get(&entry.key).is_some_and(|current| current.spi == spi) {
            self.by_key.remove(&entry.key);
        }
        Some(entry)
    }

    /// Number of live entries reachable by key
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether no SA is tracked at all
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.by_spi.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: SpiKey, spi: u32) -> SpiEntry {
        SpiEntry {
            key,
            spi,
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(10, 0, 0, 1),
            direction: SaDirection::In,
        }
    }

    #[test]
    fn keys_are_directed() {
        let a = PeerName(1);
        let b = PeerName(2);
        assert_ne!(SpiKey::new(a, b), SpiKey::new(b, a));
        assert_eq!(SpiKey::new(a, a), SpiKey::new(a, a));
    }

    #[test]
    fn refcounts_pre_increment_and_pre_decrement() {
        let key = SpiKey::new(PeerName(1), PeerName(2));
        let mut counts = ConnRefCounts::default();
        assert_eq!(counts.get(key), 1);
        assert_eq!(counts.get(key), 2);
        assert_eq!(counts.put(key), 1);
        assert_eq!(counts.put(key), 0);
        assert_eq!(counts.put(key), -1);
    }

    #[test]
    fn refcounts_track_directions_independently() {
        let ab = SpiKey::new(PeerName(1), PeerName(2));
        let ba = SpiKey::new(PeerName(2), PeerName(1));
        let mut counts = ConnRefCounts::default();
        assert_eq!(counts.get(ab), 1);
        assert_eq!(counts.get(ba), 1);
        assert_eq!(counts.put(ab), 0);
        assert_eq!(counts.get(ba), 2);
    }

    #[test]
    fn both_indices_see_the_same_entry() {
        let key = SpiKey::new(PeerName(2), PeerName(1));
        let mut registry = SpiRegistry::default();
        registry.add(entry(key, 0x100));

        let by_key = registry.get(key).map(|e| e.spi);
        let by_spi = registry.get_spi(0x100).map(|e| e.key);
        assert_eq!(by_key, Some(0x100));
        assert_eq!(by_spi, Some(key));

        registry.remove(key);
        assert!(registry.get(key).is_none());
        assert!(registry.get_spi(0x100).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn rekey_replacement_keeps_the_old_spi_reachable() {
        let key = SpiKey::new(PeerName(2), PeerName(1));
        let mut registry = SpiRegistry::default();
        registry.add(entry(key, 0x100));
        registry.add(entry(key, 0x200));

        assert_eq!(registry.get(key).map(|e| e.spi), Some(0x200));
        assert!(registry.contains_spi(0x100));
        assert!(registry.contains_spi(0x200));

        // Hard expiry of the superseded SPI must not disturb the current one
        registry.remove_spi(0x100);
        assert_eq!(registry.get(key).map(|e| e.spi), Some(0x200));
        assert!(!registry.contains_spi(0x100));

        registry.remove_spi(0x200);
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_an_unknown_spi_is_a_no_op() {
        let mut registry = SpiRegistry::default();
        assert!(registry.remove_spi(0xdead).is_none());
        assert_eq!(registry.len(), 0);
    }
}
