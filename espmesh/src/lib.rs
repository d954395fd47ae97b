//! # espmesh
//!
//! Control plane for per-peer transport-mode ESP in a mesh overlay network.
//!
//! Between every pair of mesh peers the engine negotiates and maintains two
//! unidirectional Security Associations protecting the overlay's UDP traffic
//! with AES-GCM. Establishing one direction is a two-step exchange: the
//! receiving side allocates an SPI, installs the inbound SA and its filter
//! rules, and announces both through a single `CREATE_SA` message; the
//! sending side answers by installing the matching outbound SA and policy.
//! The full tunnel is two such exchanges, one initiated by each peer.
//!
//! The engine drives three collaborators: the kernel xfrm subsystem (through
//! [xfrm::XfrmApi]), the host packet filter (through [filter::IpTables]), and
//! a peer-messaging `send` callback supplied by the enclosing mesh runtime.
//! Rekeying is driven by kernel lifetime notifications consumed by
//! [Ipsec::monitor].

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::io;
use std::net::Ipv4Addr;

use espmesh_proto::kdf;
use espmesh_proto::kdf::KdfError;
use espmesh_proto::message::CreateSa;
use espmesh_proto::message::WireError;
use espmesh_proto::Nonce;
use espmesh_proto::PeerName;
use espmesh_proto::SessionKey;
use espmesh_proto::NONCE_SIZE;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::filter::FilterError;
use crate::filter::FilterManager;
use crate::filter::IpTables;
use crate::registry::ConnRefCounts;
use crate::registry::RekeyCallback;
use crate::registry::SaDirection;
use crate::registry::SpiEntry;
use crate::registry::SpiKey;
use crate::registry::SpiRegistry;
use crate::xfrm::ExpiryEvent;
use crate::xfrm::ExpiryEvents;
use crate::xfrm::SaLimits;
use crate::xfrm::XfrmApi;
use crate::xfrm::XfrmError;
use crate::xfrm::XfrmPolicy;
use crate::xfrm::XfrmState;
use crate::xfrm::XfrmStateId;

pub mod filter;
pub mod registry;
pub mod xfrm;

/// The per-peer ESP establishment engine
///
/// One instance per process. All public operations may be called
/// concurrently; a single lock linearizes them, including the `send`
/// callback inside [Ipsec::protect_init] — when `send` returns, kernel state
/// and registry already reflect the announced SA, so the peer can never act
/// on an announcement before its inbound half exists.
pub struct Ipsec {
    inner: Mutex<Inner>,
}

struct Inner {
    xfrm: Box<dyn XfrmApi>,
    filter: FilterManager,
    refs: ConnRefCounts,
    registry: SpiRegistry,
}

impl Ipsec {
    /// Create the engine and install the packet-filter scaffolding
    pub fn new(xfrm: Box<dyn XfrmApi>, tables: Box<dyn IpTables>) -> Result<Self, Error> {
        let mut filter = FilterManager::new(tables);
        filter.setup()?;

        Ok(Self {
            inner: Mutex::new(Inner {
                xfrm,
                filter,
                refs: ConnRefCounts::default(),
                registry: SpiRegistry::default(),
            }),
        })
    }

    /// Set up the inbound half of one tunnel direction
    ///
    /// Allocates an SPI, installs the inbound SA for traffic from
    /// `remote_peer` and the packet-filter rules for the pair, then announces
    /// the SA to the peer through `send`. Overlapping non-rekey calls for the
    /// same pair coalesce into one establishment. With `is_rekey` the pair
    /// must already have an inbound SA; only the SPI-bound filter rule is
    /// added then, and the superseded SA stays until its hard expiry.
    ///
    /// If `send` fails the installed kernel state is left in place; a later
    /// [Ipsec::destroy] or hard expiry reclaims it.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all)]
    pub async fn protect_init<S, F>(
        &self,
        local_peer: PeerName,
        remote_peer: PeerName,
        local_ip: Ipv4Addr,
        remote_ip: Ipv4Addr,
        dst_port: u16,
        session_key: &SessionKey,
        is_rekey: bool,
        send: S,
    ) -> Result<(), Error>
    where
        S: FnOnce(Vec<u8>) -> F,
        F: Future<Output = io::Result<()>>,
    {
        let mut inner = self.inner.lock().await;
        let key = SpiKey::new(remote_peer, local_peer);

        if !is_rekey && inner.refs.get(key) > 1 {
            debug!("{remote_peer} -> {local_peer} is already protected");
            return Ok(());
        }
        if is_rekey && inner.registry.get(key).is_none() {
            return Err(Error::UnknownSpi {
                src: remote_peer,
                dst: local_peer,
            });
        }

        let nonce = gen_nonce()?;
        let aead_key = kdf::derive_key(session_key, &nonce, local_peer)?;

        let mut sa = inner.xfrm.alloc_spi(remote_ip, local_ip)?;
        sa.key = Some(aead_key);
        sa.limits = SaLimits::inbound();
        inner.xfrm.state_update(&sa)?;

        if is_rekey {
            inner.filter.install_mark_rule(local_ip, remote_ip, sa.spi)?;
        } else {
            inner
                .filter
                .install_peer(local_ip, remote_ip, dst_port, sa.spi)?;
        }

        let msg = CreateSa {
            nonce,
            spi: sa.spi,
        };
        send(msg.compose()).await.map_err(Error::SendFailed)?;

        inner.registry.add(SpiEntry {
            key,
            spi: sa.spi,
            src: remote_ip,
            dst: local_ip,
            direction: SaDirection::In,
        });

        info!(
            "inbound SA {remote_peer} -> {local_peer} installed, spi {:#010x}, rekey {is_rekey}",
            sa.spi
        );
        Ok(())
    }

    /// Complete the outbound half of one tunnel direction
    ///
    /// `msg` is the peer-delivered `CREATE_SA`. Derives the same key as the
    /// initiator, installs the outbound SA and the outbound policy (updating
    /// it in place when the pair already had one, i.e. on rekey), and stores
    /// `rekey` as the soft-expiry trigger of the new SA.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all)]
    pub async fn protect_finish(
        &self,
        msg: &[u8],
        local_peer: PeerName,
        remote_peer: PeerName,
        local_ip: Ipv4Addr,
        remote_ip: Ipv4Addr,
        dst_port: u16,
        session_key: &SessionKey,
        rekey: RekeyCallback,
    ) -> Result<(), Error> {
        let msg = CreateSa::parse(msg)?;

        let mut inner = self.inner.lock().await;
        let key = SpiKey::new(local_peer, remote_peer);
        let is_rekey = inner.registry.get(key).is_some();

        // The peer initiated this direction, its name binds the key
        let aead_key = kdf::derive_key(session_key, &msg.nonce, remote_peer)?;

        let sa = XfrmState::outbound(local_ip, remote_ip, msg.spi, aead_key);
        inner.xfrm.state_add(&sa)?;

        let policy = XfrmPolicy::outbound(local_ip, remote_ip, dst_port, msg.spi);
        if is_rekey {
            inner.xfrm.policy_update(&policy)?;
        } else {
            inner.xfrm.policy_add(&policy)?;
        }

        inner.registry.add(SpiEntry {
            key,
            spi: msg.spi,
            src: local_ip,
            dst: remote_ip,
            direction: SaDirection::Out {
                on_soft_expiry: rekey,
            },
        });

        info!(
            "outbound SA {local_peer} -> {remote_peer} installed, spi {:#010x}, rekey {is_rekey}",
            msg.spi
        );
        Ok(())
    }

    /// Release one establishment of the `remote_peer -> local_peer` direction
    ///
    /// Only the release matching the last live establishment tears the pair
    /// down: inbound SA, outbound SA and policy, the three per-peer filter
    /// rules, and the registry rows. Decrementing below zero reports
    /// [Error::InvalidState] and touches nothing.
    #[instrument(skip_all)]
    pub async fn destroy(
        &self,
        local_peer: PeerName,
        remote_peer: PeerName,
        local_ip: Ipv4Addr,
        remote_ip: Ipv4Addr,
        remote_port: u16,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        let key_in = SpiKey::new(remote_peer, local_peer);

        let count = inner.refs.put(key_in);
        if count > 0 {
            debug!("{remote_peer} -> {local_peer} still referenced {count} times");
            return Ok(());
        }
        if count < 0 {
            return Err(Error::InvalidState {
                src: remote_peer,
                dst: local_peer,
            });
        }

        let inbound_spi = match inner.registry.remove(key_in) {
            Some(entry) => {
                inner.xfrm.state_del(XfrmStateId {
                    src: remote_ip,
                    dst: local_ip,
                    spi: entry.spi,
                })?;
                Some(entry.spi)
            }
            None => {
                warn!("no inbound SA recorded for {remote_peer} -> {local_peer}");
                None
            }
        };

        let key_out = SpiKey::new(local_peer, remote_peer);
        if let Some(entry) = inner.registry.remove(key_out) {
            let policy = XfrmPolicy::outbound(local_ip, remote_ip, remote_port, entry.spi);
            inner.xfrm.policy_del(&policy)?;
            inner.xfrm.state_del(XfrmStateId {
                src: local_ip,
                dst: remote_ip,
                spi: entry.spi,
            })?;
        }

        inner
            .filter
            .remove_peer(local_ip, remote_ip, remote_port, inbound_spi)?;

        info!("tunnel with {remote_peer} torn down");
        Ok(())
    }

    /// Remove every SA and policy this process owns from the kernel and empty
    /// the private chains
    ///
    /// With `destroy` the chains and scaffolding rules are removed as well.
    /// Reference counters and registry rows stay; callers flush at shutdown.
    #[instrument(skip_all)]
    pub async fn flush(&self, destroy: bool) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let policies = inner.xfrm.policy_list()?;
        for policy in &policies {
            inner.xfrm.policy_del(policy)?;
        }

        let states = inner.xfrm.state_list()?;
        for id in states {
            if inner.registry.contains_spi(id.spi) {
                inner.xfrm.state_del(id)?;
            }
        }

        inner.filter.flush(destroy)?;

        info!("flushed, destroy {destroy}");
        Ok(())
    }

    /// Consume kernel expiry notifications until the stream ends or fails
    ///
    /// Soft expiry of an outbound SA fires its rekey trigger; hard expiry
    /// removes whatever the kernel has already reclaimed from the registry
    /// and, for inbound SAs, the SPI-bound filter rule. Stream errors are
    /// fatal and surface to the caller.
    pub async fn monitor(&self, events: &mut ExpiryEvents) -> Result<(), Error> {
        while let Some(event) = events.recv().await {
            self.handle_expiry(event?).await?;
        }
        Ok(())
    }

    async fn handle_expiry(&self, event: ExpiryEvent) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(entry) = inner.registry.get_spi(event.spi).cloned() else {
            debug!("expiry for untracked spi {:#010x}", event.spi);
            return Ok(());
        };

        match (&entry.direction, event.hard) {
            (SaDirection::In, true) => {
                // The kernel already dropped the SA; retire its filter rule
                if let Err(err) = inner.filter.remove_mark_rule(entry.dst, entry.src, entry.spi) {
                    warn!(
                        "could not remove ESP mark rule for spi {:#010x}: {err}",
                        entry.spi
                    );
                }
                inner.registry.remove_spi(event.spi);
                info!("inbound SA spi {:#010x} hard-expired", event.spi);
            }
            (SaDirection::In, false) => {
                debug!("ignoring soft expiry of inbound spi {:#010x}", event.spi);
            }
            (SaDirection::Out { .. }, true) => {
                inner.registry.remove_spi(event.spi);
                info!("outbound SA spi {:#010x} hard-expired", event.spi);
            }
            (SaDirection::Out { on_soft_expiry }, false) => {
                info!("outbound SA spi {:#010x} soft-expired, rekeying", event.spi);
                on_soft_expiry().map_err(Error::SendFailed)?;
            }
        }
        Ok(())
    }
}

fn gen_nonce() -> Result<Nonce, Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|err| Error::Crypto(err.to_string()))?;
    Ok(nonce)
}

/// The errors surfaced by the establishment engine
///
/// Nothing is retried; establishment cadence belongs to the upper layer.
#[derive(Debug, Error)]
pub enum Error {
    /// A kernel xfrm operation failed
    #[error(transparent)]
    Kernel(#[from] XfrmError),

    /// A packet-filter operation failed
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// The peer-delivered control message was rejected
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Rekey requested for a pair with no live inbound SA
    #[error("no inbound SA registered for {src} -> {dst}")]
    UnknownSpi {
        /// Sender of the missing direction
        src: PeerName,
        /// Receiver of the missing direction
        dst: PeerName,
    },

    /// The random source or the key derivation failed
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A teardown without a matching establishment
    #[error("reference count for {src} -> {dst} dropped below zero")]
    InvalidState {
        /// Sender of the over-released direction
        src: PeerName,
        /// Receiver of the over-released direction
        dst: PeerName,
    },

    /// The caller-supplied send or rekey callback failed
    #[error("callback failed: {0}")]
    SendFailed(#[source] io::Error),
}

impl From<KdfError> for Error {
    fn from(value: KdfError) -> Self {
        Self::Crypto(value.to_string())
    }
}
