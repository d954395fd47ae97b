//! Typed facade over the kernel xfrm subsystem
//!
//! The establishment engine only ever needs a handful of xfrm operations,
//! always on IPv4 transport-mode ESP states with a fixed AEAD. This module
//! models exactly that surface; [netlink] carries it to the kernel.

pub mod netlink;

use std::io;
use std::net::Ipv4Addr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use espmesh_proto::kdf::AeadKey;

/// IP protocol number of ESP
pub const IPPROTO_ESP: u8 = 50;

/// IP protocol number of UDP
pub const IPPROTO_UDP: u8 = 17;

/// AEAD algorithm installed on every SA
pub const AEAD_ALG: &str = "rfc4106(gcm(aes))";

/// ICV length in bits for [AEAD_ALG]
pub const AEAD_ICV_BITS: u32 = 128;

/// Anti-replay window of every SA
pub const REPLAY_WINDOW: u8 = 32;

/// The packet-mark bit reserved for this subsystem, used both as mark value
/// and as mark mask on policies and filter rules
pub const PROCESS_MARK: u32 = 0x2_0000;

const HARD_PACKET_LIMIT: u64 = 100;
const HARD_EXPIRY_SECS: u64 = 14;
const SOFT_PACKET_LIMIT: u64 = 50;
const SOFT_EXPIRY_SECS: u64 = 10;

/// Lifetime limits of an SA
///
/// `None` means unlimited. Crossing a soft limit makes the kernel emit a
/// soft [ExpiryEvent] while the SA keeps working; crossing a hard limit
/// removes the SA and emits a hard event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaLimits {
    /// Soft packet count limit
    pub soft_packets: Option<u64>,
    /// Soft age limit in seconds
    pub soft_seconds: Option<u64>,
    /// Hard packet count limit
    pub hard_packets: Option<u64>,
    /// Hard age limit in seconds
    pub hard_seconds: Option<u64>,
}

impl SaLimits {
    /// Limits for inbound SAs: hard only, the peer drives the rekey
    pub fn inbound() -> Self {
        Self {
            soft_packets: None,
            soft_seconds: None,
            hard_packets: Some(HARD_PACKET_LIMIT),
            hard_seconds: Some(HARD_EXPIRY_SECS),
        }
    }

    /// Limits for outbound SAs: the soft limits trigger the local rekey
    /// before the hard ones cut the SA off
    pub fn outbound() -> Self {
        Self {
            soft_packets: Some(SOFT_PACKET_LIMIT),
            soft_seconds: Some(SOFT_EXPIRY_SECS),
            hard_packets: Some(HARD_PACKET_LIMIT),
            hard_seconds: Some(HARD_EXPIRY_SECS),
        }
    }
}

/// One SA as the engine manipulates it
///
/// `key` is absent on the stub returned by [XfrmApi::alloc_spi]; the caller
/// fills it in before materializing the SA with [XfrmApi::state_update].
#[derive(Debug, Clone)]
pub struct XfrmState {
    /// Sender of the protected traffic
    pub src: Ipv4Addr,
    /// Receiver of the protected traffic, owner of the SPI
    pub dst: Ipv4Addr,
    /// Kernel-assigned SPI
    pub spi: u32,
    /// AEAD key material, 32-byte key plus 4-byte salt
    pub key: Option<AeadKey>,
    /// Lifetime limits
    pub limits: SaLimits,
}

impl XfrmState {
    /// A complete outbound SA, ready for [XfrmApi::state_add]
    pub fn outbound(src: Ipv4Addr, dst: Ipv4Addr, spi: u32, key: AeadKey) -> Self {
        Self {
            src,
            dst,
            spi,
            key: Some(key),
            limits: SaLimits::outbound(),
        }
    }

    /// The identity of this SA for deletion and listing
    pub fn id(&self) -> XfrmStateId {
        XfrmStateId {
            src: self.src,
            dst: self.dst,
            spi: self.spi,
        }
    }
}

/// Identity of an SA: endpoint pair and SPI, protocol is always ESP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfrmStateId {
    /// Sender of the protected traffic
    pub src: Ipv4Addr,
    /// Receiver of the protected traffic
    pub dst: Ipv4Addr,
    /// Kernel-assigned SPI
    pub spi: u32,
}

/// Outbound policy demanding ESP transport for marked overlay traffic
///
/// Selector is `src/32 -> dst/32`, UDP to `dst_port`, restricted to packets
/// carrying `mark`; the template points at the SA identified by `spi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfrmPolicy {
    /// Local endpoint
    pub src: Ipv4Addr,
    /// Remote endpoint
    pub dst: Ipv4Addr,
    /// UDP destination port of the overlay traffic
    pub dst_port: u16,
    /// SPI of the SA the template selects
    pub spi: u32,
    /// Mark value; the mask always equals the value
    pub mark: u32,
}

impl XfrmPolicy {
    /// The policy for one outbound SA
    pub fn outbound(src: Ipv4Addr, dst: Ipv4Addr, dst_port: u16, spi: u32) -> Self {
        Self {
            src,
            dst,
            dst_port,
            spi,
            mark: PROCESS_MARK,
        }
    }
}

/// Kernel notification that an SA crossed one of its lifetime limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryEvent {
    /// SPI of the expiring SA
    pub spi: u32,
    /// Hard expiry removes the SA; soft expiry only announces the limit
    pub hard: bool,
}

/// Stream of kernel expiry notifications, see [netlink::monitor_expiry]
pub type ExpiryEvents = mpsc::UnboundedReceiver<Result<ExpiryEvent, XfrmError>>;

/// The xfrm operation a [XfrmError] originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[allow(missing_docs)]
pub enum KernelOp {
    StateAllocSpi,
    StateUpdate,
    StateAdd,
    StateDel,
    PolicyAdd,
    PolicyUpdate,
    PolicyDel,
    List,
    Monitor,
}

/// A failed kernel xfrm operation
#[derive(Debug, Error)]
#[error("kernel {op} failed: {source}")]
pub struct XfrmError {
    /// The operation that failed
    pub op: KernelOp,
    /// The underlying netlink error
    #[source]
    pub source: io::Error,
}

/// The kernel xfrm operations the establishment engine drives
///
/// Implemented by [netlink::NetlinkXfrm] in production and by in-memory
/// doubles in tests.
pub trait XfrmApi: Send {
    /// Ask the kernel to reserve an unused SPI for ESP transport between the
    /// given endpoints, returning the SA stub holding it
    fn alloc_spi(&mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Result<XfrmState, XfrmError>;

    /// Replace an allocated stub in place, materializing the SA
    fn state_update(&mut self, state: &XfrmState) -> Result<(), XfrmError>;

    /// Create a fresh SA
    fn state_add(&mut self, state: &XfrmState) -> Result<(), XfrmError>;

    /// Remove an SA
    fn state_del(&mut self, id: XfrmStateId) -> Result<(), XfrmError>;

    /// Install an outbound policy
    fn policy_add(&mut self, policy: &XfrmPolicy) -> Result<(), XfrmError>;

    /// Re-point an existing outbound policy, e.g. at a rekeyed SA
    fn policy_update(&mut self, policy: &XfrmPolicy) -> Result<(), XfrmError>;

    /// Remove an outbound policy
    fn policy_del(&mut self, policy: &XfrmPolicy) -> Result<(), XfrmError>;

    /// Identities of every IPv4 ESP SA currently in the kernel
    fn state_list(&mut self) -> Result<Vec<XfrmStateId>, XfrmError>;

    /// Every outbound policy carrying the process mark
    fn policy_list(&mut self) -> Result<Vec<XfrmPolicy>, XfrmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_op_tags() {
        assert_eq!(KernelOp::StateAllocSpi.to_string(), "state_alloc_spi");
        assert_eq!(KernelOp::StateUpdate.to_string(), "state_update");
        assert_eq!(KernelOp::StateAdd.to_string(), "state_add");
        assert_eq!(KernelOp::StateDel.to_string(), "state_del");
        assert_eq!(KernelOp::PolicyAdd.to_string(), "policy_add");
        assert_eq!(KernelOp::PolicyUpdate.to_string(), "policy_update");
        assert_eq!(KernelOp::PolicyDel.to_string(), "policy_del");
        assert_eq!(KernelOp::List.to_string(), "list");
    }

    #[test]
    fn limit_templates() {
        let inbound = SaLimits::inbound();
        assert_eq!(inbound.soft_packets, None);
        assert_eq!(inbound.soft_seconds, None);
        assert_eq!(inbound.hard_packets, Some(100));
        assert_eq!(inbound.hard_seconds, Some(14));

        let outbound = SaLimits::outbound();
        assert_eq!(outbound.soft_packets, Some(50));
        assert_eq!(outbound.soft_seconds, Some(10));
        assert_eq!(outbound.hard_packets, Some(100));
        assert_eq!(outbound.hard_seconds, Some(14));
    }

    #[test]
    fn outbound_policy_carries_the_process_mark() {
        let policy = XfrmPolicy::outbound(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            6783,
            0x100,
        );
        assert_eq!(policy.mark, 0x20000);
    }
}
