//! NETLINK_XFRM transport for [XfrmApi]
//!
//! The kernel structs are mirrored as `#[repr(C, packed)]` zerocopy types
//! (layouts from `linux/xfrm.h`), messages are framed by hand, and every
//! change operation is confirmed through the NLMSG_ERROR acknowledgement.
//! All calls block on the socket; the engine serializes them behind its lock.

use std::io;
use std::mem::size_of;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::thread;

use tokio::sync::mpsc;
use tracing::trace;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::xfrm::ExpiryEvent;
use crate::xfrm::ExpiryEvents;
use crate::xfrm::KernelOp;
use crate::xfrm::SaLimits;
use crate::xfrm::XfrmApi;
use crate::xfrm::XfrmError;
use crate::xfrm::XfrmPolicy;
use crate::xfrm::XfrmState;
use crate::xfrm::XfrmStateId;
use crate::xfrm::AEAD_ALG;
use crate::xfrm::AEAD_ICV_BITS;
use crate::xfrm::IPPROTO_ESP;
use crate::xfrm::IPPROTO_UDP;
use crate::xfrm::PROCESS_MARK;
use crate::xfrm::REPLAY_WINDOW;

const NETLINK_XFRM: libc::c_int = 6;

// Netlink header
const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_DUMP: u16 = 0x300;

// XFRM message types (from linux/xfrm.h)
const XFRM_MSG_NEWSA: u16 = 0x10;
const XFRM_MSG_DELSA: u16 = 0x11;
const XFRM_MSG_GETSA: u16 = 0x12;
const XFRM_MSG_NEWPOLICY: u16 = 0x13;
const XFRM_MSG_DELPOLICY: u16 = 0x14;
const XFRM_MSG_GETPOLICY: u16 = 0x15;
const XFRM_MSG_ALLOCSPI: u16 = 0x16;
const XFRM_MSG_EXPIRE: u16 = 0x18;
const XFRM_MSG_UPDPOLICY: u16 = 0x19;
const XFRM_MSG_UPDSA: u16 = 0x1a;

// XFRM attribute types
const XFRMA_TMPL: u16 = 5;
const XFRMA_ALG_AEAD: u16 = 18;
const XFRMA_MARK: u16 = 21;

// Modes, directions, actions
const XFRM_MODE_TRANSPORT: u8 = 0;
const XFRM_POLICY_OUT: u8 = 1;
const XFRM_POLICY_ALLOW: u8 = 0;

// Multicast group carrying soft/hard expiry events; bit is 1 << (group - 1)
const XFRMNLGRP_EXPIRE: u32 = 2;

const AF_INET: u16 = libc::AF_INET as u16;

// "No limit" value of the lifetime fields
const XFRM_INF: u64 = u64::MAX;

// SPI range requested from the kernel
const SPI_MIN: u32 = 0x100;

/// XFRM address, 4 octets of IPv4 in a 16-byte field
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmAddress {
    bytes: [u8; 16],
}

impl XfrmAddress {
    fn from_v4(addr: Ipv4Addr) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&addr.octets());
        Self { bytes }
    }

    fn to_v4(self) -> Ipv4Addr {
        Ipv4Addr::new(self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3])
    }
}

/// `xfrm_id`: destination, SPI and protocol of an SA
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmId {
    daddr: XfrmAddress,
    /// Network byte order
    spi: u32,
    proto: u8,
    _pad: [u8; 3],
}

/// `xfrm_selector`: the traffic a policy or SA applies to
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmSelector {
    daddr: XfrmAddress,
    saddr: XfrmAddress,
    /// Network byte order
    dport: u16,
    dport_mask: u16,
    /// Network byte order
    sport: u16,
    sport_mask: u16,
    family: u16,
    prefixlen_d: u8,
    prefixlen_s: u8,
    proto: u8,
    _pad: [u8; 3],
    ifindex: i32,
    user: u32,
}

/// `xfrm_lifetime_cfg`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmLifetimeCfg {
    soft_byte_limit: u64,
    hard_byte_limit: u64,
    soft_packet_limit: u64,
    hard_packet_limit: u64,
    soft_add_expires_seconds: u64,
    hard_add_expires_seconds: u64,
    soft_use_expires_seconds: u64,
    hard_use_expires_seconds: u64,
}

/// `xfrm_lifetime_cur`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmLifetimeCur {
    bytes: u64,
    packets: u64,
    add_time: u64,
    use_time: u64,
}

/// `xfrm_stats`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmStats {
    replay_window: u32,
    replay: u32,
    integrity_failed: u32,
}

/// `xfrm_usersa_info`: the SA body of NEWSA/UPDSA/expiry messages
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmUsersaInfo {
    sel: XfrmSelector,
    id: XfrmId,
    saddr: XfrmAddress,
    lft: XfrmLifetimeCfg,
    curlft: XfrmLifetimeCur,
    stats: XfrmStats,
    seq: u32,
    reqid: u32,
    family: u16,
    mode: u8,
    replay_window: u8,
    flags: u8,
    _pad: [u8; 7],
}

/// `xfrm_userspi_info`: ALLOCSPI request
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmUserSpiInfo {
    info: XfrmUsersaInfo,
    min: u32,
    max: u32,
}

/// `xfrm_usersa_id`: DELSA request
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmUsersaId {
    daddr: XfrmAddress,
    /// Network byte order
    spi: u32,
    family: u16,
    proto: u8,
    _pad: [u8; 1],
}

/// `xfrm_userpolicy_info`: the policy body of NEWPOLICY/UPDPOLICY
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmUserpolicyInfo {
    sel: XfrmSelector,
    lft: XfrmLifetimeCfg,
    curlft: XfrmLifetimeCur,
    priority: u32,
    index: u32,
    dir: u8,
    action: u8,
    flags: u8,
    share: u8,
    _pad: [u8; 4],
}

/// `xfrm_userpolicy_id`: DELPOLICY request
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmUserpolicyId {
    sel: XfrmSelector,
    index: u32,
    dir: u8,
    _pad: [u8; 3],
}

/// `xfrm_user_tmpl`: the SA template attached to a policy
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmUserTmpl {
    id: XfrmId,
    family: u16,
    _pad1: [u8; 2],
    saddr: XfrmAddress,
    reqid: u32,
    mode: u8,
    share: u8,
    optional: u8,
    _pad2: [u8; 1],
    aalgos: u32,
    ealgos: u32,
    calgos: u32,
}

/// `xfrm_mark`
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmMark {
    v: u32,
    m: u32,
}

/// `xfrm_user_expire`: body of XFRM_MSG_EXPIRE notifications
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
struct XfrmUserExpire {
    state: XfrmUsersaInfo,
    hard: u8,
    _pad: [u8; 7],
}

/// A bound NETLINK_XFRM socket
struct NetlinkSocket {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkSocket {
    /// Open and bind, subscribing to the given multicast groups (0 for none)
    fn connect(groups: u32) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_XFRM,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast(),
                size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd, seq: 0 })
    }

    /// Frame and send one request
    fn send(&mut self, msg_type: u16, flags: u16, payload: &[u8]) -> io::Result<()> {
        self.seq = self.seq.wrapping_add(1);

        let len = NLMSG_HDRLEN + payload.len();
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&(len as u32).to_ne_bytes()); // nlmsg_len
        buf.extend_from_slice(&msg_type.to_ne_bytes()); // nlmsg_type
        buf.extend_from_slice(&flags.to_ne_bytes()); // nlmsg_flags
        buf.extend_from_slice(&self.seq.to_ne_bytes()); // nlmsg_seq
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid, kernel fills
        buf.extend_from_slice(payload);

        let rc = unsafe { libc::send(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive one datagram
    fn recv(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; 64 * 1024];
        let rc = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(rc as usize);
        Ok(buf)
    }
}

/// Walk the netlink messages of one datagram, 4-byte aligned
fn messages(data: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= data.len() {
        let len = u32::from_ne_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let msg_type = u16::from_ne_bytes([data[offset + 4], data[offset + 5]]);

        if len < NLMSG_HDRLEN || offset + len > data.len() {
            break;
        }
        out.push((msg_type, &data[offset + NLMSG_HDRLEN..offset + len]));

        offset += (len + 3) & !3;
    }
    out
}

/// Extract the errno of an NLMSG_ERROR payload; 0 is an acknowledgement
fn nlmsg_errno(payload: &[u8]) -> i32 {
    if payload.len() < 4 {
        return 0;
    }
    i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]])
}

/// Append one netlink attribute, padding to the 4-byte boundary
fn push_attr(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    let len = 4 + data.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(data);
    buf.resize(buf.len() + ((4 - len % 4) % 4), 0);
}

/// Walk the attributes trailing a fixed-size message body
fn attributes(mut input: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    while input.len() >= 4 {
        let len = u16::from_ne_bytes([input[0], input[1]]) as usize;
        let attr_type = u16::from_ne_bytes([input[2], input[3]]);
        if len < 4 || len > input.len() {
            break;
        }
        out.push((attr_type, &input[4..len]));

        let aligned = (len + 3) & !3;
        input = &input[aligned.min(input.len())..];
    }
    out
}

fn lifetime(limits: &SaLimits) -> XfrmLifetimeCfg {
    XfrmLifetimeCfg {
        soft_byte_limit: XFRM_INF,
        hard_byte_limit: XFRM_INF,
        soft_packet_limit: limits.soft_packets.unwrap_or(XFRM_INF),
        hard_packet_limit: limits.hard_packets.unwrap_or(XFRM_INF),
        soft_add_expires_seconds: limits.soft_seconds.unwrap_or(0),
        hard_add_expires_seconds: limits.hard_seconds.unwrap_or(0),
        soft_use_expires_seconds: 0,
        hard_use_expires_seconds: 0,
    }
}

/// Serialize an `xfrm_algo_aead` for [AEAD_ALG]
fn aead_attr(key: &[u8]) -> Vec<u8> {
    let mut name = [0u8; 64];
    name[..AEAD_ALG.len()].copy_from_slice(AEAD_ALG.as_bytes());

    let mut buf = Vec::with_capacity(72 + key.len());
    buf.extend_from_slice(&name);
    buf.extend_from_slice(&((key.len() * 8) as u32).to_ne_bytes());
    buf.extend_from_slice(&AEAD_ICV_BITS.to_ne_bytes());
    buf.extend_from_slice(key);
    buf
}

/// The SA body plus its AEAD attribute
fn state_payload(state: &XfrmState) -> Vec<u8> {
    let mut info = XfrmUsersaInfo::new_zeroed();
    info.id.daddr = XfrmAddress::from_v4(state.dst);
    info.id.spi = state.spi.to_be();
    info.id.proto = IPPROTO_ESP;
    info.saddr = XfrmAddress::from_v4(state.src);
    info.lft = lifetime(&state.limits);
    info.family = AF_INET;
    info.mode = XFRM_MODE_TRANSPORT;
    info.replay_window = REPLAY_WINDOW;

    let mut payload = info.as_bytes().to_vec();
    if let Some(key) = &state.key {
        push_attr(&mut payload, XFRMA_ALG_AEAD, &aead_attr(key));
    }
    payload
}

fn policy_selector(policy: &XfrmPolicy) -> XfrmSelector {
    let mut sel = XfrmSelector::new_zeroed();
    sel.saddr = XfrmAddress::from_v4(policy.src);
    sel.daddr = XfrmAddress::from_v4(policy.dst);
    sel.prefixlen_s = 32;
    sel.prefixlen_d = 32;
    sel.proto = IPPROTO_UDP;
    sel.dport = policy.dst_port.to_be();
    sel.dport_mask = u16::MAX;
    sel.family = AF_INET;
    sel
}

/// The policy body plus its template and mark attributes
fn policy_payload(policy: &XfrmPolicy) -> Vec<u8> {
    let mut info = XfrmUserpolicyInfo::new_zeroed();
    info.sel = policy_selector(policy);
    info.lft = lifetime(&SaLimits::default());
    info.dir = XFRM_POLICY_OUT;
    info.action = XFRM_POLICY_ALLOW;

    let mut payload = info.as_bytes().to_vec();

    let mut tmpl = XfrmUserTmpl::new_zeroed();
    tmpl.id.daddr = XfrmAddress::from_v4(policy.dst);
    tmpl.id.spi = policy.spi.to_be();
    tmpl.id.proto = IPPROTO_ESP;
    tmpl.family = AF_INET;
    tmpl.saddr = XfrmAddress::from_v4(policy.src);
    tmpl.mode = XFRM_MODE_TRANSPORT;
    tmpl.aalgos = u32::MAX;
    tmpl.ealgos = u32::MAX;
    tmpl.calgos = u32::MAX;
    push_attr(&mut payload, XFRMA_TMPL, tmpl.as_bytes());

    let mark = XfrmMark {
        v: policy.mark,
        m: policy.mark,
    };
    push_attr(&mut payload, XFRMA_MARK, mark.as_bytes());

    payload
}

/// Blocking NETLINK_XFRM implementation of [XfrmApi]
pub struct NetlinkXfrm {
    socket: NetlinkSocket,
}

impl NetlinkXfrm {
    /// Open the request socket
    pub fn connect() -> io::Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::connect(0)?,
        })
    }

    /// Send a change request and wait for its acknowledgement
    fn ack(&mut self, msg_type: u16, flags: u16, payload: &[u8]) -> io::Result<()> {
        self.socket
            .send(msg_type, NLM_F_REQUEST | NLM_F_ACK | flags, payload)?;
        loop {
            let data = self.socket.recv()?;
            for (msg_type, payload) in messages(&data) {
                if msg_type == NLMSG_ERROR {
                    let errno = nlmsg_errno(payload);
                    if errno != 0 {
                        return Err(io::Error::from_raw_os_error(-errno));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Run a dump request, collecting every message payload until NLMSG_DONE
    fn dump(&mut self, msg_type: u16, payload: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        self.socket
            .send(msg_type, NLM_F_REQUEST | NLM_F_DUMP, payload)?;
        let mut parts = Vec::new();
        loop {
            let data = self.socket.recv()?;
            for (msg_type, payload) in messages(&data) {
                match msg_type {
                    NLMSG_DONE => return Ok(parts),
                    NLMSG_ERROR => {
                        let errno = nlmsg_errno(payload);
                        if errno != 0 {
                            return Err(io::Error::from_raw_os_error(-errno));
                        }
                    }
                    _ => parts.push(payload.to_vec()),
                }
            }
        }
    }
}

impl XfrmApi for NetlinkXfrm {
    fn alloc_spi(&mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Result<XfrmState, XfrmError> {
        let run = |this: &mut Self| -> io::Result<u32> {
            let mut req = XfrmUserSpiInfo::new_zeroed();
            req.info.id.daddr = XfrmAddress::from_v4(dst);
            req.info.id.proto = IPPROTO_ESP;
            req.info.saddr = XfrmAddress::from_v4(src);
            req.info.family = AF_INET;
            req.info.mode = XFRM_MODE_TRANSPORT;
            req.min = SPI_MIN;
            req.max = u32::MAX;

            this.socket
                .send(XFRM_MSG_ALLOCSPI, NLM_F_REQUEST, req.as_bytes())?;
            loop {
                let data = this.socket.recv()?;
                for (msg_type, payload) in messages(&data) {
                    match msg_type {
                        NLMSG_ERROR => {
                            let errno = nlmsg_errno(payload);
                            if errno != 0 {
                                return Err(io::Error::from_raw_os_error(-errno));
                            }
                        }
                        XFRM_MSG_NEWSA => {
                            let info = XfrmUsersaInfo::ref_from_prefix(payload)
                                .ok_or_else(|| io::Error::other("short ALLOCSPI reply"))?;
                            return Ok(u32::from_be(info.id.spi));
                        }
                        _ => {}
                    }
                }
            }
        };

        let spi = run(self).map_err(|source| XfrmError {
            op: KernelOp::StateAllocSpi,
            source,
        })?;
        trace!("kernel reserved spi {spi:#010x} for {src} -> {dst}");

        Ok(XfrmState {
            src,
            dst,
            spi,
            key: None,
            limits: SaLimits::default(),
        })
    }

    fn state_update(&mut self, state: &XfrmState) -> Result<(), XfrmError> {
        self.ack(XFRM_MSG_UPDSA, 0, &state_payload(state))
            .map_err(|source| XfrmError {
                op: KernelOp::StateUpdate,
                source,
            })
    }

    fn state_add(&mut self, state: &XfrmState) -> Result<(), XfrmError> {
        self.ack(XFRM_MSG_NEWSA, NLM_F_CREATE | NLM_F_EXCL, &state_payload(state))
            .map_err(|source| XfrmError {
                op: KernelOp::StateAdd,
                source,
            })
    }

    fn state_del(&mut self, id: XfrmStateId) -> Result<(), XfrmError> {
        let mut req = XfrmUsersaId::new_zeroed();
        req.daddr = XfrmAddress::from_v4(id.dst);
        req.spi = id.spi.to_be();
        req.family = AF_INET;
        req.proto = IPPROTO_ESP;

        self.ack(XFRM_MSG_DELSA, 0, req.as_bytes())
            .map_err(|source| XfrmError {
                op: KernelOp::StateDel,
                source,
            })
    }

    fn policy_add(&mut self, policy: &XfrmPolicy) -> Result<(), XfrmError> {
        self.ack(
            XFRM_MSG_NEWPOLICY,
            NLM_F_CREATE | NLM_F_EXCL,
            &policy_payload(policy),
        )
        .map_err(|source| XfrmError {
            op: KernelOp::PolicyAdd,
            source,
        })
    }

    fn policy_update(&mut self, policy: &XfrmPolicy) -> Result<(), XfrmError> {
        self.ack(XFRM_MSG_UPDPOLICY, 0, &policy_payload(policy))
            .map_err(|source| XfrmError {
                op: KernelOp::PolicyUpdate,
                source,
            })
    }

    fn policy_del(&mut self, policy: &XfrmPolicy) -> Result<(), XfrmError> {
        let mut req = XfrmUserpolicyId::new_zeroed();
        req.sel = policy_selector(policy);
        req.dir = XFRM_POLICY_OUT;

        let mut payload = req.as_bytes().to_vec();
        let mark = XfrmMark {
            v: policy.mark,
            m: policy.mark,
        };
        push_attr(&mut payload, XFRMA_MARK, mark.as_bytes());

        self.ack(XFRM_MSG_DELPOLICY, 0, &payload)
            .map_err(|source| XfrmError {
                op: KernelOp::PolicyDel,
                source,
            })
    }

    fn state_list(&mut self) -> Result<Vec<XfrmStateId>, XfrmError> {
        let parts = self
            .dump(XFRM_MSG_GETSA, XfrmUsersaInfo::new_zeroed().as_bytes())
            .map_err(|source| XfrmError {
                op: KernelOp::List,
                source,
            })?;

        let mut ids = Vec::new();
        for part in &parts {
            let Some(info) = XfrmUsersaInfo::ref_from_prefix(part) else {
                continue;
            };
            if info.family != AF_INET || info.id.proto != IPPROTO_ESP {
                continue;
            }
            ids.push(XfrmStateId {
                src: info.saddr.to_v4(),
                dst: info.id.daddr.to_v4(),
                spi: u32::from_be(info.id.spi),
            });
        }
        Ok(ids)
    }

    fn policy_list(&mut self) -> Result<Vec<XfrmPolicy>, XfrmError> {
        let parts = self
            .dump(XFRM_MSG_GETPOLICY, XfrmUserpolicyInfo::new_zeroed().as_bytes())
            .map_err(|source| XfrmError {
                op: KernelOp::List,
                source,
            })?;

        let mut policies = Vec::new();
        for part in &parts {
            let Some(info) = XfrmUserpolicyInfo::ref_from_prefix(part) else {
                continue;
            };
            if info.sel.family != AF_INET || info.dir != XFRM_POLICY_OUT {
                continue;
            }

            let mut mark = 0;
            let mut spi = 0;
            for (attr_type, data) in attributes(&part[size_of::<XfrmUserpolicyInfo>()..]) {
                match attr_type {
                    XFRMA_MARK => {
                        if let Some(m) = XfrmMark::ref_from_prefix(data) {
                            mark = m.v;
                        }
                    }
                    XFRMA_TMPL => {
                        if let Some(tmpl) = XfrmUserTmpl::ref_from_prefix(data) {
                            spi = u32::from_be(tmpl.id.spi);
                        }
                    }
                    _ => {}
                }
            }
            if mark != PROCESS_MARK {
                continue;
            }

            policies.push(XfrmPolicy {
                src: info.sel.saddr.to_v4(),
                dst: info.sel.daddr.to_v4(),
                dst_port: u16::from_be(info.sel.dport),
                spi,
                mark,
            });
        }
        Ok(policies)
    }
}

/// Subscribe to kernel soft/hard expiry notifications
///
/// Opens a socket joined to the expiry multicast group and spawns a blocking
/// reader thread. Events and read failures surface on the returned channel;
/// after a failure the thread exits and the channel closes.
pub fn monitor_expiry() -> io::Result<ExpiryEvents> {
    let socket = NetlinkSocket::connect(1 << (XFRMNLGRP_EXPIRE - 1))?;
    let (tx, rx) = mpsc::unbounded_channel();

    thread::Builder::new()
        .name("xfrm-expiry".into())
        .spawn(move || loop {
            let data = match socket.recv() {
                Ok(data) => data,
                Err(source) => {
                    let _ = tx.send(Err(XfrmError {
                        op: KernelOp::Monitor,
                        source,
                    }));
                    return;
                }
            };
            for (msg_type, payload) in messages(&data) {
                if msg_type != XFRM_MSG_EXPIRE {
                    continue;
                }
                let Some(expire) = XfrmUserExpire::ref_from_prefix(payload) else {
                    continue;
                };
                let event = ExpiryEvent {
                    spi: u32::from_be(expire.state.id.spi),
                    hard: expire.hard != 0,
                };
                trace!("kernel expiry: {event:?}");
                if tx.send(Ok(event)).is_err() {
                    // Receiver gone, stop watching
                    return;
                }
            }
        })?;

    Ok(rx)
}
