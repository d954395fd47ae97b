//! End-to-end exercises of the establishment engine against in-memory
//! doubles of the kernel and the packet filter.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;

use espmesh::filter::FilterError;
use espmesh::filter::IpTables;
use espmesh::filter::Table;
use espmesh::filter::CHAIN_IN;
use espmesh::filter::CHAIN_IN_MARK;
use espmesh::filter::CHAIN_OUT;
use espmesh::filter::CHAIN_OUT_MARK;
use espmesh::xfrm::ExpiryEvent;
use espmesh::xfrm::KernelOp;
use espmesh::xfrm::SaLimits;
use espmesh::xfrm::XfrmApi;
use espmesh::xfrm::XfrmError;
use espmesh::xfrm::XfrmPolicy;
use espmesh::xfrm::XfrmState;
use espmesh::xfrm::XfrmStateId;
use espmesh::Error;
use espmesh::Ipsec;
use espmesh_proto::kdf::AeadKey;
use espmesh_proto::message::CreateSa;
use espmesh_proto::message::MESSAGE_SIZE;
use espmesh_proto::PeerName;

const PEER_L: PeerName = PeerName(0x0000_0000_0000_0001);
const PEER_R: PeerName = PeerName(0x0000_0000_0000_0002);
const IP_L: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const IP_R: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const PORT: u16 = 6783;
const SESSION_KEY: [u8; 32] = [0u8; 32];

#[derive(Debug, Clone)]
struct StateRec {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    key: Option<AeadKey>,
    limits: SaLimits,
}

#[derive(Default)]
struct KernelState {
    next_spi: u32,
    calls: usize,
    alloc_calls: usize,
    policy_adds: usize,
    policy_updates: usize,
    states: HashMap<u32, StateRec>,
    policies: HashMap<(Ipv4Addr, Ipv4Addr), XfrmPolicy>,
}

/// In-memory kernel double; clones share the same state
#[derive(Default, Clone)]
struct FakeXfrm {
    state: Arc<Mutex<KernelState>>,
}

impl FakeXfrm {
    fn lock(&self) -> std::sync::MutexGuard<'_, KernelState> {
        self.state.lock().unwrap()
    }
}

impl XfrmApi for FakeXfrm {
    fn alloc_spi(&mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Result<XfrmState, XfrmError> {
        let mut kernel = self.lock();
        kernel.calls += 1;
        kernel.alloc_calls += 1;
        kernel.next_spi += 1;
        let spi = 0x100 + kernel.next_spi;
        kernel.states.insert(
            spi,
            StateRec {
                src,
                dst,
                key: None,
                limits: SaLimits::default(),
            },
        );
        Ok(XfrmState {
            src,
            dst,
            spi,
            key: None,
            limits: SaLimits::default(),
        })
    }

    fn state_update(&mut self, state: &XfrmState) -> Result<(), XfrmError> {
        let mut kernel = self.lock();
        kernel.calls += 1;
        kernel.states.insert(
            state.spi,
            StateRec {
                src: state.src,
                dst: state.dst,
                key: state.key,
                limits: state.limits,
            },
        );
        Ok(())
    }

    fn state_add(&mut self, state: &XfrmState) -> Result<(), XfrmError> {
        self.state_update(state)
    }

    fn state_del(&mut self, id: XfrmStateId) -> Result<(), XfrmError> {
        let mut kernel = self.lock();
        kernel.calls += 1;
        kernel.states.remove(&id.spi).map(|_| ()).ok_or(XfrmError {
            op: KernelOp::StateDel,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }

    fn policy_add(&mut self, policy: &XfrmPolicy) -> Result<(), XfrmError> {
        let mut kernel = self.lock();
        kernel.calls += 1;
        kernel.policy_adds += 1;
        kernel.policies.insert((policy.src, policy.dst), *policy);
        Ok(())
    }

    fn policy_update(&mut self, policy: &XfrmPolicy) -> Result<(), XfrmError> {
        let mut kernel = self.lock();
        kernel.calls += 1;
        kernel.policy_updates += 1;
        kernel.policies.insert((policy.src, policy.dst), *policy);
        Ok(())
    }

    fn policy_del(&mut self, policy: &XfrmPolicy) -> Result<(), XfrmError> {
        let mut kernel = self.lock();
        kernel.calls += 1;
        kernel.policies.remove(&(policy.src, policy.dst));
        Ok(())
    }

    fn state_list(&mut self) -> Result<Vec<XfrmStateId>, XfrmError> {
        let mut kernel = self.lock();
        kernel.calls += 1;
        Ok(kernel
            .states
            .iter()
            .map(|(spi, rec)| XfrmStateId {
                src: rec.src,
                dst: rec.dst,
                spi: *spi,
            })
            .collect())
    }

    fn policy_list(&mut self) -> Result<Vec<XfrmPolicy>, XfrmError> {
        let mut kernel = self.lock();
        kernel.calls += 1;
        Ok(kernel.policies.values().copied().collect())
    }
}

/// In-memory packet-filter double; clones share the same state
#[derive(Default, Clone)]
struct FakeTables {
    chains: Arc<Mutex<HashMap<(Table, String), Vec<Vec<String>>>>>,
}

impl FakeTables {
    fn chain(&self, table: Table, chain: &str) -> Vec<Vec<String>> {
        self.chains
            .lock()
            .unwrap()
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.chains
            .lock()
            .unwrap()
            .contains_key(&(table, chain.to_string()))
    }

    fn rule_count(&self) -> usize {
        self.chains.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl IpTables for FakeTables {
    fn ensure_chain(&mut self, table: Table, chain: &str) -> Result<(), FilterError> {
        self.chains
            .lock()
            .unwrap()
            .entry((table, chain.to_string()))
            .or_default();
        Ok(())
    }

    fn append(&mut self, table: Table, chain: &str, rule: &[String]) -> Result<(), FilterError> {
        self.chains
            .lock()
            .unwrap()
            .entry((table, chain.to_string()))
            .or_default()
            .push(rule.to_vec());
        Ok(())
    }

    fn insert(
        &mut self,
        table: Table,
        chain: &str,
        pos: u32,
        rule: &[String],
    ) -> Result<(), FilterError> {
        let mut chains = self.chains.lock().unwrap();
        let rules = chains.entry((table, chain.to_string())).or_default();
        let pos = (pos as usize - 1).min(rules.len());
        rules.insert(pos, rule.to_vec());
        Ok(())
    }

    fn delete(&mut self, table: Table, chain: &str, rule: &[String]) -> Result<(), FilterError> {
        if let Some(rules) = self
            .chains
            .lock()
            .unwrap()
            .get_mut(&(table, chain.to_string()))
        {
            rules.retain(|r| r != rule);
        }
        Ok(())
    }

    fn exists(&mut self, table: Table, chain: &str, rule: &[String]) -> Result<bool, FilterError> {
        Ok(self.chain(table, chain).contains(&rule.to_vec()))
    }

    fn clear_chain(&mut self, table: Table, chain: &str) -> Result<(), FilterError> {
        if let Some(rules) = self
            .chains
            .lock()
            .unwrap()
            .get_mut(&(table, chain.to_string()))
        {
            rules.clear();
        }
        Ok(())
    }

    fn delete_chain(&mut self, table: Table, chain: &str) -> Result<(), FilterError> {
        self.chains
            .lock()
            .unwrap()
            .remove(&(table, chain.to_string()));
        Ok(())
    }
}

struct Host {
    ipsec: Ipsec,
    kernel: FakeXfrm,
    tables: FakeTables,
}

fn host() -> Host {
    let kernel = FakeXfrm::default();
    let tables = FakeTables::default();
    let ipsec = Ipsec::new(Box::new(kernel.clone()), Box::new(tables.clone())).unwrap();
    Host {
        ipsec,
        kernel,
        tables,
    }
}

/// Run `protect_init` on `host`, returning the emitted message
async fn init_on(host: &Host, is_rekey: bool) -> Vec<u8> {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let captured = sent.clone();
    host.ipsec
        .protect_init(
            PEER_L,
            PEER_R,
            IP_L,
            IP_R,
            PORT,
            &SESSION_KEY,
            is_rekey,
            |msg| {
                let captured = captured.clone();
                async move {
                    captured.lock().unwrap().push(msg);
                    Ok(())
                }
            },
        )
        .await
        .unwrap();
    let mut sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    sent.pop().unwrap()
}

/// Run `protect_finish` on `host` with a counting rekey callback
async fn finish_on(host: &Host, msg: &[u8], rekeys: &Arc<AtomicUsize>) {
    let rekeys = rekeys.clone();
    host.ipsec
        .protect_finish(
            msg,
            PEER_R,
            PEER_L,
            IP_R,
            IP_L,
            PORT,
            &SESSION_KEY,
            Box::new(move || {
                rekeys.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await
        .unwrap();
}

fn expiry(spi: u32, hard: bool) -> Result<ExpiryEvent, XfrmError> {
    Ok(ExpiryEvent { spi, hard })
}

async fn inject(ipsec: &Ipsec, events: Vec<Result<ExpiryEvent, XfrmError>>) -> Result<(), Error> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    for event in events {
        tx.send(event).unwrap();
    }
    drop(tx);
    ipsec.monitor(&mut rx).await
}

#[tokio::test]
async fn happy_path_establishes_both_halves() {
    let left = host();
    let right = host();

    let msg = init_on(&left, false).await;
    assert_eq!(msg.len(), MESSAGE_SIZE);
    let parsed = CreateSa::parse(&msg).unwrap();

    // The initiator installed the inbound SA remote -> local
    let spi = parsed.spi;
    let (inbound, left_key) = {
        let kernel = left.kernel.lock();
        let rec = kernel.states.get(&spi).cloned().unwrap();
        (rec.clone(), rec.key.unwrap())
    };
    assert_eq!(inbound.src, IP_R);
    assert_eq!(inbound.dst, IP_L);
    assert_eq!(inbound.limits, SaLimits::inbound());

    // All three per-peer rules are in place
    assert_eq!(left.tables.chain(Table::Mangle, CHAIN_IN).len(), 1);
    assert_eq!(left.tables.chain(Table::Filter, CHAIN_IN).len(), 1);
    assert_eq!(left.tables.chain(Table::Mangle, CHAIN_OUT).len(), 1);

    let rekeys = Arc::new(AtomicUsize::new(0));
    finish_on(&right, &msg, &rekeys).await;

    // The responder installed the matching outbound SA and policy
    let (outbound, right_key, policy) = {
        let kernel = right.kernel.lock();
        let rec = kernel.states.get(&spi).cloned().unwrap();
        let policy = kernel.policies.get(&(IP_R, IP_L)).copied().unwrap();
        assert_eq!(kernel.policy_adds, 1);
        assert_eq!(kernel.policy_updates, 0);
        (rec.clone(), rec.key.unwrap(), policy)
    };
    assert_eq!(outbound.src, IP_R);
    assert_eq!(outbound.dst, IP_L);
    assert_eq!(outbound.limits, SaLimits::outbound());
    assert_eq!(policy.spi, spi);
    assert_eq!(policy.dst_port, PORT);
    assert_eq!(policy.mark, 0x20000);

    // Both sides derived the same AEAD key
    assert_eq!(left_key, right_key);
}

#[tokio::test]
async fn concurrent_inits_coalesce() {
    let left = host();

    init_on(&left, false).await;

    // The second establishment attempt must not touch kernel or rules
    let calls_before = left.kernel.lock().calls;
    let rules_before = left.tables.rule_count();
    left.ipsec
        .protect_init(PEER_L, PEER_R, IP_L, IP_R, PORT, &SESSION_KEY, false, |_| {
            async move { panic!("coalesced establishment must not send") }
        })
        .await
        .unwrap();

    assert_eq!(left.kernel.lock().alloc_calls, 1);
    assert_eq!(left.kernel.lock().calls, calls_before);
    assert_eq!(left.tables.rule_count(), rules_before);

    // First release keeps the tunnel, second tears it down
    left.ipsec
        .destroy(PEER_L, PEER_R, IP_L, IP_R, PORT)
        .await
        .unwrap();
    assert_eq!(left.kernel.lock().states.len(), 1);
    assert_eq!(left.tables.chain(Table::Mangle, CHAIN_IN).len(), 1);

    left.ipsec
        .destroy(PEER_L, PEER_R, IP_L, IP_R, PORT)
        .await
        .unwrap();
    assert!(left.kernel.lock().states.is_empty());
    assert!(left.tables.chain(Table::Mangle, CHAIN_IN).is_empty());
    assert!(left.tables.chain(Table::Filter, CHAIN_IN).is_empty());
    assert!(left.tables.chain(Table::Mangle, CHAIN_OUT).is_empty());
}

#[tokio::test]
async fn destroy_without_establishment_is_invalid() {
    let left = host();
    let calls_before = left.kernel.lock().calls;

    let result = left.ipsec.destroy(PEER_L, PEER_R, IP_L, IP_R, PORT).await;
    assert!(matches!(result, Err(Error::InvalidState { .. })));
    assert_eq!(left.kernel.lock().calls, calls_before);
}

#[tokio::test]
async fn rekey_requires_a_live_inbound_sa() {
    let left = host();
    let result = left
        .ipsec
        .protect_init(PEER_L, PEER_R, IP_L, IP_R, PORT, &SESSION_KEY, true, |_| {
            async move { panic!("nothing to announce") }
        })
        .await;
    assert!(matches!(result, Err(Error::UnknownSpi { .. })));
}

#[tokio::test]
async fn soft_expiry_drives_rekey_and_hard_expiry_cleans_up() {
    let left = host();
    let right = host();

    let msg = init_on(&left, false).await;
    let spi1 = CreateSa::parse(&msg).unwrap().spi;
    let rekeys = Arc::new(AtomicUsize::new(0));
    finish_on(&right, &msg, &rekeys).await;

    // Soft expiry of the outbound SA fires the trigger exactly once
    inject(&right.ipsec, vec![expiry(spi1, false)]).await.unwrap();
    assert_eq!(rekeys.load(Ordering::SeqCst), 1);

    // The upper layer answers with a rekey on the initiating side
    let msg2 = init_on(&left, true).await;
    let spi2 = CreateSa::parse(&msg2).unwrap().spi;
    assert_ne!(spi1, spi2);

    // Only the SPI-bound rule was added; both generations coexist
    let esp_rules = left.tables.chain(Table::Mangle, CHAIN_IN);
    assert_eq!(esp_rules.len(), 2);
    assert_eq!(left.tables.chain(Table::Filter, CHAIN_IN).len(), 1);
    assert_eq!(left.tables.chain(Table::Mangle, CHAIN_OUT).len(), 1);

    // Hard expiry of the old inbound SPI retires its rule and nothing else
    left.kernel.lock().states.remove(&spi1);
    inject(&left.ipsec, vec![expiry(spi1, true)]).await.unwrap();
    let esp_rules = left.tables.chain(Table::Mangle, CHAIN_IN);
    assert_eq!(esp_rules.len(), 1);
    assert!(esp_rules[0].contains(&format!("{spi2:#x}")));
    assert!(left.kernel.lock().states.contains_key(&spi2));

    // A repeated hard expiry for the same SPI is ignored
    inject(&left.ipsec, vec![expiry(spi1, true)]).await.unwrap();
    assert_eq!(left.tables.chain(Table::Mangle, CHAIN_IN).len(), 1);
}

#[tokio::test]
async fn rekeyed_responder_updates_the_policy_in_place() {
    let left = host();
    let right = host();
    let rekeys = Arc::new(AtomicUsize::new(0));

    let msg = init_on(&left, false).await;
    finish_on(&right, &msg, &rekeys).await;
    let msg2 = init_on(&left, true).await;
    let spi2 = CreateSa::parse(&msg2).unwrap().spi;
    finish_on(&right, &msg2, &rekeys).await;

    let kernel = right.kernel.lock();
    assert_eq!(kernel.policy_adds, 1);
    assert_eq!(kernel.policy_updates, 1);
    assert_eq!(kernel.policies.get(&(IP_R, IP_L)).unwrap().spi, spi2);
}

#[tokio::test]
async fn hard_expiry_of_outbound_only_drops_bookkeeping() {
    let left = host();
    let right = host();
    let rekeys = Arc::new(AtomicUsize::new(0));

    let msg = init_on(&left, false).await;
    let spi = CreateSa::parse(&msg).unwrap().spi;
    finish_on(&right, &msg, &rekeys).await;

    let rules_before = right.tables.rule_count();
    inject(&right.ipsec, vec![expiry(spi, true)]).await.unwrap();
    assert_eq!(right.tables.rule_count(), rules_before);

    // A later soft expiry for the forgotten SPI no longer rekeys
    inject(&right.ipsec, vec![expiry(spi, false)]).await.unwrap();
    assert_eq!(rekeys.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn monitor_surfaces_subscription_errors() {
    let left = host();
    let result = inject(
        &left.ipsec,
        vec![Err(XfrmError {
            op: KernelOp::Monitor,
            source: std::io::Error::other("socket gone"),
        })],
    )
    .await;
    assert!(matches!(result, Err(Error::Kernel(_))));
}

#[tokio::test]
async fn flush_destroy_removes_everything_marked() {
    let left = host();
    let right = host();
    let rekeys = Arc::new(AtomicUsize::new(0));

    let msg = init_on(&left, false).await;
    finish_on(&right, &msg, &rekeys).await;

    left.ipsec.flush(true).await.unwrap();
    assert!(left.kernel.lock().states.is_empty());
    for (table, chain) in [
        (Table::Mangle, CHAIN_IN),
        (Table::Mangle, CHAIN_IN_MARK),
        (Table::Mangle, CHAIN_OUT),
        (Table::Mangle, CHAIN_OUT_MARK),
        (Table::Filter, CHAIN_IN),
    ] {
        assert!(!left.tables.has_chain(table, chain));
    }
    assert!(left.tables.chain(Table::Mangle, "INPUT").is_empty());
    assert!(left.tables.chain(Table::Mangle, "OUTPUT").is_empty());
    assert!(left.tables.chain(Table::Filter, "INPUT").is_empty());
    assert!(left.tables.chain(Table::Filter, "OUTPUT").is_empty());

    right.ipsec.flush(true).await.unwrap();
    assert!(right.kernel.lock().policies.is_empty());
    assert!(right.kernel.lock().states.is_empty());
}

#[tokio::test]
async fn plain_flush_keeps_chains_and_scaffolding() {
    let left = host();
    init_on(&left, false).await;

    left.ipsec.flush(false).await.unwrap();
    assert!(left.tables.has_chain(Table::Mangle, CHAIN_IN));
    assert_eq!(left.tables.chain(Table::Mangle, "INPUT").len(), 1);
    assert!(left.tables.chain(Table::Mangle, CHAIN_IN).is_empty());
}

#[tokio::test]
async fn finish_rejects_bad_messages() {
    let right = host();

    let short = right
        .ipsec
        .protect_finish(
            &[1u8; 64],
            PEER_R,
            PEER_L,
            IP_R,
            IP_L,
            PORT,
            &SESSION_KEY,
            Box::new(|| Ok(())),
        )
        .await;
    assert!(matches!(short, Err(Error::Wire(_))));

    let mut wrong_version = CreateSa {
        nonce: [0; 32],
        spi: 1,
    }
    .compose();
    wrong_version[0] = 9;
    let rejected = right
        .ipsec
        .protect_finish(
            &wrong_version,
            PEER_R,
            PEER_L,
            IP_R,
            IP_L,
            PORT,
            &SESSION_KEY,
            Box::new(|| Ok(())),
        )
        .await;
    assert!(matches!(rejected, Err(Error::Wire(_))));
    assert!(right.kernel.lock().states.is_empty());
}

#[tokio::test]
async fn failed_send_leaves_kernel_state_for_reclaim() {
    let left = host();

    let result = left
        .ipsec
        .protect_init(PEER_L, PEER_R, IP_L, IP_R, PORT, &SESSION_KEY, false, |_| {
            async move { Err(std::io::Error::other("peer unreachable")) }
        })
        .await;
    assert!(matches!(result, Err(Error::SendFailed(_))));

    // The SA survives until reclaimed; the release path still removes rules
    assert_eq!(left.kernel.lock().states.len(), 1);
    left.ipsec
        .destroy(PEER_L, PEER_R, IP_L, IP_R, PORT)
        .await
        .unwrap();
    assert!(left.tables.chain(Table::Filter, CHAIN_IN).is_empty());
    assert!(left.tables.chain(Table::Mangle, CHAIN_OUT).is_empty());
}
