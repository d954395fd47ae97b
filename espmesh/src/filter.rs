//! Packet-filter rule graph
//!
//! The rules enforce two promises per protected peer: inbound ESP from the
//! peer is recognized and marked, and unprotected overlay UDP from the peer
//! is dropped. A guard in the filter OUTPUT chain additionally drops local
//! overlay traffic that carries the process mark but matched no outbound
//! policy, closing the plaintext-bypass window around rekeys and teardown.
//!
//! All rule text lives here; the [IpTables] trait is the minimal capability
//! the manager needs, implemented by [IpTablesCmd] against the host binary
//! and by in-memory doubles in tests.

use std::io;
use std::net::Ipv4Addr;
use std::process::Command;

use itertools::Itertools;
use thiserror::Error;
use tracing::trace;

use crate::xfrm::PROCESS_MARK;

/// Chain receiving inbound rules, present in both tables
pub const CHAIN_IN: &str = "ESPMESH-IN";
/// Mangle chain applying the mark to recognized inbound ESP
pub const CHAIN_IN_MARK: &str = "ESPMESH-IN-MARK";
/// Mangle chain receiving outbound rules
pub const CHAIN_OUT: &str = "ESPMESH-OUT";
/// Mangle chain applying the mark to outbound overlay traffic
pub const CHAIN_OUT_MARK: &str = "ESPMESH-OUT-MARK";

/// The tables the rule graph spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// The mangle table, where marks are applied
    Mangle,
    /// The filter table, where unprotected traffic is dropped
    Filter,
}

impl Table {
    /// Table name as the binary expects it
    pub fn name(self) -> &'static str {
        match self {
            Self::Mangle => "mangle",
            Self::Filter => "filter",
        }
    }
}

/// The errors that can occur while manipulating packet-filter rules
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum FilterError {
    #[error("could not invoke iptables: {0}")]
    Invoke(#[source] io::Error),

    #[error("iptables {args} failed: {stderr}")]
    Command { args: String, stderr: String },
}

/// Minimal packet-filter capability
///
/// Deleting a rule that is not present is not an error at this layer; every
/// other failure is reported.
pub trait IpTables: Send {
    /// Create a chain if it does not exist yet
    fn ensure_chain(&mut self, table: Table, chain: &str) -> Result<(), FilterError>;

    /// Append a rule at the end of a chain
    fn append(&mut self, table: Table, chain: &str, rule: &[String]) -> Result<(), FilterError>;

    /// Insert a rule at the given 1-based position
    fn insert(
        &mut self,
        table: Table,
        chain: &str,
        pos: u32,
        rule: &[String],
    ) -> Result<(), FilterError>;

    /// Remove a rule, tolerating its absence
    fn delete(&mut self, table: Table, chain: &str, rule: &[String]) -> Result<(), FilterError>;

    /// Whether a rule is present
    fn exists(&mut self, table: Table, chain: &str, rule: &[String]) -> Result<bool, FilterError>;

    /// Remove every rule of a chain
    fn clear_chain(&mut self, table: Table, chain: &str) -> Result<(), FilterError>;

    /// Remove an empty chain
    fn delete_chain(&mut self, table: Table, chain: &str) -> Result<(), FilterError>;

    /// Append a rule unless it is already present, making repeated installs
    /// safe
    fn append_unique(
        &mut self,
        table: Table,
        chain: &str,
        rule: &[String],
    ) -> Result<(), FilterError> {
        if self.exists(table, chain, rule)? {
            return Ok(());
        }
        self.append(table, chain, rule)
    }
}

/// Rule manipulation through the host `iptables` binary
pub struct IpTablesCmd {
    binary: String,
}

impl IpTablesCmd {
    /// Manager invoking the `iptables` found on PATH
    pub fn new() -> Self {
        Self {
            binary: "iptables".into(),
        }
    }

    fn run(&self, table: Table, args: &[String]) -> Result<std::process::Output, FilterError> {
        trace!("{} -t {} {}", self.binary, table.name(), args.iter().join(" "));
        Command::new(&self.binary)
            .arg("-t")
            .arg(table.name())
            .args(args)
            .output()
            .map_err(FilterError::Invoke)
    }

    fn run_checked(&self, table: Table, args: Vec<String>) -> Result<(), FilterError> {
        let output = self.run(table, &args)?;
        if !output.status.success() {
            return Err(FilterError::Command {
                args: args.iter().join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Default for IpTablesCmd {
    fn default() -> Self {
        Self::new()
    }
}

impl IpTables for IpTablesCmd {
    fn ensure_chain(&mut self, table: Table, chain: &str) -> Result<(), FilterError> {
        if self.run(table, &["-N".into(), chain.into()])?.status.success() {
            return Ok(());
        }
        // Creation failed; fine when the chain is already there
        self.run_checked(table, vec!["-nL".into(), chain.into()])
    }

    fn append(&mut self, table: Table, chain: &str, rule: &[String]) -> Result<(), FilterError> {
        let mut args = vec!["-A".to_string(), chain.to_string()];
        args.extend(rule.iter().cloned());
        self.run_checked(table, args)
    }

    fn insert(
        &mut self,
        table: Table,
        chain: &str,
        pos: u32,
        rule: &[String],
    ) -> Result<(), FilterError> {
        let mut args = vec!["-I".to_string(), chain.to_string(), pos.to_string()];
        args.extend(rule.iter().cloned());
        self.run_checked(table, args)
    }

    fn delete(&mut self, table: Table, chain: &str, rule: &[String]) -> Result<(), FilterError> {
        if !self.exists(table, chain, rule)? {
            trace!("rule already absent from {} {chain}", table.name());
            return Ok(());
        }
        let mut args = vec!["-D".to_string(), chain.to_string()];
        args.extend(rule.iter().cloned());
        self.run_checked(table, args)
    }

    fn exists(&mut self, table: Table, chain: &str, rule: &[String]) -> Result<bool, FilterError> {
        let mut args = vec!["-C".to_string(), chain.to_string()];
        args.extend(rule.iter().cloned());
        let output = self.run(table, &args)?;
        if output.status.success() {
            return Ok(true);
        }
        // iptables answers a clean miss with status 1
        match output.status.code() {
            Some(1) => Ok(false),
            _ => Err(FilterError::Command {
                args: args.iter().join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn clear_chain(&mut self, table: Table, chain: &str) -> Result<(), FilterError> {
        self.run_checked(table, vec!["-F".into(), chain.into()])
    }

    fn delete_chain(&mut self, table: Table, chain: &str) -> Result<(), FilterError> {
        self.run_checked(table, vec!["-X".into(), chain.into()])
    }
}

fn mark() -> String {
    format!("{PROCESS_MARK:#x}/{PROCESS_MARK:#x}")
}

/// Mangle rule recognizing inbound ESP with a specific SPI
fn esp_mark_rule(local: Ipv4Addr, remote: Ipv4Addr, spi: u32) -> Vec<String> {
    vec![
        "-s".into(),
        remote.to_string(),
        "-d".into(),
        local.to_string(),
        "-p".into(),
        "esp".into(),
        "-m".into(),
        "esp".into(),
        "--espspi".into(),
        format!("{spi:#x}"),
        "-j".into(),
        CHAIN_IN_MARK.into(),
    ]
}

/// Filter rule dropping unprotected overlay UDP from the peer
fn drop_unprotected_rule(local: Ipv4Addr, remote: Ipv4Addr, dst_port: u16) -> Vec<String> {
    vec![
        "-s".into(),
        remote.to_string(),
        "-d".into(),
        local.to_string(),
        "-p".into(),
        "udp".into(),
        "--dport".into(),
        dst_port.to_string(),
        "-m".into(),
        "mark".into(),
        "!".into(),
        "--mark".into(),
        mark(),
        "-j".into(),
        "DROP".into(),
    ]
}

/// Mangle rule marking outbound overlay UDP towards the peer
fn mark_outbound_rule(local: Ipv4Addr, remote: Ipv4Addr, dst_port: u16) -> Vec<String> {
    vec![
        "-s".into(),
        local.to_string(),
        "-d".into(),
        remote.to_string(),
        "-p".into(),
        "udp".into(),
        "--dport".into(),
        dst_port.to_string(),
        "-j".into(),
        CHAIN_OUT_MARK.into(),
    ]
}

/// Owner of the private chains and the per-peer rules
pub struct FilterManager {
    backend: Box<dyn IpTables>,
}

impl FilterManager {
    /// The five private chains
    const CHAINS: [(Table, &'static str); 5] = [
        (Table::Mangle, CHAIN_IN),
        (Table::Mangle, CHAIN_IN_MARK),
        (Table::Mangle, CHAIN_OUT),
        (Table::Mangle, CHAIN_OUT_MARK),
        (Table::Filter, CHAIN_IN),
    ];

    /// Wrap a backend; no rules are touched until [FilterManager::setup]
    pub fn new(backend: Box<dyn IpTables>) -> Self {
        Self { backend }
    }

    /// The six scaffolding rules living in built-in and mark chains
    fn scaffolding() -> [(Table, &'static str, Vec<String>); 6] {
        let jump_in = vec!["-j".to_string(), CHAIN_IN.to_string()];
        let set_mark = vec![
            "-j".to_string(),
            "MARK".to_string(),
            "--set-xmark".to_string(),
            mark(),
        ];
        // Marked overlay traffic leaving without a matching outbound policy
        // would go out in clear; drop it instead
        let bypass_guard = vec![
            "!".to_string(),
            "-p".to_string(),
            "esp".to_string(),
            "-m".to_string(),
            "policy".to_string(),
            "--dir".to_string(),
            "out".to_string(),
            "--pol".to_string(),
            "none".to_string(),
            "-m".to_string(),
            "mark".to_string(),
            "--mark".to_string(),
            mark(),
            "-j".to_string(),
            "DROP".to_string(),
        ];

        [
            (Table::Mangle, "INPUT", jump_in.clone()),
            (Table::Mangle, CHAIN_IN_MARK, set_mark.clone()),
            (
                Table::Mangle,
                "OUTPUT",
                vec!["-j".to_string(), CHAIN_OUT.to_string()],
            ),
            (Table::Mangle, CHAIN_OUT_MARK, set_mark),
            (Table::Filter, "INPUT", jump_in),
            (Table::Filter, "OUTPUT", bypass_guard),
        ]
    }

    /// Create the chains and scaffolding rules; safe to repeat
    pub fn setup(&mut self) -> Result<(), FilterError> {
        for (table, chain) in Self::CHAINS {
            self.backend.ensure_chain(table, chain)?;
        }
        for (table, chain, rule) in Self::scaffolding() {
            self.backend.append_unique(table, chain, &rule)?;
        }
        Ok(())
    }

    /// Install the three rules protecting one peer
    pub fn install_peer(
        &mut self,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        dst_port: u16,
        spi: u32,
    ) -> Result<(), FilterError> {
        self.install_mark_rule(local, remote, spi)?;
        self.backend.append_unique(
            Table::Filter,
            CHAIN_IN,
            &drop_unprotected_rule(local, remote, dst_port),
        )?;
        self.backend.append_unique(
            Table::Mangle,
            CHAIN_OUT,
            &mark_outbound_rule(local, remote, dst_port),
        )
    }

    /// Install only the ESP-recognition rule for a fresh SPI
    ///
    /// The rekey path: the peer- and port-bound rules already exist, and the
    /// rule for the superseded SPI stays until its SA hard-expires.
    pub fn install_mark_rule(
        &mut self,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        spi: u32,
    ) -> Result<(), FilterError> {
        self.backend
            .append_unique(Table::Mangle, CHAIN_IN, &esp_mark_rule(local, remote, spi))
    }

    /// Remove the ESP-recognition rule of one SPI
    pub fn remove_mark_rule(
        &mut self,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        spi: u32,
    ) -> Result<(), FilterError> {
        self.backend
            .delete(Table::Mangle, CHAIN_IN, &esp_mark_rule(local, remote, spi))
    }

    /// Remove every rule protecting one peer
    ///
    /// `inbound_spi` may be unknown when the registry lost track of the
    /// inbound SA; the SPI-bound rule is skipped then and ages out with its
    /// SA.
    pub fn remove_peer(
        &mut self,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        dst_port: u16,
        inbound_spi: Option<u32>,
    ) -> Result<(), FilterError> {
        if let Some(spi) = inbound_spi {
            self.remove_mark_rule(local, remote, spi)?;
        }
        self.backend.delete(
            Table::Filter,
            CHAIN_IN,
            &drop_unprotected_rule(local, remote, dst_port),
        )?;
        self.backend.delete(
            Table::Mangle,
            CHAIN_OUT,
            &mark_outbound_rule(local, remote, dst_port),
        )
    }

    /// Empty the private chains; with `destroy` also remove the scaffolding
    /// and the chains themselves
    pub fn flush(&mut self, destroy: bool) -> Result<(), FilterError> {
        for (table, chain) in Self::CHAINS {
            self.backend.clear_chain(table, chain)?;
        }
        if !destroy {
            return Ok(());
        }
        for (table, chain, rule) in Self::scaffolding() {
            self.backend.delete(table, chain, &rule)?;
        }
        for (table, chain) in Self::CHAINS {
            self.backend.delete_chain(table, chain)?;
        }
        Ok(())
    }
}
