//! Rule chains and the packet evaluation engine
//!
//! This module defines the iptables-style rule model and the engine that
//! decides whether simulated traffic passes.
//!
//! # Rule Structure
//!
//! A [`Rule`] matches on:
//! - Source and destination (IPv4 literal or CIDR, wildcard `0.0.0.0/0`)
//! - Protocol (`tcp`, `udp`, `icmp`, or `all`)
//! - Destination port (exact string match)
//!
//! and carries a [`Target`]. `sport` is recorded and displayed but does not
//! take part in matching.
//!
//! # Evaluation
//!
//! Chains are scanned in index order and the first terminal match wins.
//! `LOG` rules record the packet and let the scan continue. Traffic that
//! matches nothing is dropped by the implicit default policy.
//!
//! # Example
//!
//! ```
//! use fwsim::core::event_log::EventLog;
//! use fwsim::core::firewall::{ChainName, Packet, Protocol, RuleChainEngine, RuleSpec, Target};
//!
//! let mut engine = RuleChainEngine::deterministic(60);
//! let mut log = EventLog::detached();
//!
//! engine
//!     .append_rule(
//!         "FORWARD",
//!         RuleSpec::default()
//!             .source("192.168.10.0/24")
//!             .protocol(Protocol::Tcp)
//!             .dport("80")
//!             .target(Target::Accept),
//!     )
//!     .unwrap();
//!
//! let packet = Packet::new("192.168.10.10", "192.168.30.10", Protocol::Tcp, Some("80"));
//! let verdict = engine.evaluate(ChainName::Forward, &packet, &mut log);
//! assert!(verdict.allowed);
//! assert_eq!(verdict.provenance, "ACCEPT by FORWARD rule 1");
//! ```

use super::error::{Error, Result};
use super::event_log::{EventLog, LogAction, LogRecord};
use crate::validators::escape_html;
use ipnetwork::Ipv4Network;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::net::Ipv4Addr;
use strum::IntoEnumIterator;

/// Address pattern that matches every host
pub const WILDCARD: &str = "0.0.0.0/0";

/// Provenance reported when no rule matched
pub const DEFAULT_POLICY_PROVENANCE: &str = "DROP by default policy";

/// Rule provenance recorded in the log for default-policy drops
pub const DEFAULT_POLICY_RULE: &str = "Default policy";

/// Named chain, one per traffic direction
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ChainName {
    /// Traffic addressed to the firewall itself
    Input,
    /// Traffic originating at the firewall
    Output,
    /// Traffic routed through the firewall between zones
    Forward,
}

impl ChainName {
    /// Parses a chain name, mapping failures to [`Error::InvalidChain`].
    pub fn parse(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| Error::InvalidChain(escape_html(name)))
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

/// Network protocol matched by a rule or carried by a packet
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    /// Match all protocols
    #[default]
    All,
    /// Transmission Control Protocol
    Tcp,
    /// User Datagram Protocol
    Udp,
    /// Internet Control Message Protocol
    Icmp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::All => "all",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

/// Action prescribed by a matching rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Target {
    /// Let the packet through
    Accept,
    /// Discard silently
    #[default]
    Drop,
    /// Discard and notify the sender
    Reject,
    /// Record the packet and keep evaluating
    Log,
}

impl Target {
    /// Returns true if evaluation stops at a rule with this target
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Target::Log)
    }
}

/// A fully-populated firewall rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Rule {
    pub source: String,
    pub destination: String,
    pub protocol: Protocol,
    pub sport: Option<String>,
    pub dport: Option<String>,
    pub target: Target,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            source: WILDCARD.to_string(),
            destination: WILDCARD.to_string(),
            protocol: Protocol::All,
            sport: None,
            dport: None,
            target: Target::Drop,
        }
    }
}

/// Returns true if `ip` falls inside the CIDR `network`.
///
/// Unparseable input never matches.
fn ip_in_network(ip: &str, network: &str) -> bool {
    match (ip.parse::<Ipv4Addr>(), network.parse::<Ipv4Network>()) {
        (Ok(ip), Ok(network)) => network.contains(ip),
        _ => false,
    }
}

/// Wildcard matches anything, a CIDR tests containment, anything else must be
/// byte-for-byte equal.
fn address_matches(pattern: &str, ip: &str) -> bool {
    if pattern.is_empty() || pattern == WILDCARD {
        true
    } else if pattern.contains('/') {
        ip_in_network(ip, pattern)
    } else {
        pattern == ip
    }
}

impl Rule {
    pub fn matches(&self, packet: &Packet) -> bool {
        address_matches(&self.source, &packet.source)
            && address_matches(&self.destination, &packet.destination)
            && (self.protocol == Protocol::All || self.protocol == packet.protocol)
            // A port-less packet (ICMP) is not judged by dport
            && self.dport.as_deref().is_none_or(|dport| {
                packet.port.as_deref().is_none_or(|port| port == dport)
            })
    }

    pub fn is_match_all(&self) -> bool {
        self.source == WILDCARD && self.destination == WILDCARD
    }

    /// Port options as shown by `iptables -L -v` (display-safe)
    pub fn options(&self) -> String {
        let mut out = String::new();
        if let Some(dport) = &self.dport {
            let _ = write!(out, " dpt:{}", escape_html(dport));
        }
        if let Some(sport) = &self.sport {
            let _ = write!(out, " spt:{}", escape_html(sport));
        }
        out
    }

    /// Reconstructs the `iptables -A` command for this rule, omitting defaults
    pub fn to_command(&self, chain: ChainName) -> String {
        let mut cmd = format!("iptables -A {chain}");
        if self.source != WILDCARD {
            let _ = write!(cmd, " -s {}", self.source);
        }
        if self.destination != WILDCARD {
            let _ = write!(cmd, " -d {}", self.destination);
        }
        if self.protocol != Protocol::All {
            let _ = write!(cmd, " -p {}", self.protocol);
        }
        if let Some(sport) = &self.sport {
            let _ = write!(cmd, " --sport {sport}");
        }
        if let Some(dport) = &self.dport {
            let _ = write!(cmd, " --dport {dport}");
        }
        let _ = write!(cmd, " -j {}", self.target);
        cmd
    }
}

/// Partially specified rule; unset fields take the defaults of [`Rule`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSpec {
    pub source: Option<String>,
    pub destination: Option<String>,
    pub protocol: Option<Protocol>,
    pub sport: Option<String>,
    pub dport: Option<String>,
    pub target: Option<Target>,
}

impl RuleSpec {
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn sport(mut self, sport: impl Into<String>) -> Self {
        self.sport = Some(sport.into());
        self
    }

    pub fn dport(mut self, dport: impl Into<String>) -> Self {
        self.dport = Some(dport.into());
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// Fills unset fields with defaults
    pub fn into_rule(self) -> Rule {
        let defaults = Rule::default();
        Rule {
            source: self.source.unwrap_or(defaults.source),
            destination: self.destination.unwrap_or(defaults.destination),
            protocol: self.protocol.unwrap_or(defaults.protocol),
            sport: self.sport,
            dport: self.dport,
            target: self.target.unwrap_or(defaults.target),
        }
    }
}

/// Simulated traffic presented to a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub source: String,
    pub destination: String,
    pub protocol: Protocol,
    pub port: Option<String>,
}

impl Packet {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        protocol: Protocol,
        port: Option<&str>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            protocol,
            port: port.map(String::from),
        }
    }
}

/// Outcome of evaluating a packet against a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    /// Which rule (or the default policy) decided, e.g. `ACCEPT by FORWARD rule 1`
    pub provenance: String,
}

/// Packet and byte totals for one rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCounter {
    pub packets: u64,
    pub bytes: u64,
}

/// Source of simulated payload sizes for byte counters
pub trait PayloadSizer: Send + fmt::Debug {
    fn next_size(&mut self) -> u64;
}

/// Uniformly random payload sizes in `min..=max`
#[derive(Debug, Clone, Copy)]
pub struct RandomPayload {
    pub min: u64,
    pub max: u64,
}

impl Default for RandomPayload {
    fn default() -> Self {
        Self { min: 40, max: 1500 }
    }
}

impl PayloadSizer for RandomPayload {
    fn next_size(&mut self) -> u64 {
        if self.min >= self.max {
            return self.min;
        }
        rand::rng().random_range(self.min..=self.max)
    }
}

/// Every packet has the same size
#[derive(Debug, Clone, Copy)]
pub struct FixedPayload(pub u64);

impl PayloadSizer for FixedPayload {
    fn next_size(&mut self) -> u64 {
        self.0
    }
}

/// Ordered rules of one chain with their positionally aligned counters
#[derive(Debug, Clone, Default)]
pub struct Chain {
    rules: Vec<Rule>,
    counters: Vec<RuleCounter>,
}

impl Chain {
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn counters(&self) -> &[RuleCounter] {
        &self.counters
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn push(&mut self, rule: Rule) -> usize {
        self.rules.push(rule);
        self.counters.push(RuleCounter::default());
        self.assert_aligned();
        self.rules.len()
    }

    fn remove(&mut self, position: usize) -> Rule {
        let rule = self.rules.remove(position);
        self.counters.remove(position);
        self.assert_aligned();
        rule
    }

    fn clear(&mut self) {
        self.rules.clear();
        self.counters.clear();
    }

    fn assert_aligned(&self) {
        assert_eq!(
            self.rules.len(),
            self.counters.len(),
            "rule/counter misalignment"
        );
    }
}

/// A single rule as it appears in a listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListedRule {
    /// 1-based position in the chain
    pub index: usize,
    #[serde(flatten)]
    pub rule: Rule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<RuleCounter>,
}

/// Listing of one chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainListing {
    pub chain: ChainName,
    pub policy: Target,
    pub rules: Vec<ListedRule>,
}

/// `iptables -L` view of one or all chains
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleListing {
    pub verbose: bool,
    pub chains: Vec<ChainListing>,
}

impl fmt::Display for RuleListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        for chain in &self.chains {
            writeln!(f, "Chain {} (policy {})", chain.chain, chain.policy)?;
            if self.verbose {
                writeln!(
                    f,
                    "{:<8} {:<10} {:<12} {:<6} {:<20} {:<20} options",
                    "pkts", "bytes", "target", "prot", "source", "destination"
                )?;
            } else {
                writeln!(
                    f,
                    "{:<12} {:<6} {:<20} {:<20}",
                    "target", "prot", "source", "destination"
                )?;
            }

            for listed in &chain.rules {
                if let Some(counter) = listed.counter {
                    write!(f, "{:<8} {:<10} ", counter.packets, counter.bytes)?;
                }
                let rule = &listed.rule;
                write!(
                    f,
                    "{:<12} {:<6} {:<20} {:<20}",
                    rule.target.as_ref(),
                    rule.protocol.as_str(),
                    escape_html(&rule.source),
                    escape_html(&rule.destination)
                )?;
                writeln!(f, "{}", rule.options())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// The three chains of one session plus the payload size source
#[derive(Debug)]
pub struct RuleChainEngine {
    chains: [Chain; 3],
    payload: Box<dyn PayloadSizer>,
}

impl Default for RuleChainEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleChainEngine {
    /// Engine with random payload sizes
    pub fn new() -> Self {
        Self::with_payload(Box::new(RandomPayload::default()))
    }

    pub fn with_payload(payload: Box<dyn PayloadSizer>) -> Self {
        Self {
            chains: Default::default(),
            payload,
        }
    }

    /// Engine where every packet counts `bytes` bytes
    pub fn deterministic(bytes: u64) -> Self {
        Self::with_payload(Box::new(FixedPayload(bytes)))
    }

    pub fn chain(&self, name: ChainName) -> &Chain {
        &self.chains[name.slot()]
    }

    pub fn rules(&self, name: ChainName) -> &[Rule] {
        self.chain(name).rules()
    }

    pub fn counters(&self, name: ChainName) -> &[RuleCounter] {
        self.chain(name).counters()
    }

    /// All chains in INPUT, OUTPUT, FORWARD order
    pub fn chains(&self) -> impl Iterator<Item = (ChainName, &Chain)> {
        ChainName::iter().map(|name| (name, self.chain(name)))
    }

    /// Appends a rule at the lowest priority and returns its 1-based index.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidChain`] if `chain` is not INPUT, OUTPUT or FORWARD
    /// - [`Error::DuplicateRule`] if an identical rule is already in the chain
    pub fn append_rule(&mut self, chain: &str, spec: RuleSpec) -> Result<usize> {
        let name = ChainName::parse(chain)?;
        let rule = spec.into_rule();
        let slot = &mut self.chains[name.slot()];

        if slot.rules.contains(&rule) {
            return Err(Error::DuplicateRule {
                chain: name.to_string(),
            });
        }

        let index = slot.push(rule);
        tracing::info!(chain = %name, index, "rule appended");
        Ok(index)
    }

    /// Removes the rule at 1-based `index`; later rules shift down by one.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidChain`] for an unknown chain
    /// - [`Error::InvalidIndex`] if `index` is outside `1..=len`
    pub fn delete_rule(&mut self, chain: &str, index: usize) -> Result<Rule> {
        let name = ChainName::parse(chain)?;
        let slot = &mut self.chains[name.slot()];

        if index == 0 || index > slot.len() {
            return Err(Error::InvalidIndex {
                chain: name.to_string(),
                index,
                len: slot.len(),
            });
        }

        let rule = slot.remove(index - 1);
        tracing::info!(chain = %name, index, "rule deleted");
        Ok(rule)
    }

    /// Clears one chain, or all chains when `chain` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChain`] for an unknown chain name.
    pub fn flush(&mut self, chain: Option<&str>) -> Result<()> {
        match chain {
            Some(chain) => {
                let name = ChainName::parse(chain)?;
                self.chains[name.slot()].clear();
                tracing::info!(chain = %name, "chain flushed");
            }
            None => self.clear_all(),
        }
        Ok(())
    }

    /// Empties every chain
    pub(crate) fn clear_all(&mut self) {
        for slot in &mut self.chains {
            slot.clear();
        }
        tracing::info!("all chains flushed");
    }

    /// Lists one chain, or all chains when `chain` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChain`] for an unknown chain name.
    pub fn list_rules(&self, chain: Option<&str>, verbose: bool) -> Result<RuleListing> {
        let names: Vec<ChainName> = match chain {
            Some(chain) => vec![ChainName::parse(chain)?],
            None => ChainName::iter().collect(),
        };

        let chains = names
            .into_iter()
            .map(|name| {
                let slot = self.chain(name);
                ChainListing {
                    chain: name,
                    policy: Target::Drop,
                    rules: slot
                        .rules
                        .iter()
                        .zip(&slot.counters)
                        .enumerate()
                        .map(|(i, (rule, counter))| ListedRule {
                            index: i + 1,
                            rule: rule.clone(),
                            counter: verbose.then_some(*counter),
                        })
                        .collect(),
                }
            })
            .collect();

        Ok(RuleListing { verbose, chains })
    }

    /// Decides whether `packet` passes `chain`, updating counters and the log.
    ///
    /// Never fails: if no terminal rule matches, the default DROP policy applies.
    pub fn evaluate(&mut self, chain: ChainName, packet: &Packet, log: &mut EventLog) -> Verdict {
        let Self { chains, payload } = self;
        let slot = &mut chains[chain.slot()];

        for (i, rule) in slot.rules.iter().enumerate() {
            if !rule.matches(packet) {
                continue;
            }

            let position = i + 1;
            let counter = &mut slot.counters[i];
            counter.packets += 1;
            counter.bytes += payload.next_size();

            log.append(LogRecord::for_packet(
                LogAction::from(rule.target),
                packet,
                format!("{chain} rule {position}"),
            ));

            if !rule.target.is_terminal() {
                continue;
            }

            let provenance = format!("{} by {chain} rule {position}", rule.target);
            tracing::debug!(
                chain = %chain,
                source = %packet.source,
                destination = %packet.destination,
                protocol = %packet.protocol,
                "{provenance}"
            );
            return Verdict {
                allowed: rule.target == Target::Accept,
                provenance,
            };
        }

        log.append(LogRecord::for_packet(
            LogAction::Drop,
            packet,
            DEFAULT_POLICY_RULE,
        ));
        tracing::debug!(
            chain = %chain,
            source = %packet.source,
            destination = %packet.destination,
            "{DEFAULT_POLICY_PROVENANCE}"
        );
        Verdict {
            allowed: false,
            provenance: DEFAULT_POLICY_PROVENANCE.to_string(),
        }
    }

    /// Zeroes every counter without touching the rules
    pub fn reset_counters(&mut self) {
        for slot in &mut self.chains {
            slot.counters.fill(RuleCounter::default());
        }
    }

    /// Renders all chains as a replayable `iptables` script
    pub fn export(&self) -> String {
        let mut out = String::from("# Firewall Rules Configuration\n");
        let _ = writeln!(
            out,
            "# Generated: {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        for (name, chain) in self.chains() {
            let _ = writeln!(out, "# {name} Chain");
            for rule in chain.rules() {
                let _ = writeln!(out, "{}", rule.to_command(name));
            }
            out.push('\n');
        }
        out
    }
}
