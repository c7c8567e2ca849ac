//! Per-terminal network addressing
//!
//! Each session simulates four hosts ("terminals"). Three of them get their
//! address from the user via `ifconfig set ip`; the firewall itself has a fixed
//! sentinel address. Network and gateway are always derived from the address
//! under a fixed /24 mask, so they are never stored independently of it.

use super::error::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use strum::IntoEnumIterator;

/// Netmask shared by every simulated segment
pub const NETMASK: &str = "255.255.255.0";

/// Prefix length matching [`NETMASK`]
pub const PREFIX_LEN: u8 = 24;

/// Fixed address label of the firewall terminal
pub const FIREWALL_SENTINEL: &str = "FIREWALL";

/// One of the four simulated hosts
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
#[strum(ascii_case_insensitive)]
pub enum Terminal {
    /// Host on the internal LAN
    #[default]
    #[strum(serialize = "insider")]
    Insider,
    /// Host on the external network
    #[strum(serialize = "outsider")]
    Outsider,
    /// Web server in the demilitarized zone
    #[strum(serialize = "dmz")]
    Dmz,
    /// The firewall's own admin console
    #[strum(serialize = "firewall")]
    Firewall,
}

impl Terminal {
    /// Returns the fixed zone label for this terminal
    pub const fn zone(self) -> &'static str {
        match self {
            Terminal::Insider => "LAN1-INTERNAL",
            Terminal::Outsider => "LAN2-EXTERNAL",
            Terminal::Dmz => "DMZ-WEBSERVER",
            Terminal::Firewall => "FIREWALL-ADMIN",
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }

    /// Parses a terminal name, mapping failures to [`Error::UnknownTerminal`].
    pub fn parse(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| Error::UnknownTerminal(crate::validators::escape_html(name)))
    }
}

/// Addressing of a single terminal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub ip: Option<String>,
    pub netmask: String,
    pub gateway: Option<String>,
    pub network: Option<String>,
    pub zone: String,
}

impl NetworkConfig {
    fn unconfigured(terminal: Terminal) -> Self {
        Self {
            ip: (terminal == Terminal::Firewall).then(|| FIREWALL_SENTINEL.to_string()),
            netmask: NETMASK.to_string(),
            gateway: None,
            network: None,
            zone: terminal.zone().to_string(),
        }
    }
}

/// Result of a successful address assignment, forwarded to the observer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigChange {
    pub terminal: Terminal,
    pub ip: String,
    pub network: String,
    pub gateway: String,
}

/// Computes the /24 network containing `ip` and its conventional `.1` gateway.
///
/// # Errors
///
/// Returns [`Error::Validation`] if `ip` cannot carry a /24 prefix.
///
/// # Examples
///
/// ```
/// use fwsim::core::network::derive_network;
///
/// let (network, gateway) = derive_network("192.168.10.10".parse().unwrap()).unwrap();
/// assert_eq!(network.to_string(), "192.168.10.0/24");
/// assert_eq!(gateway.to_string(), "192.168.10.1");
/// ```
pub fn derive_network(ip: Ipv4Addr) -> Result<(Ipv4Network, Ipv4Addr)> {
    let invalid = |e: ipnetwork::IpNetworkError| Error::validation("ip", e.to_string());
    let host = Ipv4Network::new(ip, PREFIX_LEN).map_err(invalid)?;
    let network = Ipv4Network::new(host.network(), PREFIX_LEN).map_err(invalid)?;
    let gateway = network.nth(1).unwrap_or_else(|| network.network());
    Ok((network, gateway))
}

/// Addressing for all four terminals of one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfigStore {
    configs: Vec<NetworkConfig>,
}

impl Default for NetworkConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkConfigStore {
    pub fn new() -> Self {
        Self {
            configs: Terminal::iter().map(NetworkConfig::unconfigured).collect(),
        }
    }

    /// Assigns an address to a terminal and recomputes its network and gateway.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the literal is not a well-formed IPv4
    /// address or the terminal is the firewall (whose address is fixed).
    /// Nothing is mutated on error.
    pub fn set_ip(&mut self, terminal: Terminal, literal: &str) -> Result<ConfigChange> {
        if terminal == Terminal::Firewall {
            return Err(Error::validation(
                "ip",
                "The firewall address is fixed and cannot be changed",
            ));
        }

        let addr = crate::validators::validate_ipv4(literal)
            .map_err(|message| Error::validation("ip", message))?;
        let (network, gateway) = derive_network(addr)?;

        let change = ConfigChange {
            terminal,
            ip: addr.to_string(),
            network: network.to_string(),
            gateway: gateway.to_string(),
        };

        let config = &mut self.configs[terminal.slot()];
        config.ip = Some(change.ip.clone());
        config.network = Some(change.network.clone());
        config.gateway = Some(change.gateway.clone());

        tracing::info!(
            terminal = %terminal,
            ip = %change.ip,
            network = %change.network,
            "terminal address assigned"
        );
        Ok(change)
    }

    /// Returns a snapshot of a terminal's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTerminal`] if `name` is not one of the four roles.
    pub fn get_config(&self, name: &str) -> Result<NetworkConfig> {
        Ok(self.config(Terminal::parse(name)?).clone())
    }

    pub fn config(&self, terminal: Terminal) -> &NetworkConfig {
        &self.configs[terminal.slot()]
    }

    /// Address used as the source of traffic originating at `terminal`
    pub fn source_ip(&self, terminal: Terminal) -> Option<&str> {
        self.config(terminal).ip.as_deref()
    }
}
