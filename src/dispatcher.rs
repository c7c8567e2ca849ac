//! Executes parsed commands against a session and renders terminal output
//!
//! The dispatcher is the only place that knows what a tool "looks like". It
//! turns each [`Command`] into core calls, formats the result the way the real
//! tool would, and inserts pacing delays for the slow tools.
//!
//! Delays use `tokio::time::sleep`, so they suspend only the calling task.
//! Dropping the future returned by [`Dispatcher::execute`] cancels the command
//! and discards its output; every state change has already happened inside a
//! synchronous core call by then.

use crate::command::{Command, ParseError};
use crate::config::PacingConfig;
use crate::core::error::Error;
use crate::core::event_log::LogEntry;
use crate::core::firewall::{ChainName, Packet, Protocol};
use crate::core::network::Terminal;
use crate::core::session::{Session, SessionStore};
use crate::validators::escape_html;
use rand::Rng;
use rand::seq::IndexedRandom;
use std::fmt::Write;
use tracing::debug;

/// Shown when a traffic tool runs on a terminal without an address
pub const NO_IP_CONFIGURED: &str = "Error: No IP address configured. Use 'ifconfig set ip <ip>'";

/// Entries shown by `logs` without a count
pub const DEFAULT_LOG_LINES: usize = 20;

const PING_COUNT: u32 = 4;

pub const HELP_TEXT: &str = "
Available commands:

Network Configuration:
  ifconfig                    - Show network configuration
  ifconfig set ip <ip>        - Set IP address for this terminal

Firewall Management:
  iptables -L [chain] [-v]    - List firewall rules (-v for counters)
  iptables -A <chain> [opts]  - Append rule to chain
    Options: -s <source> -d <dest> -p <protocol> --sport <port> --dport <port> -j <target>
    Chains: INPUT, OUTPUT, FORWARD
    Targets: ACCEPT, DROP, REJECT, LOG
  iptables -D <chain> <num>   - Delete rule number from chain
  iptables -F [chain]         - Flush all rules (or specific chain)

Network Testing:
  ping <target>               - Test ICMP connectivity
  nmap [-p <ports>] <target>  - Scan ports (use -p 80,443 or -p 1-1000)
  nc <target> <port>          - Test TCP connection
  curl <url>                  - HTTP request

Network Utilities:
  traceroute <target>         - Trace route to target
  nslookup <domain>           - DNS lookup
  whoami                      - Show terminal info
  clear                       - Clear terminal

Logs and Analysis:
  logs [count]                - Show recent firewall events
  logs stats                  - Show event statistics
  logs clear                  - Clear logs and reset counters
  warnings                    - Show rule conflicts
  export                      - Export rules as iptables commands

Examples:
  ifconfig set ip 192.168.10.10
  iptables -A FORWARD -s 192.168.10.0/24 -p tcp --dport 80 -j ACCEPT
  iptables -A FORWARD -d 192.168.10.0/24 -j DROP
  nmap -p 80,443 192.168.30.10
  iptables -L -v
";

/// Result of one terminal line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Text(String),
    /// The terminal should wipe its screen
    ClearScreen,
}

impl Output {
    fn line(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        Output::Text(text)
    }

    /// Rendered text, empty for [`Output::ClearScreen`]
    pub fn text(&self) -> &str {
        match self {
            Output::Text(text) => text,
            Output::ClearScreen => "",
        }
    }
}

/// Renders a core error as terminal text.
pub fn render_error(error: &Error) -> String {
    match error {
        Error::Validation { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn render_parse_error(error: &ParseError) -> String {
    match error {
        ParseError::Rule(inner) => render_error(inner),
        other => other.to_string(),
    }
}

fn service_name(port: u16) -> &'static str {
    match port {
        80 => "http",
        443 => "https",
        22 => "ssh",
        21 => "ftp",
        23 => "telnet",
        25 => "smtp",
        53 => "dns",
        3306 => "mysql",
        _ => "unknown",
    }
}

fn random_ipv4() -> String {
    let mut rng = rand::rng();
    format!(
        "{}.{}.{}.{}",
        rng.random_range(1..=255),
        rng.random_range(1..=255),
        rng.random_range(1..=255),
        rng.random_range(1..=255)
    )
}

/// Host that `curl` connects to: the URL host for lab addresses, a public
/// resolver for everything else.
fn curl_target(url: &str) -> &str {
    if !url.contains("192.168.") {
        return "8.8.8.8";
    }
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest.split('/').next().unwrap_or(rest);
    host.split(':').next().unwrap_or(host)
}

fn curl_port(url: &str) -> &'static str {
    if url.to_ascii_lowercase().starts_with("https://") {
        "443"
    } else {
        "80"
    }
}

fn format_log_entry(entry: &LogEntry) -> String {
    let mut line = format!(
        "{} {:<7} {} -> {} {}",
        entry.timestamp.format("%H:%M:%S"),
        entry.action.as_ref(),
        entry.source,
        entry.destination,
        entry.protocol
    );
    if let Some(port) = &entry.port {
        let _ = write!(line, ":{port}");
    }
    let _ = write!(line, " [{}]", entry.rule);
    if let Some(warning) = &entry.warning {
        let _ = write!(line, "\n         ! {warning}");
    }
    line
}

#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    pacing: PacingConfig,
}

impl Dispatcher {
    pub fn new(pacing: PacingConfig) -> Self {
        Self { pacing }
    }

    /// Parses and runs one line on the client's session.
    ///
    /// Holds the session for the whole command, so lines from the same client
    /// run strictly one after another.
    pub async fn handle(
        &self,
        store: &SessionStore,
        client: &str,
        terminal: Terminal,
        line: &str,
    ) -> Option<Output> {
        let mut session = store.acquire(client).await;
        self.run_line(&mut session, terminal, line).await
    }

    /// Parses and runs one line. Blank lines produce no output.
    pub async fn run_line(
        &self,
        session: &mut Session,
        terminal: Terminal,
        line: &str,
    ) -> Option<Output> {
        match Command::parse(line) {
            Ok(None) => None,
            Ok(Some(cmd)) => Some(self.execute(session, terminal, cmd).await),
            Err(e) => Some(Output::line(render_parse_error(&e))),
        }
    }

    pub async fn execute(&self, session: &mut Session, terminal: Terminal, cmd: Command) -> Output {
        debug!(session = %session.id(), %terminal, ?cmd, "executing command");

        match cmd {
            Command::Help => Output::line(HELP_TEXT),
            Command::Ifconfig => Output::line(ifconfig(session, terminal)),
            Command::SetIp(ip) => Output::line(match session.set_ip(terminal, &ip) {
                Ok(change) => format!(
                    "IP address set to {}\nNetwork: {}\nGateway: {}",
                    change.ip, change.network, change.gateway
                ),
                Err(e) => render_error(&e),
            }),
            Command::IptablesList { chain, verbose } => {
                Output::line(match session.list_rules(chain.as_deref(), verbose) {
                    Ok(listing) => listing.to_string(),
                    Err(e) => render_error(&e),
                })
            }
            Command::IptablesAppend { chain, spec } => {
                Output::line(match session.append_rule(&chain, spec) {
                    Ok(index) => format!("Rule {index} added to {chain} chain"),
                    Err(e) => render_error(&e),
                })
            }
            Command::IptablesDelete { chain, index } => {
                Output::line(match session.delete_rule(&chain, index) {
                    Ok(_) => format!("Deleted rule {index} from {chain} chain"),
                    Err(e) => render_error(&e),
                })
            }
            Command::IptablesFlush { chain } => {
                Output::line(match session.flush(chain.as_deref()) {
                    Ok(()) => match chain {
                        Some(chain) => format!("Flushed {chain} chain"),
                        None => "Flushed all chains".to_string(),
                    },
                    Err(e) => render_error(&e),
                })
            }
            Command::Ping { target } => Output::line(self.ping(session, terminal, &target).await),
            Command::Nmap { target, ports } => {
                Output::line(self.nmap(session, terminal, &target, &ports).await)
            }
            Command::Nc { target, port } => Output::line(nc(session, terminal, &target, &port)),
            Command::Curl { url } => Output::line(curl(session, terminal, &url)),
            Command::Traceroute { target } => Output::line(self.traceroute(&target).await),
            Command::Nslookup { domain } => Output::line(format!(
                "Server:  8.8.8.8\nAddress: 8.8.8.8#53\n\nName: {}\nAddress: {}",
                escape_html(&domain),
                random_ipv4()
            )),
            Command::Whoami => Output::line(whoami(session, terminal)),
            Command::Clear => Output::ClearScreen,
            Command::Logs { limit } => Output::line(logs(session, limit)),
            Command::LogsClear => {
                session.clear_logs();
                Output::line("Logs and statistics cleared")
            }
            Command::LogsStats => {
                let stats = session.stats();
                Output::line(format!(
                    "Total events: {}\nAllowed:      {}\nBlocked:      {}\nWarnings:     {}",
                    stats.total, stats.allowed, stats.blocked, stats.warnings
                ))
            }
            Command::Warnings => {
                let warnings = session.analyze();
                if warnings.is_empty() {
                    Output::line("No rule conflicts detected")
                } else {
                    Output::line(
                        warnings
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join("\n"),
                    )
                }
            }
            Command::Export => Output::line(session.export()),
        }
    }

    async fn ping(&self, session: &mut Session, terminal: Terminal, target: &str) -> String {
        let Some(source) = session.network().source_ip(terminal).map(String::from) else {
            return NO_IP_CONFIGURED.to_string();
        };

        let safe_target = escape_html(target);
        let verdict = session.evaluate(
            ChainName::Forward,
            &Packet::new(source, target, Protocol::Icmp, None),
        );
        if !verdict.allowed {
            return format!("ping: {safe_target}: {}", verdict.provenance);
        }

        let mut output = format!("PING {safe_target} 56(84) bytes of data.\n");
        for seq in 1..=PING_COUNT {
            let (ttl, latency) = {
                let mut rng = rand::rng();
                (rng.random_range(50..=64), rng.random_range(0.5..50.0))
            };
            let _ = writeln!(
                output,
                "64 bytes from {safe_target}: icmp_seq={seq} ttl={ttl} time={latency:.1} ms"
            );
            tokio::time::sleep(self.pacing.ping()).await;
        }

        let _ = write!(
            output,
            "\n--- {safe_target} ping statistics ---\n{PING_COUNT} packets transmitted, {PING_COUNT} received, 0% packet loss"
        );
        output
    }

    async fn nmap(
        &self,
        session: &mut Session,
        terminal: Terminal,
        target: &str,
        ports: &[u16],
    ) -> String {
        let Some(source) = session.network().source_ip(terminal).map(String::from) else {
            return NO_IP_CONFIGURED.to_string();
        };

        let safe_target = escape_html(target);
        let mut output = format!(
            "\nStarting Nmap scan on {safe_target}\nNmap scan report for {safe_target}\nHost is up (0.0010s latency).\n\n{:<10} {:<12} SERVICE\n",
            "PORT", "STATE"
        );

        for &port in ports {
            let port_str = port.to_string();
            let verdict = session.evaluate(
                ChainName::Forward,
                &Packet::new(source.as_str(), target, Protocol::Tcp, Some(&port_str)),
            );
            let proto_port = format!("{port}/tcp");
            if verdict.allowed {
                let state = ["open", "open", "open", "closed"]
                    .choose(&mut rand::rng())
                    .copied()
                    .unwrap_or("open");
                let _ = writeln!(
                    output,
                    "{proto_port:<10} {state:<12} {}",
                    service_name(port)
                );
            } else {
                let _ = writeln!(
                    output,
                    "{proto_port:<10} {:<12} (blocked by firewall)",
                    "filtered"
                );
            }
            tokio::time::sleep(self.pacing.scan()).await;
        }

        output.push_str("\nNmap done: 1 IP address scanned");
        output
    }

    async fn traceroute(&self, target: &str) -> String {
        let hops: Vec<(String, f64)> = {
            let mut rng = rand::rng();
            let count = rng.random_range(5..=12);
            (1..=count)
                .map(|hop| (random_ipv4(), rng.random_range(1.0..50.0) * f64::from(hop)))
                .collect()
        };

        let mut output = format!(
            "traceroute to {}, 30 hops max, 60 byte packets\n",
            escape_html(target)
        );
        for (hop, (ip, latency)) in hops.iter().enumerate() {
            let _ = writeln!(output, " {}  {ip}  {latency:.3} ms", hop + 1);
            tokio::time::sleep(self.pacing.trace()).await;
        }
        output
    }
}

fn ifconfig(session: &Session, terminal: Terminal) -> String {
    let config = session.network().config(terminal);
    let Some(ip) = &config.ip else {
        return "eth0: No IP address configured\nUse: ifconfig set ip <ip_address>".to_string();
    };

    let mac_suffix: u8 = rand::rng().random_range(10..=99);
    format!(
        "eth0: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1500\n        inet {ip}  netmask {}  broadcast {}\n        ether 02:42:ac:11:00:{mac_suffix}  txqueuelen 0  (Ethernet)\n        RX packets 1234  bytes 567890 (567.8 KB)\n        TX packets 987  bytes 123456 (123.4 KB)\n\nZone: {}\nNetwork: {}",
        config.netmask,
        config.gateway.as_deref().unwrap_or("N/A"),
        config.zone,
        config.network.as_deref().unwrap_or("N/A"),
    )
}

fn whoami(session: &Session, terminal: Terminal) -> String {
    let config = session.network().config(terminal);
    format!(
        "Terminal: {terminal}\nZone: {}\nNetwork: {}\nIP: {}",
        config.zone,
        config.network.as_deref().unwrap_or("Not configured"),
        config.ip.as_deref().unwrap_or("Not configured"),
    )
}

fn nc(session: &mut Session, terminal: Terminal, target: &str, port: &str) -> String {
    let Some(source) = session.network().source_ip(terminal).map(String::from) else {
        return NO_IP_CONFIGURED.to_string();
    };

    let verdict = session.evaluate(
        ChainName::Forward,
        &Packet::new(source, target, Protocol::Tcp, Some(port)),
    );
    let (safe_target, safe_port) = (escape_html(target), escape_html(port));
    if verdict.allowed {
        format!("Connection to {safe_target} {safe_port} port [tcp/*] succeeded!")
    } else {
        format!(
            "nc: connect to {safe_target} port {safe_port} (tcp) failed: {}",
            verdict.provenance
        )
    }
}

fn curl(session: &mut Session, terminal: Terminal, url: &str) -> String {
    let Some(source) = session.network().source_ip(terminal).map(String::from) else {
        return NO_IP_CONFIGURED.to_string();
    };

    let verdict = session.evaluate(
        ChainName::Forward,
        &Packet::new(source, curl_target(url), Protocol::Tcp, Some(curl_port(url))),
    );
    if verdict.allowed {
        format!(
            "HTTP/1.1 200 OK\nContent-Type: text/html\n\n<html><body>Response from {}</body></html>",
            escape_html(url)
        )
    } else {
        format!("curl: (7) Failed to connect: {}", verdict.provenance)
    }
}

fn logs(session: &Session, limit: Option<usize>) -> String {
    let log = session.log();
    if log.is_empty() {
        return "No log entries".to_string();
    }
    let count = limit.unwrap_or(DEFAULT_LOG_LINES);
    let lines: Vec<String> = log.recent(count).map(format_log_entry).collect();
    format!(
        "Showing {} of {} entries\n{}",
        lines.len(),
        log.len(),
        lines.join("\n")
    )
}
