//! Typed command grammar for the simulator shell
//!
//! A terminal line is parsed once into a [`Command`]; the dispatcher never
//! looks at raw strings again. Parsing is purely syntactic. Anything that
//! needs session state (chain names, address validity) is checked by the core
//! when the command runs.
//!
//! # Example
//!
//! ```
//! use fwsim::command::Command;
//! use fwsim::core::firewall::{Protocol, Target};
//!
//! let cmd = Command::parse("iptables -A FORWARD -p tcp --dport 80 -j ACCEPT")
//!     .unwrap()
//!     .unwrap();
//! let Command::IptablesAppend { chain, spec } = cmd else { unreachable!() };
//! assert_eq!(chain, "FORWARD");
//! assert_eq!(spec.protocol, Some(Protocol::Tcp));
//! assert_eq!(spec.target, Some(Target::Accept));
//! ```

use crate::core::error::Error;
use crate::core::firewall::{Protocol, RuleSpec, Target};
use crate::core::network::Terminal;
use crate::validators::{escape_html, parse_port_spec};
use thiserror::Error;

/// Ports scanned by `nmap` without `-p`
pub const DEFAULT_SCAN_PORTS: [u16; 8] = [80, 443, 22, 21, 23, 25, 53, 3306];

pub const USAGE_IFCONFIG: &str = "Usage: ifconfig [set ip <ip_address>]";
pub const USAGE_IPTABLES: &str = "Usage: iptables [-A|-D|-L|-F] [chain] [options]";
pub const USAGE_IPTABLES_APPEND: &str = "Usage: iptables -A <chain> [options]";
pub const USAGE_IPTABLES_DELETE: &str = "Usage: iptables -D <chain> <rule_number>";
pub const USAGE_NMAP: &str = "Usage: nmap [-p <ports>] <target>";
pub const USAGE_PING: &str = "Usage: ping <target>";
pub const USAGE_NC: &str = "Usage: nc <target> <port>";
pub const USAGE_CURL: &str = "Usage: curl <url>";
pub const USAGE_TRACEROUTE: &str = "Usage: traceroute <target>";
pub const USAGE_NSLOOKUP: &str = "Usage: nslookup <domain>";
pub const USAGE_LOGS: &str = "Usage: logs [<count>|clear|stats]";

/// Why a line could not be turned into a [`Command`]
///
/// Every variant renders to the text shown in the terminal.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("bash: {0}: command not found\nType 'help' for available commands")]
    UnknownCommand(String),

    #[error("{0}")]
    Usage(&'static str),

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("{0}")]
    Invalid(String),

    #[error("Error: No target specified")]
    MissingTarget,

    #[error(transparent)]
    Rule(#[from] Error),
}

/// One parsed shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Ifconfig,
    SetIp(String),
    IptablesList {
        chain: Option<String>,
        verbose: bool,
    },
    IptablesAppend {
        chain: String,
        spec: RuleSpec,
    },
    IptablesDelete {
        chain: String,
        index: usize,
    },
    IptablesFlush {
        chain: Option<String>,
    },
    Ping {
        target: String,
    },
    Nmap {
        target: String,
        ports: Vec<u16>,
    },
    /// Port is kept verbatim; out-of-range values are a logged misconfiguration
    Nc {
        target: String,
        port: String,
    },
    Curl {
        url: String,
    },
    Traceroute {
        target: String,
    },
    Nslookup {
        domain: String,
    },
    Whoami,
    Clear,
    Logs {
        limit: Option<usize>,
    },
    LogsClear,
    LogsStats,
    Warnings,
    Export,
}

impl Command {
    /// Parses one terminal line.
    ///
    /// Returns `Ok(None)` for a blank line. The command word is
    /// case-insensitive; arguments are taken verbatim.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((first, args)) = parts.split_first() else {
            return Ok(None);
        };

        let name = first.to_ascii_lowercase();
        let cmd = match name.as_str() {
            "help" => Command::Help,
            "ifconfig" => parse_ifconfig(args)?,
            "iptables" => parse_iptables(args)?,
            "nmap" => parse_nmap(args)?,
            "ping" => Command::Ping {
                target: first_arg(args, USAGE_PING)?,
            },
            "nc" => match args {
                [target, port, ..] => Command::Nc {
                    target: (*target).to_string(),
                    port: (*port).to_string(),
                },
                _ => return Err(ParseError::Usage(USAGE_NC)),
            },
            "curl" => Command::Curl {
                url: first_arg(args, USAGE_CURL)?,
            },
            "traceroute" => Command::Traceroute {
                target: first_arg(args, USAGE_TRACEROUTE)?,
            },
            "nslookup" => Command::Nslookup {
                domain: first_arg(args, USAGE_NSLOOKUP)?,
            },
            "whoami" => Command::Whoami,
            "clear" => Command::Clear,
            "logs" => parse_logs(args)?,
            "warnings" => Command::Warnings,
            "export" => Command::Export,
            _ => return Err(ParseError::UnknownCommand(escape_html(&name))),
        };
        Ok(Some(cmd))
    }
}

/// Splits an optional `@terminal` prefix off a shell line.
///
/// `@dmz ping 8.8.8.8` yields `(Some(Dmz), "ping 8.8.8.8")`; a line without a
/// prefix yields `(None, line)`.
///
/// # Errors
///
/// Returns [`Error::UnknownTerminal`] if the prefix names no terminal.
pub fn split_terminal(line: &str) -> Result<(Option<Terminal>, &str), Error> {
    let trimmed = line.trim_start();
    let Some(rest) = trimmed.strip_prefix('@') else {
        return Ok((None, line));
    };
    let (name, command) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    Ok((Some(Terminal::parse(name)?), command.trim_start()))
}

fn first_arg(args: &[&str], usage: &'static str) -> Result<String, ParseError> {
    args.first()
        .map(|arg| (*arg).to_string())
        .ok_or(ParseError::Usage(usage))
}

fn parse_ifconfig(args: &[&str]) -> Result<Command, ParseError> {
    match args {
        [] => Ok(Command::Ifconfig),
        ["set", "ip", ip, ..] => Ok(Command::SetIp((*ip).to_string())),
        _ => Err(ParseError::Usage(USAGE_IFCONFIG)),
    }
}

fn parse_iptables(args: &[&str]) -> Result<Command, ParseError> {
    let Some((option, rest)) = args.split_first() else {
        return Err(ParseError::Usage(USAGE_IPTABLES));
    };

    match *option {
        "-L" => {
            let verbose = rest.contains(&"-v");
            let chain = rest
                .iter()
                .find(|arg| !arg.starts_with('-'))
                .map(|chain| (*chain).to_string());
            Ok(Command::IptablesList { chain, verbose })
        }
        "-F" => Ok(Command::IptablesFlush {
            chain: rest.first().map(|chain| (*chain).to_string()),
        }),
        "-A" => {
            let Some((chain, options)) = rest.split_first() else {
                return Err(ParseError::Usage(USAGE_IPTABLES_APPEND));
            };
            Ok(Command::IptablesAppend {
                chain: (*chain).to_string(),
                spec: parse_rule_options(options)?,
            })
        }
        "-D" => match rest {
            [chain, number, ..] => {
                let index = number
                    .parse()
                    .map_err(|_| ParseError::Invalid("Rule number must be an integer".into()))?;
                Ok(Command::IptablesDelete {
                    chain: (*chain).to_string(),
                    index,
                })
            }
            _ => Err(ParseError::Usage(USAGE_IPTABLES_DELETE)),
        },
        other => Err(ParseError::UnknownOption(escape_html(other))),
    }
}

/// Builds a [`RuleSpec`] from `-s/-d/-p/--sport/--dport/-j` pairs.
///
/// Unrecognized tokens and flags missing their value are skipped.
///
/// # Errors
///
/// Returns [`Error::Validation`] for an unknown protocol or target.
pub fn parse_rule_options(options: &[&str]) -> Result<RuleSpec, Error> {
    let mut spec = RuleSpec::default();
    let mut i = 0;

    while i < options.len() {
        let Some(value) = options.get(i + 1).copied() else {
            break;
        };
        match options[i] {
            "-s" => spec = spec.source(value),
            "-d" => spec = spec.destination(value),
            "-p" => {
                let protocol: Protocol = value.parse().map_err(|_| {
                    Error::validation(
                        "protocol",
                        format!("Invalid protocol: {} (use tcp, udp, icmp or all)", escape_html(value)),
                    )
                })?;
                spec = spec.protocol(protocol);
            }
            "--sport" => spec = spec.sport(value),
            "--dport" => spec = spec.dport(value),
            "-j" => {
                let target: Target = value.parse().map_err(|_| {
                    Error::validation(
                        "target",
                        format!(
                            "Invalid target: {} (use ACCEPT, DROP, REJECT or LOG)",
                            escape_html(value)
                        ),
                    )
                })?;
                spec = spec.target(target);
            }
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    Ok(spec)
}

fn parse_nmap(args: &[&str]) -> Result<Command, ParseError> {
    if args.is_empty() {
        return Err(ParseError::Usage(USAGE_NMAP));
    }

    let mut ports = DEFAULT_SCAN_PORTS.to_vec();
    let mut target = None;
    let mut i = 0;
    while i < args.len() {
        if args[i] == "-p"
            && let Some(spec) = args.get(i + 1)
        {
            ports = parse_port_spec(spec).map_err(ParseError::Invalid)?;
            i += 2;
        } else {
            target = Some(args[i].to_string());
            i += 1;
        }
    }

    let target = target.ok_or(ParseError::MissingTarget)?;
    Ok(Command::Nmap { target, ports })
}

fn parse_logs(args: &[&str]) -> Result<Command, ParseError> {
    match args {
        [] => Ok(Command::Logs { limit: None }),
        ["clear"] => Ok(Command::LogsClear),
        ["stats"] => Ok(Command::LogsStats),
        [count] => count
            .parse()
            .map(|limit| Command::Logs { limit: Some(limit) })
            .map_err(|_| ParseError::Usage(USAGE_LOGS)),
        _ => Err(ParseError::Usage(USAGE_LOGS)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        Command::parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_blank_line_is_nothing() {
        assert!(Command::parse("   ").unwrap().is_none());
    }

    #[test]
    fn test_command_word_is_case_insensitive() {
        assert_eq!(parse("HELP"), Command::Help);
        assert_eq!(parse("WhoAmI"), Command::Whoami);
    }

    #[test]
    fn test_unknown_command_message() {
        let err = Command::parse("telnet 10.0.0.1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "bash: telnet: command not found\nType 'help' for available commands"
        );
    }

    #[test]
    fn test_ifconfig_forms() {
        assert_eq!(parse("ifconfig"), Command::Ifconfig);
        assert_eq!(
            parse("ifconfig set ip 192.168.10.10"),
            Command::SetIp("192.168.10.10".into())
        );
        assert!(matches!(
            Command::parse("ifconfig eth0 up"),
            Err(ParseError::Usage(USAGE_IFCONFIG))
        ));
    }

    #[test]
    fn test_append_with_all_options() {
        let cmd = parse("iptables -A FORWARD -s 192.168.10.0/24 -d 192.168.30.10 -p TCP --sport 1024 --dport 80 -j accept");
        assert_eq!(
            cmd,
            Command::IptablesAppend {
                chain: "FORWARD".into(),
                spec: RuleSpec::default()
                    .source("192.168.10.0/24")
                    .destination("192.168.30.10")
                    .protocol(Protocol::Tcp)
                    .sport("1024")
                    .dport("80")
                    .target(Target::Accept),
            }
        );
    }

    #[test]
    fn test_append_skips_unknown_tokens() {
        let spec = parse_rule_options(&["-m", "state", "-p", "udp", "--dport"]).unwrap();
        assert_eq!(spec, RuleSpec::default().protocol(Protocol::Udp));
    }

    #[test]
    fn test_append_rejects_bad_protocol_and_target() {
        let err = parse_rule_options(&["-p", "sctp"]).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "protocol"));

        let err = Command::parse("iptables -A INPUT -j BOUNCE").unwrap_err();
        assert!(matches!(err, ParseError::Rule(Error::Validation { .. })));
    }

    #[test]
    fn test_iptables_list_and_flush() {
        assert_eq!(
            parse("iptables -L -v"),
            Command::IptablesList {
                chain: None,
                verbose: true
            }
        );
        assert_eq!(
            parse("iptables -L INPUT"),
            Command::IptablesList {
                chain: Some("INPUT".into()),
                verbose: false
            }
        );
        assert_eq!(parse("iptables -F"), Command::IptablesFlush { chain: None });
        assert_eq!(
            parse("iptables -F OUTPUT"),
            Command::IptablesFlush {
                chain: Some("OUTPUT".into())
            }
        );
    }

    #[test]
    fn test_iptables_delete() {
        assert_eq!(
            parse("iptables -D INPUT 2"),
            Command::IptablesDelete {
                chain: "INPUT".into(),
                index: 2
            }
        );
        assert_eq!(
            Command::parse("iptables -D INPUT two").unwrap_err().to_string(),
            "Rule number must be an integer"
        );
        assert!(matches!(
            Command::parse("iptables -D INPUT"),
            Err(ParseError::Usage(USAGE_IPTABLES_DELETE))
        ));
    }

    #[test]
    fn test_iptables_unknown_option() {
        assert_eq!(
            Command::parse("iptables -X").unwrap_err().to_string(),
            "Unknown option: -X"
        );
    }

    #[test]
    fn test_nmap_ports() {
        assert_eq!(
            parse("nmap 192.168.30.10"),
            Command::Nmap {
                target: "192.168.30.10".into(),
                ports: DEFAULT_SCAN_PORTS.to_vec()
            }
        );
        assert_eq!(
            parse("nmap -p 20-22 192.168.30.10"),
            Command::Nmap {
                target: "192.168.30.10".into(),
                ports: vec![20, 21, 22]
            }
        );
        assert!(matches!(
            Command::parse("nmap -p 80"),
            Err(ParseError::MissingTarget)
        ));
        assert!(matches!(
            Command::parse("nmap -p 90-80 10.0.0.1"),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn test_tools_require_arguments() {
        assert!(matches!(
            Command::parse("ping"),
            Err(ParseError::Usage(USAGE_PING))
        ));
        assert!(matches!(
            Command::parse("nc 10.0.0.1"),
            Err(ParseError::Usage(USAGE_NC))
        ));
        assert_eq!(
            parse("nc 10.0.0.1 99999"),
            Command::Nc {
                target: "10.0.0.1".into(),
                port: "99999".into()
            }
        );
    }

    #[test]
    fn test_logs_subcommands() {
        assert_eq!(parse("logs"), Command::Logs { limit: None });
        assert_eq!(parse("logs 20"), Command::Logs { limit: Some(20) });
        assert_eq!(parse("logs clear"), Command::LogsClear);
        assert_eq!(parse("logs stats"), Command::LogsStats);
        assert!(Command::parse("logs many").is_err());
    }

    #[test]
    fn test_split_terminal_prefix() {
        assert_eq!(split_terminal("ping x").unwrap(), (None, "ping x"));
        assert_eq!(
            split_terminal("@DMZ  nc 10.0.0.1 80").unwrap(),
            (Some(Terminal::Dmz), "nc 10.0.0.1 80")
        );
        assert_eq!(
            split_terminal("@outsider").unwrap(),
            (Some(Terminal::Outsider), "")
        );
        assert!(matches!(
            split_terminal("@router ping x"),
            Err(Error::UnknownTerminal(_))
        ));
    }
}
