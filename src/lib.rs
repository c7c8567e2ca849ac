//! fwsim - Firewall Simulator
//!
//! A packet-filtering firewall simulator for learning iptables. Every client
//! gets an isolated session with four simulated terminals, three rule chains
//! and an event log; shell-like commands configure the network, edit rules and
//! send simulated traffic through the FORWARD chain.
//!
//! # Architecture
//!
//! - [`core`] - Rule evaluation, conflict analysis, event log, sessions
//! - [`command`] - Typed command grammar parsed from terminal lines
//! - [`dispatcher`] - Runs commands against a session and renders output
//! - [`validators`] - Address/port validation and display sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories)
//!
//! # Example
//!
//! ```
//! use fwsim::core::event_log::EventLog;
//! use fwsim::core::firewall::{ChainName, Packet, Protocol, RuleChainEngine, RuleSpec, Target};
//!
//! let mut engine = RuleChainEngine::new();
//! let mut log = EventLog::detached();
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
//! let verdict = engine.evaluate(
//!     ChainName::Forward,
//!     &Packet::new("192.168.10.10", "192.168.30.10", Protocol::Tcp, Some("80")),
//!     &mut log,
//! );
//! assert!(verdict.allowed);
//! assert_eq!(verdict.provenance, "ACCEPT by FORWARD rule 1");
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod command;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{ChainName, Protocol, Rule, RuleSpec, Target};
pub use core::session::{Session, SessionStore};
