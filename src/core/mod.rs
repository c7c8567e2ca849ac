//! Simulated firewall core
//!
//! Everything that decides traffic and records what happened lives here. The
//! command grammar and the dispatcher sit on top and only call into these
//! modules.
//!
//! - [`network`]: per-terminal addressing and /24 derivation
//! - [`firewall`]: rule chains, counters and first-match evaluation
//! - [`conflicts`]: static CONFLICT/UNREACHABLE analysis
//! - [`event_log`]: bounded decision log with misconfiguration detection
//! - [`events`]: notifications and the observer seam
//! - [`session`]: per-client state, idle expiry and the session store
//! - [`error`]: error taxonomy

pub mod conflicts;
pub mod error;
pub mod event_log;
pub mod events;
pub mod firewall;
pub mod network;
pub mod session;

#[cfg(test)]
pub mod test_helpers;
