//! Bounded event log of filtering decisions and administrative actions
//!
//! Every verdict the rule engine reaches is recorded here, along with
//! administrative events such as clearing the log. Entries are sanitized for
//! display on the way in, checked against a couple of misconfiguration
//! heuristics, and pushed to the session's observer as soon as they are final.
//!
//! # Limits
//!
//! The log keeps at most [`MAX_LOGS`] entries (configurable per session);
//! older entries are evicted first.

use super::conflicts;
use super::events::{Notification, Notifier};
use super::firewall::{Packet, RuleChainEngine, Target};
use crate::validators::escape_html;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default capacity of a session's event log
pub const MAX_LOGS: usize = 1000;

/// Placeholder used for fields that do not apply to administrative entries
pub const NOT_APPLICABLE: &str = "N/A";

/// Highest valid TCP/UDP port
const MAX_PORT: u64 = 65_535;

/// What happened to the traffic (or the administrative action)
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogAction {
    Accept,
    Drop,
    Reject,
    Log,
    Info,
}

impl From<Target> for LogAction {
    fn from(target: Target) -> Self {
        match target {
            Target::Accept => LogAction::Accept,
            Target::Drop => LogAction::Drop,
            Target::Reject => LogAction::Reject,
            Target::Log => LogAction::Log,
        }
    }
}

/// Display category of an entry
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogCategory {
    #[default]
    Normal,
    Warning,
    Info,
}

/// A finalized, display-safe log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub action: LogAction,
    pub source: String,
    pub destination: String,
    pub protocol: String,
    pub port: Option<String>,
    /// Provenance of the entry, e.g. `FORWARD rule 2` or `Default policy`
    pub rule: String,
    pub category: LogCategory,
    pub warning: Option<String>,
    pub details: String,
}

/// Raw input to [`EventLog::append`], not yet sanitized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub action: LogAction,
    pub source: String,
    pub destination: String,
    pub protocol: String,
    pub port: Option<String>,
    pub rule: String,
    pub category: LogCategory,
}

impl LogRecord {
    pub fn new(
        action: LogAction,
        source: impl Into<String>,
        destination: impl Into<String>,
        protocol: impl Into<String>,
        port: Option<String>,
        rule: impl Into<String>,
    ) -> Self {
        Self {
            action,
            source: source.into(),
            destination: destination.into(),
            protocol: protocol.into(),
            port,
            rule: rule.into(),
            category: LogCategory::Normal,
        }
    }

    /// Record describing a verdict on a simulated packet
    pub fn for_packet(action: LogAction, packet: &Packet, rule: impl Into<String>) -> Self {
        Self::new(
            action,
            packet.source.as_str(),
            packet.destination.as_str(),
            packet.protocol.as_str(),
            packet.port.clone(),
            rule,
        )
    }

    /// Administrative record with no traffic attached
    pub fn info(rule: impl Into<String>) -> Self {
        Self::new(
            LogAction::Info,
            NOT_APPLICABLE,
            NOT_APPLICABLE,
            NOT_APPLICABLE,
            None,
            rule,
        )
        .with_category(LogCategory::Info)
    }

    pub fn with_category(mut self, category: LogCategory) -> Self {
        self.category = category;
        self
    }
}

/// Aggregate counts over the log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LogStats {
    pub total: usize,
    pub blocked: usize,
    pub allowed: usize,
    pub warnings: usize,
}

/// Returns true for a numeric port that cannot exist.
///
/// An explicit `+` sign is accepted. Non-numeric ports are not judged here.
fn port_out_of_range(port: &str) -> bool {
    let digits = port.strip_prefix('+').unwrap_or(port);
    !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
        && digits.parse::<u64>().map_or(true, |p| p > MAX_PORT)
}

/// Detects obviously broken traffic descriptions on blocked packets
fn detect_misconfiguration(
    source: &str,
    destination: &str,
    port: Option<&str>,
) -> Option<&'static str> {
    if source == destination {
        Some("MISCONFIGURATION: Source and destination are the same")
    } else if port.is_some_and(port_out_of_range) {
        Some("MISCONFIGURATION: Invalid port number")
    } else {
        None
    }
}

/// Bounded, append-only log for one session
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    notifier: Notifier,
}

impl EventLog {
    /// Creates an empty log holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize, notifier: Notifier) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(MAX_LOGS)),
            capacity,
            notifier,
        }
    }

    /// A [`MAX_LOGS`]-sized log without an observer
    pub fn detached() -> Self {
        Self::new(MAX_LOGS, Notifier::detached())
    }

    /// Sanitizes, classifies and stores a record, then notifies the observer.
    pub fn append(&mut self, record: LogRecord) -> &LogEntry {
        let source = escape_html(&record.source);
        let destination = escape_html(&record.destination);
        let protocol = escape_html(&record.protocol);
        let port = record.port.as_deref().map(escape_html);
        let rule = escape_html(&record.rule);

        let mut category = record.category;
        let mut warning = None;
        if matches!(record.action, LogAction::Drop | LogAction::Reject)
            && category == LogCategory::Normal
            && let Some(message) = detect_misconfiguration(&source, &destination, port.as_deref())
        {
            tracing::warn!(
                source = %source,
                destination = %destination,
                rule = %rule,
                "{message}"
            );
            category = LogCategory::Warning;
            warning = Some(escape_html(message));
        }

        let details = match &port {
            Some(port) => format!(
                "{} traffic from {source} to {destination} ({protocol}:{port})",
                record.action
            ),
            None => format!(
                "{} traffic from {source} to {destination} ({protocol})",
                record.action
            ),
        };

        let entry = LogEntry {
            timestamp: chrono::Utc::now(),
            action: record.action,
            source,
            destination,
            protocol,
            port,
            rule,
            category,
            warning,
            details,
        };

        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }

        let entry = self
            .entries
            .back()
            .unwrap_or_else(|| unreachable!("entry was just pushed"));
        self.notifier.send(&Notification::LogAppended(entry.clone()));
        entry
    }

    /// Empties the log, zeroes every rule counter and records the action.
    pub fn clear(&mut self, engine: &mut RuleChainEngine) {
        self.entries.clear();
        engine.reset_counters();
        tracing::info!(session = %self.notifier.session(), "logs and counters cleared");
        self.append(LogRecord::info("Logs and statistics cleared"));
    }

    /// Counts verdicts and warnings, including live rule conflicts.
    pub fn stats(&self, engine: &RuleChainEngine) -> LogStats {
        let mut stats = LogStats {
            total: self.entries.len(),
            ..LogStats::default()
        };
        for entry in &self.entries {
            match entry.action {
                LogAction::Drop | LogAction::Reject => stats.blocked += 1,
                LogAction::Accept => stats.allowed += 1,
                LogAction::Log | LogAction::Info => {}
            }
            if entry.category == LogCategory::Warning {
                stats.warnings += 1;
            }
        }
        stats.warnings += conflicts::analyze(engine).len();
        stats
    }

    /// All entries, oldest first
    pub fn entries(&self) -> impl ExactSizeIterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// The newest `count` entries, oldest first
    pub fn recent(&self, count: usize) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .iter()
            .skip(self.entries.len().saturating_sub(count))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{Protocol, RuleSpec};
    use crate::core::test_helpers::{RecordingObserver, packet};

    fn drop_record(src: &str, dst: &str, port: Option<&str>) -> LogRecord {
        LogRecord::new(
            LogAction::Drop,
            src,
            dst,
            "tcp",
            port.map(String::from),
            "FORWARD rule 1",
        )
    }

    #[test]
    fn test_append_sanitizes_fields() {
        let mut log = EventLog::detached();
        let entry = log.append(drop_record("10.0.0.1", "<script>", Some("80")));
        assert_eq!(entry.destination, "&lt;script&gt;");
        assert_eq!(
            entry.details,
            "DROP traffic from 10.0.0.1 to &lt;script&gt; (tcp:80)"
        );
        assert_eq!(entry.category, LogCategory::Normal);
        assert!(entry.warning.is_none());
    }

    #[test]
    fn test_details_without_port() {
        let mut log = EventLog::detached();
        let entry = log.append(LogRecord::new(
            LogAction::Accept,
            "10.0.0.1",
            "10.0.0.2",
            "icmp",
            None,
            "FORWARD rule 1",
        ));
        assert_eq!(entry.details, "ACCEPT traffic from 10.0.0.1 to 10.0.0.2 (icmp)");
    }

    #[test]
    fn test_same_source_and_destination_is_flagged() {
        let mut log = EventLog::detached();
        let entry = log.append(drop_record("10.0.0.1", "10.0.0.1", Some("22")));
        assert_eq!(entry.category, LogCategory::Warning);
        assert_eq!(
            entry.warning.as_deref(),
            Some("MISCONFIGURATION: Source and destination are the same")
        );
    }

    #[test]
    fn test_port_above_range_is_flagged() {
        let mut log = EventLog::detached();
        let entry = log.append(drop_record("10.0.0.1", "10.0.0.2", Some("70000")));
        assert_eq!(entry.category, LogCategory::Warning);
        assert_eq!(
            entry.warning.as_deref(),
            Some("MISCONFIGURATION: Invalid port number")
        );

        // Non-numeric ports are left alone
        let entry = log.append(drop_record("10.0.0.1", "10.0.0.2", Some("http")));
        assert_eq!(entry.category, LogCategory::Normal);
    }

    #[test]
    fn test_signed_port_above_range_is_flagged() {
        let mut log = EventLog::detached();
        let entry = log.append(drop_record("10.0.0.1", "10.0.0.2", Some("+70000")));
        assert_eq!(entry.category, LogCategory::Warning);

        let entry = log.append(drop_record("10.0.0.1", "10.0.0.2", Some("+8080")));
        assert_eq!(entry.category, LogCategory::Normal);
        let entry = log.append(drop_record("10.0.0.1", "10.0.0.2", Some("+")));
        assert_eq!(entry.category, LogCategory::Normal);
    }

    #[test]
    fn test_accepted_traffic_is_never_flagged() {
        let mut log = EventLog::detached();
        let entry = log.append(LogRecord::new(
            LogAction::Accept,
            "10.0.0.1",
            "10.0.0.1",
            "tcp",
            Some("99999".to_string()),
            "INPUT rule 1",
        ));
        assert_eq!(entry.category, LogCategory::Normal);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut log = EventLog::new(5, Notifier::detached());
        for i in 0..8 {
            log.append(drop_record(&format!("10.0.0.{i}"), "10.0.1.1", None));
        }
        assert_eq!(log.len(), 5);
        let sources: Vec<_> = log.entries().map(|e| e.source.as_str()).collect();
        assert_eq!(
            sources,
            ["10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6", "10.0.0.7"]
        );
    }

    #[test]
    fn test_recent_returns_newest_in_order() {
        let mut log = EventLog::detached();
        for i in 0..4 {
            log.append(drop_record(&format!("10.0.0.{i}"), "10.0.1.1", None));
        }
        let recent: Vec<_> = log.recent(2).map(|e| e.source.as_str()).collect();
        assert_eq!(recent, ["10.0.0.2", "10.0.0.3"]);
        assert_eq!(log.recent(10).count(), 4);
    }

    #[test]
    fn test_observer_notified_once_per_append() {
        let (observer, notifier) = RecordingObserver::attached();
        let mut log = EventLog::new(2, notifier);
        for i in 0..3 {
            log.append(drop_record(&format!("10.0.0.{i}"), "10.0.1.1", None));
        }
        let seen = observer.log_entries();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].source, "10.0.0.2");
    }

    #[test]
    fn test_clear_resets_counters_and_leaves_info_entry() {
        let mut engine = RuleChainEngine::deterministic(100);
        let mut log = EventLog::detached();
        engine
            .append_rule("INPUT", RuleSpec::default().target(Target::Accept))
            .unwrap();
        engine.evaluate(
            "INPUT".parse().unwrap(),
            &packet("10.0.0.1", "10.0.0.2", Protocol::Tcp, Some("22")),
            &mut log,
        );
        assert_eq!(engine.counters("INPUT".parse().unwrap())[0].packets, 1);

        log.clear(&mut engine);

        assert_eq!(log.len(), 1);
        let entry = log.entries().next().unwrap();
        assert_eq!(entry.action, LogAction::Info);
        assert_eq!(entry.category, LogCategory::Info);
        assert_eq!(entry.source, NOT_APPLICABLE);
        assert_eq!(entry.rule, "Logs and statistics cleared");
        let counter = engine.counters("INPUT".parse().unwrap())[0];
        assert_eq!((counter.packets, counter.bytes), (0, 0));
    }

    #[test]
    fn test_stats_counts_actions_and_conflicts() {
        let mut engine = RuleChainEngine::deterministic(64);
        engine
            .append_rule("FORWARD", RuleSpec::default().dport("80").target(Target::Accept))
            .unwrap();
        engine
            .append_rule("FORWARD", RuleSpec::default().dport("80").target(Target::Drop))
            .unwrap();

        let mut log = EventLog::detached();
        log.append(drop_record("10.0.0.1", "10.0.0.2", None));
        log.append(drop_record("10.0.0.1", "10.0.0.1", None));
        log.append(LogRecord::new(
            LogAction::Accept,
            "10.0.0.1",
            "10.0.0.2",
            "tcp",
            None,
            "FORWARD rule 1",
        ));
        log.append(LogRecord::info("note"));

        let stats = log.stats(&engine);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.blocked, 2);
        assert_eq!(stats.allowed, 1);
        // one misconfiguration entry + one CONFLICT warning
        assert_eq!(stats.warnings, 2);
    }
}
