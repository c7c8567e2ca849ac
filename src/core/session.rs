//! Isolated simulator sessions and their idle-expiry lifecycle
//!
//! A [`Session`] bundles everything one client can change: terminal
//! addressing, the three rule chains and the event log. Sessions never share
//! state. The [`SessionStore`] maps client keys to sessions and wraps each one
//! in its own async mutex, so a session runs one command at a time while other
//! sessions proceed independently.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --first interaction--> Active --idle timeout--> Expired
//! ```
//!
//! `Expired` is terminal. The next interaction from the same client gets a
//! brand-new session. Expiry is only decided between commands: when a session
//! is acquired, and by the sweeper, which skips sessions that are busy.

use super::conflicts::{self, ConflictWarning};
use super::error::Result;
use super::event_log::{EventLog, LogEntry, LogRecord, LogStats, MAX_LOGS};
use super::events::{Notification, Notifier, Observer};
use super::firewall::{
    ChainName, FixedPayload, Packet, PayloadSizer, RandomPayload, Rule, RuleChainEngine,
    RuleListing, RuleSpec, Verdict,
};
use super::network::{ConfigChange, NetworkConfig, NetworkConfigStore, Terminal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Idle lifetime of a session (45 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Unique identifier of one session incarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Uninitialized,
    Active,
    Expired,
}

/// How byte counters grow per matched packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Random { min: u64, max: u64 },
    Fixed(u64),
}

impl PayloadSource {
    fn build(self) -> Box<dyn PayloadSizer> {
        match self {
            PayloadSource::Random { min, max } => Box::new(RandomPayload { min, max }),
            PayloadSource::Fixed(bytes) => Box::new(FixedPayload(bytes)),
        }
    }
}

/// Parameters applied to every new session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub max_logs: usize,
    pub payload: PayloadSource,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_logs: MAX_LOGS,
            payload: PayloadSource::Random { min: 40, max: 1500 },
        }
    }
}

impl From<&crate::config::SimulatorConfig> for SessionSettings {
    fn from(config: &crate::config::SimulatorConfig) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_logs: config.max_logs,
            payload: PayloadSource::Random {
                min: config.payload_min_bytes,
                max: config.payload_max_bytes,
            },
        }
    }
}

/// All simulator state belonging to one client
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    idle_timeout: Duration,
    last_activity: Instant,
    network: NetworkConfigStore,
    engine: RuleChainEngine,
    log: EventLog,
    notifier: Notifier,
}

impl Session {
    pub fn new(settings: &SessionSettings, observer: Arc<dyn Observer>) -> Self {
        let id = SessionId::new();
        let notifier = Notifier::new(id, observer);
        Self {
            id,
            state: SessionState::Uninitialized,
            idle_timeout: settings.idle_timeout,
            last_activity: Instant::now(),
            network: NetworkConfigStore::new(),
            engine: RuleChainEngine::with_payload(settings.payload.build()),
            log: EventLog::new(settings.max_logs, notifier.clone()),
            notifier,
        }
    }

    /// Moves an uninitialized session to `Active` and announces its lifetime.
    pub fn activate(&mut self) {
        if self.state != SessionState::Uninitialized {
            return;
        }
        self.state = SessionState::Active;
        self.last_activity = Instant::now();
        info!(session = %self.id, "session initialized");
        self.notifier.send(&Notification::SessionInitialized {
            idle_lifetime_secs: self.idle_timeout.as_secs(),
        });
    }

    /// Resets the idle timer
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle_expired(&self, now: Instant) -> bool {
        self.state == SessionState::Active
            && now.saturating_duration_since(self.last_activity) >= self.idle_timeout
    }

    /// Terminal transition: drops all rules, addressing and log entries.
    pub fn expire(&mut self) {
        if self.state == SessionState::Expired {
            return;
        }
        self.state = SessionState::Expired;
        self.network = NetworkConfigStore::new();
        self.log = EventLog::new(self.log.capacity(), self.notifier.clone());
        self.engine.clear_all();
        info!(session = %self.id, "session expired");
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn network(&self) -> &NetworkConfigStore {
        &self.network
    }

    pub fn engine(&self) -> &RuleChainEngine {
        &self.engine
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Assigns an address and notifies the client of the new network.
    ///
    /// # Errors
    ///
    /// See [`NetworkConfigStore::set_ip`].
    pub fn set_ip(&mut self, terminal: Terminal, literal: &str) -> Result<ConfigChange> {
        let change = self.network.set_ip(terminal, literal)?;
        self.notifier.send(&Notification::ConfigChanged {
            terminal,
            ip: change.ip.clone(),
            network: change.network.clone(),
        });
        Ok(change)
    }

    /// # Errors
    ///
    /// See [`NetworkConfigStore::get_config`].
    pub fn get_config(&self, terminal: &str) -> Result<NetworkConfig> {
        self.network.get_config(terminal)
    }

    /// # Errors
    ///
    /// See [`RuleChainEngine::append_rule`].
    pub fn append_rule(&mut self, chain: &str, spec: RuleSpec) -> Result<usize> {
        self.engine.append_rule(chain, spec)
    }

    /// # Errors
    ///
    /// See [`RuleChainEngine::delete_rule`].
    pub fn delete_rule(&mut self, chain: &str, index: usize) -> Result<Rule> {
        self.engine.delete_rule(chain, index)
    }

    /// # Errors
    ///
    /// See [`RuleChainEngine::flush`].
    pub fn flush(&mut self, chain: Option<&str>) -> Result<()> {
        self.engine.flush(chain)
    }

    /// # Errors
    ///
    /// See [`RuleChainEngine::list_rules`].
    pub fn list_rules(&self, chain: Option<&str>, verbose: bool) -> Result<RuleListing> {
        self.engine.list_rules(chain, verbose)
    }

    pub fn evaluate(&mut self, chain: ChainName, packet: &Packet) -> Verdict {
        self.engine.evaluate(chain, packet, &mut self.log)
    }

    pub fn analyze(&self) -> Vec<ConflictWarning> {
        conflicts::analyze(&self.engine)
    }

    /// Records a free-form entry (tool notes, INFO lines) in the session log.
    pub fn append_log(&mut self, record: LogRecord) -> LogEntry {
        self.log.append(record).clone()
    }

    pub fn clear_logs(&mut self) {
        self.log.clear(&mut self.engine);
    }

    pub fn stats(&self) -> LogStats {
        self.log.stats(&self.engine)
    }

    pub fn export(&self) -> String {
        self.engine.export()
    }
}

/// Exclusive access to one session for the duration of a command
pub type SessionGuard = OwnedMutexGuard<Session>;

type SessionSlot = Arc<Mutex<Session>>;

/// Concurrent map from client key to that client's session
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionSlot>>,
    settings: SessionSettings,
    observer: Arc<dyn Observer>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(settings: SessionSettings, observer: Arc<dyn Observer>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            observer,
        }
    }

    async fn slot(&self, client: &str) -> SessionSlot {
        if let Some(slot) = self.sessions.read().await.get(client) {
            return Arc::clone(slot);
        }

        let mut sessions = self.sessions.write().await;
        let slot = sessions.entry(client.to_string()).or_insert_with(|| {
            debug!(client, "allocating session");
            Arc::new(Mutex::new(Session::new(
                &self.settings,
                Arc::clone(&self.observer),
            )))
        });
        Arc::clone(slot)
    }

    /// Returns the client's active session, creating or replacing it as needed.
    ///
    /// Waits while another command of the same client is running. Resets the
    /// idle timer.
    pub async fn acquire(&self, client: &str) -> SessionGuard {
        loop {
            let mut session = self.slot(client).await.lock_owned().await;

            match session.state() {
                // The sweeper removed this slot while we waited for the lock
                SessionState::Expired => continue,
                SessionState::Active if session.is_idle_expired(Instant::now()) => {
                    session.expire();
                    *session = Session::new(&self.settings, Arc::clone(&self.observer));
                }
                _ => {}
            }

            session.activate();
            session.touch();
            return session;
        }
    }

    /// Drops every idle-expired session that has no command in flight.
    ///
    /// Returns the number of sessions removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();

        sessions.retain(|client, slot| {
            let Ok(mut session) = slot.try_lock() else {
                return true;
            };
            if session.is_idle_expired(now) {
                debug!(client = %client, session = %session.id(), "purging idle session");
                session.expire();
                false
            } else {
                true
            }
        });

        before - sessions.len()
    }

    /// Number of sessions currently held (any state)
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Runs [`purge_expired`](Self::purge_expired) every `every` until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let purged = store.purge_expired().await;
                if purged > 0 {
                    info!(purged, "expired sessions purged");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_log::{LogAction, LogCategory};
    use crate::core::firewall::{Protocol, Target};
    use crate::core::test_helpers::{RecordingObserver, deterministic_settings, packet};

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_activates_and_notifies() {
        let observer = Arc::new(RecordingObserver::default());
        let store = SessionStore::new(deterministic_settings(), observer.clone());

        let session = store.acquire("alice").await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(
            observer.notifications(),
            [Notification::SessionInitialized {
                idle_lifetime_secs: 2700
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_isolated() {
        let store = SessionStore::new(deterministic_settings(), Arc::new(RecordingObserver::default()));

        {
            let mut alice = store.acquire("alice").await;
            alice.set_ip(Terminal::Insider, "192.168.10.10").unwrap();
            alice
                .append_rule("FORWARD", RuleSpec::default().target(Target::Accept))
                .unwrap();
        }

        let bob = store.acquire("bob").await;
        assert!(bob.network().source_ip(Terminal::Insider).is_none());
        assert!(bob.engine().rules(ChainName::Forward).is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_replaced_on_next_interaction() {
        let observer = Arc::new(RecordingObserver::default());
        let store = SessionStore::new(deterministic_settings(), observer.clone());

        let first_id = {
            let mut session = store.acquire("alice").await;
            session
                .append_rule("INPUT", RuleSpec::default().target(Target::Accept))
                .unwrap();
            session.id()
        };

        tokio::time::advance(DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1)).await;

        let session = store.acquire("alice").await;
        assert_ne!(session.id(), first_id);
        assert!(session.engine().rules(ChainName::Input).is_empty());
        let inits = observer
            .notifications()
            .into_iter()
            .filter(|n| matches!(n, Notification::SessionInitialized { .. }))
            .count();
        assert_eq!(inits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interaction_resets_idle_timer() {
        let store = SessionStore::new(deterministic_settings(), Arc::new(RecordingObserver::default()));
        let id = store.acquire("alice").await.id();

        for _ in 0..3 {
            tokio::time::advance(DEFAULT_IDLE_TIMEOUT - Duration::from_secs(60)).await;
            assert_eq!(store.acquire("alice").await.id(), id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_skips_busy_sessions() {
        let store = SessionStore::new(deterministic_settings(), Arc::new(RecordingObserver::default()));
        drop(store.acquire("idle").await);
        let busy = store.acquire("busy").await;

        tokio::time::advance(DEFAULT_IDLE_TIMEOUT * 2).await;

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
        drop(busy);

        assert_eq!(store.purge_expired().await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purged_client_gets_fresh_session() {
        let store = SessionStore::new(deterministic_settings(), Arc::new(RecordingObserver::default()));
        let old = store.acquire("alice").await.id();
        tokio::time::advance(DEFAULT_IDLE_TIMEOUT).await;
        store.purge_expired().await;

        let session = store.acquire("alice").await;
        assert_ne!(session.id(), old);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_expire_discards_state() {
        let mut session = Session::new(
            &deterministic_settings(),
            Arc::new(RecordingObserver::default()),
        );
        session.activate();
        session.set_ip(Terminal::Dmz, "192.168.30.10").unwrap();
        session
            .append_rule("FORWARD", RuleSpec::default().target(Target::Accept))
            .unwrap();
        session.evaluate(
            ChainName::Forward,
            &packet("192.168.30.10", "8.8.8.8", Protocol::Tcp, Some("80")),
        );

        session.expire();

        assert_eq!(session.state(), SessionState::Expired);
        assert!(session.log().is_empty());
        assert!(session.network().source_ip(Terminal::Dmz).is_none());
        assert!(session.engine().rules(ChainName::Forward).is_empty());
    }

    #[test]
    fn test_append_log_records_and_notifies() {
        let observer = Arc::new(RecordingObserver::default());
        let mut session = Session::new(&deterministic_settings(), observer.clone());

        let entry = session.append_log(LogRecord::new(
            LogAction::Drop,
            "10.0.0.5",
            "10.0.0.5",
            "tcp",
            Some("<22>".to_string()),
            "INPUT rule 1",
        ));

        assert_eq!(entry.port.as_deref(), Some("&lt;22&gt;"));
        assert_eq!(entry.category, LogCategory::Warning);
        assert_eq!(session.log().len(), 1);
        assert_eq!(session.stats().blocked, 1);
        assert_eq!(observer.log_entries(), [entry]);
    }

    #[test]
    fn test_set_ip_notifies_config_change() {
        let observer = Arc::new(RecordingObserver::default());
        let mut session = Session::new(&deterministic_settings(), observer.clone());
        session.set_ip(Terminal::Outsider, "203.0.113.7").unwrap();
        assert!(session.set_ip(Terminal::Outsider, "nope").is_err());

        assert_eq!(
            observer.notifications(),
            [Notification::ConfigChanged {
                terminal: Terminal::Outsider,
                ip: "203.0.113.7".to_string(),
                network: "203.0.113.0/24".to_string(),
            }]
        );
    }
}
