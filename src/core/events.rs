//! Notifications pushed from a session to its client
//!
//! The core never talks to a transport directly. Sessions hold a [`Notifier`]
//! that forwards [`Notification`]s to whatever [`Observer`] the embedding
//! application installed: a channel feeding a terminal, a websocket, or
//! nothing at all.

use super::event_log::LogEntry;
use super::network::Terminal;
use super::session::SessionId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events a session emits towards its client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A finalized entry was appended to the event log
    LogAppended(LogEntry),
    /// A terminal's address changed
    ConfigChanged {
        terminal: Terminal,
        ip: String,
        network: String,
    },
    /// A fresh session was activated
    SessionInitialized { idle_lifetime_secs: u64 },
}

/// Receives notifications from every session
///
/// Called synchronously from inside session operations, so implementations
/// must not block.
pub trait Observer: Send + Sync {
    fn notify(&self, session: SessionId, notification: &Notification);
}

/// Discards every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn notify(&self, _session: SessionId, _notification: &Notification) {}
}

/// Forwards notifications into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<(SessionId, Notification)>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(SessionId, Notification)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn notify(&self, session: SessionId, notification: &Notification) {
        // Receiver gone means the client disconnected; nothing left to deliver to
        if self.tx.send((session, notification.clone())).is_err() {
            tracing::debug!(%session, "notification channel closed");
        }
    }
}

/// Session-scoped handle onto an [`Observer`]
#[derive(Clone)]
pub struct Notifier {
    session: SessionId,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(session: SessionId, observer: Arc<dyn Observer>) -> Self {
        Self { session, observer }
    }

    /// A notifier that goes nowhere, for standalone engines and tests
    pub fn detached() -> Self {
        Self::new(SessionId::new(), Arc::new(NullObserver))
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn send(&self, notification: &Notification) {
        self.observer.notify(self.session, notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_observer_delivers_in_order() {
        let (observer, mut rx) = ChannelObserver::new();
        let notifier = Notifier::new(SessionId::new(), Arc::new(observer));

        notifier.send(&Notification::SessionInitialized {
            idle_lifetime_secs: 2700,
        });
        notifier.send(&Notification::ConfigChanged {
            terminal: Terminal::Dmz,
            ip: "192.168.30.10".to_string(),
            network: "192.168.30.0/24".to_string(),
        });

        let (session, first) = rx.try_recv().unwrap();
        assert_eq!(session, notifier.session());
        assert!(matches!(first, Notification::SessionInitialized { .. }));
        let (_, second) = rx.try_recv().unwrap();
        assert!(matches!(second, Notification::ConfigChanged { .. }));
    }

    #[test]
    fn test_channel_observer_survives_closed_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.notify(
            SessionId::new(),
            &Notification::SessionInitialized {
                idle_lifetime_secs: 1,
            },
        );
    }

    #[test]
    fn test_notification_serialization_is_tagged() {
        let json = serde_json::to_value(Notification::SessionInitialized {
            idle_lifetime_secs: 2700,
        })
        .unwrap();
        assert_eq!(json["event"], "session_initialized");
        assert_eq!(json["idle_lifetime_secs"], 2700);
    }
}
