//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::core::event_log::LogEntry;
use crate::core::events::{Notification, Notifier, Observer};
use crate::core::firewall::{Packet, Protocol};
use crate::core::session::{PayloadSource, SessionId, SessionSettings};
use std::sync::{Arc, Mutex};

/// Observer that remembers everything it was told
#[derive(Debug, Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<(SessionId, Notification)>>,
}

impl RecordingObserver {
    /// Creates an observer together with a notifier bound to it.
    pub fn attached() -> (Arc<Self>, Notifier) {
        let observer = Arc::new(Self::default());
        let notifier = Notifier::new(SessionId::new(), observer.clone());
        (observer, notifier)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Only the entries delivered through `LogAppended`
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::LogAppended(entry) => Some(entry),
                _ => None,
            })
            .collect()
    }
}

impl Observer for RecordingObserver {
    fn notify(&self, session: SessionId, notification: &Notification) {
        self.seen
            .lock()
            .unwrap()
            .push((session, notification.clone()));
    }
}

pub fn packet(src: &str, dst: &str, protocol: Protocol, port: Option<&str>) -> Packet {
    Packet::new(src, dst, protocol, port)
}

/// Default settings with a fixed 100-byte payload
pub fn deterministic_settings() -> SessionSettings {
    SessionSettings {
        payload: PayloadSource::Fixed(100),
        ..SessionSettings::default()
    }
}
