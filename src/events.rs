//! Outbound notifications for UI-side collaborators
//!
//! Fire-and-forget: events go out over a broadcast channel, status
//! messages are also kept in a bounded history for late subscribers.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::types::{MessageClass, TunnelState};

/// Status messages kept for late subscribers
pub const STATUS_HISTORY_LIMIT: usize = 500;

/// Event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Human-readable status line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub at: DateTime<Utc>,
    pub class: MessageClass,
    pub text: String,
}

/// Core event
#[derive(Debug, Clone, Serialize)]
pub enum TunnelEvent {
    /// Tunnel state transition
    StateChanged(TunnelState),
    /// Handshake completed
    HandshakeSucceeded,
    /// Session ended without a stop request
    UnexpectedDisconnect,
    /// Status line
    Status(StatusMessage),
}

#[derive(Debug, Default)]
struct HubState {
    history: VecDeque<StatusMessage>,
    home_pages: Vec<String>,
}

/// Event fan-out plus the shared status log and home-page list
pub struct EventHub {
    event_tx: broadcast::Sender<TunnelEvent>,
    state: Mutex<HubState>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            event_tx,
            state: Mutex::new(HubState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: TunnelEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Record a status line, log it and broadcast it.
    pub fn status(&self, class: MessageClass, text: impl Into<String>) {
        let message = StatusMessage {
            at: Utc::now(),
            class,
            text: text.into(),
        };

        match class {
            MessageClass::Good => info!("✅ {}", message.text),
            MessageClass::Info => info!("ℹ️ {}", message.text),
            MessageClass::Bad => warn!("❌ {}", message.text),
        }

        {
            let mut state = self.lock();
            if state.history.len() == STATUS_HISTORY_LIMIT {
                state.history.pop_front();
            }
            state.history.push_back(message.clone());
        }

        self.emit(TunnelEvent::Status(message));
    }

    pub fn status_history(&self) -> Vec<StatusMessage> {
        self.lock().history.iter().cloned().collect()
    }

    /// Append home pages from a handshake. Duplicates are kept.
    pub fn add_home_pages<I, S>(&self, pages: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().home_pages.extend(pages.into_iter().map(Into::into));
    }

    pub fn home_pages(&self) -> Vec<String> {
        self.lock().home_pages.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_is_broadcast_and_recorded() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        hub.status(MessageClass::Good, "connected");

        match rx.recv().await.unwrap() {
            TunnelEvent::Status(msg) => {
                assert_eq!(msg.class, MessageClass::Good);
                assert_eq!(msg.text, "connected");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(hub.status_history().len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let hub = EventHub::new();
        for i in 0..STATUS_HISTORY_LIMIT + 5 {
            hub.status(MessageClass::Info, format!("line {}", i));
        }
        let history = hub.status_history();
        assert_eq!(history.len(), STATUS_HISTORY_LIMIT);
        assert_eq!(history[0].text, "line 5");
    }

    #[test]
    fn test_home_pages_append() {
        let hub = EventHub::new();
        hub.add_home_pages(vec!["https://a.example/"]);
        hub.add_home_pages(vec!["https://a.example/", "https://b.example/"]);
        assert_eq!(hub.home_pages().len(), 3);
    }
}
