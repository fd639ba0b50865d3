//! Per-session event fan-out
//!
//! The lifecycle controller publishes every observable change here. Stream
//! subscriptions and provider pumps subscribe by session id. A channel is
//! closed once its session reaches a terminal state, so receivers see
//! `RecvError::Closed` after the final event.

use crate::session::SessionId;
use devlink_core::SessionStatus;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 32;

/// Something that happened to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Non-terminal status change
    Status(SessionStatus),
    /// New QR payload from the live provider
    QrRotated(String),
    /// Session completed
    Linked {
        credential: String,
        device_info: Option<String>,
    },
    /// Session expired or was cancelled
    Ended(SessionStatus),
    /// Live connection closed before pairing
    ProviderClosed(String),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Linked { .. } | SessionEvent::Ended(_))
    }
}

/// Broadcast channels keyed by session
#[derive(Default)]
pub struct SessionEvents {
    channels: Mutex<HashMap<SessionId, broadcast::Sender<SessionEvent>>>,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a session's events, creating its channel on first use
    pub fn subscribe(&self, id: &SessionId) -> broadcast::Receiver<SessionEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver an event to current subscribers. Terminal events close the
    /// channel after delivery.
    pub fn publish(&self, id: &SessionId, event: SessionEvent) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let terminal = event.is_terminal();
        if let Some(tx) = channels.get(id) {
            let delivered = tx.send(event).unwrap_or(0);
            debug!("Session {} event delivered to {} subscriber(s)", id, delivered);
        }
        if terminal {
            channels.remove(id);
        }
    }

    /// Drop a session's channel without sending anything
    pub fn close(&self, id: &SessionId) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.remove(id);
    }

    /// Number of sessions with an open channel
    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
