//! Application events.
//!
//! The core raises typed events that surrounding UI/config code observes:
//! connection-state changes, user directory changes, stats. Denials and
//! protocol failures surface here too, as notifications rather than errors.

use tokio::sync::broadcast;

use crate::payload::UserInfo;

/// Events raised by the transport and orchestration layers.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// This peer completed the handshake and was assigned an id.
    Connected { user_id: i64 },
    /// The connection to the authority (or a peer's connection) was lost.
    Disconnected { user_id: i64, reason: String },
    /// The handshake was refused or violated; the connection is gone.
    ConnectionFailed { reason: String },
    UserJoined { user: UserInfo },
    UserLeft { user_id: i64 },
    UserRenamed { user_id: i64, name: String },
    /// Periodic informational stats, not an error.
    Stats {
        latency_micros: u64,
        queued_bytes: u64,
    },
}

/// Broadcast hub for application events. Cloneable; slow observers drop
/// events rather than blocking the raiser.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<AppEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Raise an event. Nobody listening is fine.
    pub fn raise(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raised_events_reach_subscribers() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.raise(AppEvent::Connected { user_id: 3 });
        match rx.recv().await.unwrap() {
            AppEvent::Connected { user_id } => assert_eq!(user_id, 3),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn raising_without_subscribers_is_fine() {
        let hub = EventHub::new();
        hub.raise(AppEvent::UserLeft { user_id: 1 });
    }
}
