//! In-process typed publish/subscribe for entity changes (§2, §4.1, §9).
//!
//! A slow subscriber must not stall publishers: `tokio::sync::broadcast`
//! gives every subscriber its own bounded lane and drops the oldest entries
//! for a lagging receiver rather than blocking the sender, matching the
//! `progress_tx: broadcast::Sender<SyncProgress>` pattern this codebase
//! already uses for orchestrator fan-out.

use tokio::sync::broadcast;

use crate::models::Event;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Best-effort: if there are no subscribers this is a
    /// no-op, and a lagging subscriber simply misses old entries on its next
    /// `recv()` rather than blocking this call.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let playlist_id = Uuid::new_v4();
        bus.publish(Event::PlaylistCreated { playlist_id });

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.playlist_id(), playlist_id);
        assert_eq!(e2.playlist_id(), playlist_id);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::PlaylistCreated {
            playlist_id: Uuid::new_v4(),
        });
    }
}
