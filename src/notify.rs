use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub — the notification sink the engine emits lifecycle and
/// assignment events into. Topics are room ids for reservation events and
/// staff ids for report assignment events. Delivery is fire-and-forget:
/// a lagging or absent subscriber never fails the operation that emitted.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, topic: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&topic) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a room is retired).
    pub fn remove(&self, topic: &Ulid) {
        self.channels.remove(topic);
    }
}
