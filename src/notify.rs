use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, ResourceId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-resource change feed. Every committed event is fanned out to the
/// resource's subscribers; slow subscribers see `Lagged`, never block writers.
pub struct NotifyHub {
    channels: DashMap<ResourceId, broadcast::Sender<Event>>,
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

    /// Subscribe to a resource's events. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: &ResourceId) -> broadcast::Receiver<Event> {
        self.channels
            .entry(resource_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        if let Some(sender) = self.channels.get(event.resource_id()) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a resource's channel; current receivers observe `Closed`.
    pub fn remove(&self, resource_id: &ResourceId) {
        self.channels.remove(resource_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
