use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, Span};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A committed WAL event touching this resource.
    Committed(Event),
    /// A cancellation freed `span` on `date`; these active waitlist entries overlap it.
    SlotFreed {
        resource_id: String,
        date: NaiveDate,
        span: Span,
        waitlist: Vec<Ulid>,
    },
}

/// Broadcast hub, one channel per resource.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
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

    /// Subscribe to notifications for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: &str) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(resource_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, resource_id: &str, notification: Notification) {
        if let Some(sender) = self.channels.get(resource_id) {
            let _ = sender.send(notification);
        }
    }

    pub fn send_event(&self, resource_id: &str, event: &Event) {
        if self.channels.contains_key(resource_id) {
            self.send(resource_id, Notification::Committed(event.clone()));
        }
    }
}
