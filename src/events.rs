// src/events.rs
//! In-process notification of queue state changes.
//!
//! The canonical, totally-ordered record of every transition is the Redis
//! `events` stream written by the scripts themselves. This bus only fans the
//! local process's own observations out to subscribers; producers and
//! workers never share mutable state beyond the store keys.

use crate::JobId;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Waiting { id: JobId },
    Active { id: JobId },
    Progress { id: JobId, progress: serde_json::Value },
    Completed { id: JobId, returnvalue: serde_json::Value },
    Failed { id: JobId, reason: String },
    Stalled { id: JobId },
    Delayed { id: JobId, until: i64 },
    Removed { id: JobId },
    Drained,
    Paused,
    Resumed,
}

/// Bounded broadcast channel; slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Emission never fails the caller; an event with no subscribers is
    /// simply dropped.
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(QueueEvent::Drained);
        match rx.recv().await.unwrap() {
            QueueEvent::Drained => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new(8);
        bus.emit(QueueEvent::Paused);
    }
}
