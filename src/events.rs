//! Asynchronous status notifications.
//!
//! The engine publishes one event per terminal state of an update attempt,
//! plus queue changes and cycle reports. Delivery (dashboard stream, chat
//! notifications) is up to the subscriber.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::engine::UpdateState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueChange {
    Added,
    Approved,
    Requeued,
    Rejected,
    Ignored,
    Applied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    UpdateStarted {
        key: String,
        target_image: String,
    },
    UpdateSucceeded {
        key: String,
        previous_image: String,
        target_image: String,
    },
    UpdateFailed {
        key: String,
        target_image: String,
        /// State the attempt was in when it failed.
        failed_in: UpdateState,
        error: String,
    },
    RolledBack {
        key: String,
        image: String,
        /// The update failure that triggered an automatic rollback.
        cause: Option<String>,
    },
    RollbackFailed {
        key: String,
        image: String,
        error: String,
    },
    QueueChanged {
        key: String,
        change: QueueChange,
    },
    CyclesDetected {
        cycles: Vec<Vec<String>>,
    },
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event);
}

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish(&self, event: Event) {
        match &event {
            Event::UpdateFailed { .. } => warn!("{:?}", event),
            Event::RollbackFailed { .. } => error!("{:?}", event),
            Event::CyclesDetected { .. } => warn!("{:?}", event),
            _ => info!("{:?}", event),
        }
    }
}

/// Fans events out to any number of subscribers. Publishing never blocks;
/// slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Event>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: Event) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
