//! Event types for the Tally pipeline event system

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Pipeline event types
///
/// Emitted by the coordinator and sweep runner as units of work move through
/// their state machines. Subscribers (tests, monitoring) receive events via
/// [`EventBus::subscribe`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A unit of work transitioned between states
    WorkStateChanged {
        work_id: Uuid,
        source_id: Uuid,
        old_state: String,
        new_state: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Observations were durably appended for a source document
    ObservationsAppended {
        work_id: Uuid,
        source_id: Uuid,
        count: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A unit of work reached a terminal state with its completion tallies
    WorkCompleted {
        work_id: Uuid,
        source_id: Uuid,
        upserted: usize,
        failed: usize,
        terminal_state: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A new rule-set version was published
    RuleSetPublished {
        version: i64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A re-normalization sweep started (or resumed)
    SweepStarted {
        ruleset_version: i64,
        selector: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Periodic progress report from a running sweep
    SweepProgress {
        ruleset_version: i64,
        processed: u64,
        failed: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A sweep finished or was cancelled between records
    SweepFinished {
        ruleset_version: i64,
        processed: u64,
        failed: u64,
        cancelled: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast bus for pipeline events.
///
/// Thin wrapper around a tokio broadcast channel. Emitting never blocks;
/// events are dropped when no subscriber is listening, and slow subscribers
/// lose the oldest buffered events first.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events.
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: PipelineEvent) {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(PipelineEvent::RuleSetPublished {
            version: 1,
            timestamp: chrono::Utc::now(),
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::RuleSetPublished { version, .. } => assert_eq!(version, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.emit(PipelineEvent::SweepProgress {
            ruleset_version: 2,
            processed: 10,
            failed: 0,
            timestamp: chrono::Utc::now(),
        });
    }
}
