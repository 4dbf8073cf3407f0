//! Event model - timestamped lifecycle records for external logging/metrics.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::AgentState;
use crate::id::{AgentId, EventId, ItemId, QueueId};
use crate::item::ItemStatus;
use crate::resource::{BudgetScope, CircuitState};
use crate::Time;

/// A discrete, timestamped observability record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier
    pub id: EventId,

    /// When it happened
    pub timestamp: Time,

    /// What happened
    pub kind: EventKind,
}

impl Event {
    /// Create an event stamped now.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            timestamp: chrono::Utc::now(),
            kind,
        }
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A producer added an item
    ItemEnqueued { item: ItemId, queue: QueueId },

    /// An item changed status
    ItemTransition {
        item: ItemId,
        queue: QueueId,
        from: ItemStatus,
        to: ItemStatus,
        agent: Option<AgentId>,
    },

    /// An item exhausted its attempts
    ItemDeadLettered {
        item: ItemId,
        queue: QueueId,
        attempts: u32,
        reason: String,
    },

    /// An agent took an item from a queue other than its home
    ItemStolen {
        item: ItemId,
        from_queue: QueueId,
        agent: AgentId,
        home_queue: QueueId,
    },

    /// Items held by a vanished agent were put back
    ItemsRecovered { agent: AgentId, count: usize },

    /// An agent changed lifecycle state
    AgentStateChanged {
        agent: AgentId,
        from: AgentState,
        to: AgentState,
    },

    /// A new agent joined the pool
    AgentSpawned { agent: AgentId, home_queue: QueueId },

    /// An agent left the pool
    AgentRetired { agent: AgentId, reason: String },

    /// An agent was reaped too often and stopped
    ChronicFailure {
        agent: AgentId,
        reaps: usize,
        window_ms: u64,
    },

    /// A reservation was refused
    BudgetExceeded {
        agent: AgentId,
        scope: BudgetScope,
        requested: u64,
        remaining: u64,
    },

    /// An operation ran past its timeout
    OperationTimedOut { agent: AgentId, timeout_ms: u64 },

    /// A circuit breaker changed state
    CircuitStateChanged {
        agent: AgentId,
        from: CircuitState,
        to: CircuitState,
        failures: usize,
    },

    /// An operation was rejected by an open circuit
    CircuitRejected { agent: AgentId },

    /// The supervisor resized the pool
    PoolScaled {
        from: usize,
        to: usize,
        reason: String,
    },
}

/// Destination for events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: Event);
}

/// Shared handle to an event sink.
pub type Events = Arc<dyn EventSink>;

/// Convenience for emitting a payload.
pub fn emit(events: &Events, kind: EventKind) {
    events.emit(Event::new(kind));
}

/// Sink that writes events as structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match &event.kind {
            EventKind::ItemDeadLettered { item, queue, attempts, reason } => {
                tracing::warn!(%item, %queue, attempts, %reason, "item dead-lettered");
            }
            EventKind::ChronicFailure { agent, reaps, window_ms } => {
                tracing::error!(%agent, reaps, window_ms, "agent retired after chronic reaping");
            }
            EventKind::BudgetExceeded { agent, scope, requested, remaining } => {
                tracing::warn!(%agent, %scope, requested, remaining, "budget exceeded");
            }
            EventKind::OperationTimedOut { agent, timeout_ms } => {
                tracing::warn!(%agent, timeout_ms, "operation timed out");
            }
            EventKind::CircuitStateChanged { agent, from, to, failures } => {
                tracing::warn!(%agent, %from, %to, failures, "circuit breaker changed state");
            }
            EventKind::CircuitRejected { agent } => {
                tracing::info!(%agent, "operation rejected by open circuit");
            }
            EventKind::PoolScaled { from, to, reason } => {
                tracing::info!(from, to, %reason, "pool scaled");
            }
            EventKind::AgentSpawned { agent, home_queue } => {
                tracing::info!(%agent, %home_queue, "agent spawned");
            }
            EventKind::AgentRetired { agent, reason } => {
                tracing::info!(%agent, %reason, "agent retired");
            }
            EventKind::ItemStolen { item, from_queue, agent, home_queue } => {
                tracing::info!(%item, %from_queue, %agent, %home_queue, "item stolen");
            }
            EventKind::ItemsRecovered { agent, count } => {
                tracing::warn!(%agent, count, "recovered items from vanished agent");
            }
            EventKind::ItemEnqueued { item, queue } => {
                tracing::debug!(%item, %queue, "item enqueued");
            }
            EventKind::ItemTransition { item, queue, from, to, agent } => {
                tracing::debug!(%item, %queue, %from, %to, agent = ?agent, "item transition");
            }
            EventKind::AgentStateChanged { agent, from, to } => {
                tracing::debug!(%agent, %from, %to, "agent transition");
            }
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event received so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events whose payload matches the predicate.
    pub fn filter(&self, predicate: impl Fn(&EventKind) -> bool) -> Vec<EventKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| predicate(&e.kind))
            .map(|e| e.kind.clone())
            .collect()
    }

    /// Number of events received.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was received.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Sink that publishes events on a broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: broadcast::Sender<Event>,
}

impl ChannelSink {
    /// Create a sink with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

/// Sink that forwards every event to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Events>,
}

impl FanoutSink {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination.
    pub fn with(mut self, sink: Events) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        sink.emit(Event::new(EventKind::PoolScaled { from: 1, to: 2, reason: "backlog".into() }));
        sink.emit(Event::new(EventKind::CircuitRejected { agent: AgentId::new() }));
        assert_eq!(sink.len(), 2);
        let scaled = sink.filter(|k| matches!(k, EventKind::PoolScaled { .. }));
        assert_eq!(scaled.len(), 1);
    }

    #[test]
    fn test_fanout_delivers_to_all() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());
        fanout.emit(Event::new(EventKind::ItemsRecovered { agent: AgentId::new(), count: 1 }));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink_broadcasts() {
        let sink = ChannelSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(Event::new(EventKind::PoolScaled { from: 0, to: 1, reason: "min".into() }));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, EventKind::PoolScaled { to: 1, .. }));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::new(EventKind::ItemEnqueued { item: ItemId::new(), queue: QueueId::new() });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["type"], "item_enqueued");
    }
}
