//! Queue model - the description of a work queue.

use serde::{Deserialize, Serialize};
use crate::id::{QueueId, TaskId};

/// Static description of a work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Unique identifier
    pub id: QueueId,

    /// Task that produces items for this queue
    pub task_id: TaskId,

    /// Human-readable name
    pub name: String,

    /// What an agent does when the queue has nothing to claim
    pub empty_behavior: EmptyBehavior,

    /// Whether agents homed on this queue may steal from other queues
    pub stealing_enabled: bool,

    /// Preference weight when other agents steal from this queue (higher first)
    pub priority: u32,
}

impl QueueSpec {
    /// Create a spec with default policies.
    pub fn new(name: impl Into<String>, task_id: TaskId) -> Self {
        Self {
            id: QueueId::new(),
            task_id,
            name: name.into(),
            empty_behavior: EmptyBehavior::default(),
            stealing_enabled: false,
            priority: 0,
        }
    }

    /// Set the empty-queue behavior.
    pub fn with_empty_behavior(mut self, behavior: EmptyBehavior) -> Self {
        self.empty_behavior = behavior;
        self
    }

    /// Enable or disable stealing.
    pub fn with_stealing(mut self, enabled: bool) -> Self {
        self.stealing_enabled = enabled;
        self
    }

    /// Set the stealing priority weight.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Policy applied when an agent finds its home queue empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyBehavior {
    /// Poll again after a backoff
    #[default]
    Idle,
    /// Sleep until the queue changes
    Hibernate,
    /// Stop the agent
    Terminate,
    /// Ask the supervisor for an item from another queue
    StealFromOthers,
}

/// Depth metric exposed to the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Items waiting to be claimed
    pub pending: usize,

    /// Items held by an agent
    pub in_flight: usize,

    /// Items accepted
    pub completed: usize,

    /// Items that exhausted their attempts
    pub dead_lettered: usize,
}

impl QueueDepth {
    /// Items that have not reached a terminal status.
    pub fn live(&self) -> usize {
        self.pending + self.in_flight
    }
}
