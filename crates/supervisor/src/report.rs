//! Read-only views of a pool.

use hive_agent::AgentExit;
use hive_core::{AgentSnapshot, QueueDepth, QueueId, WorkItem};
use serde::Serialize;

/// One queue as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueReport {
    /// Queue identity
    pub id: QueueId,
    /// Queue name
    pub name: String,
    /// Stealing preference weight
    pub priority: u32,
    /// Item counts
    pub depth: QueueDepth,
    /// Live agents homed on the queue
    pub agents: usize,
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    /// Queues ordered by descending priority
    pub queues: Vec<QueueReport>,
    /// Live agents
    pub agents: Vec<AgentSnapshot>,
    /// Pool tokens consumed or reserved
    pub tokens_used: u64,
    /// Pool tokens still available
    pub tokens_remaining: u64,
}

impl PoolSnapshot {
    /// Pending plus in-flight items across all queues.
    pub fn live_items(&self) -> usize {
        self.queues.iter().map(|q| q.depth.live()).sum()
    }

    /// Dead-lettered items across all queues.
    pub fn dead_lettered(&self) -> usize {
        self.queues.iter().map(|q| q.depth.dead_lettered).sum()
    }
}

/// What a pool left behind after shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Final snapshot, taken after every agent stopped
    pub snapshot: PoolSnapshot,
    /// Every agent that ran, in the order they stopped
    pub exits: Vec<AgentExit>,
    /// Every item, grouped by queue
    pub items: Vec<WorkItem>,
    /// Dead-lettered items
    pub dead_letters: Vec<WorkItem>,
}
