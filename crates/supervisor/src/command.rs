//! Messages understood by the supervisor actor.

use std::sync::Arc;

use hive_agent::ReapDecision;
use hive_core::{AgentId, ItemId, QueueId, QueueSpec, WorkItem};
use hive_queue::{Claim, EnqueueRequest, WorkQueue};
use tokio::sync::oneshot;

use crate::error::Result;
use crate::report::{PoolSnapshot, ShutdownReport};

pub(crate) enum Command {
    AddQueue {
        spec: QueueSpec,
        reply: oneshot::Sender<Arc<WorkQueue>>,
    },
    Queue {
        id: QueueId,
        reply: oneshot::Sender<Option<Arc<WorkQueue>>>,
    },
    Enqueue {
        queue: QueueId,
        request: EnqueueRequest,
        reply: oneshot::Sender<Result<ItemId>>,
    },
    Steal {
        agent: AgentId,
        home: QueueId,
        reply: oneshot::Sender<Option<Claim>>,
    },
    AfterReap {
        agent: AgentId,
        reason: String,
        reply: oneshot::Sender<ReapDecision>,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    DeadLetters {
        reply: oneshot::Sender<Vec<WorkItem>>,
    },
    WaitDrained {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<ShutdownReport>,
    },
}
