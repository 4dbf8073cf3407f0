//! Client side of the supervisor actor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive_agent::{ReapDecision, SupervisorLink};
use hive_core::{AgentId, ItemId, QueueId, QueueSpec, WorkItem};
use hive_queue::{Claim, EnqueueRequest, WorkQueue};
use tokio::sync::{mpsc, oneshot};

use crate::command::Command;
use crate::error::{Result, SupervisorError};
use crate::report::{PoolSnapshot, ShutdownReport};

/// Cloneable handle to a running supervisor.
///
/// The supervisor stops its agents once every handle has been dropped.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    /// Register a queue. Registering an existing id returns the existing queue.
    pub async fn add_queue(&self, spec: QueueSpec) -> Result<Arc<WorkQueue>> {
        self.request(|reply| Command::AddQueue { spec, reply }).await
    }

    /// Look up a queue.
    pub async fn queue(&self, id: QueueId) -> Result<Arc<WorkQueue>> {
        self.request(|reply| Command::Queue { id, reply })
            .await?
            .ok_or(SupervisorError::UnknownQueue(id))
    }

    /// Add an item to a queue.
    pub async fn enqueue(&self, queue: QueueId, request: EnqueueRequest) -> Result<ItemId> {
        self.request(|reply| Command::Enqueue { queue, request, reply }).await?
    }

    /// Current view of queues, agents and the pool budget.
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Items that exhausted their attempts, across all queues.
    pub async fn dead_letters(&self) -> Result<Vec<WorkItem>> {
        self.request(|reply| Command::DeadLetters { reply }).await
    }

    /// Wait until no queue has pending or in-flight items.
    pub async fn wait_drained(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.request(|reply| Command::WaitDrained { reply })).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::NotDrained(timeout)),
        }
    }

    /// Stop every agent and wait for them to finish.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Link handed to agents. Holds only a weak sender so agents never keep
/// the supervisor alive.
pub(crate) struct PoolLink {
    tx: mpsc::WeakSender<Command>,
}

impl PoolLink {
    pub(crate) fn new(tx: mpsc::WeakSender<Command>) -> Self {
        Self { tx }
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let tx = self.tx.upgrade()?;
        let (reply, rx) = oneshot::channel();
        tx.send(command(reply)).await.ok()?;
        drop(tx);
        rx.await.ok()
    }
}

#[async_trait]
impl SupervisorLink for PoolLink {
    async fn steal(&self, agent: AgentId, home: QueueId) -> Option<Claim> {
        self.ask(|reply| Command::Steal { agent, home, reply }).await?
    }

    async fn after_reap(&self, agent: AgentId, reason: &str) -> ReapDecision {
        let reason = reason.to_string();
        self.ask(|reply| Command::AfterReap { agent, reason, reply })
            .await
            .unwrap_or(ReapDecision::Retire)
    }
}
