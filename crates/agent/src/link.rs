//! The agent's view of its supervisor.

use async_trait::async_trait;
use hive_core::{AgentId, QueueId};
use hive_queue::Claim;

/// What a reaped agent should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapDecision {
    /// Go back to idle
    Resume,
    /// Stop
    Retire,
}

/// Calls an agent makes into the pool supervisor.
#[async_trait]
pub trait SupervisorLink: Send + Sync {
    /// Claim one item from a queue other than `home`, if any is worth taking.
    async fn steal(&self, agent: AgentId, home: QueueId) -> Option<Claim>;

    /// Decide the fate of an agent whose operation was aborted.
    async fn after_reap(&self, agent: AgentId, reason: &str) -> ReapDecision;
}

/// Link for an agent running without a supervisor: never steals, always resumes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Standalone;

#[async_trait]
impl SupervisorLink for Standalone {
    async fn steal(&self, _agent: AgentId, _home: QueueId) -> Option<Claim> {
        None
    }

    async fn after_reap(&self, _agent: AgentId, _reason: &str) -> ReapDecision {
        ReapDecision::Resume
    }
}
