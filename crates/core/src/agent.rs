//! Agent model - worker lifecycle states and transitions.

use serde::{Deserialize, Serialize};
use crate::id::{AgentId, ItemId, QueueId};
use crate::queue::EmptyBehavior;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Ready to claim
    #[default]
    Idle,
    /// Asking for an item from another queue
    Claiming,
    /// Running the executor
    Executing,
    /// Waiting for the verifier
    Verifying,
    /// Hibernating until the queue changes or the circuit cools down
    Waiting,
    /// Finished, never runs again
    Done,
    /// Operation aborted by the bulkhead, awaiting a supervisor decision
    Reaped,
}

impl AgentState {
    /// `Done` is the only terminal state.
    pub fn is_terminal(self) -> bool {
        self == Self::Done
    }

    /// States in which the agent is available for new work.
    pub fn is_available(self) -> bool {
        matches!(self, Self::Idle | Self::Waiting)
    }

    /// Apply an event, returning the next state.
    pub fn on(self, event: AgentEvent) -> Result<AgentState, InvalidTransition> {
        use AgentEvent as E;
        use AgentState as S;

        let next = match (self, event) {
            (S::Done, _) => None,
            (_, E::Shutdown) => Some(S::Done),

            (S::Idle, E::Claimed) => Some(S::Executing),
            (S::Idle, E::NoWork(EmptyBehavior::Idle)) => Some(S::Idle),
            (S::Idle, E::NoWork(EmptyBehavior::Hibernate)) => Some(S::Waiting),
            (S::Idle, E::NoWork(EmptyBehavior::Terminate)) => Some(S::Done),
            (S::Idle, E::NoWork(EmptyBehavior::StealFromOthers)) => Some(S::Claiming),
            (S::Idle, E::CircuitOpen) => Some(S::Waiting),

            (S::Claiming, E::Claimed) => Some(S::Executing),
            (S::Claiming, E::NothingToSteal) => Some(S::Idle),

            (S::Executing, E::Output) => Some(S::Verifying),
            (S::Executing, E::Breach) => Some(S::Reaped),
            (S::Executing, E::ExecutionFailed) => Some(S::Idle),

            (S::Verifying, E::VerificationPassed) => Some(S::Idle),
            (S::Verifying, E::VerificationFailed) => Some(S::Idle),

            (S::Waiting, E::Woken) => Some(S::Idle),

            (S::Reaped, E::Resume) => Some(S::Idle),
            (S::Reaped, E::Retire) => Some(S::Done),

            _ => None,
        };

        next.ok_or(InvalidTransition { from: self, event })
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Reaped => "reaped",
        };
        f.write_str(s)
    }
}

/// Things that happen to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    /// An item was claimed (home queue or stolen)
    Claimed,
    /// The home queue had nothing claimable
    NoWork(EmptyBehavior),
    /// The supervisor found nothing to steal
    NothingToSteal,
    /// The agent's own circuit breaker is open
    CircuitOpen,
    /// The executor produced output
    Output,
    /// Bulkhead timeout, budget or circuit refusal
    Breach,
    /// The executor returned an error
    ExecutionFailed,
    /// Every commitment passed
    VerificationPassed,
    /// At least one commitment failed
    VerificationFailed,
    /// Queue change notification or cooldown elapsed
    Woken,
    /// Supervisor keeps the agent after a reap
    Resume,
    /// Supervisor retires the agent after a reap
    Retire,
    /// Pool shrink or shutdown
    Shutdown,
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid agent transition: {event:?} in state {from}")]
pub struct InvalidTransition {
    /// State the agent was in
    pub from: AgentState,
    /// Event that was not allowed
    pub event: AgentEvent,
}

/// Cumulative resources used by an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens charged to the agent
    pub tokens: u64,

    /// Wall time spent inside executor calls
    pub wall_time: std::time::Duration,

    /// Executor operations attempted
    pub operations: u64,
}

/// Point-in-time view of an agent, published for the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Agent identity
    pub id: AgentId,

    /// Queue the agent was spawned for
    pub home_queue: QueueId,

    /// Current state
    pub state: AgentState,

    /// Item currently held
    pub item: Option<ItemId>,

    /// Queue owning the held item (differs from home when stolen)
    pub item_queue: Option<QueueId>,

    /// Resources used so far
    pub usage: Usage,

    /// Reaps inside the current window
    pub recent_reaps: usize,
}

impl AgentSnapshot {
    /// Snapshot of a freshly spawned agent.
    pub fn new(id: AgentId, home_queue: QueueId) -> Self {
        Self {
            id,
            home_queue,
            state: AgentState::Idle,
            item: None,
            item_queue: None,
            usage: Usage::default(),
            recent_reaps: 0,
        }
    }
}
