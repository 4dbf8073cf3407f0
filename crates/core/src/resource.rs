//! Resource model - budget scopes, circuit states and failure classes.

use serde::{Deserialize, Serialize};

/// Which budget refused a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// The agent's own budget
    Agent,
    /// The pool aggregate budget
    Pool,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => f.write_str("agent"),
            Self::Pool => f.write_str("pool"),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Operations flow normally
    #[default]
    Closed,
    /// Every operation is rejected until the cooldown ends
    Open,
    /// One trial operation is admitted
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Another agent won a claim race
    ClaimConflict,
    /// The executor failed or timed out
    ExecutionFailure,
    /// One or more commitments failed
    VerificationFailure,
    /// A reservation exceeded the agent or pool budget
    BudgetExceeded,
    /// The circuit breaker rejected the operation
    CircuitOpen,
    /// An agent was reaped too often
    ChronicFailure,
}

impl FailureClass {
    /// Whether the class is always reported on the event channel.
    pub fn is_surfaced(self) -> bool {
        matches!(self, Self::BudgetExceeded | Self::CircuitOpen | Self::ChronicFailure)
    }

    /// Whether the class is retried within the item's attempt limit.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ClaimConflict | Self::ExecutionFailure | Self::VerificationFailure
        )
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ClaimConflict => "claim conflict",
            Self::ExecutionFailure => "execution failure",
            Self::VerificationFailure => "verification failure",
            Self::BudgetExceeded => "budget exceeded",
            Self::CircuitOpen => "circuit open",
            Self::ChronicFailure => "chronic failure",
        };
        f.write_str(s)
    }
}
