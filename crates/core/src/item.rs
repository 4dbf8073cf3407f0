//! Work item model - the unit of assignable work.

use serde::{Deserialize, Serialize};
use crate::id::{AgentId, ItemId, QueueId};
use crate::Time;

/// Default number of claims an item may receive before it is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A unit of work that one agent at a time may claim and execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier
    pub id: ItemId,

    /// Queue that owns this item
    pub queue_id: QueueId,

    /// Opaque payload handed to the executor
    pub assignment: String,

    /// Checks the output must satisfy
    pub commitments: Vec<Commitment>,

    /// Lifecycle status
    pub status: ItemStatus,

    /// Agent currently holding the item
    pub claimed_by: Option<AgentId>,

    /// Number of claims so far
    pub attempts: u32,

    /// Maximum number of claims
    pub max_attempts: u32,

    /// Scheduling priority (inherited from the queue at enqueue time)
    pub priority: u32,

    /// Tokens to reserve per attempt, overriding the agent default
    pub token_request: Option<u64>,

    /// Item this one was spawned from, if any
    pub parent: Option<ItemId>,

    /// Output of the latest execution
    pub output: Option<String>,

    /// Reason the latest attempt failed
    pub last_error: Option<String>,

    /// Creation timestamp
    pub created_at: Time,

    /// Latest claim timestamp
    pub claimed_at: Option<Time>,

    /// Completion (or dead-letter) timestamp
    pub completed_at: Option<Time>,
}

impl WorkItem {
    /// Create a pending item.
    pub fn new(queue_id: QueueId, assignment: impl Into<String>) -> Self {
        Self {
            id: ItemId::new(),
            queue_id,
            assignment: assignment.into(),
            commitments: Vec::new(),
            status: ItemStatus::Pending,
            claimed_by: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
            token_request: None,
            parent: None,
            output: None,
            last_error: None,
            created_at: chrono::Utc::now(),
            claimed_at: None,
            completed_at: None,
        }
    }

    /// Whether the item may still be claimed once more.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether the item reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed, execution not started yet
    Claimed,
    /// The executor is working on it
    Executing,
    /// Output is being checked against commitments
    Verifying,
    /// Accepted
    Completed,
    /// Attempt failed, awaiting requeue or dead-letter
    Failed,
    /// Retry budget exhausted
    DeadLettered,
}

impl ItemStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }

    /// Statuses during which an agent holds the item.
    pub fn is_held(self) -> bool {
        matches!(self, Self::Claimed | Self::Executing | Self::Verifying)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        };
        f.write_str(s)
    }
}

/// A deterministic check that must hold for an item's output to be accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    /// What the check guarantees
    pub description: String,

    /// The executable check
    pub assertion: Assertion,

    /// Outcome of the latest verification
    #[serde(default)]
    pub status: CommitmentStatus,
}

impl Commitment {
    /// Create a pending commitment.
    pub fn new(description: impl Into<String>, assertion: Assertion) -> Self {
        Self {
            description: description.into(),
            assertion,
            status: CommitmentStatus::Pending,
        }
    }
}

/// Outcome of a commitment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    /// Not evaluated yet
    #[default]
    Pending,
    /// Assertion held
    Passed,
    /// Assertion did not hold
    Failed,
}

/// Executable assertion kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    /// Output contains the text
    Contains { text: String },

    /// Output does not contain the text
    NotContains { text: String },

    /// Output matches the regular expression
    Matches { pattern: String },

    /// Output is JSON and the value at `path` satisfies `condition`
    JsonPath { path: String, condition: String },

    /// Process run with the output on stdin
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        expected_exit_code: Option<i32>,
        #[serde(default = "default_command_timeout_ms")]
        timeout_ms: u64,
    },

    /// A file exists in the environment
    FileExists { path: String },
}

fn default_command_timeout_ms() -> u64 {
    60_000
}

/// Result of evaluating one commitment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitmentResult {
    /// Position of the commitment in the item
    pub index: usize,

    /// Commitment description
    pub description: String,

    /// Outcome
    pub status: CommitmentStatus,

    /// Explanation for failures
    pub detail: Option<String>,

    /// Time spent evaluating
    pub duration: std::time::Duration,
}

/// Verdict over all of an item's commitments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Verified item
    pub item_id: ItemId,

    /// One result per commitment, in commitment order
    pub results: Vec<CommitmentResult>,
}

impl Verdict {
    /// Whether every commitment passed.
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.status == CommitmentStatus::Passed)
    }

    /// Results that failed.
    pub fn failures(&self) -> impl Iterator<Item = &CommitmentResult> {
        self.results.iter().filter(|r| r.status == CommitmentStatus::Failed)
    }

    /// One-line summary of the failed commitments.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|r| match &r.detail {
                Some(detail) => format!("{}: {}", r.description, detail),
                None => r.description.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: CommitmentStatus) -> CommitmentResult {
        CommitmentResult {
            index: 0,
            description: "has greeting".to_string(),
            status,
            detail: Some("missing 'hello'".to_string()),
            duration: std::time::Duration::ZERO,
        }
    }

    #[test]
    fn test_new_item_defaults() {
        let item = WorkItem::new(QueueId::new(), "write a haiku");
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(item.attempts, 0);
        assert!(item.claimed_by.is_none());
        assert!(!item.attempts_exhausted());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ItemStatus::Completed.is_terminal());
        assert!(ItemStatus::DeadLettered.is_terminal());
        assert!(!ItemStatus::Failed.is_terminal());
        assert!(ItemStatus::Executing.is_held());
        assert!(!ItemStatus::Pending.is_held());
    }

    #[test]
    fn test_empty_verdict_passes() {
        let verdict = Verdict { item_id: ItemId::new(), results: Vec::new() };
        assert!(verdict.passed());
    }

    #[test]
    fn test_verdict_failure_summary() {
        let verdict = Verdict {
            item_id: ItemId::new(),
            results: vec![result(CommitmentStatus::Passed), result(CommitmentStatus::Failed)],
        };
        assert!(!verdict.passed());
        assert_eq!(verdict.failure_summary(), "has greeting: missing 'hello'");
    }

    #[test]
    fn test_assertion_json_shape() {
        let json = r#"{"description":"compiles","assertion":{"kind":"command","program":"sh","args":["-c","exit 0"]}}"#;
        let commitment: Commitment = serde_json::from_str(json).unwrap();
        assert_eq!(commitment.status, CommitmentStatus::Pending);
        match commitment.assertion {
            Assertion::Command { timeout_ms, expected_exit_code, .. } => {
                assert_eq!(timeout_ms, 60_000);
                assert_eq!(expected_exit_code, None);
            }
            other => panic!("unexpected assertion {:?}", other),
        }
    }
}
