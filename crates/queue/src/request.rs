//! Producer-side enqueue requests.

use hive_core::{Commitment, ItemId, WorkerProfile};

/// What a producer supplies to create a work item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueRequest {
    /// Opaque payload for the executor
    pub assignment: String,

    /// Checks the output must satisfy
    pub commitments: Vec<Commitment>,

    /// Claims allowed; the queue default applies when unset
    pub max_attempts: Option<u32>,

    /// Tokens to reserve per attempt
    pub token_request: Option<u64>,

    /// Item this one follows up on
    pub parent: Option<ItemId>,
}

impl EnqueueRequest {
    /// Create a request for an assignment.
    pub fn new(assignment: impl Into<String>) -> Self {
        Self {
            assignment: assignment.into(),
            ..Default::default()
        }
    }

    /// Add one commitment.
    pub fn commitment(mut self, commitment: Commitment) -> Self {
        self.commitments.push(commitment);
        self
    }

    /// Add several commitments.
    pub fn commitments(mut self, commitments: impl IntoIterator<Item = Commitment>) -> Self {
        self.commitments.extend(commitments);
        self
    }

    /// Override the attempt limit.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the per-attempt token reservation.
    pub fn token_request(mut self, tokens: u64) -> Self {
        self.token_request = Some(tokens);
        self
    }

    /// Reference a parent item.
    pub fn parent(mut self, parent: ItemId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Attach a profile's default commitments.
    pub fn with_profile(mut self, profile: &WorkerProfile) -> Self {
        self.commitments.extend(profile.default_commitments.iter().cloned());
        self
    }
}
