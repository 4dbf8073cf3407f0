//! Queue errors.

use hive_core::{AgentId, ItemId, ItemStatus};

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors raised by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// No item with this identity in the queue
    #[error("item {0} not found")]
    NotFound(ItemId),

    /// The caller does not hold the item
    #[error("item {item} is held by {holder:?}, not by {agent}")]
    NotHolder {
        /// Item concerned
        item: ItemId,
        /// Caller
        agent: AgentId,
        /// Actual holder
        holder: Option<AgentId>,
    },

    /// The item is not in a status that allows the transition
    #[error("item {item} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Item concerned
        item: ItemId,
        /// Current status
        from: ItemStatus,
        /// Requested status
        to: ItemStatus,
    },

    /// A failing verdict was offered for completion
    #[error("verdict for item {0} did not pass")]
    VerdictFailed(ItemId),

    /// The enqueue request is unusable
    #[error("rejected enqueue: {0}")]
    Rejected(String),
}
