//! Supervisor errors.

use std::time::Duration;

use hive_core::QueueId;
use hive_queue::QueueError;

/// Result type for supervisor calls.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Errors returned through a [`crate::SupervisorHandle`].
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The supervisor task has stopped
    #[error("supervisor stopped")]
    Stopped,

    /// No queue with this identity
    #[error("unknown queue {0}")]
    UnknownQueue(QueueId),

    /// The queue rejected the request
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Work was still live when the wait ended
    #[error("queues not drained after {0:?}")]
    NotDrained(Duration),
}
