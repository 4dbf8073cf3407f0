//! Work queues and the claim protocol.
//!
//! A [`WorkQueue`] is the only structure shared by every agent in a pool.
//! Claims are arbitrated per item with a compare-and-swap on an atomic status
//! word, so at most one agent ever holds a given item.

#![warn(missing_docs)]

mod error;
mod request;
mod slot;
pub mod queue;

pub use error::{QueueError, Result};
pub use request::EnqueueRequest;
pub use queue::{WorkQueue, Claim, Disposition, QueueWatch};
