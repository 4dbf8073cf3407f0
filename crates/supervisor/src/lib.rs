//! Pool Supervisor
//!
//! A single actor per pool that owns the queues and the agent table, scales
//! agents against backlog, serves steal requests and surfaces dead letters.

#![warn(missing_docs)]

mod command;
mod error;
pub mod handle;
pub mod report;
pub mod supervisor;

pub use error::{SupervisorError, Result};
pub use handle::SupervisorHandle;
pub use report::{PoolSnapshot, QueueReport, ShutdownReport};
pub use supervisor::{Supervisor, target_size};
