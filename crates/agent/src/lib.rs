//! Agents
//!
//! A worker that claims one item at a time, runs it through the executor
//! under its bulkhead, hands the output to the verifier and reports back to
//! its supervisor.

#![warn(missing_docs)]

pub mod executor;
pub mod link;
pub mod agent;

pub use executor::{Executor, Execution, ExecutorError, CommandExecutor};
pub use link::{SupervisorLink, ReapDecision, Standalone};
pub use agent::{Agent, AgentRuntime, AgentExit, ExitReason, AgentError};
