//! Tool Integration
//!
//! Run external processes (assertion commands, executor commands) with
//! stdin, environment and a hard timeout.

#![warn(missing_docs)]

pub mod runner;
pub mod process;

pub use runner::{CommandRunner, CommandSpec, CommandOutput, ToolError};
pub use process::ProcessRunner;
