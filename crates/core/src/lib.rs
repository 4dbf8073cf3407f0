//! Hive core data models.
//!
//! This crate defines the data structures shared by the work queue, the
//! verifier, the bulkhead, agents and the pool supervisor.

#![warn(missing_docs)]

// Core identities
mod id;

// Work model
mod item;
mod queue;
mod profile;

// Workers and resources
mod agent;
mod resource;

// Observability and configuration
pub mod event;
pub mod config;

// Re-exports
pub use id::*;

pub use item::{
    WorkItem, ItemStatus, Commitment, CommitmentStatus, Assertion, CommitmentResult, Verdict,
    DEFAULT_MAX_ATTEMPTS,
};
pub use queue::{QueueSpec, EmptyBehavior, QueueDepth};
pub use profile::{WorkerProfile, ASSIGNMENT_PLACEHOLDER};
pub use agent::{AgentState, AgentEvent, AgentSnapshot, InvalidTransition, Usage};
pub use resource::{BudgetScope, CircuitState, FailureClass};
pub use event::{Event, EventKind, EventSink, Events, TracingSink, MemorySink, ChannelSink, FanoutSink};
pub use config::{
    HiveConfig, ConfigError, QueueDefaults, AgentConfig, PoolConfig, CircuitConfig, ExecutorConfig,
    StolenPriority,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
