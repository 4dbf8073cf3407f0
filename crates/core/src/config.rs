//! Configuration for queues, agents, the pool and circuit breakers.
//!
//! Every field has a default so a configuration file only needs to name the
//! values it changes. Durations are expressed in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::item::DEFAULT_MAX_ATTEMPTS;
use crate::queue::{EmptyBehavior, QueueSpec};

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is out of range or inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// Defaults for new queues and items
    pub queue: QueueDefaults,

    /// Per-agent limits
    pub agent: AgentConfig,

    /// Pool sizing and aggregate budget
    pub pool: PoolConfig,

    /// Circuit breaker tuning
    pub circuit: CircuitConfig,

    /// External executor command (used by the CLI)
    pub executor: ExecutorConfig,
}

impl HiveConfig {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse and validate JSON.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: HiveConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be at least 1".into()));
        }
        if self.pool.min_agents > self.pool.max_agents {
            return Err(ConfigError::Invalid(format!(
                "pool.min_agents ({}) exceeds pool.max_agents ({})",
                self.pool.min_agents, self.pool.max_agents
            )));
        }
        if self.pool.max_agents == 0 {
            return Err(ConfigError::Invalid("pool.max_agents must be at least 1".into()));
        }
        if self.pool.scale_up_backlog == 0 {
            return Err(ConfigError::Invalid("pool.scale_up_backlog must be at least 1".into()));
        }
        if self.pool.tick_ms == 0 {
            return Err(ConfigError::Invalid("pool.tick_ms must be positive".into()));
        }
        if self.agent.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("agent.operation_timeout_ms must be positive".into()));
        }
        if self.agent.reap_threshold == 0 {
            return Err(ConfigError::Invalid("agent.reap_threshold must be at least 1".into()));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::Invalid("circuit.failure_threshold must be at least 1".into()));
        }
        if self.queue.empty_behavior == EmptyBehavior::StealFromOthers && !self.queue.stealing_enabled {
            tracing::warn!("queue.empty_behavior is steal_from_others but stealing is disabled; agents will idle");
        }
        if self.agent.token_budget > self.pool.token_budget {
            tracing::warn!(
                agent = self.agent.token_budget,
                pool = self.pool.token_budget,
                "agent token budget exceeds the pool budget"
            );
        }
        Ok(())
    }
}

/// Defaults applied to queues and items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefaults {
    /// Claims allowed per item
    pub max_attempts: u32,

    /// Behavior when a queue is empty
    pub empty_behavior: EmptyBehavior,

    /// Whether agents may steal from other queues
    pub stealing_enabled: bool,

    /// Stealing preference weight
    pub priority: u32,
}

impl QueueDefaults {
    /// Queue description with these defaults applied.
    pub fn spec(&self, name: impl Into<String>, task_id: TaskId) -> QueueSpec {
        QueueSpec::new(name, task_id)
            .with_empty_behavior(self.empty_behavior)
            .with_stealing(self.stealing_enabled)
            .with_priority(self.priority)
    }
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            empty_behavior: EmptyBehavior::Idle,
            stealing_enabled: false,
            priority: 0,
        }
    }
}

/// Per-agent limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Lifetime token budget of one agent
    pub token_budget: u64,

    /// Tokens reserved per operation unless the item overrides it
    pub operation_tokens: u64,

    /// Executor timeout
    pub operation_timeout_ms: u64,

    /// Delay before re-polling an empty queue
    pub idle_backoff_ms: u64,

    /// Reaps within the window that retire an agent
    pub reap_threshold: usize,

    /// Sliding window for counting reaps
    pub reap_window_ms: u64,
}

impl AgentConfig {
    /// Executor timeout as a duration.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Idle backoff as a duration.
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    /// Reap window as a duration.
    pub fn reap_window(&self) -> Duration {
        Duration::from_millis(self.reap_window_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token_budget: 100_000,
            operation_tokens: 4_000,
            operation_timeout_ms: 120_000,
            idle_backoff_ms: 500,
            reap_threshold: 3,
            reap_window_ms: 600_000,
        }
    }
}

/// Priority given to an item taken from another queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StolenPriority {
    /// Keep the priority of the queue it came from
    #[default]
    Original,
    /// Take the priority of the stealing agent's home queue
    Inherit,
}

/// Pool sizing and aggregate limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Agents kept alive even without work
    pub min_agents: usize,

    /// Upper bound on agents
    pub max_agents: usize,

    /// Aggregate token budget of all agents
    pub token_budget: u64,

    /// Pending items per agent before scaling up
    pub scale_up_backlog: usize,

    /// Supervisor decision interval
    pub tick_ms: u64,

    /// Priority policy for stolen items
    pub stolen_priority: StolenPriority,
}

impl PoolConfig {
    /// Tick interval as a duration.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_agents: 1,
            max_agents: 4,
            token_budget: 1_000_000,
            scale_up_backlog: 2,
            tick_ms: 250,
            stolen_priority: StolenPriority::Original,
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: usize,

    /// Window the failures must fall into
    pub window_ms: u64,

    /// Time the breaker stays open
    pub cooldown_ms: u64,
}

impl CircuitConfig {
    /// Failure window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Cooldown as a duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_ms: 5 * 60 * 1000,
            cooldown_ms: 60 * 1000,
        }
    }
}

/// Command the CLI runs as the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program to run
    pub program: String,

    /// Arguments
    pub args: Vec<String>,
}
