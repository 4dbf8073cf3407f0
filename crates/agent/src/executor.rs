//! Executor seam.

use async_trait::async_trait;
use hive_bulkhead::Metered;
use hive_tools::{CommandRunner, CommandSpec, ProcessRunner, ToolError};
use std::sync::Arc;

/// Environment variable carrying the token budget for a command executor.
pub const TOKEN_BUDGET_ENV: &str = "HIVE_TOKEN_BUDGET";

/// Output line prefix a command executor may use to report consumption.
pub const TOKENS_TRAILER: &str = "hive-tokens:";

/// Successful executor call.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// Text produced
    pub output: String,

    /// Tokens the call consumed
    pub tokens_consumed: u64,
}

impl Metered for Execution {
    fn tokens(&self) -> u64 {
        self.tokens_consumed
    }
}

/// Failed executor call.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor ran and reported failure
    #[error("{message}")]
    Failed {
        /// What went wrong
        message: String,
        /// Tokens consumed before failing
        tokens_consumed: u64,
    },

    /// The executor could not be run
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl ExecutorError {
    /// Failure without consumption.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            tokens_consumed: 0,
        }
    }
}

impl Metered for ExecutorError {
    fn tokens(&self) -> u64 {
        match self {
            Self::Failed { tokens_consumed, .. } => *tokens_consumed,
            Self::Tool(_) => 0,
        }
    }
}

/// The external, non-deterministic worker (typically an LLM client).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a prompt within `budget` tokens.
    async fn execute(&self, prompt: &str, budget: u64) -> Result<Execution, ExecutorError>;
}

/// Runs a configured program with the prompt on stdin.
///
/// The budget is passed in `HIVE_TOKEN_BUDGET`. If the last stdout line is
/// `hive-tokens: N` it is stripped and used as the consumption; otherwise
/// consumption is estimated at one token per four bytes of output.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    runner: Arc<dyn CommandRunner>,
}

impl CommandExecutor {
    /// Create an executor for a program.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_runner(program, args, Arc::new(ProcessRunner::new()))
    }

    /// Create an executor with a custom runner.
    pub fn with_runner(program: impl Into<String>, args: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            args,
            runner,
        }
    }
}

fn split_tokens(stdout: &str) -> (String, u64) {
    let trimmed = stdout.trim_end();
    let (body, last) = trimmed.rsplit_once('\n').unwrap_or(("", trimmed));
    let reported = last
        .trim()
        .strip_prefix(TOKENS_TRAILER)
        .and_then(|count| count.trim().parse().ok());
    match reported {
        Some(tokens) => (body.to_string(), tokens),
        None => (stdout.to_string(), estimate_tokens(stdout)),
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, prompt: &str, budget: u64) -> Result<Execution, ExecutorError> {
        let spec = CommandSpec::new(&self.program)
            .args(self.args.iter().cloned())
            .env(TOKEN_BUDGET_ENV, budget.to_string())
            .stdin(prompt);

        let result = self.runner.run(&spec).await?;
        let (output, tokens_consumed) = split_tokens(&result.stdout);
        if result.success() {
            Ok(Execution { output, tokens_consumed })
        } else {
            let stderr = result.stderr.trim();
            Err(ExecutorError::Failed {
                message: if stderr.is_empty() {
                    format!("{} exited with {}", self.program, result.exit_code)
                } else {
                    format!("{} exited with {}: {}", self.program, result.exit_code, stderr)
                },
                tokens_consumed,
            })
        }
    }
}
