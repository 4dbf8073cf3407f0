//! Command runner abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Errors raised while running a command.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The program could not be started
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Program that failed
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The program ran past its timeout and was killed
    #[error("'{program}' timed out after {timeout:?}")]
    Timeout {
        /// Program that timed out
        program: String,
        /// Configured limit
        timeout: Duration,
    },

    /// Reading output or writing stdin failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs commands described by a [`CommandSpec`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError>;
}

/// A process invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,

    /// Command arguments
    pub args: Vec<String>,

    /// Environment variables
    pub env: HashMap<String, String>,

    /// Standard input
    pub stdin: Option<String>,

    /// Timeout
    pub timeout: Option<Duration>,

    /// Working directory
    pub work_dir: Option<std::path::PathBuf>,
}

impl CommandSpec {
    /// Create a spec for a program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Feed text on stdin.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Kill the process after this long.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Output from a finished command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal)
    pub exit_code: i32,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Execution duration
    pub duration: Duration,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, for parsing.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "cat"])
            .env("MODE", "check")
            .stdin("hello")
            .timeout(Duration::from_secs(2));
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "cat"]);
        assert_eq!(spec.env.get("MODE").map(String::as_str), Some("check"));
        assert_eq!(spec.stdin.as_deref(), Some("hello"));
        assert_eq!(spec.timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_combined_output() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: "out".into(),
            stderr: "err".into(),
            duration: Duration::ZERO,
        };
        assert!(!output.success());
        assert_eq!(output.combined(), "out\nerr");
    }
}
