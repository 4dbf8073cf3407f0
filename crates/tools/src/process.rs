//! Local process runner.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::runner::{CommandOutput, CommandRunner, CommandSpec, ToolError};

/// Runs commands as local child processes.
///
/// The child is killed when its timeout elapses or when the future running it
/// is dropped, so a cancelled caller never leaves a stray process behind.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError> {
        let start = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe.
        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!("stdin closed early: {}", e);
                }
            });
        }

        let wait = child.wait_with_output();
        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!(program = %spec.program, ?limit, "command timed out");
                    return Err(ToolError::Timeout {
                        program: spec.program.clone(),
                        timeout: limit,
                    });
                }
            },
            None => wait.await?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_command_with_stdin() {
        let spec = CommandSpec::new("sh").args(["-c", "tr a-z A-Z"]).stdin("hello");
        let output = ProcessRunner::new().run(&spec).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "HELLO");
    }

    #[tokio::test]
    async fn test_reports_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]);
        let output = ProcessRunner::new().run(&spec).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_passes_environment() {
        let spec = CommandSpec::new("sh").args(["-c", "printf %s \"$GREETING\""]).env("GREETING", "hi");
        let output = ProcessRunner::new().run(&spec).await.unwrap();
        assert_eq!(output.stdout, "hi");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(100));
        let err = ProcessRunner::new().run(&spec).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let spec = CommandSpec::new("definitely-not-a-real-program-hive");
        let err = ProcessRunner::new().run(&spec).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
