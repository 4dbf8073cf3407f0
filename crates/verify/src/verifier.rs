//! Commitment verifier.

use async_trait::async_trait;
use futures::future::join_all;
use hive_core::{
    Assertion, Commitment, CommitmentResult, CommitmentStatus, ItemId, ItemStatus, Verdict,
    WorkItem,
};
use hive_tools::{CommandRunner, CommandSpec, ProcessRunner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::parser;

/// Produces a verdict for an item in `verifying`.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Evaluate every commitment of `item` against its recorded output.
    async fn verify(&self, item: &WorkItem) -> Verdict;
}

/// Evaluates commitment assertions, running all of them concurrently.
#[derive(Clone)]
pub struct CommitmentVerifier {
    runner: Arc<dyn CommandRunner>,
    work_dir: Option<PathBuf>,
}

impl Default for CommitmentVerifier {
    fn default() -> Self {
        Self::new(Arc::new(ProcessRunner::new()))
    }
}

impl CommitmentVerifier {
    /// Create a verifier that runs command assertions with `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            work_dir: None,
        }
    }

    /// Directory for command assertions and relative `file_exists` paths.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Verify arbitrary output against a list of commitments.
    ///
    /// Every commitment is evaluated; one failing does not stop the others.
    pub async fn verify_output(
        &self,
        item_id: ItemId,
        commitments: &[Commitment],
        output: &str,
    ) -> Verdict {
        let checks = commitments
            .iter()
            .enumerate()
            .map(|(index, commitment)| self.check(index, commitment, output));
        let results = join_all(checks).await;

        let verdict = Verdict { item_id, results };
        if verdict.passed() {
            tracing::debug!(item = %item_id, commitments = commitments.len(), "verification passed");
        } else {
            tracing::debug!(item = %item_id, failures = %verdict.failure_summary(), "verification failed");
        }
        verdict
    }

    /// Evaluate a single commitment.
    pub async fn check(&self, index: usize, commitment: &Commitment, output: &str) -> CommitmentResult {
        let start = Instant::now();
        let outcome = match &commitment.assertion {
            Assertion::Contains { text } => parser::contains(output, text).map(|_| ()),
            Assertion::NotContains { text } => parser::not_contains(output, text).map(|_| ()),
            Assertion::Matches { pattern } => parser::regex(output, pattern).map(|_| ()),
            Assertion::JsonPath { path, condition } => {
                parser::json_path(output, path).and_then(|values| {
                    if parser::evaluate_condition(condition, &values) {
                        Ok(())
                    } else {
                        Err(format!(
                            "condition '{}' not met (value = {})",
                            condition,
                            values.get("value").unwrap_or("?")
                        ))
                    }
                })
            }
            Assertion::Command { program, args, expected_exit_code, timeout_ms } => {
                self.run_command(program, args, *expected_exit_code, *timeout_ms, output).await
            }
            Assertion::FileExists { path } => self.file_exists(path).await,
        };

        let (status, detail) = match outcome {
            Ok(()) => (CommitmentStatus::Passed, None),
            Err(detail) => (CommitmentStatus::Failed, Some(detail)),
        };
        CommitmentResult {
            index,
            description: commitment.description.clone(),
            status,
            detail,
            duration: start.elapsed(),
        }
    }

    async fn run_command(
        &self,
        program: &str,
        args: &[String],
        expected: Option<i32>,
        timeout_ms: u64,
        output: &str,
    ) -> Result<(), String> {
        let mut spec = CommandSpec::new(program)
            .args(args.iter().cloned())
            .stdin(output)
            .timeout(Duration::from_millis(timeout_ms));
        spec.work_dir = self.work_dir.clone();

        let expected = expected.unwrap_or(0);
        match self.runner.run(&spec).await {
            Ok(result) if result.exit_code == expected => Ok(()),
            Ok(result) => {
                let stderr = result.stderr.trim();
                Err(if stderr.is_empty() {
                    format!("exit code {} (expected {})", result.exit_code, expected)
                } else {
                    format!("exit code {} (expected {}): {}", result.exit_code, expected, stderr)
                })
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn file_exists(&self, path: &str) -> Result<(), String> {
        let mut full = PathBuf::from(path);
        if full.is_relative() {
            if let Some(dir) = &self.work_dir {
                full = dir.join(full);
            }
        }
        match tokio::fs::try_exists(&full).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!("{} does not exist", full.display())),
            Err(e) => Err(format!("cannot check {}: {}", full.display(), e)),
        }
    }
}

#[async_trait]
impl Verifier for CommitmentVerifier {
    async fn verify(&self, item: &WorkItem) -> Verdict {
        if item.status != ItemStatus::Verifying {
            tracing::warn!(item = %item.id, status = %item.status, "verify called outside verifying");
            let results = item
                .commitments
                .iter()
                .enumerate()
                .map(|(index, c)| CommitmentResult {
                    index,
                    description: c.description.clone(),
                    status: CommitmentStatus::Failed,
                    detail: Some(format!("item is {}, not verifying", item.status)),
                    duration: Duration::ZERO,
                })
                .collect();
            return Verdict { item_id: item.id, results };
        }
        let output = item.output.as_deref().unwrap_or_default();
        self.verify_output(item.id, &item.commitments, output).await
    }
}
