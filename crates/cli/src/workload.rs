//! Workload files: queues and the items to put on them.

use std::path::Path;

use anyhow::{Context, Result};
use hive_core::{Commitment, EmptyBehavior, QueueDefaults, QueueSpec, TaskId, WorkerProfile};
use hive_queue::EnqueueRequest;
use serde::Deserialize;

/// A batch of work to run against a pool.
#[derive(Debug, Clone, Deserialize)]
pub struct Workload {
    /// How assignments are framed
    #[serde(default)]
    pub profile: Option<WorkerProfile>,

    /// Queues, each with its items
    pub queues: Vec<QueueWorkload>,
}

/// One queue of a workload. Unset fields take the configured defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueWorkload {
    pub name: String,
    #[serde(default)]
    pub empty_behavior: Option<EmptyBehavior>,
    #[serde(default)]
    pub stealing_enabled: Option<bool>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub items: Vec<ItemWorkload>,
}

/// One item of a workload.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemWorkload {
    pub assignment: String,
    #[serde(default)]
    pub commitments: Vec<Commitment>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub token_request: Option<u64>,
}

impl Workload {
    /// Load a workload from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workload {}", path.display()))?;
        let workload: Workload = serde_json::from_str(&raw)
            .with_context(|| format!("invalid workload {}", path.display()))?;
        if workload.queues.is_empty() {
            anyhow::bail!("workload {} has no queues", path.display());
        }
        Ok(workload)
    }

    /// Items in file order, across all queues.
    pub fn items(&self) -> impl Iterator<Item = &ItemWorkload> {
        self.queues.iter().flat_map(|q| q.items.iter())
    }
}

impl QueueWorkload {
    /// Queue spec with configured defaults filled in.
    pub fn spec(&self, defaults: &QueueDefaults, task_id: TaskId) -> QueueSpec {
        let mut spec = defaults.spec(self.name.clone(), task_id);
        if let Some(behavior) = self.empty_behavior {
            spec = spec.with_empty_behavior(behavior);
        }
        if let Some(enabled) = self.stealing_enabled {
            spec = spec.with_stealing(enabled);
        }
        if let Some(priority) = self.priority {
            spec = spec.with_priority(priority);
        }
        spec
    }
}

impl ItemWorkload {
    /// Enqueue request for this item.
    pub fn request(&self, profile: Option<&WorkerProfile>) -> EnqueueRequest {
        let mut request = EnqueueRequest::new(self.assignment.clone()).commitments(self.commitments.iter().cloned());
        if let Some(profile) = profile {
            request = request.with_profile(profile);
        }
        if let Some(max_attempts) = self.max_attempts {
            request = request.max_attempts(max_attempts);
        }
        if let Some(tokens) = self.token_request {
            request = request.token_request(tokens);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::Assertion;
    use std::io::Write;

    const WORKLOAD: &str = r#"{
        "queues": [
            {
                "name": "docs",
                "priority": 5,
                "items": [
                    {
                        "assignment": "summarize the changelog",
                        "max_attempts": 2,
                        "commitments": [
                            {"description": "mentions release", "assertion": {"kind": "contains", "text": "release"}}
                        ]
                    },
                    {"assignment": "list contributors"}
                ]
            },
            {"name": "helpers", "empty_behavior": "steal_from_others", "stealing_enabled": true}
        ]
    }"#;

    fn load(raw: &str) -> Result<Workload> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(raw.as_bytes())?;
        Workload::from_file(file.path())
    }

    #[test]
    fn test_load_workload() {
        let workload = load(WORKLOAD).unwrap();
        assert_eq!(workload.queues.len(), 2);
        assert_eq!(workload.items().count(), 2);

        let first = &workload.queues[0].items[0];
        assert_eq!(first.max_attempts, Some(2));
        assert_eq!(
            first.commitments[0].assertion,
            Assertion::Contains { text: "release".into() }
        );
    }

    #[test]
    fn test_queue_overrides_defaults() {
        let workload = load(WORKLOAD).unwrap();
        let defaults = QueueDefaults::default();

        let docs = workload.queues[0].spec(&defaults, TaskId::new());
        assert_eq!(docs.priority, 5);
        assert_eq!(docs.empty_behavior, defaults.empty_behavior);

        let helpers = workload.queues[1].spec(&defaults, TaskId::new());
        assert_eq!(helpers.empty_behavior, EmptyBehavior::StealFromOthers);
        assert!(helpers.stealing_enabled);
        assert_eq!(helpers.priority, defaults.priority);
    }

    #[test]
    fn test_request_carries_item_settings() {
        let workload = load(WORKLOAD).unwrap();
        let request = workload.queues[0].items[0].request(None);
        assert_eq!(request.assignment, "summarize the changelog");
        assert_eq!(request.max_attempts, Some(2));
        assert_eq!(request.commitments.len(), 1);
    }

    #[test]
    fn test_empty_workload_rejected() {
        let err = load(r#"{"queues": []}"#).unwrap_err();
        assert!(err.to_string().contains("no queues"));
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = Workload::from_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read workload"));
    }
}
