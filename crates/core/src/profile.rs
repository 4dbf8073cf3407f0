//! Worker profiles - worker "flavors" expressed as data.

use serde::{Deserialize, Serialize};
use crate::item::Commitment;

/// Placeholder replaced by the item's assignment.
pub const ASSIGNMENT_PLACEHOLDER: &str = "{assignment}";

/// Configuration that distinguishes one kind of worker from another.
///
/// Every agent runs the same state machine; a profile only changes how the
/// assignment is framed and which commitments are attached by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    /// Profile name (e.g. "reviewer")
    pub name: String,

    /// Template wrapped around each assignment
    #[serde(default = "default_template")]
    pub template: String,

    /// Commitments appended to every item enqueued with this profile
    #[serde(default)]
    pub default_commitments: Vec<Commitment>,
}

fn default_template() -> String {
    ASSIGNMENT_PLACEHOLDER.to_string()
}

impl WorkerProfile {
    /// Profile that passes assignments through unchanged.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: default_template(),
            default_commitments: Vec::new(),
        }
    }

    /// Set the template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Add a default commitment.
    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.default_commitments.push(commitment);
        self
    }

    /// Frame an assignment with the template.
    pub fn render(&self, assignment: &str) -> String {
        if self.template.contains(ASSIGNMENT_PLACEHOLDER) {
            self.template.replace(ASSIGNMENT_PLACEHOLDER, assignment)
        } else {
            format!("{}\n\n{}", self.template, assignment)
        }
    }
}

impl Default for WorkerProfile {
    fn default() -> Self {
        Self::plain("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Assertion;

    #[test]
    fn test_plain_profile_passes_through() {
        assert_eq!(WorkerProfile::default().render("fix bug"), "fix bug");
    }

    #[test]
    fn test_template_substitution() {
        let profile = WorkerProfile::plain("tester").with_template("Write tests for: {assignment}");
        assert_eq!(profile.render("parser"), "Write tests for: parser");
    }

    #[test]
    fn test_template_without_placeholder_appends() {
        let profile = WorkerProfile::plain("reviewer").with_template("Review carefully.");
        assert_eq!(profile.render("diff"), "Review carefully.\n\ndiff");
    }

    #[test]
    fn test_default_commitments() {
        let profile = WorkerProfile::plain("architect").with_commitment(Commitment::new(
            "mentions design",
            Assertion::Contains { text: "design".into() },
        ));
        assert_eq!(profile.default_commitments.len(), 1);
    }
}
