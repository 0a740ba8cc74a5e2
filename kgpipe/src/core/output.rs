//! Tagged stage output consumed by the orchestrator loop.

use super::StageStatus;
use crate::errors::StageFailure;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The output of a stage execution.
///
/// Outputs are built through the factory methods so that the status and the
/// status-specific fields always agree: a failed output always carries a
/// [`StageFailure`], a cancelled output always carries a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the stage execution.
    pub status: StageStatus,

    /// Facts the stage reports about its work (paths, digests, endpoints).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,

    /// Exit code of the stage process, when one was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Process id of a long-running stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Typed failure (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,

    /// Cancel reason (for cancelled executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl StageOutput {
    fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            data: HashMap::new(),
            exit_code: None,
            pid: None,
            failure: None,
            cancel_reason: None,
        }
    }

    /// Creates a successful output with data.
    #[must_use]
    pub fn ok(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data,
            ..Self::with_status(StageStatus::Succeeded)
        }
    }

    /// Creates a successful output with no data.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self::with_status(StageStatus::Succeeded)
    }

    /// Creates an output for a long-running stage that is serving.
    #[must_use]
    pub fn up(pid: Option<u32>, endpoint: impl Into<String>) -> Self {
        let mut output = Self::with_status(StageStatus::Up);
        output.pid = pid;
        output
            .data
            .insert("endpoint".to_string(), serde_json::json!(endpoint.into()));
        output
    }

    /// Creates a failure output.
    #[must_use]
    pub fn fail(failure: StageFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::with_status(StageStatus::Failed)
        }
    }

    /// Creates a cancel output with a reason.
    #[must_use]
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            cancel_reason: Some(reason.into()),
            ..Self::with_status(StageStatus::Cancelled)
        }
    }

    /// Records the observed process exit code.
    #[must_use]
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Adds a single data entry.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Gets a value from the output data.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Returns true if the output allows downstream stages to run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the output indicates failure or cancellation.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;

    #[test]
    fn test_ok_output() {
        let output = StageOutput::ok_empty().add_data("files", serde_json::json!(3));

        assert!(output.is_success());
        assert_eq!(output.get("files"), Some(&serde_json::json!(3)));
        assert!(output.failure.is_none());
    }

    #[test]
    fn test_up_output_carries_endpoint() {
        let output = StageOutput::up(Some(4242), "127.0.0.1:7474");

        assert_eq!(output.status, StageStatus::Up);
        assert!(output.is_success());
        assert_eq!(output.pid, Some(4242));
        assert_eq!(output.get("endpoint"), Some(&serde_json::json!("127.0.0.1:7474")));
    }

    #[test]
    fn test_fail_output() {
        let output = StageOutput::fail(StageFailure::load("syntax error")).with_exit_code(Some(2));

        assert!(output.is_failure());
        assert_eq!(output.exit_code, Some(2));
        assert_eq!(output.failure.unwrap().kind, FailureKind::LoadFailure);
    }

    #[test]
    fn test_cancel_output() {
        let output = StageOutput::cancel("interrupted");

        assert!(output.is_failure());
        assert_eq!(output.cancel_reason.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let json = serde_json::to_value(StageOutput::ok_empty()).unwrap();

        assert_eq!(json, serde_json::json!({ "status": "succeeded" }));
    }
}
