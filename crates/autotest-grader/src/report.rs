// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Grade report and run output records.
//!
//! The container writes a [`GradeReport`] to `/archive/report.json`. The
//! grader wraps it in a [`ContainerOutput`], and the output together with the
//! task forms the [`CommitRecord`] persisted for every run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::task::GradingTask;

/// Feedback when the grader itself failed.
pub const GENERIC_FAILURE_FEEDBACK: &str =
    "AutoTest encountered an unexpected error. Please make a new commit and try again.";
/// Feedback when the run hit its time limit.
pub const TIMEOUT_FEEDBACK: &str =
    "Grading of this commit was forcibly terminated after exceeding alloted time.";
/// Feedback when no usable report was produced.
pub const INVALID_REPORT_FEEDBACK: &str = "Failed to read grade report.";
/// Feedback when the service could not handle the task at all.
pub const INTERNAL_ERROR_FEEDBACK: &str =
    "Internal error: The grading service failed to handle the request.";

/// Errors from reading a grade report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReportError {
    /// No report file was written.
    #[error("Report not found: {0}")]
    Missing(PathBuf),

    /// Reading the report failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The report is not valid JSON of the expected shape.
    #[error("Malformed report: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The report parsed but breaks an invariant.
    #[error("Invalid report: {0}")]
    Invalid(String),
}

/// A file attached to the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name.
    pub name: String,
    /// Encoded content.
    pub data: String,
    /// MIME type.
    pub content_type: String,
}

/// Report produced by the grading image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeReport {
    /// Overall score.
    pub score_overall: f64,
    /// Test score. `null` when the image does not report one.
    #[serde(default)]
    pub score_test: Option<f64>,
    /// Coverage score, when measured.
    #[serde(default)]
    pub score_cover: Option<f64>,
    /// Tests that passed.
    pub pass_names: Vec<String>,
    /// Tests that failed.
    pub fail_names: Vec<String>,
    /// Tests that errored.
    pub error_names: Vec<String>,
    /// Tests that were skipped.
    pub skip_names: Vec<String>,
    /// Image-specific data.
    #[serde(default)]
    pub custom: Value,
    /// Markdown feedback for the student.
    pub feedback: String,
    /// Optional attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl GradeReport {
    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ReportError> {
        for (name, score) in [
            ("scoreOverall", Some(self.score_overall)),
            ("scoreTest", self.score_test),
            ("scoreCover", self.score_cover),
        ] {
            if let Some(score) = score
                && !score.is_finite()
            {
                return Err(ReportError::Invalid(format!("{} is not a finite number", name)));
            }
        }

        let mut seen = HashSet::new();
        for test in self
            .pass_names
            .iter()
            .chain(&self.fail_names)
            .chain(&self.error_names)
            .chain(&self.skip_names)
        {
            if !seen.insert(test.as_str()) {
                return Err(ReportError::Invalid(format!(
                    "test {:?} appears in more than one outcome list",
                    test
                )));
            }
        }
        Ok(())
    }

    /// Read and validate the report at `path`.
    pub async fn load(path: &Path) -> Result<Self, ReportError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReportError::Missing(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let report: GradeReport = serde_json::from_slice(&bytes)?;
        report.validate()?;
        Ok(report)
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    /// A valid report was produced.
    Success,
    /// The run exceeded its time limit and left no valid report.
    Timeout,
    /// The run finished without a valid report.
    InvalidReport,
    /// The grader could not run the container.
    Fail,
}

impl ContainerState {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Success => "SUCCESS",
            ContainerState::Timeout => "TIMEOUT",
            ContainerState::InvalidReport => "INVALID_REPORT",
            ContainerState::Fail => "FAIL",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of grading one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    /// Commit graded.
    pub commit_url: String,
    /// Completion time, milliseconds since the epoch.
    pub timestamp: i64,
    /// The report, when one was read.
    pub report: Option<GradeReport>,
    /// Markdown feedback.
    pub feedback: Option<String>,
    /// Whether the caller still has to post feedback.
    pub postback_on_complete: bool,
    /// Free-form data.
    pub custom: Value,
    /// Attachments.
    pub attachments: Vec<Attachment>,
    /// Terminal state.
    pub state: ContainerState,
}

impl ContainerOutput {
    /// Initial output: `FAIL` until proven otherwise.
    pub fn new(commit_url: impl Into<String>) -> Self {
        Self {
            commit_url: commit_url.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            report: None,
            feedback: None,
            postback_on_complete: true,
            custom: Value::Object(Default::default()),
            attachments: Vec::new(),
            state: ContainerState::Fail,
        }
    }
}

/// Persisted record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    /// Commit graded.
    pub commit_url: String,
    /// Commit SHA.
    pub commit_sha: String,
    /// Task as received (credentials stripped).
    pub input: GradingTask,
    /// Outcome.
    pub output: ContainerOutput,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report_json() -> Value {
        json!({
            "scoreOverall": 50,
            "scoreTest": 50,
            "scoreCover": null,
            "passNames": ["a"],
            "failNames": ["b"],
            "errorNames": [],
            "skipNames": [],
            "custom": {},
            "feedback": "Test execution complete."
        })
    }

    #[test]
    fn test_parse_report() {
        let report: GradeReport = serde_json::from_value(report_json()).unwrap();
        assert_eq!(report.score_overall, 50.0);
        assert_eq!(report.score_cover, None);
        assert!(report.validate().is_ok());
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut value = report_json();
        value.as_object_mut().unwrap().remove("feedback");
        assert!(serde_json::from_value::<GradeReport>(value).is_err());
    }

    #[tokio::test]
    async fn test_load_accepts_null_test_score() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut value = report_json();
        value["scoreTest"] = Value::Null;
        std::fs::write(&path, value.to_string()).unwrap();

        let report = GradeReport::load(&path).await.unwrap();
        assert_eq!(report.score_test, None);
        assert_eq!(report.score_overall, 50.0);

        value.as_object_mut().unwrap().remove("scoreTest");
        let report: GradeReport = serde_json::from_value(value).unwrap();
        assert_eq!(report.score_test, None);
    }

    #[test]
    fn test_overlapping_names_rejected() {
        let mut value = report_json();
        value["skipNames"] = json!(["a"]);
        let report: GradeReport = serde_json::from_value(value).unwrap();
        assert!(matches!(report.validate(), Err(ReportError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_load_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        assert!(matches!(
            GradeReport::load(&path).await,
            Err(ReportError::Missing(_))
        ));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            GradeReport::load(&path).await,
            Err(ReportError::Malformed(_))
        ));

        std::fs::write(&path, report_json().to_string()).unwrap();
        assert!(GradeReport::load(&path).await.is_ok());
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(
            serde_json::to_value(ContainerState::InvalidReport).unwrap(),
            json!("INVALID_REPORT")
        );
        assert_eq!(ContainerState::Timeout.to_string(), "TIMEOUT");
    }

    #[test]
    fn test_output_defaults() {
        let out = ContainerOutput::new("https://example.com/commit/1");
        assert_eq!(out.state, ContainerState::Fail);
        assert!(out.postback_on_complete);
        let value = serde_json::to_value(&out).unwrap();
        assert!(value.get("postbackOnComplete").is_some());
        assert!(value.get("commitUrl").is_some());
    }
}
