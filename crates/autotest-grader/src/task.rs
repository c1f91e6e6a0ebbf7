// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Grading task - the input of one run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The push that triggered grading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushInfo {
    /// Ref that was pushed.
    pub branch: String,
    /// Repository name.
    pub repo: String,
    /// Commit SHA.
    #[serde(rename = "commitSHA")]
    pub commit_sha: String,
    /// Full URL of the commit.
    #[serde(rename = "commitURL")]
    pub commit_url: String,
    /// Organization name.
    pub org: String,
    /// Full URL of the project.
    #[serde(rename = "projectURL")]
    pub project_url: String,
    /// Where results are posted back.
    #[serde(rename = "postbackURL")]
    pub postback_url: String,
    /// Push time, milliseconds since the epoch.
    pub timestamp: i64,
}

/// A repository to fetch, optionally with an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Clone URL.
    pub url: String,
    /// Commit or branch to check out.
    #[serde(default)]
    pub reference: Option<String>,
    /// Access token. Accepted on input, never written back out.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

impl SourceSpec {
    /// Clone URL with the token injected as userinfo.
    pub fn authenticated_url(&self) -> String {
        match self.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => self.url.replacen("://", &format!("://{}@", token), 1),
            None => self.url.clone(),
        }
    }
}

/// Container settings for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    /// Grading image.
    pub image: String,
    /// Wall-clock limit in milliseconds; `0` disables it.
    pub timeout_ms: u64,
    /// Maximum transcript length kept, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_size: Option<usize>,
}

/// Everything needed to grade one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingTask {
    /// Deliverable being graded; passed to the container as `ASSIGNMENT`.
    pub deliv_id: String,
    /// Course the deliverable belongs to.
    pub course_id: String,
    /// Triggering push.
    pub push_info: PushInfo,
    /// Student submission, checked out at the pushed commit.
    pub assignment: SourceSpec,
    /// Solution repository, checked out at the deliverable's branch.
    pub solution: SourceSpec,
    /// Container settings.
    pub container: ContainerConfig,
    /// Free-form data.
    #[serde(default)]
    pub custom: Value,
}
