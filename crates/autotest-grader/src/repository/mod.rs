// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source-control fetch.
//!
//! The grader only needs one capability from source control: materialize a
//! repository at a given reference into a directory.

pub mod git;
pub mod mock;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

use crate::command::CommandError;

pub use git::GitRepository;
pub use mock::{FetchCall, MockRepository};

/// Errors from fetching sources.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepositoryError {
    /// The VCS tool failed.
    #[error("Fetch failed: {0}")]
    Command(#[from] CommandError),

    /// Preparing the target directory failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Fetches a repository snapshot into a local directory.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Clone `url` into `dir` and check out `reference` (commit or branch)
    /// when given. `url` may embed credentials.
    async fn fetch(&self, url: &str, dir: &Path, reference: Option<&str>) -> Result<()>;
}

/// Strip credentials from a URL before it is logged.
pub fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        Ok(_) => url.to_string(),
        Err(_) => "<unparseable url>".to_string(),
    }
}
