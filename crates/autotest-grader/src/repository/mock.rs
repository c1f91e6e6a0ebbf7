// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock repository for testing.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{Repository, RepositoryError, Result};

/// A recorded fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    /// Requested URL.
    pub url: String,
    /// Target directory.
    pub dir: PathBuf,
    /// Requested reference.
    pub reference: Option<String>,
}

/// Repository that writes a marker file instead of cloning.
#[derive(Debug, Default)]
pub struct MockRepository {
    calls: Mutex<Vec<FetchCall>>,
    /// If true, every fetch fails.
    pub fail_by_default: bool,
}

impl MockRepository {
    /// Repository whose fetches succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository whose fetches fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::default()
        }
    }

    /// Fetches made so far.
    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Repository for MockRepository {
    async fn fetch(&self, url: &str, dir: &Path, reference: Option<&str>) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FetchCall {
                url: url.to_string(),
                dir: dir.to_path_buf(),
                reference: reference.map(str::to_string),
            });

        if self.fail_by_default {
            return Err(RepositoryError::Other(format!("Mock fetch failure: {}", url)));
        }

        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join("FETCHED"), reference.unwrap_or("HEAD")).await?;
        Ok(())
    }
}
