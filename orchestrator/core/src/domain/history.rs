// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub date: DateTime<FixedOffset>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackMethod {
    /// New commits undoing everything after the target; history is kept.
    Revert,
    /// History after the target was discarded.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub target: String,
    pub method: RollbackMethod,
    pub head: String,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("unknown revision '{0}'")]
    UnknownRevision(String),
    #[error("version control command failed: {0}")]
    CommandFailed(String),
    #[error("unexpected version control output: {0}")]
    Parse(String),
}

/// Version control over the stack root.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create the repository if missing. Idempotent.
    async fn init(&self) -> Result<(), HistoryError>;

    /// Stage `paths` and commit them. `None` when nothing changed.
    async fn commit(&self, paths: &[PathBuf], message: &str)
        -> Result<Option<String>, HistoryError>;

    /// Newest first.
    async fn log(&self, limit: usize) -> Result<Vec<CommitInfo>, HistoryError>;

    /// Full sha of `revision` (sha, `HEAD~1`, tag).
    async fn resolve(&self, revision: &str) -> Result<String, HistoryError>;

    async fn rollback(&self, target: &str) -> Result<RollbackOutcome, HistoryError>;
}
