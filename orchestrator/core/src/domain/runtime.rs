// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::domain::runtime_spec::ComposeFile;
use crate::domain::stack::ServiceKind;

/// Name-level difference between desired and running services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub add: Vec<String>,
    pub update: Vec<String>,
    pub remove: Vec<String>,
}

impl ChangeSet {
    /// `add = desired - running`, `update = desired ∩ running`, `remove = running - desired`.
    pub fn between<'a>(
        desired: impl IntoIterator<Item = &'a str>,
        running: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let desired: BTreeSet<&str> = desired.into_iter().collect();
        let running: BTreeSet<&str> = running.into_iter().collect();
        Self {
            add: desired.difference(&running).map(|s| s.to_string()).collect(),
            update: desired.intersection(&running).map(|s| s.to_string()).collect(),
            remove: running.difference(&desired).map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

/// Outcome of an apply, derived from runtime status before and after.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub services_started: Vec<String>,
    pub services_updated: Vec<String>,
    pub services_removed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ApplyResult {
    pub fn from_transition<'a>(
        before: impl IntoIterator<Item = &'a str>,
        after: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let before: BTreeSet<&str> = before.into_iter().collect();
        let after: BTreeSet<&str> = after.into_iter().collect();
        Self {
            services_started: after.difference(&before).map(|s| s.to_string()).collect(),
            services_updated: after.intersection(&before).map(|s| s.to_string()).collect(),
            services_removed: before.difference(&after).map(|s| s.to_string()).collect(),
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
    Error,
    Starting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLabel {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub kind: ServiceKind,
    pub status: RunState,
    pub health: HealthLabel,
    pub replicas_running: u32,
    pub replicas_desired: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<u32>,
    #[serde(default)]
    pub follow: bool,
    /// Passed through to the runtime (`10m`, RFC 3339 timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

/// Raw log bytes; dropping the stream terminates the producer.
pub type LogStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime command failed: {0}")]
    CommandFailed(String),
    #[error("unexpected runtime output: {0}")]
    Parse(String),
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pluggable container runtime.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    async fn diff(&self, desired: &ComposeFile) -> Result<ChangeSet, RuntimeError>;

    /// Converge the runtime onto `desired`. A failing runtime command is
    /// reported as a warning on the result, not as an error.
    async fn apply(&self, desired: &ComposeFile) -> Result<ApplyResult, RuntimeError>;

    /// Empty when nothing was deployed yet.
    async fn status(&self) -> Result<Vec<ServiceStatus>, RuntimeError>;

    async fn logs(&self, service: &str, options: &LogOptions) -> Result<LogStream, RuntimeError>;

    async fn scale(&self, service: &str, replicas: u32) -> Result<(), RuntimeError>;

    async fn start(&self, services: &[String]) -> Result<(), RuntimeError>;

    async fn stop(&self, services: &[String]) -> Result<(), RuntimeError>;

    async fn down(&self) -> Result<(), RuntimeError>;
}
