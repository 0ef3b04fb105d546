// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the stackpilot CLI

pub mod agent;
pub mod config;
pub mod secret;
pub mod stack;

pub use self::agent::AgentCommand;
pub use self::config::ConfigCommand;
pub use self::secret::SecretCommand;
pub use self::stack::StackCommand;

use anyhow::Result;
use futures::StreamExt;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use stackpilot_core::domain::operator_config::{OperatorConfig, DEFAULT_PORT};
use stackpilot_core::domain::runtime::LogOptions;

use crate::daemon::DaemonClient;

/// Where client commands find the daemon.
#[derive(Debug, Clone)]
pub struct Target {
    pub config: Option<PathBuf>,
    pub host: String,
    pub port: Option<u16>,
    pub api_key: Option<String>,
}

impl Target {
    /// Unset port and API key fall back to the operator configuration.
    pub fn client(&self) -> Result<DaemonClient> {
        let needs_config = self.port.is_none() || self.api_key.is_none();
        let config = if needs_config {
            OperatorConfig::load_or_default(self.config.clone()).ok()
        } else {
            None
        };
        let port = self
            .port
            .or_else(|| config.as_ref().map(|c| c.port))
            .unwrap_or(DEFAULT_PORT);
        let api_key = match &self.api_key {
            Some(key) => Some(key.clone()),
            None => config.and_then(|c| c.resolved_api_key().ok().flatten()),
        };
        DaemonClient::new(&self.host, port, api_key)
    }
}

/// Copy a daemon log stream to stdout until it ends.
pub(crate) async fn print_logs(client: &DaemonClient, path: &str, options: &LogOptions) -> Result<()> {
    let mut stream = Box::pin(client.logs(path, options).await?);
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.next().await {
        stdout.write_all(&chunk?).await?;
        stdout.flush().await?;
    }
    Ok(())
}
