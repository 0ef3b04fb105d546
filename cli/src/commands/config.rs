// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stack spec and operator configuration commands
//!
//! Commands: show, apply, validate, compile, operator

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::Value;
use std::path::PathBuf;

use stackpilot_core::application::{compile, CompileOptions};
use stackpilot_core::domain::operator_config::OperatorConfig;
use stackpilot_core::domain::stack::StackSpec;
use stackpilot_core::infrastructure::{SpecStore, SpecStoreError};

use super::Target;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the stack spec the daemon holds
    Show,

    /// Validate, save and commit a stack spec through the daemon
    Apply {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Validate a stack spec locally (default: the configured spec with overlay)
    Validate {
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Print the compose manifest a stack spec compiles to, without deploying
    Compile {
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Print the effective operator configuration
    Operator,
}

pub async fn handle_command(command: ConfigCommand, target: &Target) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let spec: StackSpec = target.client()?.get("/config").await?;
            print!("{}", serde_yaml::to_string(&spec)?);
        }
        ConfigCommand::Apply { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let spec: StackSpec = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let update: Value = target.client()?.post("/config", &spec).await?;
            match update["commit"].as_str() {
                Some(sha) => println!("{} stack spec saved as {}", "✓".green(), sha),
                None => println!("{} stack spec unchanged", "✓".green()),
            }
        }
        ConfigCommand::Validate { file } => {
            let config = operator_config(target)?;
            match load_local(&config, file).await {
                Ok(spec) => println!(
                    "{} '{}' is valid ({} services, {} agents, {} mcp servers)",
                    "✓".green(),
                    spec.name,
                    spec.services.len(),
                    spec.agents.len(),
                    spec.mcp_servers.len()
                ),
                Err(SpecStoreError::Invalid(errors)) => {
                    println!("{} {}", "✗".red(), errors);
                    for message in errors.messages() {
                        println!("  - {}", message);
                    }
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        ConfigCommand::Compile { file } => {
            let config = operator_config(target)?;
            let spec = load_local(&config, file).await?;
            let project = config.project.clone().unwrap_or_else(|| spec.name.clone());
            let options = CompileOptions {
                project,
                root: config.root.clone(),
                cert_resolver: config.cert_resolver.clone(),
            };
            let manifest = compile(&spec, &options)?;
            print!("{}", manifest.to_yaml()?);
        }
        ConfigCommand::Operator => {
            let mut config = operator_config(target)?;
            if config.api_key.is_some() {
                config.api_key = Some("<redacted>".to_string());
            }
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }
    Ok(())
}

fn operator_config(target: &Target) -> Result<OperatorConfig> {
    OperatorConfig::load_or_default(target.config.clone()).context("Failed to load configuration")
}

async fn load_local(
    config: &OperatorConfig,
    file: Option<PathBuf>,
) -> Result<StackSpec, SpecStoreError> {
    let store = match file {
        Some(file) => SpecStore::new(file, None),
        None => SpecStore::new(config.spec_path(), config.overlay_path()),
    };
    store.load_validated().await
}
