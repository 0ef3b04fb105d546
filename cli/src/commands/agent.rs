// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};

use stackpilot_core::domain::runtime::LogOptions;

use super::{print_logs, Target};

#[derive(Subcommand)]
pub enum AgentCommand {
    /// List declared agents
    List,

    /// Start an agent container
    Start {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Stop an agent container
    Stop {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Print the logs of an agent
    Logs {
        #[arg(value_name = "NAME")]
        name: String,

        /// Number of lines from the end
        #[arg(short = 'n', long)]
        lines: Option<u32>,

        /// Follow log output
        #[arg(short, long)]
        follow: bool,

        /// Only logs newer than a duration (10m) or timestamp
        #[arg(long)]
        since: Option<String>,
    },
}

pub async fn handle_command(command: AgentCommand, target: &Target) -> Result<()> {
    let client = target.client()?;
    match command {
        AgentCommand::List => {
            let agents: Vec<Value> = client.get("/agents").await?;
            if agents.is_empty() {
                println!("No agents declared.");
                return Ok(());
            }
            for agent in agents {
                let status = agent["status"].as_str().unwrap_or("unknown");
                let status = if status == "running" {
                    status.green()
                } else {
                    status.dimmed()
                };
                println!(
                    "{} [{}] {}",
                    agent["name"].as_str().unwrap_or_default().bold(),
                    status,
                    agent["image"].as_str().unwrap_or_default().dimmed()
                );
                if let Some(role) = agent["role"].as_str() {
                    println!("    role:   {}", role);
                }
                println!("    skills: {}", joined(&agent["skills"]));
                println!("    tools:  {}", joined(&agent["mcp_servers"]));
            }
        }
        AgentCommand::Start { name } => {
            let _: Value = client
                .post(&format!("/agents/{}/start", name), &json!({}))
                .await?;
            println!("{} agent {} started", "✓".green(), name.bold());
        }
        AgentCommand::Stop { name } => {
            let _: Value = client
                .post(&format!("/agents/{}/stop", name), &json!({}))
                .await?;
            println!("{} agent {} stopped", "✓".green(), name.bold());
        }
        AgentCommand::Logs {
            name,
            lines,
            follow,
            since,
        } => {
            let options = LogOptions {
                lines,
                follow,
                since,
            };
            print_logs(&client, &format!("/agents/{}/logs", name), &options).await?;
        }
    }
    Ok(())
}

fn joined(value: &Value) -> String {
    let items: Vec<&str> = value
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
