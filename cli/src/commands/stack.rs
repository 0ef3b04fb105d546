// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stack reconciliation commands
//!
//! Commands: status, deploy, plan, rollback, logs, scale, down, history

use anyhow::Result;
use chrono::Local;
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};

use stackpilot_core::domain::history::CommitInfo;
use stackpilot_core::domain::runtime::{ChangeSet, HealthLabel, LogOptions, RunState, ServiceStatus};

use super::{print_logs, Target};

#[derive(Subcommand)]
pub enum StackCommand {
    /// Show run state and health of every workload
    Status,

    /// Compile the stack spec and converge the runtime onto it
    Deploy,

    /// Show what a deploy would add, update and remove
    Plan,

    /// Restore the stack spec of an earlier commit and redeploy
    Rollback {
        /// Commit sha or revision (e.g. HEAD~1)
        #[arg(value_name = "REV")]
        revision: String,
    },

    /// Print the logs of a service
    Logs {
        #[arg(value_name = "SERVICE")]
        service: String,

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

    /// Set the running replica count of a service
    Scale {
        #[arg(value_name = "SERVICE")]
        service: String,

        #[arg(value_name = "REPLICAS")]
        replicas: u32,
    },

    /// Stop and remove every container of the stack
    Down,

    /// Show the commit history of the stack spec
    History {
        /// Number of commits
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

pub async fn handle_command(command: StackCommand, target: &Target) -> Result<()> {
    let client = target.client()?;
    match command {
        StackCommand::Status => {
            let statuses: Vec<ServiceStatus> = client.get("/status").await?;
            print_status(&statuses);
        }
        StackCommand::Deploy => {
            println!("Deploying via {} ...", client.base_url());
            let report: Value = client.post("/deploy", &json!({})).await?;
            print_deploy(&report);
        }
        StackCommand::Plan => {
            let plan: Value = client.get("/plan").await?;
            let changes: ChangeSet = serde_json::from_value(plan.clone())?;
            print_changes(&changes);
            if let Some(missing) = plan["missing_secrets"].as_array() {
                for name in missing.iter().filter_map(Value::as_str) {
                    println!("{} required secret '{}' has no value", "!".yellow(), name);
                }
            }
        }
        StackCommand::Rollback { revision } => {
            let report: Value = client.post("/rollback", &json!({ "sha": revision })).await?;
            let method = report["rollback"]["method"].as_str().unwrap_or("revert");
            let head = report["rollback"]["head"].as_str().unwrap_or_default();
            if method == "reset" {
                println!(
                    "{}",
                    "Revert failed; history after the target was discarded (reset)."
                        .yellow()
                        .bold()
                );
            }
            println!("{} rolled back, HEAD is now {}", "✓".green(), short_sha(head));
            print_deploy(&report["deploy"]);
        }
        StackCommand::Logs {
            service,
            lines,
            follow,
            since,
        } => {
            let options = LogOptions {
                lines,
                follow,
                since,
            };
            print_logs(&client, &format!("/logs/{}", service), &options).await?;
        }
        StackCommand::Scale { service, replicas } => {
            let _: Value = client
                .post(&format!("/scale/{}", service), &json!({ "replicas": replicas }))
                .await?;
            println!("{} {} scaled to {}", "✓".green(), service.bold(), replicas);
        }
        StackCommand::Down => {
            let _: Value = client.post("/down", &json!({})).await?;
            println!("{} stack is down", "✓".green());
        }
        StackCommand::History { limit } => {
            let commits: Vec<CommitInfo> = client.get(&format!("/history?n={}", limit)).await?;
            if commits.is_empty() {
                println!("No history yet.");
            }
            for commit in commits {
                println!(
                    "{}  {}  {}  {}",
                    short_sha(&commit.sha).yellow(),
                    commit.date.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    commit.author.dimmed(),
                    commit.message
                );
            }
        }
    }
    Ok(())
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

fn print_status(statuses: &[ServiceStatus]) {
    if statuses.is_empty() {
        println!("No workloads declared or running.");
        return;
    }
    println!(
        "{:<24} {:<8} {:<10} {:<10} {}",
        "NAME".bold(),
        "KIND".bold(),
        "STATE".bold(),
        "HEALTH".bold(),
        "REPLICAS".bold()
    );
    for s in statuses {
        let state = match s.status {
            RunState::Running => "running".green(),
            RunState::Starting => "starting".yellow(),
            RunState::Stopped => "stopped".dimmed(),
            RunState::Error => "error".red(),
        };
        let health = match s.health {
            HealthLabel::Healthy => "healthy".green(),
            HealthLabel::Unhealthy => "unhealthy".red(),
            HealthLabel::Unknown => "-".dimmed(),
        };
        println!(
            "{:<24} {:<8} {:<10} {:<10} {}/{}",
            s.name, s.kind, state, health, s.replicas_running, s.replicas_desired
        );
    }
}

fn print_changes(changes: &ChangeSet) {
    if changes.is_empty() {
        println!("Nothing to do.");
        return;
    }
    for name in &changes.add {
        println!("  {} {}", "+".green(), name);
    }
    for name in &changes.update {
        println!("  {} {}", "~".yellow(), name);
    }
    for name in &changes.remove {
        println!("  {} {}", "-".red(), name);
    }
}

fn print_deploy(report: &Value) {
    let list = |key: &str| -> Vec<String> {
        report[key]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default()
    };
    println!("{} deploy finished", "✓".green());
    for (label, key) in [
        ("started", "services_started"),
        ("updated", "services_updated"),
        ("removed", "services_removed"),
    ] {
        let names = list(key);
        if !names.is_empty() {
            println!("  {:<8} {}", label, names.join(", "));
        }
    }
    for warning in list("warnings") {
        println!("  {} {}", "warning:".yellow(), warning);
    }
    if let Some(commit) = report["commit"].as_str() {
        println!("  recorded as {}", short_sha(commit));
    }
}
