// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Credential commands. Values are written, never read back.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::{json, Value};
use std::io::Read;

use super::Target;

#[derive(Subcommand)]
pub enum SecretCommand {
    /// List declared and stored credentials
    List,

    /// Store a credential (value read from stdin when omitted)
    Set {
        #[arg(value_name = "NAME")]
        name: String,

        #[arg(value_name = "VALUE")]
        value: Option<String>,
    },

    /// Remove a stored credential
    Delete {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

pub async fn handle_command(command: SecretCommand, target: &Target) -> Result<()> {
    let client = target.client()?;
    match command {
        SecretCommand::List => {
            let listing: Value = client.get("/credentials").await?;
            println!(
                "backend: {}",
                listing["backend"].as_str().unwrap_or("unknown").bold()
            );
            for entry in listing["credentials"].as_array().into_iter().flatten() {
                let present = entry["present"].as_bool().unwrap_or(false);
                let required = entry["required"].as_bool().unwrap_or(false);
                let marker = match (present, required) {
                    (true, _) => "✓".green(),
                    (false, true) => "✗".red(),
                    (false, false) => "·".dimmed(),
                };
                let note = if entry["declared"].as_bool().unwrap_or(false) {
                    String::new()
                } else {
                    " (not declared in spec)".dimmed().to_string()
                };
                println!(
                    "  {} {:<28} {}{}",
                    marker,
                    entry["name"].as_str().unwrap_or_default(),
                    entry["env_key"].as_str().unwrap_or_default().dimmed(),
                    note
                );
            }
        }
        SecretCommand::Set { name, value } => {
            let value = match value {
                Some(value) => value,
                None => read_stdin_value()?,
            };
            let _: Value = client
                .put(&format!("/credentials/{}", name), &json!({ "value": value }))
                .await?;
            println!("{} stored {}", "✓".green(), name.bold());
        }
        SecretCommand::Delete { name } => {
            client.delete(&format!("/credentials/{}", name)).await?;
            println!("{} deleted {}", "✓".green(), name.bold());
        }
    }
    Ok(())
}

fn read_stdin_value() -> Result<String> {
    let mut value = String::new();
    std::io::stdin()
        .read_to_string(&mut value)
        .context("Failed to read secret value from stdin")?;
    Ok(value.trim_end_matches(['\r', '\n']).to_string())
}
