// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # stackpilot
//!
//! One binary, two roles:
//!
//! - **Daemon**: `stackpilot serve` runs the operator and its HTTP / JSON-RPC
//!   control surface for one stack root.
//! - **Client**: every other command is a thin HTTP call to a running daemon,
//!   except `config validate|compile|operator`, which work offline.
//!
//! ## Commands
//!
//! - `stackpilot serve` - Run the operator daemon
//! - `stackpilot status|deploy|plan|rollback|logs|scale|down|history` - Stack operations
//! - `stackpilot agent list|start|stop|logs` - Agent operations
//! - `stackpilot secret list|set|delete` - Credentials
//! - `stackpilot config show|apply|validate|compile|operator` - Configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use stackpilot_cli::commands::{self, AgentCommand, ConfigCommand, SecretCommand, StackCommand, Target};
use stackpilot_cli::daemon::{self, server::ServeOverrides};
use stackpilot_core::domain::operator_config::{API_KEY_ENV, CONFIG_ENV, PORT_ENV, ROOT_ENV};

const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// stackpilot - declarative operator for containerised service and agent stacks
#[derive(Parser)]
#[command(name = "stackpilot")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = CONFIG_ENV, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP API port (default: from configuration, 7400)
    #[arg(long, global = true, env = PORT_ENV)]
    port: Option<u16>,

    /// HTTP API host (default: 127.0.0.1)
    #[arg(long, global = true, env = "STACKPILOT_HOST")]
    host: Option<String>,

    /// Bearer token for the daemon API
    #[arg(long, global = true, env = API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "STACKPILOT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, env = "STACKPILOT_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the operator daemon in the foreground
    #[command(name = "serve")]
    Serve {
        /// Stack root (overrides configuration)
        #[arg(long, env = ROOT_ENV, value_name = "DIR")]
        root: Option<PathBuf>,
    },

    #[command(flatten)]
    Stack(StackCommand),

    /// Agent management
    #[command(name = "agent")]
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Credentials management
    #[command(name = "secret")]
    Secret {
        #[command(subcommand)]
        command: SecretCommand,
    },

    /// Stack spec and operator configuration
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    let target = Target {
        config: cli.config.clone(),
        host: cli.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: cli.port,
        api_key: cli.api_key.clone(),
    };

    match cli.command {
        Commands::Serve { root } => {
            let overrides = ServeOverrides {
                host: cli.host,
                port: cli.port,
                root,
            };
            daemon::serve(cli.config, overrides).await
        }
        Commands::Stack(command) => commands::stack::handle_command(command, &target).await,
        Commands::Agent { command } => commands::agent::handle_command(command, &target).await,
        Commands::Secret { command } => commands::secret::handle_command(command, &target).await,
        Commands::Config { command } => commands::config::handle_command(command, &target).await,
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Text => builder.with_target(false).compact().init(),
        LogFormat::Json => builder.with_target(true).json().init(),
    }

    Ok(())
}
