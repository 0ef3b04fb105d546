// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon HTTP server implementation

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use stackpilot_core::{
    application::{CredentialsFactory, HealthMonitor, Operator, OperatorDeps},
    domain::{
        credentials::CredentialsBackend, operator_config::OperatorConfig, stack::BackendKind,
    },
    infrastructure::{
        credentials::{
            credentials_backend_from_spec, VaultCredentials, VaultSettings, DEFAULT_ENVIRONMENT,
        },
        CommandRunner, ComposeRuntime, GitVersionControl, SpecStore, TokioCommandRunner,
    },
    presentation::api::{self, AppState},
};

const VAULT_READY_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub root: Option<PathBuf>,
}

pub async fn serve(config_path: Option<PathBuf>, overrides: ServeOverrides) -> Result<()> {
    let mut config =
        OperatorConfig::load_or_default(config_path).context("Failed to load configuration")?;
    if let Some(host) = overrides.host {
        config.bind_address = host;
    }
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(root) = overrides.root {
        config.root = root;
    }
    config
        .validate()
        .context("Configuration validation failed")?;
    let api_key = config.resolved_api_key()?;

    let operator = Arc::new(build_operator(config.clone()).await);
    info!(
        project = operator.project(),
        root = %config.root.display(),
        "stackpilot operator starting"
    );

    wait_for_vault(&config).await;
    operator
        .bootstrap()
        .await
        .context("Failed to prepare the stack root")?;

    if api_key.is_none() && !is_loopback(&config.bind_address) {
        warn!(
            "No API key configured while listening on {}; the control surface is unauthenticated",
            config.bind_address
        );
    }

    let app = api::app(AppState::new(
        operator.clone(),
        api_key,
        config.cors_origins.clone(),
    ));

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Daemon listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    operator.health_monitor().shutdown();
    info!("Daemon shutting down");
    Ok(())
}

/// Compose project: configured name, else the spec's `name`, else the root
/// directory's name.
async fn resolve_project(config: &OperatorConfig) -> String {
    if let Some(project) = config.project.clone().filter(|p| !p.is_empty()) {
        return project;
    }
    if let Ok(spec) = SpecStore::new(config.spec_path(), None).load_base().await {
        if !spec.name.is_empty() {
            return spec.name;
        }
    }
    std::fs::canonicalize(&config.root)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "stackpilot".to_string())
}

pub async fn build_operator(config: OperatorConfig) -> Operator {
    let project = resolve_project(&config).await;
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new());

    let runtime = Arc::new(ComposeRuntime::new(
        runner.clone(),
        config.compose_command.clone(),
        project.clone(),
        config.root.clone(),
    ));
    let history = Arc::new(GitVersionControl::new(
        runner,
        config.root.clone(),
        config.git_author_name.clone(),
        config.git_author_email.clone(),
    ));
    let root = config.root.clone();
    let credentials: CredentialsFactory =
        Arc::new(move |spec| credentials_backend_from_spec(spec, &root));

    Operator::new(OperatorDeps {
        config,
        project,
        runtime,
        history,
        health: Arc::new(HealthMonitor::new()),
        credentials,
    })
}

/// Block until a Vault-backed stack's Vault answers, bounded by a deadline.
async fn wait_for_vault(config: &OperatorConfig) {
    let Ok(spec) = SpecStore::new(config.spec_path(), config.overlay_path())
        .load()
        .await
    else {
        return;
    };
    let backend = spec.secrets_backend_config();
    if backend.kind != BackendKind::Vault {
        return;
    }

    let environment = spec.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT);
    let vault = match VaultSettings::from_config(&backend, &spec.name, environment)
        .and_then(VaultCredentials::new)
    {
        Ok(vault) => vault,
        Err(e) => {
            warn!("Vault backend is not usable: {}", e);
            return;
        }
    };
    info!(backend = %vault.kind(), "waiting for vault to become ready");
    if let Err(e) = vault.wait_ready(VAULT_READY_DEADLINE).await {
        warn!("{}; deploys will fail until it is reachable", e);
    }
}

fn is_loopback(address: &str) -> bool {
    address == "localhost"
        || address
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
