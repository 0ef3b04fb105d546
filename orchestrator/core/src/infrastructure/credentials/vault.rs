// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Vault KV v2 Credentials Backend
//!
//! Stores each credential as `{"value": ...}` at
//! `<mount>/data/<prefix>/<environment>/<name>` on a Vault-compatible server
//! (Vault, OpenBao).
//!
//! ## Authentication
//!
//! - **Static token** read from `token_env` (`VAULT_TOKEN` by default).
//! - **AppRole** (`role_id_env` / `secret_id_env`) when no static token is
//!   set. The client token is cached and renewed by logging in again shortly
//!   before its lease runs out, or after a `403`.

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::credentials::{ensure_valid_name, BackendKind, CredentialError, CredentialsBackend};
use crate::domain::stack::SecretsBackendConfig;

const DEFAULT_MOUNT: &str = "secret";
const DEFAULT_TOKEN_ENV: &str = "VAULT_TOKEN";
const DEFAULT_ROLE_ID_ENV: &str = "VAULT_ROLE_ID";
const DEFAULT_SECRET_ID_ENV: &str = "VAULT_SECRET_ID";
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TOKEN_RENEW_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum VaultAuth {
    Token(String),
    AppRole { role_id: String, secret_id: String },
}

#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub address: String,
    pub mount: String,
    pub prefix: String,
    pub environment: String,
    pub auth: VaultAuth,
}

impl VaultSettings {
    /// Build settings from the stack's `secrets_backend` table and the
    /// process environment.
    pub fn from_config(
        config: &SecretsBackendConfig,
        stack_name: &str,
        environment: &str,
    ) -> Result<Self, CredentialError> {
        Self::from_config_with(config, stack_name, environment, |key| std::env::var(key).ok())
    }

    pub fn from_config_with(
        config: &SecretsBackendConfig,
        stack_name: &str,
        environment: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CredentialError> {
        let address = config
            .address
            .clone()
            .or_else(|| lookup("VAULT_ADDR"))
            .ok_or_else(|| {
                CredentialError::Unavailable("vault address not configured (set address or VAULT_ADDR)".to_string())
            })?;

        let token_env = config.token_env.as_deref().unwrap_or(DEFAULT_TOKEN_ENV);
        let role_id_env = config.role_id_env.as_deref().unwrap_or(DEFAULT_ROLE_ID_ENV);
        let secret_id_env = config.secret_id_env.as_deref().unwrap_or(DEFAULT_SECRET_ID_ENV);

        let auth = match lookup(token_env).filter(|t| !t.is_empty()) {
            Some(token) => VaultAuth::Token(token),
            None => match (lookup(role_id_env), lookup(secret_id_env)) {
                (Some(role_id), Some(secret_id)) => VaultAuth::AppRole { role_id, secret_id },
                _ => {
                    return Err(CredentialError::Unavailable(format!(
                        "no vault credentials: set {} or {}/{}",
                        token_env, role_id_env, secret_id_env
                    )))
                }
            },
        };

        Ok(Self {
            address: address.trim_end_matches('/').to_string(),
            mount: config
                .mount
                .clone()
                .unwrap_or_else(|| DEFAULT_MOUNT.to_string()),
            prefix: config
                .prefix
                .clone()
                .unwrap_or_else(|| stack_name.to_string()),
            environment: environment.to_string(),
            auth,
        })
    }
}

struct CachedToken {
    token: String,
    renew_at: Option<Instant>,
}

pub struct VaultCredentials {
    client: Client,
    settings: VaultSettings,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
}

impl VaultCredentials {
    pub fn new(settings: VaultSettings) -> Result<Self, CredentialError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CredentialError::Unavailable(format!("failed to build http client: {}", e)))?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: Client, settings: VaultSettings) -> Self {
        Self {
            client,
            settings,
            token: Mutex::new(None),
        }
    }

    fn secret_path(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.settings.prefix.trim_matches('/'),
            self.settings.environment,
            name
        )
    }

    fn data_url(&self, name: &str) -> String {
        format!(
            "{}/v1/{}/data/{}",
            self.settings.address,
            self.settings.mount,
            self.secret_path(name)
        )
    }

    fn metadata_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/metadata/{}",
            self.settings.address, self.settings.mount, path
        )
    }

    async fn token(&self) -> Result<String, CredentialError> {
        let (role_id, secret_id) = match &self.settings.auth {
            VaultAuth::Token(token) => return Ok(token.clone()),
            VaultAuth::AppRole { role_id, secret_id } => (role_id, secret_id),
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.renew_at.map(|at| Instant::now() < at).unwrap_or(true) {
                return Ok(token.token.clone());
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/auth/approle/login", self.settings.address))
            .json(&json!({ "role_id": role_id, "secret_id": secret_id }))
            .send()
            .await
            .map_err(unavailable)?;
        let response = expect_success(response, "approle login").await?;
        let login: LoginResponse = response.json().await.map_err(backend)?;

        let renew_at = (login.auth.lease_duration > 0).then(|| {
            let lease = Duration::from_secs(login.auth.lease_duration);
            Instant::now() + lease.saturating_sub(TOKEN_RENEW_MARGIN.min(lease / 2))
        });
        info!(lease_secs = login.auth.lease_duration, "obtained vault token via approle");

        let token = login.auth.client_token;
        *cached = Some(CachedToken {
            token: token.clone(),
            renew_at,
        });
        Ok(token)
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Response, CredentialError> {
        let mut retried = false;
        loop {
            let token = self.token().await?;
            let mut request = self
                .client
                .request(method.clone(), url)
                .header("X-Vault-Token", token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await.map_err(unavailable)?;

            let approle = matches!(self.settings.auth, VaultAuth::AppRole { .. });
            if response.status() == StatusCode::FORBIDDEN && approle && !retried {
                warn!("vault rejected cached token, logging in again");
                *self.token.lock().await = None;
                retried = true;
                continue;
            }
            return Ok(response);
        }
    }

    /// `sys/health` answers at all (sealed/standby still count as reachable).
    pub async fn is_reachable(&self) -> bool {
        let url = format!("{}/v1/sys/health", self.settings.address);
        match self.client.get(url).send().await {
            Ok(response) => matches!(response.status().as_u16(), 200 | 429 | 472 | 473),
            Err(e) => {
                debug!("vault health probe failed: {}", e);
                false
            }
        }
    }

    /// Poll `sys/health` every 2 s until it answers or `deadline` elapses.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<(), CredentialError> {
        let started = Instant::now();
        loop {
            if self.is_reachable().await {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(CredentialError::Unavailable(format!(
                    "vault at {} not ready after {:?}",
                    self.settings.address, deadline
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - elapsed)).await;
        }
    }
}

fn unavailable(err: reqwest::Error) -> CredentialError {
    CredentialError::Unavailable(err.to_string())
}

fn backend(err: reqwest::Error) -> CredentialError {
    CredentialError::Backend(err.to_string())
}

async fn expect_success(response: Response, what: &str) -> Result<Response, CredentialError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CredentialError::Backend(format!(
        "vault {} failed with {}: {}",
        what,
        status,
        body.trim()
    )))
}

#[async_trait]
impl CredentialsBackend for VaultCredentials {
    fn kind(&self) -> BackendKind {
        BackendKind::Vault
    }

    async fn get(&self, name: &str) -> Result<Option<String>, CredentialError> {
        ensure_valid_name(name)?;
        let response = self.send(Method::GET, &self.data_url(name), None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = expect_success(response, "read")
            .await?
            .json()
            .await
            .map_err(backend)?;

        // A soft-deleted version answers with `data: null`.
        Ok(body
            .pointer("/data/data/value")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), CredentialError> {
        ensure_valid_name(name)?;
        let body = json!({ "data": { "value": value } });
        let response = self.send(Method::POST, &self.data_url(name), Some(&body)).await?;
        expect_success(response, "write").await?;
        debug!(name, "stored credential in vault");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, CredentialError> {
        ensure_valid_name(name)?;
        if self.get(name).await?.is_none() {
            return Ok(false);
        }
        let url = self.metadata_url(&self.secret_path(name));
        let response = self.send(Method::DELETE, &url, None).await?;
        expect_success(response, "delete").await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<String>, CredentialError> {
        let folder = format!(
            "{}/{}",
            self.settings.prefix.trim_matches('/'),
            self.settings.environment
        );
        let url = format!("{}?list=true", self.metadata_url(&folder));
        let response = self.send(Method::GET, &url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: Value = expect_success(response, "list")
            .await?
            .json()
            .await
            .map_err(backend)?;

        let mut names: Vec<String> = body
            .pointer("/data/keys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .filter(|k| !k.ends_with('/'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }
}
