// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Operator Configuration
//!
//! Settings for the operator daemon itself (where the stack lives, how to
//! reach the runtime, how the control surface is exposed). Distinct from the
//! stack spec, which describes the workloads.
//!
//! ## Discovery
//!
//! 1. `--config` flag (must exist)
//! 2. `STACKPILOT_CONFIG` environment variable
//! 3. `./stackpilot.yaml`
//! 4. `~/.stackpilot/config.yaml`
//! 5. `/etc/stackpilot/config.yaml`
//! 6. built-in defaults
//!
//! Environment overrides are applied last in every case.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "STACKPILOT_CONFIG";
pub const API_KEY_ENV: &str = "STACKPILOT_API_KEY";
pub const ROOT_ENV: &str = "STACKPILOT_ROOT";
pub const OVERLAY_ENV: &str = "STACKPILOT_ENV";
pub const PORT_ENV: &str = "STACKPILOT_PORT";

pub const DEFAULT_PORT: u16 = 7400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Stack root: holds the spec file, `.env` and the `.stackpilot/` work dir.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default = "default_spec_file")]
    pub spec_file: String,

    /// Compose project name. Defaults to the stack name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the control surface. `env:VAR` reads it from `VAR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_deploy_timeout", with = "humantime_serde")]
    pub deploy_timeout: Duration,

    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,

    /// Overlay name; `stack.<overlay>.yaml` is merged over the base spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_overlay: Option<String>,

    #[serde(default = "default_git_author_name")]
    pub git_author_name: String,

    #[serde(default = "default_git_author_email")]
    pub git_author_email: String,

    /// Certificate resolver used for TLS domain routers.
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_spec_file() -> String {
    "stack.yaml".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_deploy_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_compose_command() -> Vec<String> {
    vec!["docker".to_string(), "compose".to_string()]
}

fn default_git_author_name() -> String {
    "stackpilot".to_string()
}

fn default_git_author_email() -> String {
    "stackpilot@localhost".to_string()
}

fn default_cert_resolver() -> String {
    "letsencrypt".to_string()
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            spec_file: default_spec_file(),
            project: None,
            bind_address: default_bind_address(),
            port: default_port(),
            api_key: None,
            cors_origins: Vec::new(),
            deploy_timeout: default_deploy_timeout(),
            compose_command: default_compose_command(),
            environment_overlay: None,
            git_author_name: default_git_author_name(),
            git_author_email: default_git_author_email(),
            cert_resolver: default_cert_resolver(),
        }
    }
}

impl OperatorConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./stackpilot.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".stackpilot").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/stackpilot/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else {
            tracing::debug!("No configuration file found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the process environment in production).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: {}", API_KEY_ENV);
            self.api_key = Some(key);
        }
        if let Some(root) = lookup(ROOT_ENV).filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: {}={}", ROOT_ENV, root);
            self.root = PathBuf::from(root);
        }
        if let Some(overlay) = lookup(OVERLAY_ENV).filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: {}={}", OVERLAY_ENV, overlay);
            self.environment_overlay = Some(overlay);
        }
        if let Some(port) = lookup(PORT_ENV) {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: {}={}", PORT_ENV, port);
                    self.port = port;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for {}: '{}'. Expected a port number. Ignoring.",
                    PORT_ENV,
                    port
                ),
            }
        }
    }

    /// Effective API key, following `env:VAR` indirection.
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        match self.api_key.as_deref() {
            None | Some("") => Ok(None),
            Some(value) => match value.strip_prefix("env:") {
                Some(var) => {
                    let key = std::env::var(var)
                        .with_context(|| format!("api_key references unset variable {}", var))?;
                    Ok(Some(key).filter(|k| !k.is_empty()))
                }
                None => Ok(Some(value.to_string())),
            },
        }
    }

    pub fn spec_path(&self) -> PathBuf {
        self.root.join(&self.spec_file)
    }

    /// `stack.<overlay>.yaml` next to the spec, when an overlay is configured.
    pub fn overlay_path(&self) -> Option<PathBuf> {
        let overlay = self.environment_overlay.as_deref()?;
        let spec = Path::new(&self.spec_file);
        let stem = spec.file_stem()?.to_string_lossy();
        let extension = spec
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "yaml".to_string());
        Some(
            self.root
                .join(format!("{}.{}.{}", stem, overlay, extension)),
        )
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join(".stackpilot")
    }

    pub fn compose_path(&self) -> PathBuf {
        self.work_dir().join("compose.yaml")
    }

    pub fn runtime_env_path(&self) -> PathBuf {
        self.work_dir().join("runtime.env")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.spec_file.trim().is_empty() {
            anyhow::bail!("spec_file cannot be empty");
        }
        if self.compose_command.is_empty() {
            anyhow::bail!("compose_command cannot be empty");
        }
        if self.deploy_timeout.is_zero() {
            anyhow::bail!("deploy_timeout must be greater than zero");
        }
        for origin in &self.cors_origins {
            if origin.trim().is_empty() {
                anyhow::bail!("cors_origins cannot contain empty entries");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.port, 7400);
        assert_eq!(config.deploy_timeout, Duration::from_secs(600));
        assert_eq!(config.compose_command, vec!["docker", "compose"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_fields() {
        let config = OperatorConfig::from_yaml_str(
            r#"
root: /srv/acme
project: acme-prod
port: 9000
api_key: env:ACME_KEY
cors_origins: ["https://console.acme.dev", "http://localhost:*"]
deploy_timeout: 90s
compose_command: ["podman", "compose"]
"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/acme"));
        assert_eq!(config.deploy_timeout, Duration::from_secs(90));
        assert_eq!(config.compose_path(), PathBuf::from("/srv/acme/.stackpilot/compose.yaml"));
        assert_eq!(config.cors_origins.len(), 2);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (API_KEY_ENV, "secret"),
            (ROOT_ENV, "/tmp/stack"),
            (OVERLAY_ENV, "staging"),
            (PORT_ENV, "not-a-port"),
        ]);
        let mut config = OperatorConfig::default();
        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.root, PathBuf::from("/tmp/stack"));
        assert_eq!(config.port, 7400);
        assert_eq!(
            config.overlay_path(),
            Some(PathBuf::from("/tmp/stack/stack.staging.yaml"))
        );
    }

    #[test]
    fn test_literal_api_key() {
        let config = OperatorConfig {
            api_key: Some("abc".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolved_api_key().unwrap().as_deref(), Some("abc"));
        assert_eq!(OperatorConfig::default().resolved_api_key().unwrap(), None);
    }

    #[test]
    fn test_validation() {
        let mut config = OperatorConfig::default();
        config.compose_command.clear();
        assert!(config.validate().is_err());
    }
}
