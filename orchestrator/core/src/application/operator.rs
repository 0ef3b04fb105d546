// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Operator
//!
//! The single business-logic layer behind both control protocols. HTTP and
//! JSON-RPC handlers only translate requests into calls on [`Operator`].
//!
//! ## Deploy pipeline
//!
//! ```text
//! load spec (+ overlay) → validate → compile → resolve secrets into
//! .stackpilot/runtime.env → write .stackpilot/compose.yaml → apply (bounded
//! by deploy_timeout) → reload health probes
//! ```
//!
//! Deploys, rollbacks, teardown and spec writes are serialised by one
//! `tokio::sync::Mutex` owned by the operator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::application::compiler::{compile, CompileError, CompileOptions};
use crate::application::health_monitor::HealthMonitor;
use crate::domain::credentials::{
    ensure_valid_name, secret_env_key, BackendKind, CredentialError, CredentialsBackend,
};
use crate::domain::history::{CommitInfo, HistoryError, RollbackOutcome, VersionControl};
use crate::domain::operator_config::OperatorConfig;
use crate::domain::runtime::{
    ApplyResult, ChangeSet, HealthLabel, LogOptions, LogStream, RunState, RuntimeBackend,
    RuntimeError, ServiceStatus,
};
use crate::domain::runtime_spec::ComposeFile;
use crate::domain::stack::{SecretsBackendConfig, StackSpec};
use crate::domain::validation::ValidationErrors;
use crate::infrastructure::credentials::file::{render_env, write_private_file};
use crate::infrastructure::spec_store::{SpecStore, SpecStoreError};

pub const CONFIG_COMMIT_MESSAGE: &str = "config: update stack spec";
pub const DEPLOY_COMMIT_MESSAGE: &str = "deploy: record deployed stack spec";

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Spec(#[from] SpecStoreError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("{kind} '{name}' is not declared in the stack spec")]
    NotFound { kind: &'static str, name: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("deploy did not finish within {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OperatorError {
    /// Per-violation messages for validation failures, empty otherwise.
    pub fn details(&self) -> Vec<String> {
        match self {
            OperatorError::Validation(errors)
            | OperatorError::Spec(SpecStoreError::Invalid(errors)) => errors.messages(),
            OperatorError::Credential(CredentialError::MissingRequired(names)) => names.clone(),
            _ => Vec::new(),
        }
    }
}

pub type OperatorResult<T> = Result<T, OperatorError>;

/// Builds the credentials backend selected by a spec.
pub type CredentialsFactory =
    Arc<dyn Fn(&StackSpec) -> Result<Arc<dyn CredentialsBackend>, CredentialError> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub spec_present: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigUpdate {
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    #[serde(flatten)]
    pub result: ApplyResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    #[serde(flatten)]
    pub changes: ChangeSet,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_secrets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub rollback: RollbackOutcome,
    pub deploy: ApplyResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub image: String,
    pub skills: Vec<String>,
    pub mcp_servers: Vec<String>,
    pub status: RunState,
    pub health: HealthLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialEntry {
    pub name: String,
    pub env_key: String,
    pub declared: bool,
    pub required: bool,
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialsListing {
    pub backend: BackendKind,
    pub credentials: Vec<CredentialEntry>,
}

pub struct OperatorDeps {
    pub config: OperatorConfig,
    pub project: String,
    pub runtime: Arc<dyn RuntimeBackend>,
    pub history: Arc<dyn VersionControl>,
    pub health: Arc<HealthMonitor>,
    pub credentials: CredentialsFactory,
}

pub struct Operator {
    config: OperatorConfig,
    project: String,
    store: SpecStore,
    runtime: Arc<dyn RuntimeBackend>,
    history: Arc<dyn VersionControl>,
    health: Arc<HealthMonitor>,
    credentials_factory: CredentialsFactory,
    credentials: parking_lot::Mutex<Option<(SecretsBackendConfig, Arc<dyn CredentialsBackend>)>>,
    deploy_lock: Mutex<()>,
    started_at: DateTime<Utc>,
}

impl Operator {
    pub fn new(deps: OperatorDeps) -> Self {
        let store = SpecStore::new(deps.config.spec_path(), deps.config.overlay_path());
        Self {
            config: deps.config,
            project: deps.project,
            store,
            runtime: deps.runtime,
            history: deps.history,
            health: deps.health,
            credentials_factory: deps.credentials,
            credentials: parking_lot::Mutex::new(None),
            deploy_lock: Mutex::new(()),
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Prepare the stack root at daemon start: ensure the repository exists,
    /// record an uncommitted spec and resume health probes for it.
    pub async fn bootstrap(&self) -> OperatorResult<()> {
        self.history.init().await?;
        if !self.store.exists() {
            warn!(spec = %self.store.spec_path().display(), "no stack spec yet");
            return Ok(());
        }
        if let Some(sha) = self
            .history
            .commit(&self.tracked_paths(), "config: initial stack spec")
            .await?
        {
            info!(sha = %sha, "recorded existing stack spec");
        }
        match self.store.load_validated().await {
            Ok(spec) => self.health.reload(&spec),
            Err(e) => warn!("stack spec not usable yet, health probes idle: {}", e),
        }
        Ok(())
    }

    fn tracked_paths(&self) -> Vec<PathBuf> {
        vec![self.store.spec_path().to_path_buf(), self.config.root.join(".gitignore")]
    }

    fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            project: self.project.clone(),
            root: self.config.root.clone(),
            cert_resolver: self.config.cert_resolver.clone(),
        }
    }

    fn credentials_for(&self, spec: &StackSpec) -> OperatorResult<Arc<dyn CredentialsBackend>> {
        let wanted = spec.secrets_backend_config();
        let mut cached = self.credentials.lock();
        if let Some((config, backend)) = cached.as_ref() {
            if *config == wanted {
                return Ok(backend.clone());
            }
        }
        let backend = (self.credentials_factory)(spec)?;
        *cached = Some((wanted, backend.clone()));
        Ok(backend)
    }

    /// Credentials backend of the spec on disk; the default file backend when
    /// there is no spec yet.
    async fn current_credentials(&self) -> OperatorResult<(StackSpec, Arc<dyn CredentialsBackend>)> {
        let spec = match self.store.load().await {
            Ok(spec) => spec,
            Err(SpecStoreError::NotFound(_)) => StackSpec {
                name: self.project.clone(),
                ..Default::default()
            },
            Err(e) => return Err(e.into()),
        };
        let backend = self.credentials_for(&spec)?;
        Ok((spec, backend))
    }

    // ------------------------------------------------------------------
    // Health & config
    // ------------------------------------------------------------------

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            project: self.project.clone(),
            started_at: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            spec_present: self.store.exists(),
        }
    }

    pub async fn config_get(&self) -> OperatorResult<StackSpec> {
        Ok(self.store.load_base().await?)
    }

    pub async fn config_set(&self, spec: StackSpec) -> OperatorResult<ConfigUpdate> {
        spec.validate()?;

        let _guard = self.deploy_lock.lock().await;
        self.store.save(&spec).await?;
        self.history.init().await?;
        let commit = self
            .history
            .commit(&self.tracked_paths(), CONFIG_COMMIT_MESSAGE)
            .await?;
        info!(commit = ?commit, "stack spec updated");
        Ok(ConfigUpdate { commit })
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    pub async fn deploy(&self) -> OperatorResult<DeployReport> {
        let _guard = self.deploy_lock.lock().await;
        let result = self.deploy_locked().await?;
        let commit = self
            .history
            .commit(&self.tracked_paths(), DEPLOY_COMMIT_MESSAGE)
            .await?;
        Ok(DeployReport { result, commit })
    }

    async fn deploy_locked(&self) -> OperatorResult<ApplyResult> {
        let spec = self.store.load_validated().await?;
        let compose = compile(&spec, &self.compile_options())?;

        let credentials = self.credentials_for(&spec)?;
        let (env, missing) = resolve_secrets(&spec, credentials.as_ref()).await?;
        if !missing.is_empty() {
            return Err(CredentialError::MissingRequired(missing).into());
        }

        self.write_runtime_files(&compose, &env).await?;

        info!(project = %self.project, services = compose.services.len(), "applying stack");
        let timeout = self.config.deploy_timeout;
        let result = tokio::time::timeout(timeout, self.runtime.apply(&compose))
            .await
            .map_err(|_| OperatorError::Timeout(timeout))??;

        for warning in &result.warnings {
            warn!(project = %self.project, "deploy warning: {}", warning);
        }
        self.health.reload(&spec);
        Ok(result)
    }

    async fn write_runtime_files(
        &self,
        compose: &ComposeFile,
        env: &BTreeMap<String, String>,
    ) -> OperatorResult<()> {
        write_private_file(&self.config.runtime_env_path(), render_env(env).as_bytes()).await?;

        let yaml = compose
            .to_yaml()
            .map_err(|e| OperatorError::BadRequest(format!("failed to render compose file: {}", e)))?;
        let path = self.config.compose_path();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, yaml).await?;
        Ok(())
    }

    pub async fn plan(&self) -> OperatorResult<PlanReport> {
        let spec = self.store.load_validated().await?;
        let compose = compile(&spec, &self.compile_options())?;
        let changes = self.runtime.diff(&compose).await?;

        let missing_secrets = match self.credentials_for(&spec) {
            Ok(backend) => resolve_secrets(&spec, backend.as_ref()).await?.1,
            Err(e) => {
                warn!("cannot check secrets while planning: {}", e);
                Vec::new()
            }
        };
        Ok(PlanReport {
            changes,
            missing_secrets,
        })
    }

    pub async fn rollback(&self, target: &str) -> OperatorResult<RollbackReport> {
        if target.trim().is_empty() {
            return Err(OperatorError::BadRequest("rollback target is required".to_string()));
        }
        let _guard = self.deploy_lock.lock().await;
        let rollback = self.history.rollback(target.trim()).await?;
        info!(target = %rollback.target, method = ?rollback.method, "spec rolled back, redeploying");
        let deploy = self.deploy_locked().await?;
        Ok(RollbackReport { rollback, deploy })
    }

    pub async fn down(&self) -> OperatorResult<()> {
        let _guard = self.deploy_lock.lock().await;
        self.runtime.down().await?;
        self.health.reload(&StackSpec::default());
        info!(project = %self.project, "stack is down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Runtime inspection
    // ------------------------------------------------------------------

    /// Runtime status with probe results and declared replica counts
    /// overlaid. Declared workloads without containers are listed as stopped.
    pub async fn status(&self) -> OperatorResult<Vec<ServiceStatus>> {
        let mut statuses = self.runtime.status().await?;
        let spec = self.store.load().await.ok();

        if let Some(spec) = &spec {
            let now = Utc::now();
            for workload in spec.workloads() {
                match statuses.iter_mut().find(|s| s.name == workload.name) {
                    Some(status) => {
                        status.kind = workload.kind;
                        status.replicas_desired = workload.spec.replicas();
                    }
                    None => statuses.push(ServiceStatus {
                        name: workload.name.to_string(),
                        kind: workload.kind,
                        status: RunState::Stopped,
                        health: HealthLabel::Unknown,
                        replicas_running: 0,
                        replicas_desired: workload.spec.replicas(),
                        updated_at: now,
                    }),
                }
            }
        }

        let health = self.health.snapshot();
        for status in statuses.iter_mut() {
            if let Some(state) = health.get(&status.name) {
                if state.status != HealthLabel::Unknown {
                    status.health = state.status;
                }
            }
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }

    async fn require_service(&self, name: &str) -> OperatorResult<StackSpec> {
        let spec = self.store.load().await?;
        let known = spec.workload(name).is_some()
            || spec
                .mcp_servers
                .get(name)
                .map(|m| m.image.is_some())
                .unwrap_or(false);
        if !known {
            return Err(OperatorError::NotFound {
                kind: "service",
                name: name.to_string(),
            });
        }
        Ok(spec)
    }

    async fn require_agent(&self, name: &str) -> OperatorResult<StackSpec> {
        let spec = self.store.load().await?;
        if !spec.is_agent(name) {
            return Err(OperatorError::NotFound {
                kind: "agent",
                name: name.to_string(),
            });
        }
        Ok(spec)
    }

    pub async fn logs(&self, service: &str, options: &LogOptions) -> OperatorResult<LogStream> {
        self.require_service(service).await?;
        Ok(self.runtime.logs(service, options).await?)
    }

    /// Runtime-only scale; the spec's `replicas` is left untouched.
    pub async fn scale(&self, service: &str, replicas: u32) -> OperatorResult<()> {
        self.require_service(service).await?;
        self.runtime.scale(service, replicas).await?;
        info!(service, replicas, "scaled service");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    pub async fn agents(&self) -> OperatorResult<Vec<AgentSummary>> {
        let spec = self.store.load().await?;
        let statuses = self.status().await?;

        Ok(spec
            .agents
            .iter()
            .map(|(name, agent)| {
                let status = statuses.iter().find(|s| &s.name == name);
                AgentSummary {
                    name: name.clone(),
                    role: agent.role.clone(),
                    image: agent.service.image.clone().unwrap_or_default(),
                    skills: agent.skills.clone(),
                    mcp_servers: spec.agent_tool_servers(agent),
                    status: status.map(|s| s.status).unwrap_or(RunState::Stopped),
                    health: status.map(|s| s.health).unwrap_or_default(),
                }
            })
            .collect())
    }

    pub async fn agent_start(&self, name: &str) -> OperatorResult<()> {
        self.require_agent(name).await?;
        self.runtime.start(&[name.to_string()]).await?;
        info!(agent = name, "agent started");
        Ok(())
    }

    pub async fn agent_stop(&self, name: &str) -> OperatorResult<()> {
        self.require_agent(name).await?;
        self.runtime.stop(&[name.to_string()]).await?;
        info!(agent = name, "agent stopped");
        Ok(())
    }

    pub async fn agent_logs(&self, name: &str, options: &LogOptions) -> OperatorResult<LogStream> {
        self.require_agent(name).await?;
        Ok(self.runtime.logs(name, options).await?)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub async fn history(&self, limit: usize) -> OperatorResult<Vec<CommitInfo>> {
        Ok(self.history.log(limit.max(1)).await?)
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    pub async fn credentials_list(&self) -> OperatorResult<CredentialsListing> {
        let (spec, backend) = self.current_credentials().await?;
        let stored = backend.list().await?;

        let mut entries: BTreeMap<String, CredentialEntry> = BTreeMap::new();
        for secret in &spec.secrets {
            let env_key = secret_env_key(&secret.name);
            entries.insert(
                env_key.clone(),
                CredentialEntry {
                    name: secret.name.clone(),
                    present: stored.iter().any(|s| secret_env_key(s) == env_key),
                    env_key,
                    declared: true,
                    required: secret.required,
                    description: secret.description.clone(),
                },
            );
        }
        for name in stored {
            let env_key = secret_env_key(&name);
            entries.entry(env_key.clone()).or_insert(CredentialEntry {
                name,
                env_key,
                declared: false,
                required: false,
                present: true,
                description: None,
            });
        }

        Ok(CredentialsListing {
            backend: backend.kind(),
            credentials: entries.into_values().collect(),
        })
    }

    pub async fn credentials_set(&self, name: &str, value: &str) -> OperatorResult<CredentialEntry> {
        ensure_valid_name(name)?;
        let (spec, backend) = self.current_credentials().await?;
        backend.set(name, value).await?;
        info!(name, backend = %backend.kind(), "credential stored");

        let declared = spec.secrets.iter().find(|s| s.name == name);
        Ok(CredentialEntry {
            name: name.to_string(),
            env_key: secret_env_key(name),
            declared: declared.is_some(),
            required: declared.map(|s| s.required).unwrap_or(false),
            present: true,
            description: declared.and_then(|s| s.description.clone()),
        })
    }

    pub async fn credentials_delete(&self, name: &str) -> OperatorResult<()> {
        ensure_valid_name(name)?;
        let (_, backend) = self.current_credentials().await?;
        if !backend.delete(name).await? {
            return Err(OperatorError::NotFound {
                kind: "credential",
                name: name.to_string(),
            });
        }
        info!(name, backend = %backend.kind(), "credential deleted");
        Ok(())
    }
}

/// Values of every declared secret keyed by env name, plus the names of
/// required secrets that have no value.
async fn resolve_secrets(
    spec: &StackSpec,
    backend: &dyn CredentialsBackend,
) -> Result<(BTreeMap<String, String>, Vec<String>), CredentialError> {
    let mut env = BTreeMap::new();
    let mut missing = Vec::new();
    for secret in &spec.secrets {
        match backend.get(&secret.name).await? {
            Some(value) => {
                env.insert(secret_env_key(&secret.name), value);
            }
            None if secret.required => missing.push(secret.name.clone()),
            None => {}
        }
    }
    Ok((env, missing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::history::RollbackMethod;
    use crate::infrastructure::command::testing::ScriptedRunner;
    use crate::infrastructure::command::{CommandOutput, TokioCommandRunner};
    use crate::infrastructure::compose::ComposeRuntime;
    use crate::infrastructure::credentials::{credentials_backend_from_spec, FileCredentials};
    use crate::infrastructure::git::GitVersionControl;
    use async_trait::async_trait;

    const SPEC: &str = r#"
name: acme
services:
  api:
    image: api:1.0
    environment:
      DATABASE_PASSWORD: ${secret:db-password}
agents:
  coder:
    image: coder:1.0
secrets:
  - name: db-password
  - name: slack-token
    required: false
"#;

    struct Harness {
        dir: tempfile::TempDir,
        runner: Arc<ScriptedRunner>,
        operator: Operator,
    }

    fn config_for(root: &std::path::Path) -> OperatorConfig {
        OperatorConfig {
            root: root.to_path_buf(),
            git_author_name: "test-user".into(),
            git_author_email: "test@example.com".into(),
            ..Default::default()
        }
    }

    fn harness_with(runtime: Option<Arc<dyn RuntimeBackend>>, timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let mut config = config_for(dir.path());
        config.deploy_timeout = timeout;

        let runtime = runtime.unwrap_or_else(|| {
            Arc::new(ComposeRuntime::new(
                runner.clone(),
                config.compose_command.clone(),
                "acme",
                dir.path(),
            ))
        });
        let history = Arc::new(GitVersionControl::new(
            Arc::new(TokioCommandRunner::new()),
            dir.path(),
            "test-user",
            "test@example.com",
        ));
        let root = dir.path().to_path_buf();
        let operator = Operator::new(OperatorDeps {
            config,
            project: "acme".into(),
            runtime,
            history,
            health: Arc::new(HealthMonitor::new()),
            credentials: Arc::new(move |spec| credentials_backend_from_spec(spec, &root)),
        });
        Harness {
            dir,
            runner,
            operator,
        }
    }

    fn harness() -> Harness {
        harness_with(None, Duration::from_secs(30))
    }

    fn spec(yaml: &str) -> StackSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_deploy_materialises_secrets_and_compose_file() {
        let h = harness();
        h.operator.config_set(spec(SPEC)).await.unwrap();
        FileCredentials::new(h.dir.path().join(".env"))
            .set("db-password", "hunter2")
            .await
            .unwrap();

        let report = h.operator.deploy().await.unwrap();
        assert!(report
            .result
            .warnings
            .iter()
            .any(|w| w.contains("has no container")));

        let compose = std::fs::read_to_string(h.dir.path().join(".stackpilot/compose.yaml")).unwrap();
        assert!(compose.contains("api:1.0"));
        assert!(compose.contains("${DB_PASSWORD}"));
        assert!(!compose.contains("hunter2"));

        let env = std::fs::read_to_string(h.dir.path().join(".stackpilot/runtime.env")).unwrap();
        assert_eq!(env, "DB_PASSWORD=hunter2\n");
        assert_eq!(h.runner.calls_matching("up -d --remove-orphans").len(), 1);
    }

    #[tokio::test]
    async fn test_deploy_lists_every_missing_required_secret() {
        let h = harness();
        let mut stack = spec(SPEC);
        stack.secrets.push(crate::domain::stack::SecretSpec {
            name: "api-key".into(),
            description: None,
            required: true,
        });
        h.operator.config_set(stack).await.unwrap();

        match h.operator.deploy().await {
            Err(OperatorError::Credential(CredentialError::MissingRequired(names))) => {
                assert_eq!(names, vec!["db-password", "api-key"]);
            }
            other => panic!("expected missing secrets, got {:?}", other.map(|r| r.result)),
        }
        assert!(h.runner.calls_matching("up -d").is_empty());
        assert!(!h.dir.path().join(".stackpilot/compose.yaml").exists());
    }

    #[tokio::test]
    async fn test_config_set_rejects_invalid_spec_without_writing() {
        let h = harness();
        let invalid = spec("name: acme\nservices:\n  api:\n    lifecycle: forever\n");
        let err = h.operator.config_set(invalid).await.unwrap_err();
        assert!(matches!(err, OperatorError::Validation(_)));
        assert_eq!(err.details().len(), 2);
        assert!(!h.dir.path().join("stack.yaml").exists());
    }

    #[tokio::test]
    async fn test_config_set_commits_and_skips_unchanged() {
        let h = harness();
        let first = h.operator.config_set(spec(SPEC)).await.unwrap();
        assert!(first.commit.is_some());
        let again = h.operator.config_set(spec(SPEC)).await.unwrap();
        assert!(again.commit.is_none());

        let history = h.operator.history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, CONFIG_COMMIT_MESSAGE);
        assert_eq!(h.operator.config_get().await.unwrap(), spec(SPEC));
    }

    #[tokio::test]
    async fn test_rollback_restores_spec_and_redeploys() {
        let h = harness();
        let v1 = "name: acme\nservices:\n  api:\n    image: api:1.0\n";
        let v2 = "name: acme\nservices:\n  api:\n    image: api:2.0\n";
        let c1 = h.operator.config_set(spec(v1)).await.unwrap().commit.unwrap();
        let c2 = h.operator.config_set(spec(v2)).await.unwrap().commit.unwrap();

        let report = h.operator.rollback(&c1).await.unwrap();
        assert_eq!(report.rollback.method, RollbackMethod::Revert);
        assert_ne!(report.rollback.head, c2);

        let restored = h.operator.config_get().await.unwrap();
        assert_eq!(restored.services["api"].image.as_deref(), Some("api:1.0"));
        let compose = std::fs::read_to_string(h.dir.path().join(".stackpilot/compose.yaml")).unwrap();
        assert!(compose.contains("api:1.0"));

        let history = h.operator.history(10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].sha, report.rollback.head);
    }

    #[tokio::test]
    async fn test_rollback_to_unknown_revision_fails() {
        let h = harness();
        h.operator.config_set(spec(SPEC)).await.unwrap();
        assert!(matches!(
            h.operator.rollback("0000000000000000000000000000000000000000").await,
            Err(OperatorError::History(HistoryError::UnknownRevision(_)))
        ));
        assert!(matches!(
            h.operator.rollback("  ").await,
            Err(OperatorError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_agent_operations_reject_non_agents() {
        let h = harness();
        h.operator.config_set(spec(SPEC)).await.unwrap();

        assert!(matches!(
            h.operator.agent_start("api").await,
            Err(OperatorError::NotFound { kind: "agent", .. })
        ));
        assert!(matches!(
            h.operator.scale("ghost", 2).await,
            Err(OperatorError::NotFound { kind: "service", .. })
        ));

        h.operator.agent_stop("coder").await.unwrap();
        assert_eq!(h.runner.calls_matching(" stop coder").len(), 1);
    }

    #[tokio::test]
    async fn test_status_lists_declared_workloads() {
        let h = harness();
        h.operator.config_set(spec(SPEC)).await.unwrap();
        let status = h.operator.status().await.unwrap();
        let names: Vec<_> = status.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["api", "coder"]);
        assert!(status.iter().all(|s| s.status == RunState::Stopped));

        let agents = h.operator.agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].image, "coder:1.0");
    }

    #[tokio::test]
    async fn test_credentials_listing_merges_declared_and_stored() {
        let h = harness();
        h.operator.config_set(spec(SPEC)).await.unwrap();
        h.operator.credentials_set("db-password", "s3cret").await.unwrap();
        h.operator.credentials_set("extra", "x").await.unwrap();

        let listing = h.operator.credentials_list().await.unwrap();
        assert_eq!(listing.backend, BackendKind::File);
        let by_key: BTreeMap<_, _> = listing
            .credentials
            .iter()
            .map(|c| (c.env_key.as_str(), c))
            .collect();
        assert!(by_key["DB_PASSWORD"].declared && by_key["DB_PASSWORD"].present);
        assert!(!by_key["SLACK_TOKEN"].present && !by_key["SLACK_TOKEN"].required);
        assert!(!by_key["EXTRA"].declared);

        h.operator.credentials_delete("extra").await.unwrap();
        assert!(matches!(
            h.operator.credentials_delete("extra").await,
            Err(OperatorError::NotFound { .. })
        ));
        assert!(matches!(
            h.operator.credentials_set("bad name", "x").await,
            Err(OperatorError::Credential(CredentialError::InvalidName(_)))
        ));
    }

    struct StalledRuntime;

    #[async_trait]
    impl RuntimeBackend for StalledRuntime {
        async fn diff(&self, _: &ComposeFile) -> Result<ChangeSet, RuntimeError> {
            Ok(ChangeSet::default())
        }
        async fn apply(&self, _: &ComposeFile) -> Result<ApplyResult, RuntimeError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ApplyResult::default())
        }
        async fn status(&self) -> Result<Vec<ServiceStatus>, RuntimeError> {
            Ok(Vec::new())
        }
        async fn logs(&self, service: &str, _: &LogOptions) -> Result<LogStream, RuntimeError> {
            Err(RuntimeError::ServiceNotFound(service.to_string()))
        }
        async fn scale(&self, _: &str, _: u32) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn start(&self, _: &[String]) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn stop(&self, _: &[String]) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn down(&self) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_deploy_times_out() {
        let h = harness_with(Some(Arc::new(StalledRuntime)), Duration::from_millis(50));
        h.operator
            .config_set(spec("name: acme\nservices:\n  api:\n    image: api:1.0\n"))
            .await
            .unwrap();
        assert!(matches!(
            h.operator.deploy().await,
            Err(OperatorError::Timeout(_))
        ));
    }

    fn compose_verbs(runner: &ScriptedRunner) -> Vec<&'static str> {
        runner
            .calls()
            .iter()
            .filter_map(|call| {
                if call.contains(" up -d") {
                    Some("up")
                } else if call.contains(" ps ") {
                    Some("ps")
                } else if call.contains(" down --remove-orphans") {
                    Some("down")
                } else {
                    None
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_deploys_do_not_interleave() {
        let h = harness();
        h.operator
            .config_set(spec("name: acme\nservices:\n  api:\n    image: api:1.0\n"))
            .await
            .unwrap();
        h.runner
            .delay_once("up -d --remove-orphans", Duration::from_millis(200));

        let (first, second, down) = tokio::join!(
            h.operator.deploy(),
            h.operator.deploy(),
            h.operator.down()
        );
        first.unwrap();
        second.unwrap();
        down.unwrap();

        assert_eq!(
            compose_verbs(&h.runner),
            vec!["ps", "up", "ps", "ps", "up", "ps", "down"]
        );
    }

    #[tokio::test]
    async fn test_plan_reports_changes_and_missing_secrets() {
        let h = harness();
        h.operator.config_set(spec(SPEC)).await.unwrap();
        h.runner.on(
            " ps ",
            CommandOutput::ok(r#"{"Service":"old","State":"running","Health":"","ExitCode":0,"Labels":""}"#),
        );
        std::fs::create_dir_all(h.dir.path().join(".stackpilot")).unwrap();
        std::fs::write(h.dir.path().join(".stackpilot/compose.yaml"), "services: {}\n").unwrap();

        let plan = h.operator.plan().await.unwrap();
        assert_eq!(plan.changes.add, vec!["api", "coder"]);
        assert_eq!(plan.changes.remove, vec!["old"]);
        assert_eq!(plan.missing_secrets, vec!["db-password"]);
    }
}
