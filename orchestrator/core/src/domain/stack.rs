// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Stack Specification (Declarative Spec)
//!
//! The single source of truth the operator reconciles: named services, agents,
//! tool servers, skills, declared secrets and repository links.
//!
//! ## Format
//!
//! ```yaml
//! name: acme
//! environment: production
//! secrets_backend: file
//! services:
//!   api:
//!     image: ghcr.io/acme/api:1.4
//!     lifecycle: platform
//!     ports: ["8080:80"]
//!     domains:
//!       - host: api.acme.dev
//!         tls: true
//!     environment:
//!       DATABASE_PASSWORD: ${secret:db-password}
//! mcp_servers:
//!   github:
//!     url: https://mcp.example.com/github
//! skills:
//!   triage:
//!     mcp_servers: [github]
//!     prompt: Label incoming issues.
//! agents:
//!   coder:
//!     image: ghcr.io/acme/agent:latest
//!     role: Senior engineer
//!     skills: [triage]
//! secrets:
//!   - name: db-password
//! ```
//!
//! All collections are ordered maps so every derived artefact is deterministic.
//! Validation lives in [`StackSpec::validate`] and reports every violation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use crate::domain::validation::{ValidationErrors, Violation};

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap());

static SECRET_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// `${secret:name}` placeholder inside environment values.
pub static SECRET_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{secret:([A-Za-z0-9_.-]+)\}").unwrap());

/// Mount target of the per-agent workspace.
pub const AGENT_WORKSPACE_TARGET: &str = "/workspace";

// ============================================================================
// Top-level document
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_backend: Option<SecretsBackendSelector>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repositories: BTreeMap<String, RepositorySpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mcp_servers: BTreeMap<String, McpServerSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, AgentSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub skills: BTreeMap<String, SkillSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretSpec>,
}

/// Whether a runtime workload comes from `services:` or `agents:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Service,
    Agent,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Service => "service",
            ServiceKind::Agent => "agent",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Closed lifecycle tag controlling restart policy and exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Platform,
    Sidecar,
    Worker,
    System,
    Agent,
    Job,
}

impl Lifecycle {
    pub const ALL: [Lifecycle; 6] = [
        Lifecycle::Platform,
        Lifecycle::Sidecar,
        Lifecycle::Worker,
        Lifecycle::System,
        Lifecycle::Agent,
        Lifecycle::Job,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Platform => "platform",
            Lifecycle::Sidecar => "sidecar",
            Lifecycle::Worker => "worker",
            Lifecycle::System => "system",
            Lifecycle::Agent => "agent",
            Lifecycle::Job => "job",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lifecycle::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Lifecycle as written in the document.
///
/// Unknown strings are kept instead of failing the parse so that validation
/// can report them together with every other problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LifecycleSetting {
    Known(Lifecycle),
    Unrecognized(String),
}

impl From<Lifecycle> for LifecycleSetting {
    fn from(value: Lifecycle) -> Self {
        LifecycleSetting::Known(value)
    }
}

// ============================================================================
// Workloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleSetting>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// `"host:container"`, `"ip:host:container"` or `"container"`, optional `/udp`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    /// `"source:target[:ro]"`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<DomainSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ServiceSpec {
    /// Effective lifecycle; unrecognized values fall back to `default`.
    pub fn lifecycle_or(&self, default: Lifecycle) -> Lifecycle {
        match &self.lifecycle {
            Some(LifecycleSetting::Known(l)) => *l,
            _ => default,
        }
    }

    pub fn replicas(&self) -> u32 {
        self.replicas.unwrap_or(1)
    }

    /// Parsed port mappings, skipping malformed entries.
    pub fn port_mappings(&self) -> Vec<PortMapping> {
        self.ports
            .iter()
            .filter_map(|p| PortMapping::parse(p).ok())
            .collect()
    }

    /// Host port published for `container_port`, if any.
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.port_mappings()
            .into_iter()
            .find(|m| m.container == container_port)
            .and_then(|m| m.host)
    }
}

/// An agent is a service with a workspace mount and a conversational role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(flatten)]
    pub service: ServiceSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub host: String,

    /// Public entrypoint port; defaults to 443 with TLS and 80 without.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Container port the proxy forwards to; defaults to the first mapped port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,

    #[serde(default)]
    pub tls: bool,
}

impl DomainSpec {
    pub fn public_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 443 } else { 80 })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,

    /// Memory limit, Kubernetes (`512Mi`) or compose (`512m`) notation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Container port probed by the compiled health check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Explicit URL probed by the operator's monitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Shell command used as the container health check instead of an HTTP probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            port: None,
            url: None,
            command: None,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            retries: default_health_retries(),
        }
    }
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_retries() -> u32 {
    3
}

// ============================================================================
// Tool servers, skills, secrets, repositories
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    #[default]
    Http,
    Stdio,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerSpec {
    /// Remote endpoint; mutually optional with `image`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Containerised tool server, compiled as a sidecar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub transport: McpTransport,
}

impl McpServerSpec {
    pub const DEFAULT_PORT: u16 = 8080;

    /// Endpoint agents use to reach this server.
    pub fn endpoint(&self, name: &str) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        self.image.as_ref().map(|_| {
            format!(
                "http://{}:{}/mcp",
                name,
                self.port.unwrap_or(Self::DEFAULT_PORT)
            )
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Prompt fragment read at compile time, relative to the stack root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Local checkout mounted read-only into referencing agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// ============================================================================
// Credentials backend selector
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    File,
    Vault,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::File => "file",
            BackendKind::Vault => "vault",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `secrets_backend: file` or a full table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretsBackendSelector {
    Kind(BackendKind),
    Config(SecretsBackendConfig),
}

impl SecretsBackendSelector {
    pub fn config(&self) -> SecretsBackendConfig {
        match self {
            SecretsBackendSelector::Kind(kind) => SecretsBackendConfig {
                kind: *kind,
                ..Default::default()
            },
            SecretsBackendSelector::Config(config) => config.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsBackendConfig {
    #[serde(rename = "type", default)]
    pub kind: BackendKind,

    /// File backend: env file path relative to the stack root (default `.env`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Vault backend: server address; falls back to `VAULT_ADDR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_id_env: Option<String>,
}

// ============================================================================
// Port / volume notation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host: Option<u16>,
    pub container: u16,
    pub protocol: Option<String>,
}

impl PortMapping {
    pub fn parse(value: &str) -> Result<Self, String> {
        let (ports, protocol) = match value.split_once('/') {
            Some((ports, proto)) if proto == "tcp" || proto == "udp" => {
                (ports, Some(proto.to_string()))
            }
            Some(_) => return Err(value.to_string()),
            None => (value, None),
        };

        let parse = |s: &str| s.trim().parse::<u16>().map_err(|_| value.to_string());
        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host, container) = match parts.as_slice() {
            [container] => (None, None, parse(container)?),
            [host, container] => (None, Some(parse(host)?), parse(container)?),
            [ip, host, container] => (Some(ip.to_string()), Some(parse(host)?), parse(container)?),
            _ => return Err(value.to_string()),
        };

        if container == 0 || host == Some(0) {
            return Err(value.to_string());
        }

        Ok(Self {
            host_ip,
            host,
            container,
            protocol,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Bind,
    Named,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub kind: VolumeKind,
}

impl VolumeMount {
    pub fn parse(value: &str) -> Result<Self, String> {
        let parts: Vec<&str> = value.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => return Err(value.to_string()),
        };

        if source.is_empty() || !target.starts_with('/') {
            return Err(value.to_string());
        }

        let kind = if source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
        {
            VolumeKind::Bind
        } else if source
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            VolumeKind::Named
        } else {
            return Err(value.to_string());
        };

        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
            kind,
        })
    }

    pub fn to_compose(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Secret names referenced via `${secret:name}` in `value`.
pub fn secret_references(value: &str) -> Vec<String> {
    SECRET_PLACEHOLDER
        .captures_iter(value)
        .map(|c| c[1].to_string())
        .collect()
}

pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

pub fn is_valid_secret_name(name: &str) -> bool {
    SECRET_NAME_PATTERN.is_match(name)
}

// ============================================================================
// Queries and validation
// ============================================================================

/// One runtime workload (service or agent) viewed uniformly.
#[derive(Debug, Clone, Copy)]
pub struct Workload<'a> {
    pub name: &'a str,
    pub kind: ServiceKind,
    pub spec: &'a ServiceSpec,
}

impl Workload<'_> {
    pub fn lifecycle(&self) -> Lifecycle {
        self.spec.lifecycle_or(match self.kind {
            ServiceKind::Service => Lifecycle::Worker,
            ServiceKind::Agent => Lifecycle::Agent,
        })
    }

    fn owner(&self) -> String {
        format!("{} '{}'", self.kind, self.name)
    }
}

impl StackSpec {
    /// Services first, then agents, each in name order.
    pub fn workloads(&self) -> impl Iterator<Item = Workload<'_>> {
        let services = self.services.iter().map(|(name, spec)| Workload {
            name,
            kind: ServiceKind::Service,
            spec,
        });
        let agents = self.agents.iter().map(|(name, agent)| Workload {
            name,
            kind: ServiceKind::Agent,
            spec: &agent.service,
        });
        services.chain(agents)
    }

    pub fn workload(&self, name: &str) -> Option<Workload<'_>> {
        self.workloads().find(|w| w.name == name)
    }

    pub fn is_agent(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn secrets_backend_config(&self) -> SecretsBackendConfig {
        self.secrets_backend
            .as_ref()
            .map(|s| s.config())
            .unwrap_or_default()
    }

    /// Tool-server names reachable from an agent: direct references unioned
    /// with those pulled in through its skills, de-duplicated and sorted.
    /// Unresolvable references are skipped.
    pub fn agent_tool_servers(&self, agent: &AgentSpec) -> Vec<String> {
        let mut names = BTreeSet::new();
        for reference in &agent.mcp_servers {
            if self.mcp_servers.contains_key(reference) {
                names.insert(reference.clone());
            }
        }
        for skill in agent.skills.iter().filter_map(|s| self.skills.get(s)) {
            for reference in &skill.mcp_servers {
                if self.mcp_servers.contains_key(reference) {
                    names.insert(reference.clone());
                }
            }
        }
        names.into_iter().collect()
    }

    /// Check every structural invariant, collecting all violations.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.name.trim().is_empty() {
            errors.push(Violation::EmptyStackName);
        }

        self.validate_names(&mut errors);
        self.validate_workloads(&mut errors);
        self.validate_references(&mut errors);
        self.validate_claims(&mut errors);
        self.validate_secrets(&mut errors);

        errors.into_result()
    }

    fn validate_names(&self, errors: &mut ValidationErrors) {
        let groups: [(&str, Vec<&String>); 5] = [
            ("service", self.services.keys().collect()),
            ("agent", self.agents.keys().collect()),
            ("mcp server", self.mcp_servers.keys().collect()),
            ("skill", self.skills.keys().collect()),
            ("repository", self.repositories.keys().collect()),
        ];
        for (entity, names) in groups {
            for name in names {
                if !is_valid_name(name) {
                    errors.push(Violation::InvalidName {
                        entity: entity.to_string(),
                        name: name.clone(),
                    });
                }
            }
        }

        // Services, agents and containerised tool servers share one container namespace.
        let mut seen = BTreeSet::new();
        let containers = self
            .services
            .keys()
            .chain(self.agents.keys())
            .chain(
                self.mcp_servers
                    .iter()
                    .filter(|(_, m)| m.image.is_some())
                    .map(|(name, _)| name),
            );
        for name in containers {
            if !seen.insert(name.as_str()) {
                errors.push(Violation::DuplicateName { name: name.clone() });
            }
        }
    }

    fn validate_workloads(&self, errors: &mut ValidationErrors) {
        for workload in self.workloads() {
            let owner = workload.owner();
            let spec = workload.spec;

            if spec.image.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                errors.push(Violation::MissingImage {
                    owner: owner.clone(),
                });
            }

            if let Some(LifecycleSetting::Unrecognized(value)) = &spec.lifecycle {
                errors.push(Violation::InvalidLifecycle {
                    owner: owner.clone(),
                    value: value.clone(),
                });
            }

            for port in &spec.ports {
                if PortMapping::parse(port).is_err() {
                    errors.push(Violation::InvalidPort {
                        owner: owner.clone(),
                        value: port.clone(),
                    });
                }
            }

            for volume in &spec.volumes {
                if VolumeMount::parse(volume).is_err() {
                    errors.push(Violation::InvalidVolume {
                        owner: owner.clone(),
                        value: volume.clone(),
                    });
                }
            }

            for dependency in &spec.depends_on {
                let known = self.services.contains_key(dependency)
                    || self.agents.contains_key(dependency)
                    || self
                        .mcp_servers
                        .get(dependency)
                        .map(|m| m.image.is_some())
                        .unwrap_or(false);
                if !known {
                    errors.push(Violation::UnknownDependency {
                        owner: owner.clone(),
                        reference: dependency.clone(),
                    });
                }
            }
        }

        for (name, server) in &self.mcp_servers {
            if server.url.is_none() && server.image.is_none() {
                errors.push(Violation::McpServerMissingEndpoint { name: name.clone() });
            }
        }
    }

    fn validate_references(&self, errors: &mut ValidationErrors) {
        for (name, agent) in &self.agents {
            for reference in &agent.mcp_servers {
                if !self.mcp_servers.contains_key(reference) {
                    errors.push(Violation::UnknownMcpServer {
                        owner: format!("agent '{}'", name),
                        reference: reference.clone(),
                    });
                }
            }
            for reference in &agent.skills {
                if !self.skills.contains_key(reference) {
                    errors.push(Violation::UnknownSkill {
                        agent: name.clone(),
                        reference: reference.clone(),
                    });
                }
            }
            for reference in &agent.repositories {
                if !self.repositories.contains_key(reference) {
                    errors.push(Violation::UnknownRepository {
                        agent: name.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }

        for (name, skill) in &self.skills {
            for reference in &skill.mcp_servers {
                if !self.mcp_servers.contains_key(reference) {
                    errors.push(Violation::UnknownMcpServer {
                        owner: format!("skill '{}'", name),
                        reference: reference.clone(),
                    });
                }
            }
        }
    }

    fn validate_claims(&self, errors: &mut ValidationErrors) {
        let mut domains: BTreeMap<(String, u16), &str> = BTreeMap::new();
        let mut host_ports: BTreeMap<u16, &str> = BTreeMap::new();

        for workload in self.workloads() {
            for domain in &workload.spec.domains {
                let key = (domain.host.to_lowercase(), domain.public_port());
                match domains.get(&key) {
                    Some(first) if *first != workload.name => {
                        errors.push(Violation::DomainConflict {
                            host: key.0.clone(),
                            port: key.1,
                            first: first.to_string(),
                            second: workload.name.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        domains.insert(key, workload.name);
                    }
                }
            }

            for mapping in workload.spec.port_mappings() {
                let Some(host) = mapping.host else { continue };
                match host_ports.get(&host) {
                    Some(first) if *first != workload.name => {
                        errors.push(Violation::HostPortConflict {
                            port: host,
                            first: first.to_string(),
                            second: workload.name.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        host_ports.insert(host, workload.name);
                    }
                }
            }
        }
    }

    fn validate_secrets(&self, errors: &mut ValidationErrors) {
        let mut declared = BTreeSet::new();
        for secret in &self.secrets {
            if !is_valid_secret_name(&secret.name) {
                errors.push(Violation::InvalidName {
                    entity: "secret".to_string(),
                    name: secret.name.clone(),
                });
            }
            if !declared.insert(secret.name.as_str()) {
                errors.push(Violation::DuplicateSecret {
                    name: secret.name.clone(),
                });
            }
        }

        let check_env = |owner: String, env: &BTreeMap<String, String>, errors: &mut ValidationErrors| {
            for value in env.values() {
                for secret in secret_references(value) {
                    if !declared.contains(secret.as_str()) {
                        errors.push(Violation::UndeclaredSecret {
                            owner: owner.clone(),
                            secret,
                        });
                    }
                }
            }
        };

        for workload in self.workloads() {
            check_env(workload.owner(), &workload.spec.environment, errors);
        }
        for (name, server) in &self.mcp_servers {
            check_env(format!("mcp server '{}'", name), &server.environment, errors);
        }

        let backend = self.secrets_backend_config();
        if backend.kind == BackendKind::Vault
            && backend.address.is_none()
            && std::env::var("VAULT_ADDR").is_err()
        {
            errors.push(Violation::InvalidSecretsBackend {
                reason: "vault backend requires an address (or VAULT_ADDR)".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> StackSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_full_document() {
        let spec = parse(
            r#"
name: acme
environment: production
secrets_backend: file
services:
  api:
    image: ghcr.io/acme/api:1.4
    lifecycle: platform
    ports: ["8080:80"]
    domains:
      - host: api.acme.dev
        tls: true
    health:
      path: /healthz
      port: 80
      interval: 10s
mcp_servers:
  github:
    url: https://mcp.example.com/github
skills:
  triage:
    mcp_servers: [github]
agents:
  coder:
    image: ghcr.io/acme/agent:latest
    role: Senior engineer
    skills: [triage]
secrets:
  - name: db-password
"#,
        );

        assert_eq!(spec.name, "acme");
        assert_eq!(
            spec.secrets_backend,
            Some(SecretsBackendSelector::Kind(BackendKind::File))
        );
        let api = &spec.services["api"];
        assert_eq!(api.lifecycle, Some(LifecycleSetting::Known(Lifecycle::Platform)));
        assert_eq!(api.health.as_ref().unwrap().interval, Duration::from_secs(10));
        assert_eq!(spec.agents["coder"].service.image.as_deref(), Some("ghcr.io/acme/agent:latest"));
        assert!(spec.secrets[0].required);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_unknown_lifecycle_is_kept_for_validation() {
        let spec = parse(
            r#"
name: acme
services:
  api:
    image: nginx
    lifecycle: daemon
"#,
        );
        assert_eq!(
            spec.services["api"].lifecycle,
            Some(LifecycleSetting::Unrecognized("daemon".to_string()))
        );
    }

    #[test]
    fn test_validation_reports_all_problems_at_once() {
        let spec = parse(
            r#"
name: acme
services:
  api:
    image: nginx
    lifecycle: daemon
agents:
  coder:
    image: agent
    mcp_servers: [missing-server]
"#,
        );

        let errors = spec.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|v| matches!(v, Violation::InvalidLifecycle { value, .. } if value == "daemon")));
        assert!(errors.iter().any(|v| matches!(v, Violation::UnknownMcpServer { reference, .. } if reference == "missing-server")));
    }

    #[test]
    fn test_domain_conflict_names_both_services() {
        let spec = parse(
            r#"
name: acme
services:
  blog:
    image: ghost
    lifecycle: platform
    domains:
      - host: example.com
        port: 80
  shop:
    image: shopify
    lifecycle: platform
    domains:
      - host: example.com
        port: 80
"#,
        );

        let errors = spec.validate().unwrap_err();
        assert_eq!(
            errors.violations,
            vec![Violation::DomainConflict {
                host: "example.com".to_string(),
                port: 80,
                first: "blog".to_string(),
                second: "shop".to_string(),
            }]
        );
        let message = errors.to_string();
        assert!(message.contains("blog") && message.contains("shop"));
    }

    #[test]
    fn test_same_host_on_different_ports_is_allowed() {
        let spec = parse(
            r#"
name: acme
services:
  web:
    image: nginx
    domains:
      - host: example.com
  secure:
    image: nginx
    domains:
      - host: example.com
        tls: true
"#,
        );
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_host_port_conflict() {
        let spec = parse(
            r#"
name: acme
services:
  a:
    image: nginx
    ports: ["8080:80"]
agents:
  b:
    image: agent
    ports: ["127.0.0.1:8080:3000"]
"#,
        );
        let errors = spec.validate().unwrap_err();
        assert!(matches!(
            &errors.violations[0],
            Violation::HostPortConflict { port: 8080, first, second } if first == "a" && second == "b"
        ));
    }

    #[test]
    fn test_skill_and_secret_references() {
        let spec = parse(
            r#"
name: acme
services:
  api:
    image: nginx
    environment:
      TOKEN: ${secret:api-token}
skills:
  broken:
    mcp_servers: [nope]
agents:
  coder:
    image: agent
    skills: [ghost]
    repositories: [monorepo]
"#,
        );
        let messages = spec.validate().unwrap_err().messages();
        assert_eq!(messages.len(), 4, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("undeclared secret 'api-token'")));
        assert!(messages.iter().any(|m| m.contains("skill 'broken'")));
        assert!(messages.iter().any(|m| m.contains("undefined skill 'ghost'")));
        assert!(messages.iter().any(|m| m.contains("undefined repository 'monorepo'")));
    }

    #[test]
    fn test_agent_tool_servers_union_is_sorted_and_deduplicated() {
        let spec = parse(
            r#"
name: acme
mcp_servers:
  zeta: { url: "http://zeta" }
  alpha: { url: "http://alpha" }
  mid: { url: "http://mid" }
skills:
  s1:
    mcp_servers: [zeta, alpha]
agents:
  coder:
    image: agent
    mcp_servers: [mid, zeta, unknown]
    skills: [s1]
"#,
        );
        let servers = spec.agent_tool_servers(&spec.agents["coder"]);
        assert_eq!(servers, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_port_mapping_parse() {
        assert_eq!(PortMapping::parse("8080:80").unwrap().host, Some(8080));
        assert_eq!(PortMapping::parse("80").unwrap().host, None);
        let udp = PortMapping::parse("0.0.0.0:53:53/udp").unwrap();
        assert_eq!(udp.host_ip.as_deref(), Some("0.0.0.0"));
        assert_eq!(udp.protocol.as_deref(), Some("udp"));
        assert!(PortMapping::parse("abc:80").is_err());
        assert!(PortMapping::parse("80/sctp").is_err());
    }

    #[test]
    fn test_volume_parse() {
        let bind = VolumeMount::parse("./data:/data:ro").unwrap();
        assert_eq!(bind.kind, VolumeKind::Bind);
        assert!(bind.read_only);
        let named = VolumeMount::parse("pgdata:/var/lib/postgresql/data").unwrap();
        assert_eq!(named.kind, VolumeKind::Named);
        assert!(VolumeMount::parse("nodest").is_err());
        assert!(VolumeMount::parse("data:relative").is_err());
    }

    #[test]
    fn test_secret_references() {
        assert_eq!(
            secret_references("postgres://u:${secret:db-password}@db/${secret:db_name}"),
            vec!["db-password", "db_name"]
        );
        assert!(secret_references("${NOT_A_SECRET}").is_empty());
    }
}
