// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Stack spec → compose manifest.
//!
//! Pure and deterministic: the same spec and options always produce a
//! byte-identical manifest. Secret values never pass through here; secret
//! placeholders become compose variable references resolved from the
//! runtime env file.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::credentials::secret_env_key;
use crate::domain::runtime_spec::{
    compose_duration, ComposeDeploy, ComposeFile, ComposeHealthcheck, ComposeLimits,
    ComposeNetwork, ComposeResources, ComposeService, ComposeVolume, DEFAULT_NETWORK,
};
use crate::domain::stack::{
    AgentSpec, HealthCheckSpec, Lifecycle, McpServerSpec, McpTransport, ServiceKind, ServiceSpec,
    StackSpec, VolumeKind, VolumeMount, Workload, AGENT_WORKSPACE_TARGET, SECRET_PLACEHOLDER,
};

pub const PROJECT_LABEL: &str = "stackpilot.project";
pub const KIND_LABEL: &str = "stackpilot.kind";
pub const LIFECYCLE_LABEL: &str = "stackpilot.lifecycle";

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub project: String,
    /// Base for relative `prompt_file` paths.
    pub root: PathBuf,
    pub cert_resolver: String,
}

impl CompileOptions {
    pub fn new(project: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            root: root.into(),
            cert_resolver: "letsencrypt".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("skill '{skill}': failed to read prompt file {path}: {source}")]
    PromptFile {
        skill: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Serialize)]
struct McpEndpoint<'a> {
    name: &'a str,
    url: String,
    transport: McpTransport,
}

#[derive(Serialize)]
struct RepositoryRef<'a> {
    name: &'a str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
}

pub fn compile(spec: &StackSpec, options: &CompileOptions) -> Result<ComposeFile, CompileError> {
    let skill_prompts = load_skill_prompts(spec, options)?;

    let mut file = ComposeFile::default();
    file.networks
        .insert(DEFAULT_NETWORK.to_string(), ComposeNetwork::default());

    for workload in spec.workloads() {
        let mut service = compile_workload(&workload, options);
        if let Some(agent) = spec.agents.get(workload.name).filter(|_| workload.kind == ServiceKind::Agent) {
            apply_agent(spec, workload.name, agent, &skill_prompts, &mut service);
        }
        collect_named_volumes(&service.volumes, &mut file.volumes);
        file.services.insert(workload.name.to_string(), service);
    }

    for (name, server) in spec.mcp_servers.iter().filter(|(_, s)| s.image.is_some()) {
        file.services
            .insert(name.clone(), compile_sidecar(name, server, options));
    }

    Ok(file)
}

fn compile_workload(workload: &Workload<'_>, options: &CompileOptions) -> ComposeService {
    let spec = workload.spec;
    let lifecycle = workload.lifecycle();

    let mut labels = spec.labels.clone();
    labels.insert(PROJECT_LABEL.to_string(), options.project.clone());
    labels.insert(KIND_LABEL.to_string(), workload.kind.to_string());
    labels.insert(LIFECYCLE_LABEL.to_string(), lifecycle.to_string());
    if lifecycle == Lifecycle::Platform && !spec.domains.is_empty() {
        labels.extend(proxy_labels(workload.name, spec, &options.cert_resolver));
    }

    let mut volumes: Vec<String> = spec
        .volumes
        .iter()
        .map(|v| VolumeMount::parse(v).map(|m| m.to_compose()).unwrap_or_else(|_| v.clone()))
        .collect();
    if workload.kind == ServiceKind::Agent {
        volumes.push(format!(
            "./agents/{}/workspace:{}",
            workload.name, AGENT_WORKSPACE_TARGET
        ));
    }

    let depends_on: BTreeSet<String> = spec.depends_on.iter().cloned().collect();

    ComposeService {
        image: spec.image.clone().unwrap_or_default(),
        command: spec.command.clone(),
        restart: restart_policy(lifecycle).to_string(),
        environment: substitute_secrets(&spec.environment),
        ports: spec.ports.clone(),
        volumes,
        labels,
        healthcheck: spec.health.as_ref().and_then(|h| healthcheck(h, spec)),
        deploy: deploy(spec),
        depends_on: depends_on.into_iter().collect(),
        networks: vec![DEFAULT_NETWORK.to_string()],
    }
}

fn apply_agent(
    spec: &StackSpec,
    name: &str,
    agent: &AgentSpec,
    skill_prompts: &BTreeMap<String, String>,
    service: &mut ComposeService,
) {
    let endpoints: Vec<McpEndpoint<'_>> = spec
        .agent_tool_servers(agent)
        .iter()
        .filter_map(|server| {
            let (key, config) = spec.mcp_servers.get_key_value(server)?;
            Some(McpEndpoint {
                name: key.as_str(),
                url: config.endpoint(key)?,
                transport: config.transport,
            })
        })
        .collect();

    let skills: BTreeSet<&str> = agent
        .skills
        .iter()
        .filter(|s| spec.skills.contains_key(*s))
        .map(String::as_str)
        .collect();

    let env = &mut service.environment;
    env.insert(
        "MCP_SERVERS".to_string(),
        serde_json::to_string(&endpoints).unwrap_or_else(|_| "[]".to_string()),
    );
    env.insert(
        "AGENT_SKILLS".to_string(),
        skills.iter().copied().collect::<Vec<_>>().join(","),
    );
    env.insert("AGENT_NAME".to_string(), name.to_string());
    if let Some(role) = &agent.role {
        env.insert("AGENT_ROLE".to_string(), role.clone());
    }

    let prompts: BTreeMap<&str, &str> = skills
        .iter()
        .filter_map(|s| skill_prompts.get(*s).map(|p| (*s, p.as_str())))
        .collect();
    if !prompts.is_empty() {
        env.insert(
            "AGENT_SKILL_PROMPTS".to_string(),
            serde_json::to_string(&prompts).unwrap_or_default(),
        );
    }

    let mut repositories = Vec::new();
    for repo_name in agent.repositories.iter().collect::<BTreeSet<_>>() {
        let Some((key, repo)) = spec.repositories.get_key_value(repo_name) else {
            continue;
        };
        repositories.push(RepositoryRef {
            name: key.as_str(),
            url: &repo.url,
            branch: repo.branch.as_deref(),
        });
        if let Some(path) = &repo.path {
            service.volumes.push(format!("{}:/repos/{}:ro", path, key));
        }
    }
    if !repositories.is_empty() {
        service.environment.insert(
            "AGENT_REPOSITORIES".to_string(),
            serde_json::to_string(&repositories).unwrap_or_default(),
        );
    }
}

fn compile_sidecar(name: &str, server: &McpServerSpec, options: &CompileOptions) -> ComposeService {
    let labels = BTreeMap::from([
        (PROJECT_LABEL.to_string(), options.project.clone()),
        (KIND_LABEL.to_string(), ServiceKind::Service.to_string()),
        (LIFECYCLE_LABEL.to_string(), Lifecycle::Sidecar.to_string()),
    ]);
    let mut environment = substitute_secrets(&server.environment);
    environment
        .entry("MCP_SERVER_NAME".to_string())
        .or_insert_with(|| name.to_string());

    ComposeService {
        image: server.image.clone().unwrap_or_default(),
        command: server.command.clone(),
        restart: restart_policy(Lifecycle::Sidecar).to_string(),
        environment,
        labels,
        networks: vec![DEFAULT_NETWORK.to_string()],
        ..Default::default()
    }
}

pub fn restart_policy(lifecycle: Lifecycle) -> &'static str {
    match lifecycle {
        Lifecycle::System => "always",
        _ => "unless-stopped",
    }
}

/// Kubernetes-style binary suffixes to compose notation (`512Mi` → `512m`).
/// Anything else passes through unchanged.
pub fn normalize_memory(value: &str) -> String {
    for (suffix, replacement) in [("Gi", "g"), ("Mi", "m"), ("Ki", "k")] {
        if let Some(number) = value.strip_suffix(suffix) {
            return format!("{}{}", number, replacement);
        }
    }
    value.to_string()
}

/// `${secret:db-password}` → `${DB_PASSWORD}`.
pub fn substitute_secret_placeholders(value: &str) -> String {
    SECRET_PLACEHOLDER
        .replace_all(value, |caps: &regex::Captures<'_>| {
            format!("${{{}}}", secret_env_key(&caps[1]))
        })
        .into_owned()
}

fn substitute_secrets(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(k, v)| (k.clone(), substitute_secret_placeholders(v)))
        .collect()
}

fn proxy_labels(name: &str, spec: &ServiceSpec, cert_resolver: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("traefik.enable".to_string(), "true".to_string());

    let default_port = spec
        .port_mappings()
        .first()
        .map(|m| m.container)
        .or_else(|| spec.health.as_ref().and_then(|h| h.port))
        .unwrap_or(80);

    for (index, domain) in spec.domains.iter().enumerate() {
        let router = format!("{}-{}", name, index);
        let prefix = format!("traefik.http.routers.{}", router);
        labels.insert(format!("{}.rule", prefix), format!("Host(`{}`)", domain.host));
        if domain.tls {
            labels.insert(format!("{}.entrypoints", prefix), "websecure".to_string());
            labels.insert(format!("{}.tls.certresolver", prefix), cert_resolver.to_string());
        } else {
            labels.insert(format!("{}.entrypoints", prefix), "web".to_string());
        }
        labels.insert(format!("{}.service", prefix), router.clone());
        labels.insert(
            format!("traefik.http.services.{}.loadbalancer.server.port", router),
            domain.target_port.unwrap_or(default_port).to_string(),
        );
    }
    labels
}

fn healthcheck(health: &HealthCheckSpec, spec: &ServiceSpec) -> Option<ComposeHealthcheck> {
    let test = match &health.command {
        Some(command) => command.clone(),
        None => {
            let port = health
                .port
                .or_else(|| spec.port_mappings().first().map(|m| m.container))?;
            format!(
                "wget -qO- http://localhost:{}{} > /dev/null || exit 1",
                port, health.path
            )
        }
    };
    Some(ComposeHealthcheck {
        test: vec!["CMD-SHELL".to_string(), test],
        interval: compose_duration(health.interval),
        timeout: compose_duration(health.timeout),
        retries: health.retries,
    })
}

fn deploy(spec: &ServiceSpec) -> Option<ComposeDeploy> {
    let resources = spec.resources.as_ref().and_then(|r| {
        let limits = ComposeLimits {
            cpus: r.cpus.map(|c| c.to_string()),
            memory: r
                .memory
                .as_deref()
                .map(normalize_memory)
                .filter(|m| !m.is_empty()),
        };
        (limits.cpus.is_some() || limits.memory.is_some()).then_some(ComposeResources { limits })
    });

    if spec.replicas.is_none() && resources.is_none() {
        return None;
    }
    Some(ComposeDeploy {
        replicas: spec.replicas,
        resources,
    })
}

fn collect_named_volumes(volumes: &[String], out: &mut BTreeMap<String, ComposeVolume>) {
    for volume in volumes {
        if let Ok(mount) = VolumeMount::parse(volume) {
            if mount.kind == VolumeKind::Named {
                out.entry(mount.source).or_default();
            }
        }
    }
}

fn load_skill_prompts(
    spec: &StackSpec,
    options: &CompileOptions,
) -> Result<BTreeMap<String, String>, CompileError> {
    let mut prompts = BTreeMap::new();
    for (name, skill) in &spec.skills {
        let mut text = skill.prompt.clone().unwrap_or_default();
        if let Some(file) = &skill.prompt_file {
            let path = options.root.join(file);
            let fragment =
                std::fs::read_to_string(&path).map_err(|source| CompileError::PromptFile {
                    skill: name.clone(),
                    path: path.clone(),
                    source,
                })?;
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(fragment.trim_end());
        }
        if !text.is_empty() {
            prompts.insert(name.clone(), text);
        }
    }
    Ok(prompts)
}
