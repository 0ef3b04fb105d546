// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! `docker compose` implementation of [`RuntimeBackend`].
//!
//! Every invocation is
//! `<compose> -p <project> -f <root>/.stackpilot/compose.yaml --project-directory <root> [--env-file <runtime.env>] ...`
//! so the adapter never depends on the caller's working directory.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::runtime::{
    ApplyResult, ChangeSet, HealthLabel, LogOptions, LogStream, RunState, RuntimeBackend,
    RuntimeError, ServiceStatus,
};
use crate::domain::runtime_spec::ComposeFile;
use crate::domain::stack::ServiceKind;
use crate::infrastructure::command::{CommandError, CommandRunner, CommandSpec};

pub const KIND_LABEL: &str = "stackpilot.kind";

pub struct ComposeRuntime {
    runner: Arc<dyn CommandRunner>,
    command: Vec<String>,
    project: String,
    root: PathBuf,
    compose_file: PathBuf,
    env_file: PathBuf,
}

impl ComposeRuntime {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        command: Vec<String>,
        project: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Self {
        let root = root.into();
        let work_dir = root.join(".stackpilot");
        Self {
            runner,
            command,
            project: project.into(),
            compose_file: work_dir.join("compose.yaml"),
            env_file: work_dir.join("runtime.env"),
            root,
        }
    }

    fn base(&self) -> CommandSpec {
        let (program, prefix) = match self.command.split_first() {
            Some((program, prefix)) => (program.clone(), prefix.to_vec()),
            None => ("docker".to_string(), vec!["compose".to_string()]),
        };

        let mut spec = CommandSpec::new(program)
            .args(prefix)
            .args(["-p", &self.project])
            .arg("-f")
            .arg(self.compose_file.to_string_lossy())
            .arg("--project-directory")
            .arg(self.root.to_string_lossy())
            .current_dir(&self.root);
        if self.env_file.exists() {
            spec = spec.arg("--env-file").arg(self.env_file.to_string_lossy());
        }
        spec
    }

    async fn run_checked(&self, spec: CommandSpec) -> Result<String, RuntimeError> {
        let output = self.runner.run(&spec).await.map_err(command_failed)?;
        let output = output.check(&spec).map_err(command_failed)?;
        Ok(output.stdout)
    }

    /// Services with at least one container, in any state.
    async fn container_names(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.status().await?.into_iter().map(|s| s.name).collect())
    }

    /// Services that are up; exited containers do not count.
    async fn running_names(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self
            .status()
            .await?
            .into_iter()
            .filter(|s| matches!(s.status, RunState::Running | RunState::Starting))
            .map(|s| s.name)
            .collect())
    }
}

fn command_failed(err: CommandError) -> RuntimeError {
    RuntimeError::CommandFailed(err.to_string())
}

/// One line of `compose ps --format json`.
#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: i32,
    #[serde(rename = "Labels", default)]
    labels: String,
}

impl PsEntry {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Accepts both newline-delimited objects and the legacy single JSON array.
fn parse_ps_output(stdout: &str) -> Result<Vec<PsEntry>, RuntimeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| RuntimeError::Parse(e.to_string()));
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(|e| RuntimeError::Parse(e.to_string())))
        .collect()
}

fn aggregate(entries: Vec<PsEntry>) -> Vec<ServiceStatus> {
    let mut grouped: BTreeMap<String, Vec<PsEntry>> = BTreeMap::new();
    for entry in entries {
        grouped.entry(entry.service.clone()).or_default().push(entry);
    }

    let now = Utc::now();
    grouped
        .into_iter()
        .map(|(name, containers)| {
            let running: Vec<&PsEntry> = containers.iter().filter(|c| c.state == "running").collect();

            let status = if !running.is_empty() {
                if running.iter().all(|c| c.health == "starting") {
                    RunState::Starting
                } else {
                    RunState::Running
                }
            } else if containers
                .iter()
                .any(|c| c.state == "restarting" || c.state == "created")
            {
                RunState::Starting
            } else if containers
                .iter()
                .any(|c| c.state == "dead" || c.exit_code != 0)
            {
                RunState::Error
            } else {
                RunState::Stopped
            };

            let health = if containers.iter().any(|c| c.health == "unhealthy") {
                HealthLabel::Unhealthy
            } else if !running.is_empty() && running.iter().all(|c| c.health == "healthy") {
                HealthLabel::Healthy
            } else {
                HealthLabel::Unknown
            };

            let kind = match containers.iter().find_map(|c| c.label(KIND_LABEL)) {
                Some("agent") => ServiceKind::Agent,
                _ => ServiceKind::Service,
            };

            ServiceStatus {
                name,
                kind,
                status,
                health,
                replicas_running: running.len() as u32,
                replicas_desired: containers.len() as u32,
                updated_at: now,
            }
        })
        .collect()
}

#[async_trait]
impl RuntimeBackend for ComposeRuntime {
    async fn diff(&self, desired: &ComposeFile) -> Result<ChangeSet, RuntimeError> {
        let running = self.container_names().await?;
        Ok(ChangeSet::between(
            desired.service_names(),
            running.iter().map(String::as_str),
        ))
    }

    async fn apply(&self, desired: &ComposeFile) -> Result<ApplyResult, RuntimeError> {
        let before = self.running_names().await?;

        let spec = self.base().args(["up", "-d", "--remove-orphans"]);
        let output = self.runner.run(&spec).await.map_err(command_failed)?;

        let mut warnings = Vec::new();
        if !output.success() {
            let stderr = output.stderr.trim().to_string();
            warn!(
                project = %self.project,
                code = ?output.code,
                "compose up exited with an error, some services may not have converged: {}",
                stderr
            );
            warnings.push(if stderr.is_empty() {
                format!("compose up exited with {:?}", output.code)
            } else {
                stderr
            });
        }

        let after = self.running_names().await?;
        let mut result = ApplyResult::from_transition(
            before.iter().map(String::as_str),
            after.iter().map(String::as_str),
        );
        result.warnings = warnings;

        for name in desired.service_names() {
            if !after.iter().any(|a| a == name) {
                result
                    .warnings
                    .push(format!("service '{}' has no container after apply", name));
            }
        }

        info!(
            project = %self.project,
            started = result.services_started.len(),
            updated = result.services_updated.len(),
            removed = result.services_removed.len(),
            "compose apply finished"
        );
        Ok(result)
    }

    async fn status(&self) -> Result<Vec<ServiceStatus>, RuntimeError> {
        if !self.compose_file.exists() {
            return Ok(Vec::new());
        }
        let stdout = self
            .run_checked(self.base().args(["ps", "--all", "--format", "json"]))
            .await?;
        Ok(aggregate(parse_ps_output(&stdout)?))
    }

    async fn logs(&self, service: &str, options: &LogOptions) -> Result<LogStream, RuntimeError> {
        let mut spec = self.base().args(["logs", "--no-color"]);
        if let Some(lines) = options.lines {
            spec = spec.arg("--tail").arg(lines.to_string());
        }
        if options.follow {
            spec = spec.arg("--follow");
        }
        if let Some(since) = &options.since {
            spec = spec.arg("--since").arg(since);
        }
        spec = spec.arg(service);
        self.runner.stream(&spec).map_err(command_failed)
    }

    async fn scale(&self, service: &str, replicas: u32) -> Result<(), RuntimeError> {
        info!(project = %self.project, service, replicas, "scaling service");
        self.run_checked(self.base().args([
            "up",
            "-d",
            "--no-recreate",
            "--scale",
            &format!("{}={}", service, replicas),
            service,
        ]))
        .await?;
        Ok(())
    }

    async fn start(&self, services: &[String]) -> Result<(), RuntimeError> {
        self.run_checked(self.base().args(["up", "-d"]).args(services.iter().cloned()))
            .await?;
        Ok(())
    }

    async fn stop(&self, services: &[String]) -> Result<(), RuntimeError> {
        self.run_checked(self.base().arg("stop").args(services.iter().cloned()))
            .await?;
        Ok(())
    }

    async fn down(&self) -> Result<(), RuntimeError> {
        if !self.compose_file.exists() {
            return Ok(());
        }
        info!(project = %self.project, "tearing down project");
        self.run_checked(self.base().args(["down", "--remove-orphans"]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::runtime_spec::ComposeService;
    use crate::infrastructure::command::testing::ScriptedRunner;
    use crate::infrastructure::command::CommandOutput;
    use futures::StreamExt;

    fn runtime(runner: Arc<ScriptedRunner>) -> (tempfile::TempDir, ComposeRuntime) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".stackpilot")).unwrap();
        std::fs::write(dir.path().join(".stackpilot/compose.yaml"), "services: {}\n").unwrap();
        let runtime = ComposeRuntime::new(
            runner,
            vec!["docker".into(), "compose".into()],
            "acme",
            dir.path(),
        );
        (dir, runtime)
    }

    fn ps_line(service: &str, state: &str, health: &str, kind: &str) -> String {
        format!(
            r#"{{"Service":"{}","State":"{}","Health":"{}","ExitCode":0,"Labels":"stackpilot.project=acme,stackpilot.kind={}"}}"#,
            service, state, health, kind
        )
    }

    fn desired(names: &[&str]) -> ComposeFile {
        let mut file = ComposeFile::default();
        for name in names {
            file.services.insert(
                name.to_string(),
                ComposeService {
                    image: "nginx".into(),
                    restart: "unless-stopped".into(),
                    ..Default::default()
                },
            );
        }
        file
    }

    #[tokio::test]
    async fn test_status_parses_line_delimited_json() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            " ps ",
            CommandOutput::ok(format!(
                "{}\n{}\n{}\n",
                ps_line("api", "running", "healthy", "service"),
                ps_line("api", "running", "healthy", "service"),
                ps_line("coder", "exited", "", "agent"),
            )),
        );
        let (_dir, runtime) = runtime(runner.clone());

        let status = runtime.status().await.unwrap();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "api");
        assert_eq!(status[0].status, RunState::Running);
        assert_eq!(status[0].health, HealthLabel::Healthy);
        assert_eq!(status[0].replicas_running, 2);
        assert_eq!(status[1].kind, ServiceKind::Agent);
        assert_eq!(status[1].status, RunState::Stopped);

        let call = &runner.calls()[0];
        assert!(call.starts_with("docker compose -p acme -f "));
        assert!(call.contains("--project-directory"));
        assert!(call.ends_with("ps --all --format json"));
    }

    #[tokio::test]
    async fn test_status_parses_legacy_array_json() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            " ps ",
            CommandOutput::ok(format!(
                "[{}]",
                ps_line("db", "restarting", "", "service")
            )),
        );
        let (_dir, runtime) = runtime(runner);
        let status = runtime.status().await.unwrap();
        assert_eq!(status[0].status, RunState::Starting);
    }

    #[tokio::test]
    async fn test_status_is_empty_without_compose_file() {
        let runner = Arc::new(ScriptedRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let runtime = ComposeRuntime::new(runner.clone(), vec!["docker".into(), "compose".into()], "acme", dir.path());
        assert!(runtime.status().await.unwrap().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_diff_against_running() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            " ps ",
            CommandOutput::ok(format!(
                "{}\n{}",
                ps_line("A", "running", "", "service"),
                ps_line("B", "running", "", "service")
            )),
        );
        let (_dir, runtime) = runtime(runner);
        let changes = runtime.diff(&desired(&["B", "C"])).await.unwrap();
        assert_eq!(changes.add, vec!["C"]);
        assert_eq!(changes.update, vec!["B"]);
        assert_eq!(changes.remove, vec!["A"]);
    }

    #[tokio::test]
    async fn test_apply_reports_transition() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .once(" ps ", CommandOutput::ok(format!("{}\n{}", ps_line("old", "running", "", "service"), ps_line("api", "running", "", "service"))))
            .once(" ps ", CommandOutput::ok(format!("{}\n{}", ps_line("api", "running", "", "service"), ps_line("web", "running", "", "service"))));
        let (_dir, runtime) = runtime(runner.clone());

        let result = runtime.apply(&desired(&["api", "web"])).await.unwrap();
        assert_eq!(result.services_started, vec!["web"]);
        assert_eq!(result.services_updated, vec!["api"]);
        assert_eq!(result.services_removed, vec!["old"]);
        assert!(result.warnings.is_empty());
        assert_eq!(runner.calls_matching("up -d --remove-orphans").len(), 1);
    }

    #[tokio::test]
    async fn test_apply_counts_restarted_service_as_started() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .once(
                " ps ",
                CommandOutput::ok(format!(
                    "{}\n{}",
                    ps_line("api", "exited", "", "service"),
                    ps_line("web", "running", "", "service")
                )),
            )
            .once(
                " ps ",
                CommandOutput::ok(format!(
                    "{}\n{}",
                    ps_line("api", "running", "", "service"),
                    ps_line("web", "running", "", "service")
                )),
            );
        let (_dir, runtime) = runtime(runner);

        let result = runtime.apply(&desired(&["api", "web"])).await.unwrap();
        assert_eq!(result.services_started, vec!["api"]);
        assert_eq!(result.services_updated, vec!["web"]);
        assert!(result.services_removed.is_empty());
    }

    #[tokio::test]
    async fn test_failed_up_is_a_warning() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("up -d", CommandOutput::failed(1, "pull access denied for web"));
        let (_dir, runtime) = runtime(runner);

        let result = runtime.apply(&desired(&["web"])).await.unwrap();
        assert!(result.warnings[0].contains("pull access denied"));
        assert!(result.warnings.iter().any(|w| w.contains("'web' has no container")));
    }

    #[tokio::test]
    async fn test_logs_and_scale_argv() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(" logs ", CommandOutput::ok("api-1  | ready\n"));
        let (_dir, runtime) = runtime(runner.clone());

        let options = LogOptions {
            lines: Some(50),
            follow: false,
            since: Some("10m".into()),
        };
        let mut stream = runtime.logs("api", &options).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"api-1  | ready\n");
        assert!(runner.calls()[0].ends_with("logs --no-color --tail 50 --since 10m api"));

        runtime.scale("api", 3).await.unwrap();
        assert!(runner.calls()[1].ends_with("up -d --no-recreate --scale api=3 api"));
    }

    #[tokio::test]
    async fn test_failed_stop_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(" stop ", CommandOutput::failed(1, "no such service: ghost"));
        let (_dir, runtime) = runtime(runner);
        let err = runtime.stop(&["ghost".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("no such service"));
    }
}
