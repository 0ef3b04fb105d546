// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use stackpilot_core::application::health_monitor::HealthMonitor;
use stackpilot_core::application::operator::{Operator, OperatorDeps};
use stackpilot_core::domain::operator_config::OperatorConfig;
use stackpilot_core::infrastructure::command::testing::ScriptedRunner;
use stackpilot_core::infrastructure::command::TokioCommandRunner;
use stackpilot_core::infrastructure::credentials::credentials_backend_from_spec;
use stackpilot_core::infrastructure::{ComposeRuntime, GitVersionControl};

pub const STACK: &str = r#"
name: acme
services:
  api:
    image: api:1.0
    environment:
      DATABASE_PASSWORD: ${secret:db-password}
agents:
  coder:
    image: coder:1.0
    mcp_servers: [github]
mcp_servers:
  github:
    url: http://github-mcp:8080/mcp
secrets:
  - name: db-password
"#;

/// Operator over a temp root: compose answered by a [`ScriptedRunner`],
/// history backed by real `git`.
pub struct TestStack {
    pub dir: tempfile::TempDir,
    pub runner: Arc<ScriptedRunner>,
    pub operator: Arc<Operator>,
}

impl TestStack {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let config = OperatorConfig {
            root: dir.path().to_path_buf(),
            git_author_name: "test-user".into(),
            git_author_email: "test@example.com".into(),
            ..Default::default()
        };

        let runtime = Arc::new(ComposeRuntime::new(
            runner.clone(),
            config.compose_command.clone(),
            "acme",
            dir.path(),
        ));
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

        Self {
            dir,
            runner,
            operator: Arc::new(operator),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_spec(&self, yaml: &str) {
        std::fs::write(self.root().join("stack.yaml"), yaml).unwrap();
    }
}
