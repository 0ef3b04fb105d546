// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! `git` implementation of [`VersionControl`] over the stack root.

use async_trait::async_trait;
use chrono::DateTime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::history::{CommitInfo, HistoryError, RollbackMethod, RollbackOutcome, VersionControl};
use crate::infrastructure::command::{CommandOutput, CommandRunner, CommandSpec};

const FIELD_SEPARATOR: char = '\x1f';
const LOG_FORMAT: &str = "--format=%H%x1f%an%x1f%aI%x1f%s";

/// Entries every stack repository ignores.
pub const IGNORED_PATHS: [&str; 2] = [".env", ".stackpilot/"];

pub struct GitVersionControl {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    author_name: String,
    author_email: String,
}

impl GitVersionControl {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        root: impl Into<PathBuf>,
        author_name: impl Into<String>,
        author_email: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            root: root.into(),
            author_name: author_name.into(),
            author_email: author_email.into(),
        }
    }

    fn git(&self) -> CommandSpec {
        CommandSpec::new("git")
            .arg("-C")
            .arg(self.root.to_string_lossy())
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, HistoryError> {
        self.runner
            .run(&spec)
            .await
            .map_err(|e| HistoryError::CommandFailed(e.to_string()))
    }

    async fn run_checked(&self, spec: CommandSpec) -> Result<String, HistoryError> {
        let output = self.run(spec.clone()).await?;
        let output = output
            .check(&spec)
            .map_err(|e| HistoryError::CommandFailed(e.to_string()))?;
        Ok(output.stdout)
    }

    async fn has_commits(&self) -> Result<bool, HistoryError> {
        let output = self
            .run(self.git().args(["rev-parse", "--verify", "--quiet", "HEAD"]))
            .await?;
        Ok(output.success())
    }

    fn write_gitignore(&self) -> Result<(), HistoryError> {
        let path = self.root.join(".gitignore");
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        let missing: Vec<&str> = IGNORED_PATHS
            .iter()
            .copied()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        for entry in missing {
            content.push_str(entry);
            content.push('\n');
        }
        std::fs::write(&path, content)
            .map_err(|e| HistoryError::CommandFailed(format!("failed to write .gitignore: {}", e)))
    }
}

fn parse_log(stdout: &str) -> Result<Vec<CommitInfo>, HistoryError> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.splitn(4, FIELD_SEPARATOR).collect();
            let [sha, author, date, message] = fields.as_slice() else {
                return Err(HistoryError::Parse(line.to_string()));
            };
            let date = DateTime::parse_from_rfc3339(date)
                .map_err(|e| HistoryError::Parse(format!("bad commit date '{}': {}", date, e)))?;
            Ok(CommitInfo {
                sha: sha.to_string(),
                author: author.to_string(),
                date,
                message: message.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl VersionControl for GitVersionControl {
    async fn init(&self) -> Result<(), HistoryError> {
        if !self.root.join(".git").exists() {
            info!(root = %self.root.display(), "initialising stack repository");
            self.run_checked(self.git().arg("init")).await?;
        }
        self.write_gitignore()
    }

    async fn commit(
        &self,
        paths: &[PathBuf],
        message: &str,
    ) -> Result<Option<String>, HistoryError> {
        let existing: Vec<String> = paths
            .iter()
            .filter(|p| p.exists())
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if existing.is_empty() {
            return Ok(None);
        }

        self.run_checked(self.git().arg("add").arg("--").args(existing))
            .await?;

        let diff = self
            .run(self.git().args(["diff", "--cached", "--quiet"]))
            .await?;
        match diff.code {
            Some(0) => return Ok(None),
            Some(1) => {}
            _ => {
                return Err(HistoryError::CommandFailed(format!(
                    "git diff --cached failed: {}",
                    diff.stderr.trim()
                )))
            }
        }

        self.run_checked(self.git().args(["commit", "--quiet", "-m", message]))
            .await?;
        let sha = self.resolve("HEAD").await?;
        info!(sha = %sha, "committed stack change: {}", message);
        Ok(Some(sha))
    }

    async fn log(&self, limit: usize) -> Result<Vec<CommitInfo>, HistoryError> {
        if !self.has_commits().await? {
            return Ok(Vec::new());
        }
        let stdout = self
            .run_checked(self.git().args(["log", "-n", &limit.to_string(), LOG_FORMAT]))
            .await?;
        parse_log(&stdout)
    }

    async fn resolve(&self, revision: &str) -> Result<String, HistoryError> {
        let output = self
            .run(self.git().args([
                "rev-parse",
                "--verify",
                "--quiet",
                &format!("{}^{{commit}}", revision),
            ]))
            .await?;
        let sha = output.stdout.trim();
        if !output.success() || sha.is_empty() {
            return Err(HistoryError::UnknownRevision(revision.to_string()));
        }
        Ok(sha.to_string())
    }

    async fn rollback(&self, target: &str) -> Result<RollbackOutcome, HistoryError> {
        let target_sha = self.resolve(target).await?;
        let head = self.resolve("HEAD").await?;
        if target_sha == head {
            return Ok(RollbackOutcome {
                target: target_sha,
                method: RollbackMethod::Revert,
                head,
            });
        }

        let ancestor = self
            .run(self.git().args(["merge-base", "--is-ancestor", &target_sha, "HEAD"]))
            .await?;
        if !ancestor.success() {
            return Err(HistoryError::UnknownRevision(format!(
                "{} is not an ancestor of HEAD",
                target
            )));
        }

        let range = format!("{}..HEAD", target_sha);
        let revert = self
            .run(self.git().args(["revert", "--no-edit", &range]))
            .await?;

        let method = if revert.success() {
            info!(target = %target_sha, "rolled back by reverting {}", range);
            RollbackMethod::Revert
        } else {
            let abort = self.run(self.git().args(["revert", "--abort"])).await?;
            if !abort.success() {
                warn!("git revert --abort failed: {}", abort.stderr.trim());
            }
            error!(
                target = %target_sha,
                discarded_from = %head,
                "revert failed ({}); falling back to git reset --hard, history after the target is discarded",
                revert.stderr.trim()
            );
            self.run_checked(self.git().args(["reset", "--hard", &target_sha]))
                .await?;
            RollbackMethod::Reset
        };

        Ok(RollbackOutcome {
            target: target_sha,
            method,
            head: self.resolve("HEAD").await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::command::testing::ScriptedRunner;
    use crate::infrastructure::command::TokioCommandRunner;

    fn repo() -> (tempfile::TempDir, GitVersionControl) {
        let dir = tempfile::tempdir().unwrap();
        let git = GitVersionControl::new(
            Arc::new(TokioCommandRunner::new()),
            dir.path(),
            "test-user",
            "test@example.com",
        );
        (dir, git)
    }

    #[tokio::test]
    async fn test_init_writes_gitignore_once() {
        let (dir, git) = repo();
        git.init().await.unwrap();
        git.init().await.unwrap();

        assert!(dir.path().join(".git").exists());
        let ignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(ignore, ".env\n.stackpilot/\n");
        assert!(git.log(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_skips_when_nothing_changed() {
        let (dir, git) = repo();
        git.init().await.unwrap();
        let spec = dir.path().join("stack.yaml");

        std::fs::write(&spec, "name: a\n").unwrap();
        let first = git.commit(&[spec.clone()], "first").await.unwrap();
        assert!(first.is_some());

        let second = git.commit(&[spec.clone()], "nothing").await.unwrap();
        assert_eq!(second, None);

        let log = git.log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "first");
        assert_eq!(log[0].author, "test-user");
        assert_eq!(Some(log[0].sha.clone()), first);
    }

    #[tokio::test]
    async fn test_rollback_reverts_and_keeps_history() {
        let (dir, git) = repo();
        git.init().await.unwrap();
        let spec = dir.path().join("stack.yaml");

        std::fs::write(&spec, "name: x\n").unwrap();
        let c1 = git.commit(&[spec.clone()], "c1").await.unwrap().unwrap();
        std::fs::write(&spec, "name: y\n").unwrap();
        let c2 = git.commit(&[spec.clone()], "c2").await.unwrap().unwrap();

        let outcome = git.rollback(&c1).await.unwrap();
        assert_eq!(outcome.method, RollbackMethod::Revert);
        assert_eq!(outcome.target, c1);
        assert_ne!(outcome.head, c2);
        assert_eq!(std::fs::read_to_string(&spec).unwrap(), "name: x\n");
        assert_eq!(git.log(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rollback_unknown_revision() {
        let (dir, git) = repo();
        git.init().await.unwrap();
        std::fs::write(dir.path().join("stack.yaml"), "name: x\n").unwrap();
        git.commit(&[dir.path().join("stack.yaml")], "c1").await.unwrap();

        let err = git.rollback("0000000000000000000000000000000000000000").await.unwrap_err();
        assert!(matches!(err, HistoryError::UnknownRevision(_)));
    }

    #[tokio::test]
    async fn test_rollback_falls_back_to_reset() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .on("c1^{commit}", CommandOutput::ok("c1\n"))
            .once("HEAD^{commit}", CommandOutput::ok("c2\n"))
            .once("HEAD^{commit}", CommandOutput::ok("c1\n"))
            .on("revert --no-edit", CommandOutput::failed(1, "CONFLICT (content)"));
        let git = GitVersionControl::new(runner.clone(), "/srv/stack", "u", "u@example.com");

        let outcome = git.rollback("c1").await.unwrap();
        assert_eq!(outcome.method, RollbackMethod::Reset);
        assert_eq!(outcome.head, "c1");
        assert_eq!(runner.calls_matching("revert --abort").len(), 1);
        assert_eq!(runner.calls_matching("reset --hard c1").len(), 1);
    }

    #[test]
    fn test_parse_log() {
        let line = "abc\x1fJane\x1f2026-01-02T03:04:05+00:00\x1fconfig: update stack spec\n";
        let log = parse_log(line).unwrap();
        assert_eq!(log[0].sha, "abc");
        assert_eq!(log[0].message, "config: update stack spec");
        assert!(parse_log("garbage").is_err());
    }
}
