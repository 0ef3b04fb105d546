// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Subprocess port used by the compose and git adapters.
//!
//! Every child is spawned with `kill_on_drop(true)`: dropping the future (or
//! the output stream) of a command terminates the process.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::domain::runtime::LogStream;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `program arg1 arg2 ...`, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`CommandError::Failed`].
    pub fn check(self, spec: &CommandSpec) -> Result<Self, CommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandError::Failed {
                command: spec.display(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {}: {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. A non-zero exit is not an error here.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Spawn and stream stdout. Dropping the stream kills the process.
    fn stream(&self, spec: &CommandSpec) -> Result<LogStream, CommandError>;
}

/// Runs real processes through `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(command = %spec.display(), "running command");
        let output = spec
            .to_command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn stream(&self, spec: &CommandSpec) -> Result<LogStream, CommandError> {
        debug!(command = %spec.display(), "streaming command");
        let mut child = spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| CommandError::Spawn {
            program: spec.program.clone(),
            source: std::io::Error::other("stdout was not captured"),
        })?;

        // The stream owns the child so the process lives exactly as long as the reader.
        let stream = ReaderStream::new(stdout).map(move |chunk| {
            let _ = &child;
            chunk
        });
        Ok(stream.boxed())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! Scripted [`CommandRunner`] for adapter tests.

    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct Rule {
        needle: String,
        output: CommandOutput,
        once: bool,
    }

    /// Answers commands from a script instead of spawning processes.
    ///
    /// Rules match when the joined argv contains the rule's needle; the first
    /// matching rule wins and `once` rules are consumed. Unmatched commands
    /// succeed with empty output. Every call is recorded.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        delays: Mutex<Vec<(String, std::time::Duration)>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, needle: &str, output: CommandOutput) -> &Self {
            self.rules.lock().push(Rule {
                needle: needle.to_string(),
                output,
                once: false,
            });
            self
        }

        pub fn once(&self, needle: &str, output: CommandOutput) -> &Self {
            self.rules.lock().push(Rule {
                needle: needle.to_string(),
                output,
                once: true,
            });
            self
        }

        /// Hold the next matching command for `delay` after recording it.
        pub fn delay_once(&self, needle: &str, delay: std::time::Duration) -> &Self {
            self.delays.lock().push((needle.to_string(), delay));
            self
        }

        fn take_delay(&self, spec: &CommandSpec) -> Option<std::time::Duration> {
            let line = spec.display();
            let mut delays = self.delays.lock();
            let index = delays.iter().position(|(needle, _)| line.contains(needle))?;
            Some(delays.remove(index).1)
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn calls_matching(&self, needle: &str) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.contains(needle))
                .cloned()
                .collect()
        }

        fn answer(&self, spec: &CommandSpec) -> CommandOutput {
            let line = spec.display();
            self.calls.lock().push(line.clone());

            let mut rules = self.rules.lock();
            match rules.iter().position(|r| line.contains(&r.needle)) {
                Some(index) if rules[index].once => rules.remove(index).output,
                Some(index) => rules[index].output.clone(),
                None => CommandOutput::ok(""),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            let output = self.answer(spec);
            if let Some(delay) = self.take_delay(spec) {
                tokio::time::sleep(delay).await;
            }
            Ok(output)
        }

        fn stream(&self, spec: &CommandSpec) -> Result<LogStream, CommandError> {
            let output = self.answer(spec).check(spec)?;
            let chunk: Result<Bytes, std::io::Error> = Ok(Bytes::from(output.stdout));
            Ok(futures::stream::iter(vec![chunk]).boxed())
        }
    }
}
