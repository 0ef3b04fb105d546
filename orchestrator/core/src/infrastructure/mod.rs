// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod command;
pub mod compose;
pub mod credentials;
pub mod git;
pub mod spec_store;

pub use command::{CommandError, CommandOutput, CommandRunner, TokioCommandRunner};
pub use compose::ComposeRuntime;
pub use git::GitVersionControl;
pub use spec_store::{SpecStore, SpecStoreError};
