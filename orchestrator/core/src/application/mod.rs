// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod compiler;
pub mod health_monitor;
pub mod operator;

pub use compiler::{compile, normalize_memory, CompileError, CompileOptions};
pub use health_monitor::{HealthMonitor, HealthState};
pub use operator::{CredentialsFactory, Operator, OperatorDeps, OperatorError};
