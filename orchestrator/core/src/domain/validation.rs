// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Stack Validation Errors
//!
//! Structural problems found in a [`crate::domain::stack::StackSpec`]. Validation
//! never stops at the first problem: every violation is collected into a
//! [`ValidationErrors`] so a caller can fix the document in one pass.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// A single structural problem in the stack spec.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("stack name cannot be empty")]
    EmptyStackName,

    #[error("{entity} name '{name}' is invalid (lowercase letters, digits and '-' only, max 63 chars)")]
    InvalidName { entity: String, name: String },

    #[error("'{name}' is used by more than one container (service, agent or mcp server)")]
    DuplicateName { name: String },

    #[error("{owner}: image is required")]
    MissingImage { owner: String },

    #[error("{owner}: invalid lifecycle '{value}' (expected one of platform, sidecar, worker, system, agent, job)")]
    InvalidLifecycle { owner: String, value: String },

    #[error("{owner}: references undefined mcp server '{reference}'")]
    UnknownMcpServer { owner: String, reference: String },

    #[error("agent '{agent}': references undefined skill '{reference}'")]
    UnknownSkill { agent: String, reference: String },

    #[error("agent '{agent}': references undefined repository '{reference}'")]
    UnknownRepository { agent: String, reference: String },

    #[error("{owner}: depends on undefined service '{reference}'")]
    UnknownDependency { owner: String, reference: String },

    #[error("domain conflict: {host}:{port} is claimed by both '{first}' and '{second}'")]
    DomainConflict {
        host: String,
        port: u16,
        first: String,
        second: String,
    },

    #[error("host port conflict: port {port} is claimed by both '{first}' and '{second}'")]
    HostPortConflict { port: u16, first: String, second: String },

    #[error("{owner}: invalid port mapping '{value}'")]
    InvalidPort { owner: String, value: String },

    #[error("{owner}: invalid volume '{value}'")]
    InvalidVolume { owner: String, value: String },

    #[error("{owner}: references undeclared secret '{secret}'")]
    UndeclaredSecret { owner: String, secret: String },

    #[error("secret '{name}' is declared more than once")]
    DuplicateSecret { name: String },

    #[error("mcp server '{name}': either url or image is required")]
    McpServerMissingEndpoint { name: String },

    #[error("secrets_backend: {reason}")]
    InvalidSecretsBackend { reason: String },
}

/// Every violation found in one validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ValidationErrors {
    pub violations: Vec<Violation>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter()
    }

    /// Human-readable message per violation, in discovery order.
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.to_string()).collect()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack spec is invalid ({} problem", self.violations.len())?;
        if self.violations.len() != 1 {
            write!(f, "s")?;
        }
        write!(f, ")")?;
        for violation in &self.violations {
            write!(f, "\n  - {}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lists_every_violation() {
        let mut errors = ValidationErrors::new();
        errors.push(Violation::EmptyStackName);
        errors.push(Violation::MissingImage {
            owner: "service 'api'".to_string(),
        });

        let text = errors.to_string();
        assert!(text.starts_with("stack spec is invalid (2 problems)"));
        assert!(text.contains("stack name cannot be empty"));
        assert!(text.contains("service 'api': image is required"));
    }

    #[test]
    fn test_into_result() {
        assert!(ValidationErrors::new().into_result().is_ok());

        let mut errors = ValidationErrors::new();
        errors.push(Violation::EmptyStackName);
        assert_eq!(errors.into_result().unwrap_err().len(), 1);
    }
}
