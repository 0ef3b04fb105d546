// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Credentials
//!
//! Secret values are never stored in the stack spec. Services reference them
//! with `${secret:name}` and the operator resolves them through a
//! [`CredentialsBackend`] right before apply.

use async_trait::async_trait;
use thiserror::Error;

pub use crate::domain::stack::BackendKind;
use crate::domain::stack::is_valid_secret_name;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid credential name '{0}' (letters, digits, '-' and '_' only)")]
    InvalidName(String),

    #[error("missing required secrets: {}", .0.join(", "))]
    MissingRequired(Vec<String>),

    #[error("credentials backend unavailable: {0}")]
    Unavailable(String),

    #[error("credentials backend error: {0}")]
    Backend(String),

    #[error("credentials I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Environment variable name a secret is exposed as: upper-cased, with `-`
/// and `.` turned into `_`.
pub fn secret_env_key(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

pub fn ensure_valid_name(name: &str) -> Result<(), CredentialError> {
    if is_valid_secret_name(name) {
        Ok(())
    } else {
        Err(CredentialError::InvalidName(name.to_string()))
    }
}

#[async_trait]
pub trait CredentialsBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn get(&self, name: &str) -> Result<Option<String>, CredentialError>;

    async fn set(&self, name: &str, value: &str) -> Result<(), CredentialError>;

    /// Returns whether something was removed.
    async fn delete(&self, name: &str) -> Result<bool, CredentialError>;

    /// Names of every stored credential, sorted.
    async fn list(&self) -> Result<Vec<String>, CredentialError>;

    /// Write only when no value is stored yet. Returns whether it wrote.
    async fn set_if_absent(&self, name: &str, value: &str) -> Result<bool, CredentialError> {
        if self.get(name).await?.is_some() {
            return Ok(false);
        }
        self.set(name, value).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_env_key() {
        assert_eq!(secret_env_key("db-password"), "DB_PASSWORD");
        assert_eq!(secret_env_key("api.token"), "API_TOKEN");
        assert_eq!(secret_env_key("ALREADY_UPPER"), "ALREADY_UPPER");
    }

    #[test]
    fn test_missing_required_lists_every_name() {
        let err = CredentialError::MissingRequired(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "missing required secrets: a, b");
    }

    #[test]
    fn test_name_validation() {
        assert!(ensure_valid_name("db-password_2").is_ok());
        assert!(ensure_valid_name("").is_err());
        assert!(ensure_valid_name("bad name").is_err());
    }
}
