// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod file;
pub mod vault;

use std::path::Path;
use std::sync::Arc;

use crate::domain::credentials::{CredentialError, CredentialsBackend};
use crate::domain::stack::{BackendKind, StackSpec};

pub use file::FileCredentials;
pub use vault::{VaultCredentials, VaultSettings};

pub const DEFAULT_ENV_FILE: &str = ".env";
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Backend selected by the stack's `secrets_backend` (file when absent).
pub fn credentials_backend_from_spec(
    spec: &StackSpec,
    root: &Path,
) -> Result<Arc<dyn CredentialsBackend>, CredentialError> {
    let config = spec.secrets_backend_config();
    match config.kind {
        BackendKind::File => {
            let path = root.join(config.path.as_deref().unwrap_or(DEFAULT_ENV_FILE));
            Ok(Arc::new(FileCredentials::new(path)))
        }
        BackendKind::Vault => {
            let environment = spec.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT);
            let settings = VaultSettings::from_config(&config, &spec.name, environment)?;
            Ok(Arc::new(VaultCredentials::new(settings)?))
        }
    }
}
