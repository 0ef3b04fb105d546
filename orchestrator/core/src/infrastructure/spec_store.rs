// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Loads and saves the stack spec file.
//!
//! With an environment overlay configured, `stack.<overlay>.yaml` is merged
//! over the base document before parsing: mappings merge key by key, while
//! scalars and sequences from the overlay replace the base value.

use serde_yaml::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::domain::stack::StackSpec;
use crate::domain::validation::ValidationErrors;

#[derive(Debug, Error)]
pub enum SpecStoreError {
    #[error("stack spec not found at {0}")]
    NotFound(PathBuf),

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Invalid(#[from] ValidationErrors),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SpecStore {
    spec_path: PathBuf,
    overlay_path: Option<PathBuf>,
}

impl SpecStore {
    pub fn new(spec_path: impl Into<PathBuf>, overlay_path: Option<PathBuf>) -> Self {
        Self {
            spec_path: spec_path.into(),
            overlay_path,
        }
    }

    pub fn spec_path(&self) -> &Path {
        &self.spec_path
    }

    pub fn exists(&self) -> bool {
        self.spec_path.exists()
    }

    /// The base document as written on disk, without the overlay.
    pub async fn load_base(&self) -> Result<StackSpec, SpecStoreError> {
        let value = read_yaml(&self.spec_path).await?;
        from_value(value, &self.spec_path)
    }

    /// Base document with the overlay merged in.
    pub async fn load(&self) -> Result<StackSpec, SpecStoreError> {
        let mut value = read_yaml(&self.spec_path).await?;
        if let Some(overlay_path) = self.overlay_path.as_ref().filter(|p| p.exists()) {
            debug!(overlay = %overlay_path.display(), "merging spec overlay");
            let overlay = read_yaml(overlay_path).await?;
            deep_merge(&mut value, overlay);
        }
        from_value(value, &self.spec_path)
    }

    /// [`Self::load`] followed by structural validation.
    pub async fn load_validated(&self) -> Result<StackSpec, SpecStoreError> {
        let spec = self.load().await?;
        spec.validate()?;
        Ok(spec)
    }

    /// Write the base document atomically.
    pub async fn save(&self, spec: &StackSpec) -> Result<(), SpecStoreError> {
        let yaml = serde_yaml::to_string(spec).map_err(|e| SpecStoreError::Parse {
            path: self.spec_path.clone(),
            message: e.to_string(),
        })?;
        let io_err = |source| SpecStoreError::Io {
            path: self.spec_path.clone(),
            source,
        };

        let dir = self.spec_path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        let tmp = dir.join(format!(
            ".{}.tmp",
            self.spec_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "stack.yaml".to_string())
        ));
        tokio::fs::write(&tmp, yaml).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.spec_path)
            .await
            .map_err(io_err)?;
        Ok(())
    }
}

async fn read_yaml(path: &Path) -> Result<Value, SpecStoreError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SpecStoreError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(SpecStoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_yaml::from_str(&content).map_err(|e| SpecStoreError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn from_value(value: Value, path: &Path) -> Result<StackSpec, SpecStoreError> {
    serde_yaml::from_value(value).map_err(|e| SpecStoreError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
