// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Env-file credentials backend.
//!
//! Credentials live in `KEY=value` lines (the stack's `.env` by default).
//! Names are stored upper-cased with `-` turned into `_`, and `$` is written
//! as `$$` so compose does not interpolate it. Lines that are not credentials
//! (comments, blanks) survive rewrites untouched.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::credentials::{ensure_valid_name, secret_env_key, BackendKind, CredentialError, CredentialsBackend};

pub struct FileCredentials {
    path: PathBuf,
    write_lock: Mutex<()>,
}

enum Line {
    Entry { key: String, value: String },
    Other(String),
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_lines(&self) -> Result<Vec<Line>, CredentialError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content.lines().map(parse_line).collect())
    }

    async fn write_lines(&self, lines: &[Line]) -> Result<(), CredentialError> {
        let mut content = String::new();
        for line in lines {
            match line {
                Line::Entry { key, value } => {
                    content.push_str(key);
                    content.push('=');
                    content.push_str(&escape(value));
                }
                Line::Other(raw) => content.push_str(raw),
            }
            content.push('\n');
        }
        write_private_file(&self.path, content.as_bytes()).await?;
        Ok(())
    }
}

fn parse_line(raw: &str) -> Line {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Other(raw.to_string());
    }
    let body = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    match body.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Line::Entry {
            key: key.trim().to_string(),
            value: unescape(value),
        },
        _ => Line::Other(raw.to_string()),
    }
}

fn escape(value: &str) -> String {
    value.replace('$', "$$")
}

fn unescape(value: &str) -> String {
    let value = value.trim();
    let unquoted = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);
    unquoted.replace("$$", "$")
}

/// Atomically replace `path` with `content`: write a sibling temp file with
/// mode 0600 and rename it over the target.
pub async fn write_private_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "env".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Render `KEY=value` lines with `$` escaped, in key order.
pub fn render_env(entries: &BTreeMap<String, String>) -> String {
    entries
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, escape(v)))
        .collect()
}

#[async_trait]
impl CredentialsBackend for FileCredentials {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn get(&self, name: &str) -> Result<Option<String>, CredentialError> {
        let key = secret_env_key(name);
        Ok(self.read_lines().await?.into_iter().find_map(|line| match line {
            Line::Entry { key: k, value } if k == key => Some(value),
            _ => None,
        }))
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), CredentialError> {
        ensure_valid_name(name)?;
        if value.contains('\n') {
            return Err(CredentialError::Backend(
                "multi-line values are not supported by the file backend".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let key = secret_env_key(name);
        let mut lines = self.read_lines().await?;

        let mut replaced = false;
        for line in lines.iter_mut() {
            if let Line::Entry { key: k, value: v } = line {
                if *k == key {
                    *v = value.to_string();
                    replaced = true;
                }
            }
        }
        if !replaced {
            lines.push(Line::Entry {
                key: key.clone(),
                value: value.to_string(),
            });
        }

        self.write_lines(&lines).await?;
        debug!(key = %key, path = %self.path.display(), "stored credential");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, CredentialError> {
        let _guard = self.write_lock.lock().await;
        let key = secret_env_key(name);
        let lines = self.read_lines().await?;
        let before = lines.len();
        let kept: Vec<Line> = lines
            .into_iter()
            .filter(|line| !matches!(line, Line::Entry { key: k, .. } if *k == key))
            .collect();

        if kept.len() == before {
            return Ok(false);
        }
        self.write_lines(&kept).await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<String>, CredentialError> {
        let mut names: Vec<String> = self
            .read_lines()
            .await?
            .into_iter()
            .filter_map(|line| match line {
                Line::Entry { key, .. } => Some(key),
                Line::Other(_) => None,
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, FileCredentials) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileCredentials::new(dir.path().join(".env"));
        (dir, backend)
    }

    #[tokio::test]
    async fn test_dollar_is_escaped_on_disk() {
        let (dir, backend) = backend();
        backend.set("db-password", "pa$word").await.unwrap();

        assert_eq!(
            backend.get("db-password").await.unwrap().as_deref(),
            Some("pa$word")
        );
        let disk = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert_eq!(disk, "DB_PASSWORD=pa$$word\n");
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (_dir, backend) = backend();
        assert!(backend.set_if_absent("token", "v1").await.unwrap());
        assert!(!backend.set_if_absent("token", "v2").await.unwrap());
        assert_eq!(backend.get("token").await.unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_list_and_delete_use_env_keys() {
        let (dir, backend) = backend();
        std::fs::write(
            dir.path().join(".env"),
            "# managed by hand\nEXISTING=1\n\nexport QUOTED=\"two words\"\n",
        )
        .unwrap();

        backend.set("api-key", "abc").await.unwrap();
        backend.set("existing", "2").await.unwrap();
        assert_eq!(
            backend.list().await.unwrap(),
            vec!["API_KEY", "EXISTING", "QUOTED"]
        );
        assert_eq!(backend.get("quoted").await.unwrap().as_deref(), Some("two words"));

        assert!(backend.delete("api-key").await.unwrap());
        assert!(!backend.delete("api-key").await.unwrap());

        let disk = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(disk.starts_with("# managed by hand\nEXISTING=2\n"));
        assert!(!disk.contains("API_KEY"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_mode_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, backend) = backend();
        backend.set("x", "y").await.unwrap();
        let mode = std::fs::metadata(dir.path().join(".env"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_rejects_invalid_names_and_multiline_values() {
        let (_dir, backend) = backend();
        assert!(matches!(
            backend.set("bad name", "v").await,
            Err(CredentialError::InvalidName(_))
        ));
        assert!(backend.set("ok", "a\nb").await.is_err());
        assert_eq!(backend.get("missing").await.unwrap(), None);
    }

    #[test]
    fn test_render_env() {
        let entries = BTreeMap::from([
            ("B".to_string(), "x$y".to_string()),
            ("A".to_string(), "1".to_string()),
        ]);
        assert_eq!(render_env(&entries), "A=1\nB=x$$y\n");
    }
}
