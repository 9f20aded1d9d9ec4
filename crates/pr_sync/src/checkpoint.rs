use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("malformed checkpoint {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write checkpoint {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Update times `(through, latest]` already delivered by a walk of the
/// repository that did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialWindow {
    pub latest: DateTime<Utc>,
    pub through: DateTime<Utc>,
}

impl PartialWindow {
    pub fn covers(&self, updated_at: DateTime<Utc>) -> bool {
        self.through < updated_at && updated_at <= self.latest
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCheckpoint {
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialWindow>,
}

/// Per-repository watermarks keyed by `owner/repo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointState {
    repos: BTreeMap<String, RepoCheckpoint>,
}

impl CheckpointState {
    pub fn get(&self, key: &str) -> Option<&RepoCheckpoint> {
        self.repos.get(key)
    }

    pub fn watermark(&self, key: &str) -> Option<DateTime<Utc>> {
        self.repos.get(key).and_then(|entry| entry.updated_at)
    }

    pub fn set(&mut self, key: impl Into<String>, entry: RepoCheckpoint) {
        self.repos.insert(key.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

/// Reads and atomically replaces the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or blank file is an empty state.
    pub async fn load(&self) -> Result<CheckpointState, CheckpointError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint yet");
                return Ok(CheckpointState::default());
            }
            Err(source) => {
                return Err(CheckpointError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(CheckpointState::default());
        }
        serde_json::from_str(&raw).map_err(|source| CheckpointError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn save(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        let write_err = |source: io::Error| CheckpointError::Write {
            path: self.path.clone(),
            source,
        };
        let body = serde_json::to_vec_pretty(state).map_err(|err| write_err(err.into()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp).await.map_err(write_err)?;
        file.write_all(&body).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);
        fs::rename(&tmp, &self.path).await.map_err(write_err)?;

        debug!(path = %self.path.display(), repos = state.len(), "checkpoint saved");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_and_blank_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_empty());

        std::fs::write(store.path(), "  \n").unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("state.json"));
        std::fs::write(store.path(), "{\"a/b\": {\"updated_at\": 12").unwrap();
        assert!(matches!(
            store.load().await,
            Err(CheckpointError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn save_overwrites_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested/state.json"));

        let mut state = CheckpointState::default();
        state.set(
            "acme/widgets",
            RepoCheckpoint {
                updated_at: Some(ts(3)),
                partial: Some(PartialWindow {
                    latest: ts(9),
                    through: ts(6),
                }),
            },
        );
        state.set("acme/empty", RepoCheckpoint::default());
        store.save(&state).await.unwrap();

        state.set(
            "acme/widgets",
            RepoCheckpoint {
                updated_at: Some(ts(9)),
                partial: None,
            },
        );
        store.save(&state).await.unwrap();

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded, state);
        assert_eq!(reloaded.watermark("acme/widgets"), Some(ts(9)));
        assert_eq!(reloaded.watermark("acme/empty"), None);
        assert!(!dir.path().join("nested/state.json.tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["acme/widgets"]["updated_at"], "2024-01-09T00:00:00Z");
        assert!(raw["acme/widgets"].get("partial").is_none());
        assert!(raw["acme/empty"]["updated_at"].is_null());
    }

    #[test]
    fn partial_window_is_open_below() {
        let window = PartialWindow {
            latest: ts(9),
            through: ts(6),
        };
        assert!(!window.covers(ts(6)));
        assert!(window.covers(ts(7)));
        assert!(window.covers(ts(9)));
        assert!(!window.covers(ts(10)));
    }
}
