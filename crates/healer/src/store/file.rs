//! File-based storage implementation.
//!
//! The whole [`StoreState`] is kept in memory and written as one JSON
//! document after every mutation. Writes go to a sibling temp file that is
//! then renamed over the target, so a crash never leaves a torn document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{RemediationStore, StoreState};
use crate::error::{HealerError, Result};
use crate::types::{FailureRecord, FixAttempt, ProjectTarget};

/// JSON-file backed store, reloaded on startup.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl FileStore {
    /// Open the store at `path`, loading existing state if the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read_to_string(&path).await {
            Ok(content) => {
                let state: StoreState = serde_json::from_str(&content).map_err(|e| {
                    HealerError::Store(format!("failed to parse {}: {e}", path.display()))
                })?;
                info!(
                    path = %path.display(),
                    projects = state.projects.len(),
                    failures = state.failures.len(),
                    "Loaded remediation state"
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No existing state file, starting empty");
                StoreState::default()
            }
            Err(e) => {
                return Err(HealerError::Store(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Get the state file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the state, persist it, then publish it.
    ///
    /// The write lock is held across the file write so mutations are
    /// serialized and the file always matches the published state.
    async fn mutate<T>(&self, change: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(out)
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await.map_err(|e| {
            HealerError::Store(format!("failed to write {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            HealerError::Store(format!("failed to replace {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl RemediationStore for FileStore {
    fn storage_type(&self) -> &'static str {
        "file"
    }

    async fn upsert_project(&self, project: ProjectTarget) -> Result<()> {
        self.mutate(|state| {
            state.upsert_project(project);
            Ok(())
        })
        .await
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectTarget>> {
        Ok(self.state.read().await.projects.get(project_id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<ProjectTarget>> {
        Ok(self.state.read().await.projects.values().cloned().collect())
    }

    async fn try_acquire_guard(&self, project_id: &str) -> Result<bool> {
        self.mutate(|state| state.try_acquire_guard(project_id)).await
    }

    async fn release_guard(&self, project_id: &str) -> Result<()> {
        self.mutate(|state| state.release_guard(project_id)).await
    }

    async fn stale_guards(&self, held_since: DateTime<Utc>) -> Result<Vec<ProjectTarget>> {
        Ok(self.state.read().await.stale_guards(held_since))
    }

    async fn insert_failure(&self, record: FailureRecord) -> Result<()> {
        self.mutate(|state| state.insert_failure(record)).await
    }

    async fn get_failure(&self, failure_id: Uuid) -> Result<Option<FailureRecord>> {
        Ok(self.state.read().await.failures.get(&failure_id).cloned())
    }

    async fn update_failure(&self, record: &FailureRecord) -> Result<()> {
        self.mutate(|state| state.update_failure(record)).await
    }

    async fn failures_for_project(&self, project_id: &str) -> Result<Vec<FailureRecord>> {
        Ok(self.state.read().await.failures_for_project(project_id))
    }

    async fn latest_failure(&self, project_id: &str) -> Result<Option<FailureRecord>> {
        Ok(self
            .state
            .read()
            .await
            .failures_for_project(project_id)
            .pop())
    }

    async fn find_failure_by_deployment(
        &self,
        project_id: &str,
        deployment_id: &str,
    ) -> Result<Option<FailureRecord>> {
        Ok(self
            .state
            .read()
            .await
            .find_failure_by_deployment(project_id, deployment_id))
    }

    async fn append_attempt(&self, attempt: FixAttempt) -> Result<()> {
        self.mutate(|state| state.append_attempt(attempt)).await
    }

    async fn update_attempt(&self, attempt: &FixAttempt) -> Result<()> {
        self.mutate(|state| state.update_attempt(attempt)).await
    }

    async fn attempts_for(&self, failure_id: Uuid) -> Result<Vec<FixAttempt>> {
        Ok(self.state.read().await.attempts_for(failure_id))
    }

    async fn bulk_cleanup(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.mutate(|state| Ok(state.bulk_cleanup(older_than))).await
    }
}
