//! In-memory storage implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RemediationStore, StoreState};
use crate::error::Result;
use crate::types::{FailureRecord, FixAttempt, ProjectTarget};

/// Process-local store; state is lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `projects`.
    #[must_use]
    pub fn with_projects(projects: impl IntoIterator<Item = ProjectTarget>) -> Self {
        let mut state = StoreState::default();
        for project in projects {
            state.upsert_project(project);
        }
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }
}

#[async_trait]
impl RemediationStore for MemoryStore {
    fn storage_type(&self) -> &'static str {
        "memory"
    }

    async fn upsert_project(&self, project: ProjectTarget) -> Result<()> {
        self.state.write().await.upsert_project(project);
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectTarget>> {
        Ok(self.state.read().await.projects.get(project_id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<ProjectTarget>> {
        Ok(self.state.read().await.projects.values().cloned().collect())
    }

    async fn try_acquire_guard(&self, project_id: &str) -> Result<bool> {
        self.state.write().await.try_acquire_guard(project_id)
    }

    async fn release_guard(&self, project_id: &str) -> Result<()> {
        self.state.write().await.release_guard(project_id)
    }

    async fn stale_guards(&self, held_since: DateTime<Utc>) -> Result<Vec<ProjectTarget>> {
        Ok(self.state.read().await.stale_guards(held_since))
    }

    async fn insert_failure(&self, record: FailureRecord) -> Result<()> {
        self.state.write().await.insert_failure(record)
    }

    async fn get_failure(&self, failure_id: Uuid) -> Result<Option<FailureRecord>> {
        Ok(self.state.read().await.failures.get(&failure_id).cloned())
    }

    async fn update_failure(&self, record: &FailureRecord) -> Result<()> {
        self.state.write().await.update_failure(record)
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
        self.state.write().await.append_attempt(attempt)
    }

    async fn update_attempt(&self, attempt: &FixAttempt) -> Result<()> {
        self.state.write().await.update_attempt(attempt)
    }

    async fn attempts_for(&self, failure_id: Uuid) -> Result<Vec<FixAttempt>> {
        Ok(self.state.read().await.attempts_for(failure_id))
    }

    async fn bulk_cleanup(&self, older_than: DateTime<Utc>) -> Result<usize> {
        Ok(self.state.write().await.bulk_cleanup(older_than))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = MemoryStore::with_projects([ProjectTarget::new("prj_1", "acme/site")]);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_acquire_guard("prj_1").await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_latest_failure() {
        let store = MemoryStore::with_projects([ProjectTarget::new("prj_1", "acme/site")]);
        let first = FailureRecord::new("prj_1", "dpl_1", "a");
        let mut second = FailureRecord::new("prj_1", "dpl_2", "b");
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        let second_id = second.id;
        store.insert_failure(first).await.unwrap();
        store.insert_failure(second).await.unwrap();

        let latest = store.latest_failure("prj_1").await.unwrap().unwrap();
        assert_eq!(latest.id, second_id);
        assert!(store.latest_failure("prj_2").await.unwrap().is_none());
    }
}
