//! Per-project concurrency guard.
//!
//! At most one remediation cycle runs per project. Acquisition is a single
//! atomic check-and-set in the store; the winner receives a [`GuardLease`]
//! that must be released when the cycle ends, however it ends.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::RemediationStore;
use crate::types::FailureStatus;

/// Acquires and recovers project guards.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    store: Arc<dyn RemediationStore>,
}

impl ConcurrencyGuard {
    pub fn new(store: Arc<dyn RemediationStore>) -> Self {
        Self { store }
    }

    /// Try to take the project's guard.
    ///
    /// Returns `None` if another cycle holds it. Fails with
    /// `ProjectNotFound` for unknown projects.
    pub async fn try_acquire(&self, project_id: &str) -> Result<Option<GuardLease>> {
        if self.store.try_acquire_guard(project_id).await? {
            debug!(project_id, "Acquired remediation guard");
            Ok(Some(GuardLease {
                store: Arc::clone(&self.store),
                project_id: project_id.to_string(),
                released: false,
            }))
        } else {
            debug!(project_id, "Remediation guard already held");
            Ok(None)
        }
    }

    /// Reset guards held longer than `max_hold` by projects with no live cycle.
    ///
    /// Any in-flight failure record of a recovered project is marked
    /// `interrupted`, and an alert is logged per recovered guard.
    pub async fn recover_stale(
        &self,
        max_hold: Duration,
        live_projects: &HashSet<String>,
    ) -> Result<Vec<RecoveredGuard>> {
        let max_hold = chrono::Duration::from_std(max_hold).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_hold)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let mut recovered = Vec::new();

        for project in self.store.stale_guards(cutoff).await? {
            if live_projects.contains(&project.id) {
                debug!(project_id = %project.id, "Long-running guard still has a live cycle");
                continue;
            }

            let mut interrupted = Vec::new();
            for mut record in self.store.failures_for_project(&project.id).await? {
                if matches!(
                    record.status,
                    FailureStatus::Fixing | FailureStatus::PendingAnalysis
                ) {
                    record.interrupt("remediation guard was stale and has been recovered");
                    self.store.update_failure(&record).await?;
                    interrupted.push(record.id);
                }
            }

            self.store.release_guard(&project.id).await?;

            error!(
                alert = "stale_guard",
                project_id = %project.id,
                held_since = ?project.fixing_since,
                interrupted = interrupted.len(),
                "Recovered stale remediation guard"
            );

            recovered.push(RecoveredGuard {
                project_id: project.id,
                held_since: project.fixing_since,
                interrupted_failures: interrupted,
            });
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "Stale-guard sweep recovered guards");
        }
        Ok(recovered)
    }
}

/// A guard reset by the stale sweep.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecoveredGuard {
    pub project_id: String,
    pub held_since: Option<chrono::DateTime<Utc>>,
    pub interrupted_failures: Vec<Uuid>,
}

/// Proof of holding a project's guard.
///
/// Call [`GuardLease::release`]. If the lease is dropped unreleased (a
/// panicking cycle task, an aborted future) the release is spawned onto the
/// current runtime instead.
pub struct GuardLease {
    store: Arc<dyn RemediationStore>,
    project_id: String,
    released: bool,
}

impl std::fmt::Debug for GuardLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardLease")
            .field("project_id", &self.project_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl GuardLease {
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Release the guard.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let result = self.store.release_guard(&self.project_id).await;
        match &result {
            Ok(()) => debug!(project_id = %self.project_id, "Released remediation guard"),
            Err(e) => error!(project_id = %self.project_id, "Failed to release guard: {e}"),
        }
        result
    }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let project_id = std::mem::take(&mut self.project_id);
        warn!(
            project_id = %project_id,
            "Guard lease dropped without release, releasing in background"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(e) = store.release_guard(&project_id).await {
                        error!(project_id = %project_id, "Background guard release failed: {e}");
                    }
                });
            }
            Err(_) => {
                error!(
                    alert = "stale_guard",
                    project_id = %project_id,
                    "No runtime to release guard; the stale sweep will recover it"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{FailureRecord, ProjectTarget};

    fn guard() -> (ConcurrencyGuard, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_projects([ProjectTarget::new(
            "prj_1",
            "acme/site",
        )]));
        (ConcurrencyGuard::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_lease_release() {
        let (guard, store) = guard();
        let lease = guard.try_acquire("prj_1").await.unwrap().unwrap();
        assert!(guard.try_acquire("prj_1").await.unwrap().is_none());

        lease.release().await.unwrap();
        assert!(!store.get_project("prj_1").await.unwrap().unwrap().is_fixing);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released() {
        let (guard, store) = guard();
        let lease = guard.try_acquire("prj_1").await.unwrap().unwrap();
        drop(lease);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!store.get_project("prj_1").await.unwrap().unwrap().is_fixing);
    }

    #[tokio::test]
    async fn test_panicking_holder_releases_guard() {
        let (guard, _store) = guard();
        let lease = guard.try_acquire("prj_1").await.unwrap().unwrap();

        let task = tokio::spawn(async move {
            let _lease = lease;
            panic!("cycle blew up");
        });
        assert!(task.await.is_err());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(guard.try_acquire("prj_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_stale_guard() {
        let (guard, store) = guard();
        let mut record = FailureRecord::new("prj_1", "dpl_1", "logs");
        record.set_status(FailureStatus::Fixing);
        let record_id = record.id;
        store.insert_failure(record).await.unwrap();

        let lease = guard.try_acquire("prj_1").await.unwrap().unwrap();
        // simulate a crashed process: the lease is never released
        std::mem::forget(lease);

        // a live cycle protects the guard
        let live: HashSet<String> = ["prj_1".to_string()].into();
        assert!(guard
            .recover_stale(Duration::ZERO, &live)
            .await
            .unwrap()
            .is_empty());

        // held for less than the timeout
        assert!(guard
            .recover_stale(Duration::from_secs(3600), &HashSet::new())
            .await
            .unwrap()
            .is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let recovered = guard
            .recover_stale(Duration::ZERO, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].interrupted_failures, vec![record_id]);

        let record = store.get_failure(record_id).await.unwrap().unwrap();
        assert_eq!(record.status, FailureStatus::Interrupted);
        assert!(guard.try_acquire("prj_1").await.unwrap().is_some());
    }
}
