//! Persistence for projects, failure records and fix attempts.
//!
//! [`RemediationStore`] is the seam the loop talks to. Both implementations
//! share [`StoreState`], which holds the data and enforces the store-level
//! rules:
//! - the per-project guard is acquired atomically (check-and-set under one lock)
//! - fix attempts are append-only with gapless, 1-based sequence numbers
//! - an attempt whose outcome is recorded is never rewritten

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{HealerError, Result};
use crate::types::{FailureRecord, FixAttempt, ProjectTarget};

/// Storage interface for remediation state.
#[async_trait]
pub trait RemediationStore: Send + Sync {
    /// Storage type identifier
    fn storage_type(&self) -> &'static str;

    // === Projects ===

    /// Register or replace a project (the guard of an existing entry is kept)
    async fn upsert_project(&self, project: ProjectTarget) -> Result<()>;

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectTarget>>;

    async fn list_projects(&self) -> Result<Vec<ProjectTarget>>;

    // === Concurrency guard ===

    /// Atomically set the guard if it is clear. Returns false if already held.
    async fn try_acquire_guard(&self, project_id: &str) -> Result<bool>;

    /// Clear the guard. Idempotent.
    async fn release_guard(&self, project_id: &str) -> Result<()>;

    /// Projects whose guard was acquired before `held_since`.
    async fn stale_guards(&self, held_since: DateTime<Utc>) -> Result<Vec<ProjectTarget>>;

    // === Failure records ===

    async fn insert_failure(&self, record: FailureRecord) -> Result<()>;

    async fn get_failure(&self, failure_id: Uuid) -> Result<Option<FailureRecord>>;

    async fn update_failure(&self, record: &FailureRecord) -> Result<()>;

    /// All records of a project, oldest first
    async fn failures_for_project(&self, project_id: &str) -> Result<Vec<FailureRecord>>;

    /// Most recently created record of a project
    async fn latest_failure(&self, project_id: &str) -> Result<Option<FailureRecord>>;

    /// Record owning `deployment_id`, either as its failing deployment or as a
    /// redeploy triggered by one of its attempts.
    async fn find_failure_by_deployment(
        &self,
        project_id: &str,
        deployment_id: &str,
    ) -> Result<Option<FailureRecord>>;

    // === Fix attempts ===

    /// Append an attempt; its number must be the next in sequence.
    async fn append_attempt(&self, attempt: FixAttempt) -> Result<()>;

    /// Rewrite an attempt that has no recorded outcome yet.
    async fn update_attempt(&self, attempt: &FixAttempt) -> Result<()>;

    /// Attempts of a record ordered by sequence number
    async fn attempts_for(&self, failure_id: Uuid) -> Result<Vec<FixAttempt>>;

    /// Delete terminal records last updated before `older_than`, with their
    /// attempts. Returns the number of records removed.
    async fn bulk_cleanup(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

/// The data behind every store implementation.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub projects: HashMap<String, ProjectTarget>,
    #[serde(default)]
    pub failures: HashMap<Uuid, FailureRecord>,
    #[serde(default)]
    pub attempts: HashMap<Uuid, Vec<FixAttempt>>,
}

impl StoreState {
    pub fn upsert_project(&mut self, mut project: ProjectTarget) {
        if let Some(existing) = self.projects.get(&project.id) {
            project.is_fixing = existing.is_fixing;
            project.fixing_since = existing.fixing_since;
        }
        self.projects.insert(project.id.clone(), project);
    }

    pub fn try_acquire_guard(&mut self, project_id: &str) -> Result<bool> {
        let project = self
            .projects
            .get_mut(project_id)
            .ok_or_else(|| HealerError::ProjectNotFound(project_id.to_string()))?;
        if project.is_fixing {
            return Ok(false);
        }
        project.is_fixing = true;
        project.fixing_since = Some(Utc::now());
        Ok(true)
    }

    pub fn release_guard(&mut self, project_id: &str) -> Result<()> {
        let project = self
            .projects
            .get_mut(project_id)
            .ok_or_else(|| HealerError::ProjectNotFound(project_id.to_string()))?;
        project.is_fixing = false;
        project.fixing_since = None;
        Ok(())
    }

    pub fn stale_guards(&self, held_since: DateTime<Utc>) -> Vec<ProjectTarget> {
        self.projects
            .values()
            .filter(|p| p.is_fixing && p.fixing_since.is_none_or(|since| since < held_since))
            .cloned()
            .collect()
    }

    pub fn insert_failure(&mut self, record: FailureRecord) -> Result<()> {
        if !self.projects.contains_key(&record.project_id) {
            return Err(HealerError::ProjectNotFound(record.project_id));
        }
        if self.failures.contains_key(&record.id) {
            return Err(HealerError::Store(format!(
                "failure record {} already exists",
                record.id
            )));
        }
        self.failures.insert(record.id, record);
        Ok(())
    }

    pub fn update_failure(&mut self, record: &FailureRecord) -> Result<()> {
        let slot = self
            .failures
            .get_mut(&record.id)
            .ok_or(HealerError::FailureNotFound(record.id))?;
        *slot = record.clone();
        Ok(())
    }

    pub fn failures_for_project(&self, project_id: &str) -> Vec<FailureRecord> {
        let mut records: Vec<_> = self
            .failures
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn find_failure_by_deployment(
        &self,
        project_id: &str,
        deployment_id: &str,
    ) -> Option<FailureRecord> {
        self.failures
            .values()
            .filter(|r| r.project_id == project_id)
            .find(|r| {
                r.deployment_id == deployment_id
                    || self.attempts.get(&r.id).is_some_and(|attempts| {
                        attempts
                            .iter()
                            .any(|a| a.new_deployment_id.as_deref() == Some(deployment_id))
                    })
            })
            .cloned()
    }

    pub fn append_attempt(&mut self, attempt: FixAttempt) -> Result<()> {
        if !self.failures.contains_key(&attempt.failure_record_id) {
            return Err(HealerError::FailureNotFound(attempt.failure_record_id));
        }
        let attempts = self.attempts.entry(attempt.failure_record_id).or_default();
        let expected = attempts.len() as u32 + 1;
        if attempt.attempt_number != expected {
            return Err(HealerError::InvariantViolation(format!(
                "attempt number {} for failure {} is out of sequence (expected {expected})",
                attempt.attempt_number, attempt.failure_record_id
            )));
        }
        attempts.push(attempt);
        Ok(())
    }

    pub fn update_attempt(&mut self, attempt: &FixAttempt) -> Result<()> {
        let stored = self
            .attempts
            .get_mut(&attempt.failure_record_id)
            .and_then(|list| list.iter_mut().find(|a| a.id == attempt.id))
            .ok_or_else(|| HealerError::Store(format!("fix attempt {} not found", attempt.id)))?;
        if stored.is_finalized() {
            return Err(HealerError::InvariantViolation(format!(
                "fix attempt {} already has an outcome",
                attempt.id
            )));
        }
        if stored.attempt_number != attempt.attempt_number {
            return Err(HealerError::InvariantViolation(format!(
                "fix attempt {} cannot change its sequence number",
                attempt.id
            )));
        }
        *stored = attempt.clone();
        Ok(())
    }

    pub fn attempts_for(&self, failure_id: Uuid) -> Vec<FixAttempt> {
        self.attempts.get(&failure_id).cloned().unwrap_or_default()
    }

    pub fn bulk_cleanup(&mut self, older_than: DateTime<Utc>) -> usize {
        let expired: Vec<Uuid> = self
            .failures
            .values()
            .filter(|r| r.status.is_terminal() && r.updated_at < older_than)
            .map(|r| r.id)
            .collect();
        for id in &expired {
            self.failures.remove(id);
            self.attempts.remove(id);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureStatus;

    fn state_with_project() -> StoreState {
        let mut state = StoreState::default();
        state.upsert_project(ProjectTarget::new("prj_1", "acme/site"));
        state
    }

    #[test]
    fn test_guard_is_exclusive() {
        let mut state = state_with_project();
        assert!(state.try_acquire_guard("prj_1").unwrap());
        assert!(!state.try_acquire_guard("prj_1").unwrap());
        state.release_guard("prj_1").unwrap();
        assert!(state.try_acquire_guard("prj_1").unwrap());
        assert!(matches!(
            state.try_acquire_guard("nope"),
            Err(HealerError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn test_upsert_keeps_guard() {
        let mut state = state_with_project();
        state.try_acquire_guard("prj_1").unwrap();
        state.upsert_project(ProjectTarget::new("prj_1", "acme/renamed"));
        let project = &state.projects["prj_1"];
        assert!(project.is_fixing);
        assert_eq!(project.repository, "acme/renamed");
    }

    #[test]
    fn test_attempt_sequence_is_gapless() {
        let mut state = state_with_project();
        let record = FailureRecord::new("prj_1", "dpl_1", "logs");
        let id = record.id;
        state.insert_failure(record).unwrap();

        state
            .append_attempt(FixAttempt::new(id, 1, String::new()))
            .unwrap();
        let gap = state.append_attempt(FixAttempt::new(id, 3, String::new()));
        assert!(matches!(gap, Err(HealerError::InvariantViolation(_))));
        let dup = state.append_attempt(FixAttempt::new(id, 1, String::new()));
        assert!(matches!(dup, Err(HealerError::InvariantViolation(_))));
        state
            .append_attempt(FixAttempt::new(id, 2, String::new()))
            .unwrap();

        let numbers: Vec<u32> = state.attempts_for(id).iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_finalized_attempt_is_immutable() {
        let mut state = state_with_project();
        let record = FailureRecord::new("prj_1", "dpl_1", "logs");
        let id = record.id;
        state.insert_failure(record).unwrap();

        let mut attempt = FixAttempt::new(id, 1, "prompt".into());
        state.append_attempt(attempt.clone()).unwrap();
        attempt.finish(crate::types::AttemptOutcome::Rejected, Some("eval".into()));
        state.update_attempt(&attempt).unwrap();

        attempt.failure_reason = Some("rewritten".into());
        assert!(matches!(
            state.update_attempt(&attempt),
            Err(HealerError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_find_by_redeploy_id() {
        let mut state = state_with_project();
        let record = FailureRecord::new("prj_1", "dpl_1", "logs");
        let id = record.id;
        state.insert_failure(record).unwrap();
        let mut attempt = FixAttempt::new(id, 1, String::new());
        attempt.new_deployment_id = Some("dpl_2".into());
        state.append_attempt(attempt).unwrap();

        assert_eq!(
            state.find_failure_by_deployment("prj_1", "dpl_2").map(|r| r.id),
            Some(id)
        );
        assert!(state.find_failure_by_deployment("prj_1", "dpl_3").is_none());
    }

    #[test]
    fn test_bulk_cleanup_only_removes_terminal() {
        let mut state = state_with_project();
        let mut done = FailureRecord::new("prj_1", "dpl_1", "logs");
        done.set_status(FailureStatus::FixedSuccessfully);
        let done_id = done.id;
        let open = FailureRecord::new("prj_1", "dpl_2", "logs");
        let open_id = open.id;
        state.insert_failure(done).unwrap();
        state.insert_failure(open).unwrap();

        let removed = state.bulk_cleanup(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert!(!state.failures.contains_key(&done_id));
        assert!(state.failures.contains_key(&open_id));
    }
}
