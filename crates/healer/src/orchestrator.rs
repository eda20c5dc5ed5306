//! Remediation orchestrator.
//!
//! Drives one failure record through
//! `pending_analysis -> fixing -> fixed_successfully | failed_after_max_retries`.
//! Each iteration:
//! 1. builds the diagnostic context from current logs and earlier attempts
//! 2. asks the codegen collaborator for a fix
//! 3. runs the change validator (a rejection is a failed attempt and the
//!    next iteration re-prompts with the rejection reason)
//! 4. commits the edits to a fresh per-attempt branch
//! 5. triggers a redeploy and polls it to a final state
//! 6. counts the attempt; on failure fetches the new deployment's logs
//!
//! Every collaborator call goes through the backoff controller and is raced
//! against the cycle's cancellation token and deadline. An error that escapes
//! an iteration closes the open attempt as errored and leaves the record
//! `interrupted`, which a manual retry can restart.

use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{Collaborators, Credentials};
use crate::config::HealerConfig;
use crate::error::{HealerError, Result};
use crate::store::RemediationStore;
use crate::types::{
    AttemptOutcome, AttemptSummary, DeploymentState, DiagnosticContext, FailureRecord,
    FailureStatus, FixAttempt, FixProposal, ProjectTarget,
};
use crate::validator::ChangeValidator;

/// Cancellation and deadline for one cycle.
#[derive(Debug, Clone)]
pub struct CycleControl {
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl CycleControl {
    pub fn new(cancel: CancellationToken, deadline: Instant) -> Self {
        Self { cancel, deadline }
    }

    /// Run `fut` unless the cycle is cancelled or out of time first.
    pub async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(HealerError::Cancelled),
            () = tokio::time::sleep_until(self.deadline) => Err(HealerError::Timeout(
                "remediation cycle exceeded its supervisory timeout".to_string(),
            )),
            result = fut => result,
        }
    }
}

/// Runs remediation cycles.
pub struct Orchestrator {
    config: HealerConfig,
    store: Arc<dyn RemediationStore>,
    collaborators: Collaborators,
    validator: ChangeValidator,
}

impl Orchestrator {
    /// Build an orchestrator; the kill switch is read from `config.enabled`.
    pub fn new(
        config: HealerConfig,
        store: Arc<dyn RemediationStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let validator = ChangeValidator::with_policy(&config.validator)
            .map_err(|e| HealerError::Config(format!("invalid validator pattern: {e}")))?;
        Ok(Self {
            config,
            store,
            collaborators,
            validator,
        })
    }

    #[must_use]
    pub fn config(&self) -> &HealerConfig {
        &self.config
    }

    /// Run a full cycle for `failure_id`. The caller holds the project guard.
    ///
    /// Returns the record's final status. Errors inside the cycle are
    /// reflected into the record (`interrupted`) rather than returned; only
    /// failures to load or persist the record itself are returned.
    pub async fn run_cycle(
        &self,
        failure_id: Uuid,
        control: CycleControl,
    ) -> Result<FailureStatus> {
        let mut record = self
            .store
            .get_failure(failure_id)
            .await?
            .ok_or(HealerError::FailureNotFound(failure_id))?;
        let project = self
            .store
            .get_project(&record.project_id)
            .await?
            .ok_or_else(|| HealerError::ProjectNotFound(record.project_id.clone()))?;

        if !self.config.enabled {
            warn!(failure_id = %record.id, "Remediation disabled, not starting cycle");
            record.interrupt("remediation is disabled");
            self.store.update_failure(&record).await?;
            return Ok(record.status);
        }

        if record.status.is_terminal() {
            warn!(
                failure_id = %record.id,
                status = %record.status,
                "Failure record is terminal, not starting cycle"
            );
            return Ok(record.status);
        }

        record.set_status(FailureStatus::Fixing);
        self.store.update_failure(&record).await?;
        info!(
            project_id = %project.id,
            failure_id = %record.id,
            deployment_id = %record.deployment_id,
            manual = record.is_manual_retry,
            "Remediation cycle started"
        );

        match self.drive(&mut record, &project, &control).await {
            Ok(status) => {
                info!(
                    project_id = %project.id,
                    failure_id = %record.id,
                    status = %status,
                    attempts = record.attempt_count,
                    "Remediation cycle finished"
                );
                Ok(status)
            }
            Err(e) => {
                error!(
                    project_id = %project.id,
                    failure_id = %record.id,
                    category = e.category(),
                    "Remediation cycle interrupted: {e}"
                );
                self.abandon(&mut record, &e.to_string()).await?;
                Ok(record.status)
            }
        }
    }

    /// Close any open attempt as errored and mark the record interrupted.
    ///
    /// Used when a cycle ends abnormally outside [`Self::run_cycle`]'s own
    /// error handling (panic, lost task).
    pub async fn interrupt(&self, failure_id: Uuid, reason: &str) -> Result<()> {
        let mut record = self
            .store
            .get_failure(failure_id)
            .await?
            .ok_or(HealerError::FailureNotFound(failure_id))?;
        self.abandon(&mut record, reason).await
    }

    async fn abandon(&self, record: &mut FailureRecord, reason: &str) -> Result<()> {
        for mut attempt in self.store.attempts_for(record.id).await? {
            if !attempt.is_finalized() {
                attempt.finish(AttemptOutcome::Errored, Some(reason.to_string()));
                self.store.update_attempt(&attempt).await?;
            }
        }
        if !record.status.is_terminal() {
            record.interrupt(reason);
            self.store.update_failure(record).await?;
        }
        Ok(())
    }

    async fn drive(
        &self,
        record: &mut FailureRecord,
        project: &ProjectTarget,
        control: &CycleControl,
    ) -> Result<FailureStatus> {
        let max_attempts = self.config.max_attempts;
        let mut logs_deployment = self.latest_deployment(record).await?;

        if record.logs.is_empty() {
            let deployment_id = logs_deployment.clone();
            record.logs = self
                .call("deployment_logs", control, || {
                    self.collaborators
                        .platform
                        .deployment_logs(project, &deployment_id)
                })
                .await?;
            record.updated_at = chrono::Utc::now();
            self.store.update_failure(record).await?;
        }

        let mut rejection_feedback: Option<String> = None;

        loop {
            if record.attempt_count >= max_attempts {
                record.set_status(FailureStatus::FailedAfterMaxRetries);
                self.store.update_failure(record).await?;
                return Ok(record.status);
            }

            let history = self.store.attempts_for(record.id).await?;
            let sequence = history.len() as u32 + 1;
            let context = DiagnosticContext {
                project_id: project.id.clone(),
                repository: project.repository.clone(),
                deployment_id: logs_deployment.clone(),
                attempt_number: record.attempt_count + 1,
                max_attempts,
                logs: record.logs.clone(),
                previous_attempts: history.iter().map(AttemptSummary::from).collect(),
                rejection_feedback: rejection_feedback.take(),
            };

            let mut attempt = FixAttempt::new(record.id, sequence, context.render_prompt());
            self.store.append_attempt(attempt.clone()).await?;
            debug!(
                failure_id = %record.id,
                attempt = sequence,
                "Fix attempt opened"
            );

            let proposal: FixProposal = self
                .call("propose_fix", control, || {
                    self.collaborators.codegen.propose_fix(&context)
                })
                .await?;
            attempt.response = Some(serde_json::to_string(&proposal)?);
            attempt.files_changed = proposal.edits.iter().map(|e| e.path.clone()).collect();
            attempt.touch();
            self.store.update_attempt(&attempt).await?;

            if let Err(rejection) = self.validator.validate(&proposal.edits) {
                warn!(
                    project_id = %project.id,
                    failure_id = %record.id,
                    attempt = sequence,
                    path = %rejection.path,
                    kind = ?rejection.kind,
                    "Proposed fix rejected: {}",
                    rejection.reason
                );
                let reason = rejection.to_string();
                attempt.finish(AttemptOutcome::Rejected, Some(reason.clone()));
                self.store.update_attempt(&attempt).await?;
                rejection_feedback = Some(reason);

                let exhausted = record.record_attempt(max_attempts);
                self.store.update_failure(record).await?;
                if exhausted {
                    warn!(failure_id = %record.id, "Attempt budget exhausted");
                    return Ok(record.status);
                }
                continue;
            }

            let branch = branch_name(&self.config.branch_prefix, record.id, sequence);
            attempt.branch = Some(branch.clone());
            attempt.touch();
            self.store.update_attempt(&attempt).await?;

            let message = format!(
                "fix: automated remediation of deployment {} (attempt {sequence})\n\n{}",
                logs_deployment, proposal.rationale
            );
            let commit_ref = self
                .apply(project, &branch, &proposal, &message, control)
                .await?;
            attempt.commit_ref = Some(commit_ref.clone());
            attempt.touch();
            self.store.update_attempt(&attempt).await?;

            let deployment_id = self
                .call("trigger_redeploy", control, || {
                    self.collaborators
                        .platform
                        .trigger_redeploy(project, &branch, &commit_ref)
                })
                .await?;
            attempt.new_deployment_id = Some(deployment_id.clone());
            attempt.touch();
            self.store.update_attempt(&attempt).await?;
            info!(
                project_id = %project.id,
                failure_id = %record.id,
                attempt = sequence,
                deployment_id = %deployment_id,
                branch = %branch,
                "Redeploy triggered"
            );

            let state = self.await_deployment(&deployment_id, control).await?;
            attempt.deployment_status = state;

            if state == Some(DeploymentState::Ready) {
                attempt.finish(AttemptOutcome::Deployed, None);
                self.store.update_attempt(&attempt).await?;
                record.record_attempt(max_attempts);
                record.set_status(FailureStatus::FixedSuccessfully);
                self.store.update_failure(record).await?;
                info!(
                    project_id = %project.id,
                    failure_id = %record.id,
                    attempt = sequence,
                    deployment_id = %deployment_id,
                    "Deployment fixed"
                );
                return Ok(record.status);
            }

            let reason = match state {
                Some(state) => format!("redeploy {deployment_id} ended in state {state:?}"),
                None => format!(
                    "redeploy {deployment_id} did not finish within {}s",
                    self.config.deploy_timeout_secs
                ),
            };
            warn!(
                project_id = %project.id,
                failure_id = %record.id,
                attempt = sequence,
                "{reason}"
            );
            attempt.finish(AttemptOutcome::DeployFailed, Some(reason));
            self.store.update_attempt(&attempt).await?;

            let exhausted = record.record_attempt(max_attempts);
            self.store.update_failure(record).await?;
            if exhausted {
                warn!(failure_id = %record.id, "Attempt budget exhausted");
                return Ok(record.status);
            }

            // the next prompt must see the failed redeploy's logs
            record.logs = self
                .call("deployment_logs", control, || {
                    self.collaborators
                        .platform
                        .deployment_logs(project, &deployment_id)
                })
                .await?;
            record.updated_at = chrono::Utc::now();
            self.store.update_failure(record).await?;
            logs_deployment = deployment_id;
        }
    }

    /// Commit `proposal` to `branch`. Credentials live only for this call.
    async fn apply(
        &self,
        project: &ProjectTarget,
        branch: &str,
        proposal: &FixProposal,
        message: &str,
        control: &CycleControl,
    ) -> Result<String> {
        let credentials: Option<Credentials> = match project.encrypted_credentials.as_deref() {
            Some(ciphertext) => Some(
                self.call("decrypt_credentials", control, || {
                    self.collaborators.secrets.decrypt(ciphertext)
                })
                .await?,
            ),
            None => None,
        };

        self.call("create_branch", control, || {
            self.collaborators
                .source_control
                .create_branch(project, branch, credentials.as_ref())
        })
        .await?;

        self.call("commit_files", control, || {
            self.collaborators.source_control.commit_files(
                project,
                branch,
                &proposal.edits,
                message,
                credentials.as_ref(),
            )
        })
        .await
    }

    /// Poll until the deployment reaches a final state.
    ///
    /// Returns `None` if it is still running after the deploy timeout.
    async fn await_deployment(
        &self,
        deployment_id: &str,
        control: &CycleControl,
    ) -> Result<Option<DeploymentState>> {
        let deadline = Instant::now() + self.config.deploy_timeout();
        loop {
            let state = self
                .call("deployment_status", control, || {
                    self.collaborators.platform.deployment_status(deployment_id)
                })
                .await?;
            if state.is_final() {
                return Ok(Some(state));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            debug!(deployment_id, ?state, "Deployment still in progress");
            let wait = self
                .config
                .deploy_poll_interval()
                .min(deadline.saturating_duration_since(now));
            control
                .guard(async {
                    tokio::time::sleep(wait).await;
                    Ok(())
                })
                .await?;
        }
    }

    /// Deployment whose logs describe the current failure.
    async fn latest_deployment(&self, record: &FailureRecord) -> Result<String> {
        let attempts = self.store.attempts_for(record.id).await?;
        Ok(attempts
            .iter()
            .rev()
            .find_map(|a| a.new_deployment_id.clone())
            .unwrap_or_else(|| record.deployment_id.clone()))
    }

    async fn call<T, F, Fut>(&self, operation: &str, control: &CycleControl, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        control.guard(self.config.retry.run(operation, op)).await
    }
}

/// Fresh branch per attempt: `{prefix}-{first 8 hex of failure id}-{sequence}`.
fn branch_name(prefix: &str, failure_id: Uuid, sequence: u32) -> String {
    let simple = failure_id.simple().to_string();
    format!("{prefix}-{}-{sequence}", &simple[..8])
}
