//! Failure intake.
//!
//! Normalizes the two failure signals into scheduled cycles:
//! - platform webhooks carrying `{eventType, project.id, deployment.id,
//!   deployment.state}`
//! - user-initiated manual retries of an existing failure record
//!
//! Intake runs synchronously inside the request. Rejections (disabled,
//! already fixing, unknown project) are returned to the caller before any
//! state is mutated; once the guard is held, the record is created or reset
//! and the cycle is queued for the worker.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::DeploymentPlatform;
use crate::error::{HealerError, Result};
use crate::guard::{ConcurrencyGuard, GuardLease};
use crate::store::RemediationStore;
use crate::types::{DeploymentState, FailureRecord, LogRefresh};
use crate::worker::{CycleJob, CycleQueue, TriggerSource};

/// A platform webhook reduced to what intake needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentEvent {
    pub event_type: String,
    pub project_id: String,
    pub deployment_id: String,
    /// Raw platform state
    pub state: String,
}

impl DeploymentEvent {
    /// Parse a webhook body.
    ///
    /// Accepts the project/deployment either at the top level or under
    /// `payload`, and `eventType` or `type` for the event name.
    pub fn from_webhook(body: &serde_json::Value) -> Result<Self> {
        let root = body.get("payload").filter(|p| p.is_object()).unwrap_or(body);

        let event_type = str_at(body, &["eventType"])
            .or_else(|| str_at(body, &["type"]))
            .unwrap_or_default()
            .to_string();
        let project_id = str_at(root, &["project", "id"])
            .or_else(|| str_at(root, &["projectId"]))
            .ok_or_else(|| HealerError::InvalidEvent("missing project.id".to_string()))?;
        let deployment_id = str_at(root, &["deployment", "id"])
            .or_else(|| str_at(root, &["deploymentId"]))
            .ok_or_else(|| HealerError::InvalidEvent("missing deployment.id".to_string()))?;
        let state = str_at(root, &["deployment", "state"])
            .or_else(|| state_from_event_type(&event_type))
            .ok_or_else(|| HealerError::InvalidEvent("missing deployment.state".to_string()))?;

        Ok(Self {
            event_type,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
            state: state.to_string(),
        })
    }

    /// Whether the event reports a failure state (`ERROR` or `FAILED`).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        DeploymentState::parse(&self.state).is_some_and(DeploymentState::is_failure)
    }
}

fn str_at<'a>(value: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// `deployment.error` style event names imply the state.
fn state_from_event_type(event_type: &str) -> Option<&'static str> {
    let suffix = event_type.rsplit(['.', '-', '_']).next()?;
    match suffix.to_ascii_lowercase().as_str() {
        "error" => Some("ERROR"),
        "failed" => Some("FAILED"),
        "succeeded" | "ready" => Some("READY"),
        "canceled" | "cancelled" => Some("CANCELED"),
        _ => None,
    }
}

/// Result of an intake call that was not rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntakeOutcome {
    /// A cycle was queued
    Accepted {
        failure_id: Uuid,
        trigger: TriggerSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        log_refresh: Option<LogRefresh>,
    },
    /// Nothing to do
    Skipped {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_id: Option<Uuid>,
    },
}

/// Entry point for failure signals.
#[derive(Clone)]
pub struct Intake {
    enabled: bool,
    store: Arc<dyn RemediationStore>,
    guard: ConcurrencyGuard,
    platform: Arc<dyn DeploymentPlatform>,
    queue: CycleQueue,
}

impl Intake {
    /// `enabled` is the kill switch.
    pub fn new(
        enabled: bool,
        store: Arc<dyn RemediationStore>,
        platform: Arc<dyn DeploymentPlatform>,
        queue: CycleQueue,
    ) -> Self {
        Self {
            enabled,
            guard: ConcurrencyGuard::new(Arc::clone(&store)),
            store,
            platform,
            queue,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Handle a platform webhook body.
    pub async fn handle_webhook(&self, body: &serde_json::Value) -> Result<IntakeOutcome> {
        self.ensure_enabled()?;
        let event = DeploymentEvent::from_webhook(body)?;

        if !event.is_failure() {
            debug!(
                project_id = %event.project_id,
                deployment_id = %event.deployment_id,
                state = %event.state,
                "Ignoring non-failure deployment event"
            );
            return Ok(IntakeOutcome::Skipped {
                reason: format!("deployment state {} is not a failure", event.state),
                failure_id: None,
            });
        }

        if self.store.get_project(&event.project_id).await?.is_none() {
            return Err(HealerError::ProjectNotFound(event.project_id));
        }

        if let Some(existing) = self
            .store
            .find_failure_by_deployment(&event.project_id, &event.deployment_id)
            .await?
        {
            info!(
                project_id = %event.project_id,
                deployment_id = %event.deployment_id,
                failure_id = %existing.id,
                "Deployment already tracked, skipping"
            );
            return Ok(IntakeOutcome::Skipped {
                reason: "deployment is already tracked".to_string(),
                failure_id: Some(existing.id),
            });
        }

        let lease = self.acquire(&event.project_id).await?;

        let record = FailureRecord::new(&event.project_id, &event.deployment_id, String::new());
        let failure_id = record.id;
        if let Err(e) = self.store.insert_failure(record).await {
            lease.release().await?;
            return Err(e);
        }
        info!(
            project_id = %event.project_id,
            deployment_id = %event.deployment_id,
            failure_id = %failure_id,
            "Deployment failure recorded"
        );

        self.schedule(failure_id, TriggerSource::Webhook, lease).await?;
        Ok(IntakeOutcome::Accepted {
            failure_id,
            trigger: TriggerSource::Webhook,
            log_refresh: None,
        })
    }

    /// Handle a user-initiated retry of `failure_id` (default: the
    /// project's latest failure).
    ///
    /// Logs are refreshed from the platform first. If the refresh fails the
    /// retry still proceeds on the cached logs and the degradation is
    /// recorded on the failure record.
    pub async fn handle_manual_retry(
        &self,
        project_id: &str,
        failure_id: Option<Uuid>,
    ) -> Result<IntakeOutcome> {
        self.ensure_enabled()?;

        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| HealerError::ProjectNotFound(project_id.to_string()))?;

        let record = match failure_id {
            Some(id) => self
                .store
                .get_failure(id)
                .await?
                .filter(|r| r.project_id == project_id)
                .ok_or(HealerError::FailureNotFound(id))?,
            None => self.store.latest_failure(project_id).await?.ok_or_else(|| {
                HealerError::NoFailureRecorded {
                    project_id: project_id.to_string(),
                }
            })?,
        };

        // logs of the most recent failing deployment: the last redeploy, if any
        let deployment_id = self
            .store
            .attempts_for(record.id)
            .await?
            .iter()
            .rev()
            .find_map(|a| a.new_deployment_id.clone())
            .unwrap_or_else(|| record.deployment_id.clone());

        let lease = self.acquire(project_id).await?;

        let mut record = record;
        let (logs, refresh) = match self.platform.deployment_logs(&project, &deployment_id).await {
            Ok(logs) if logs == record.logs => {
                // identical logs still start a new cycle
                warn!(
                    project_id,
                    failure_id = %record.id,
                    deployment_id = %deployment_id,
                    "Refreshed logs are unchanged, retrying anyway"
                );
                (logs, LogRefresh::Unchanged)
            }
            Ok(logs) => (logs, LogRefresh::Fresh),
            Err(e) => {
                warn!(
                    project_id,
                    failure_id = %record.id,
                    deployment_id = %deployment_id,
                    "Log refresh failed, retrying with cached logs: {e}"
                );
                let cached = record.logs.clone();
                (cached, LogRefresh::Degraded { error: e.to_string() })
            }
        };

        record.reset_for_manual_retry(logs, refresh.clone());
        if let Err(e) = self.store.update_failure(&record).await {
            lease.release().await?;
            return Err(e);
        }
        info!(
            project_id,
            failure_id = %record.id,
            refresh = ?refresh,
            "Manual retry accepted"
        );

        self.schedule(record.id, TriggerSource::ManualRetry, lease).await?;
        Ok(IntakeOutcome::Accepted {
            failure_id: record.id,
            trigger: TriggerSource::ManualRetry,
            log_refresh: Some(refresh),
        })
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            debug!("Intake rejected: remediation disabled");
            Err(HealerError::Disabled)
        }
    }

    async fn acquire(&self, project_id: &str) -> Result<GuardLease> {
        self.guard.try_acquire(project_id).await?.ok_or_else(|| {
            info!(project_id, "Remediation already in progress");
            HealerError::AlreadyFixing {
                project_id: project_id.to_string(),
            }
        })
    }

    /// Queue the cycle; a record that cannot be queued is left interrupted.
    async fn schedule(
        &self,
        failure_id: Uuid,
        trigger: TriggerSource,
        lease: GuardLease,
    ) -> Result<()> {
        let job = CycleJob {
            failure_id,
            trigger,
            lease,
        };
        if let Err(e) = self.queue.enqueue(job).await {
            if let Some(mut record) = self.store.get_failure(failure_id).await? {
                record.interrupt(e.to_string());
                self.store.update_failure(&record).await?;
            }
            return Err(e);
        }
        Ok(())
    }
}
