//! Core types for deployment remediation.
//!
//! This module defines the primary data structures for:
//! - Projects under remediation and their concurrency guard
//! - Failure records and their lifecycle status
//! - Fix attempts (one per remediation iteration)
//! - Proposed edits and the diagnostic context sent to the codegen collaborator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

/// A deployable unit under remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTarget {
    /// Platform project identifier
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Source repository (e.g., "acme/storefront")
    pub repository: String,
    /// Branch the failing deployment was built from
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Source-control installation the credentials belong to
    #[serde(default)]
    pub installation_id: Option<String>,
    /// Stored access credentials, opaque to the loop
    #[serde(default)]
    pub encrypted_credentials: Option<String>,
    /// Exclusivity guard; true while exactly one cycle runs
    #[serde(default)]
    pub is_fixing: bool,
    /// When the guard was acquired
    #[serde(default)]
    pub fixing_since: Option<DateTime<Utc>>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl ProjectTarget {
    /// Create a project with no credentials and a released guard.
    pub fn new(id: impl Into<String>, repository: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            repository: repository.into(),
            base_branch: default_base_branch(),
            installation_id: None,
            encrypted_credentials: None,
            is_fixing: false,
            fixing_since: None,
        }
    }
}

/// Lifecycle status of a failure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    /// Waiting for a cycle to start
    PendingAnalysis,
    /// A cycle is running
    Fixing,
    /// A redeploy succeeded
    FixedSuccessfully,
    /// Attempt budget exhausted
    FailedAfterMaxRetries,
    /// Cycle ended abnormally (error, timeout, cancellation, stale guard)
    Interrupted,
}

impl FailureStatus {
    /// Terminal statuses never start another automatic cycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FixedSuccessfully | Self::FailedAfterMaxRetries)
    }

    /// Short name for logs and API responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingAnalysis => "pending_analysis",
            Self::Fixing => "fixing",
            Self::FixedSuccessfully => "fixed_successfully",
            Self::FailedAfterMaxRetries => "failed_after_max_retries",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the logs on a failure record were obtained for a manual retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRefresh {
    /// Fresh logs differ from the cached copy
    Fresh,
    /// Fresh logs are identical to the cached copy; the retry proceeds anyway
    Unchanged,
    /// Fetch failed; the cached copy is used
    Degraded { error: String },
}

/// One detected deployment failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Unique ID
    pub id: Uuid,
    /// Owning project
    pub project_id: String,
    /// Deployment whose failure was detected
    pub deployment_id: String,
    /// Raw build/deploy log text
    pub logs: String,
    /// Lifecycle status
    pub status: FailureStatus,
    /// Attempts made in the current cycle
    pub attempt_count: u32,
    /// Set when the current cycle was started by a user
    pub is_manual_retry: bool,
    /// Log provenance of the last manual retry
    #[serde(default)]
    pub log_refresh: Option<LogRefresh>,
    /// Last error that interrupted a cycle
    #[serde(default)]
    pub last_error: Option<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl FailureRecord {
    /// Create a record for a freshly detected failure.
    pub fn new(
        project_id: impl Into<String>,
        deployment_id: impl Into<String>,
        logs: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            deployment_id: deployment_id.into(),
            logs: logs.into(),
            status: FailureStatus::PendingAnalysis,
            attempt_count: 0,
            is_manual_retry: false,
            log_refresh: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a new status.
    pub fn set_status(&mut self, status: FailureStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Count one finished attempt against `max_attempts`.
    ///
    /// Returns true once the budget is exhausted; the record is then terminal.
    pub fn record_attempt(&mut self, max_attempts: u32) -> bool {
        self.attempt_count = (self.attempt_count + 1).min(max_attempts);
        self.updated_at = Utc::now();
        if self.attempt_count >= max_attempts {
            self.status = FailureStatus::FailedAfterMaxRetries;
            true
        } else {
            false
        }
    }

    /// Reset for a user-initiated retry.
    pub fn reset_for_manual_retry(&mut self, logs: String, refresh: LogRefresh) {
        self.logs = logs;
        self.log_refresh = Some(refresh);
        self.attempt_count = 0;
        self.is_manual_retry = true;
        self.last_error = None;
        self.set_status(FailureStatus::PendingAnalysis);
    }

    /// Mark the record recoverable after an abnormal cycle exit.
    pub fn interrupt(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
        self.set_status(FailureStatus::Interrupted);
    }
}

/// Deployment state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    Queued,
    Building,
    Ready,
    Error,
    Failed,
    Canceled,
}

impl DeploymentState {
    /// Parse a platform state string (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "QUEUED" | "INITIALIZING" | "PENDING" => Some(Self::Queued),
            "BUILDING" | "DEPLOYING" | "IN_PROGRESS" => Some(Self::Building),
            "READY" | "SUCCEEDED" | "SUCCESS" => Some(Self::Ready),
            "ERROR" => Some(Self::Error),
            "FAILED" | "FAILURE" => Some(Self::Failed),
            "CANCELED" | "CANCELLED" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Failure states that trigger remediation.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Failed)
    }

    /// States after which polling can stop.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::Ready | Self::Error | Self::Failed | Self::Canceled)
    }
}

/// A single file edit proposed by the codegen collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedEdit {
    /// Repository-relative path
    pub path: String,
    /// Full replacement content
    pub new_content: String,
}

impl ProposedEdit {
    pub fn new(path: impl Into<String>, new_content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            new_content: new_content.into(),
        }
    }
}

/// Codegen collaborator output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixProposal {
    pub edits: Vec<ProposedEdit>,
    #[serde(default)]
    pub rationale: String,
}

/// Outcome of a fix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Redeploy reached READY
    Deployed,
    /// Redeploy failed, was cancelled, or never finished in time
    DeployFailed,
    /// Change validator refused the proposal; nothing was applied
    Rejected,
    /// A collaborator call failed past its retries, or the cycle was interrupted
    Errored,
}

/// One remediation iteration against a failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAttempt {
    /// Unique ID
    pub id: Uuid,
    /// Owning failure record
    pub failure_record_id: Uuid,
    /// Gapless, 1-based, per failure record
    pub attempt_number: u32,
    /// Context sent to the codegen collaborator
    pub prompt: String,
    /// Codegen response (rationale + edits) as JSON
    #[serde(default)]
    pub response: Option<String>,
    /// Paths touched by the proposal
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Branch the edits were committed to
    #[serde(default)]
    pub branch: Option<String>,
    /// Commit produced by the source-control collaborator
    #[serde(default)]
    pub commit_ref: Option<String>,
    /// Deployment triggered for this attempt
    #[serde(default)]
    pub new_deployment_id: Option<String>,
    /// Final state of that deployment
    #[serde(default)]
    pub deployment_status: Option<DeploymentState>,
    /// Set exactly once; the attempt is immutable afterwards
    #[serde(default)]
    pub outcome: Option<AttemptOutcome>,
    /// Rejection reason or error text
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FixAttempt {
    /// Open a new attempt.
    pub fn new(failure_record_id: Uuid, attempt_number: u32, prompt: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            failure_record_id,
            attempt_number,
            prompt,
            response: None,
            files_changed: Vec::new(),
            branch: None,
            commit_ref: None,
            new_deployment_id: None,
            deployment_status: None,
            outcome: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the outcome has been recorded.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.outcome.is_some()
    }

    /// Record the outcome.
    pub fn finish(&mut self, outcome: AttemptOutcome, reason: Option<String>) {
        self.outcome = Some(outcome);
        self.failure_reason = reason;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Everything the codegen collaborator sees for one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticContext {
    pub project_id: String,
    pub repository: String,
    pub deployment_id: String,
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// Current failure logs (never stale: refreshed after each failed redeploy)
    pub logs: String,
    /// Summaries of earlier attempts on this failure
    pub previous_attempts: Vec<AttemptSummary>,
    /// Why the previous proposal was refused, if it was
    #[serde(default)]
    pub rejection_feedback: Option<String>,
}

/// Condensed view of an earlier attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptSummary {
    pub attempt_number: u32,
    pub files_changed: Vec<String>,
    pub outcome: Option<AttemptOutcome>,
    pub failure_reason: Option<String>,
}

impl From<&FixAttempt> for AttemptSummary {
    fn from(attempt: &FixAttempt) -> Self {
        Self {
            attempt_number: attempt.attempt_number,
            files_changed: attempt.files_changed.clone(),
            outcome: attempt.outcome,
            failure_reason: attempt.failure_reason.clone(),
        }
    }
}

/// Log tail included in prompts.
const MAX_PROMPT_LOG_CHARS: usize = 20_000;

impl DiagnosticContext {
    /// Render the context as the prompt text stored on the attempt.
    #[must_use]
    pub fn render_prompt(&self) -> String {
        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "Deployment {} of project {} ({}) failed. Attempt {} of {}.",
            self.deployment_id,
            self.project_id,
            self.repository,
            self.attempt_number,
            self.max_attempts
        );

        if !self.previous_attempts.is_empty() {
            prompt.push_str("\nPrevious attempts:\n");
            for attempt in &self.previous_attempts {
                let outcome = attempt
                    .outcome
                    .map_or("unknown".to_string(), |o| format!("{o:?}"));
                let _ = writeln!(
                    prompt,
                    "- #{} [{}] files: {} - {}",
                    attempt.attempt_number,
                    outcome,
                    if attempt.files_changed.is_empty() {
                        "none".to_string()
                    } else {
                        attempt.files_changed.join(", ")
                    },
                    attempt.failure_reason.as_deref().unwrap_or("no details")
                );
            }
        }

        if let Some(feedback) = &self.rejection_feedback {
            let _ = writeln!(
                prompt,
                "\nThe previous proposal was rejected by the safety gate: {feedback}\n\
                 Propose a different fix that avoids this."
            );
        }

        prompt.push_str("\nBuild logs:\n");
        prompt.push_str(tail(&self.logs, MAX_PROMPT_LOG_CHARS));
        prompt
    }
}

/// Last `max` characters of `text`, on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
