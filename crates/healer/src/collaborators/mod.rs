//! External services the remediation loop depends on.
//!
//! Each collaborator is an `async_trait` seam so the orchestrator can be
//! driven by the HTTP clients in [`http`] in production and by scripted fakes
//! in tests.

pub mod http;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::CollaboratorConfig;
use crate::error::{HealerError, Result};
use crate::types::{DeploymentState, DiagnosticContext, FixProposal, ProjectTarget, ProposedEdit};

pub use http::{HttpDeploymentPlatform, HttpFixGenerator, HttpSourceControl};

/// Every collaborator a remediation cycle calls.
#[derive(Clone)]
pub struct Collaborators {
    pub platform: Arc<dyn DeploymentPlatform>,
    pub source_control: Arc<dyn SourceControl>,
    pub codegen: Arc<dyn FixGenerator>,
    pub secrets: Arc<dyn SecretsProvider>,
}

impl Collaborators {
    /// HTTP clients for every service plus env-reference secrets.
    pub fn http(config: &CollaboratorConfig) -> Result<Self> {
        Ok(Self {
            platform: Arc::new(HttpDeploymentPlatform::new(config)?),
            source_control: Arc::new(HttpSourceControl::new(config)?),
            codegen: Arc::new(HttpFixGenerator::new(config)?),
            secrets: Arc::new(EnvSecrets),
        })
    }
}

/// Deployment platform: logs, redeploys and deployment status.
#[async_trait]
pub trait DeploymentPlatform: Send + Sync {
    /// Build/deploy log text of a deployment
    async fn deployment_logs(&self, project: &ProjectTarget, deployment_id: &str)
        -> Result<String>;

    /// Start a deployment of `branch` at `commit_ref`; returns the new deployment id
    async fn trigger_redeploy(
        &self,
        project: &ProjectTarget,
        branch: &str,
        commit_ref: &str,
    ) -> Result<String>;

    /// Current state of a deployment
    async fn deployment_status(&self, deployment_id: &str) -> Result<DeploymentState>;
}

/// Source control: branches and commits.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Create `branch` from the project's base branch. Creating an existing
    /// branch is not an error.
    async fn create_branch(
        &self,
        project: &ProjectTarget,
        branch: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()>;

    /// Commit `edits` to `branch`; returns the commit reference
    async fn commit_files(
        &self,
        project: &ProjectTarget,
        branch: &str,
        edits: &[ProposedEdit],
        message: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String>;
}

/// Code-generation service proposing fixes.
#[async_trait]
pub trait FixGenerator: Send + Sync {
    async fn propose_fix(&self, context: &DiagnosticContext) -> Result<FixProposal>;
}

/// Turns a project's stored credentials into usable ones and back.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn decrypt(&self, ciphertext: &str) -> Result<Credentials>;

    async fn encrypt(&self, credentials: &Credentials) -> Result<String>;
}

/// Source-control access token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The raw token, for building a request.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

/// Secrets stored as environment references of the form `env:NAME`.
///
/// Only the reference is ever persisted; the token lives in the process
/// environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSecrets;

const ENV_PREFIX: &str = "env:";

#[async_trait]
impl SecretsProvider for EnvSecrets {
    async fn decrypt(&self, ciphertext: &str) -> Result<Credentials> {
        let name = ciphertext.strip_prefix(ENV_PREFIX).ok_or_else(|| {
            HealerError::collaborator("secrets", "credentials must be an `env:NAME` reference")
        })?;
        match std::env::var(name) {
            Ok(token) if !token.is_empty() => Ok(Credentials::new(token)),
            _ => Err(HealerError::collaborator(
                "secrets",
                format!("environment variable {name} is not set"),
            )),
        }
    }

    async fn encrypt(&self, _credentials: &Credentials) -> Result<String> {
        Err(HealerError::collaborator(
            "secrets",
            "env references cannot be created from a raw token",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_are_redacted() {
        let creds = Credentials::new("ghp_supersecret");
        assert_eq!(format!("{creds:?}"), "Credentials(<redacted>)");
        assert_eq!(creds.expose(), "ghp_supersecret");
    }

    #[tokio::test]
    async fn test_env_secrets() {
        let secrets = EnvSecrets;
        // PATH is always present in a test environment
        let creds = secrets.decrypt("env:PATH").await.unwrap();
        assert!(!creds.expose().is_empty());

        assert!(secrets.decrypt("PATH").await.is_err());
        assert!(secrets
            .decrypt("env:DEPLOY_HEALER_TEST_UNSET_VARIABLE")
            .await
            .is_err());
        assert!(secrets.encrypt(&creds).await.is_err());
    }
}
