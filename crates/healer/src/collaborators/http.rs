//! JSON-over-HTTP collaborator clients.
//!
//! Endpoints (relative to each service's base URL):
//!
//! | Service        | Call                                            |
//! |----------------|-------------------------------------------------|
//! | platform       | `GET  /v1/deployments/{id}/logs?projectId=..`   |
//! | platform       | `POST /v1/projects/{project}/deployments`       |
//! | platform       | `GET  /v1/deployments/{id}`                     |
//! | source control | `POST /v1/repos/{owner}/{repo}/branches`        |
//! | source control | `POST /v1/repos/{owner}/{repo}/commits`         |
//! | codegen        | `POST /v1/fixes`                                |
//!
//! Non-success statuses become [`HealerError::Http`]; HTTP 529 or an error
//! body mentioning "overloaded" becomes [`HealerError::Overloaded`]. The
//! backoff controller decides what to retry.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Credentials, DeploymentPlatform, FixGenerator, SourceControl};
use crate::config::{CollaboratorConfig, ServiceEndpoint};
use crate::error::{HealerError, Result};
use crate::types::{DeploymentState, DiagnosticContext, FixProposal, ProjectTarget, ProposedEdit};

/// Non-standard status some model APIs use for overload.
const STATUS_OVERLOADED: u16 = 529;

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// One configured HTTP service.
#[derive(Debug, Clone)]
struct HttpService {
    name: &'static str,
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl HttpService {
    fn new(name: &'static str, endpoint: &ServiceEndpoint, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HealerError::collaborator(name, format!("failed to build client: {e}")))?;
        Ok(Self {
            name,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            token: endpoint.token(),
            client,
        })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        credentials: Option<&Credentials>,
    ) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let builder = self.client.request(method, url);
        match credentials.map(Credentials::expose).or(self.token.as_deref()) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| HealerError::from_reqwest(self.name, &e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(self.status_error(status, body))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        response.json::<T>().await.map_err(|e| {
            HealerError::collaborator(self.name, format!("unexpected response body: {e}"))
        })
    }

    fn status_error(&self, status: StatusCode, body: String) -> HealerError {
        if status.as_u16() == STATUS_OVERLOADED || body.to_lowercase().contains("overloaded") {
            return HealerError::Overloaded {
                service: self.name.to_string(),
            };
        }
        let mut body = body;
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        HealerError::Http {
            service: self.name.to_string(),
            status: status.as_u16(),
            body,
        }
    }
}

// ============================================================================
// Deployment platform
// ============================================================================

#[derive(Debug, Deserialize)]
struct LogsResponse {
    logs: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RedeployRequest<'a> {
    branch: &'a str,
    commit_ref: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeploymentResponse {
    id: String,
    #[serde(default)]
    state: Option<String>,
}

/// Deployment platform reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDeploymentPlatform {
    service: HttpService,
}

impl HttpDeploymentPlatform {
    pub fn new(config: &CollaboratorConfig) -> Result<Self> {
        Ok(Self {
            service: HttpService::new(
                "platform",
                &config.platform,
                Duration::from_secs(config.request_timeout_secs),
            )?,
        })
    }
}

#[async_trait]
impl DeploymentPlatform for HttpDeploymentPlatform {
    async fn deployment_logs(
        &self,
        project: &ProjectTarget,
        deployment_id: &str,
    ) -> Result<String> {
        debug!(project_id = %project.id, deployment_id, "Fetching deployment logs");
        let builder = self
            .service
            .request(Method::GET, &format!("/v1/deployments/{deployment_id}/logs"), None)
            .query(&[("projectId", project.id.as_str())]);
        let response: LogsResponse = self.service.send_json(builder).await?;
        Ok(response.logs)
    }

    async fn trigger_redeploy(
        &self,
        project: &ProjectTarget,
        branch: &str,
        commit_ref: &str,
    ) -> Result<String> {
        debug!(project_id = %project.id, branch, commit_ref, "Triggering redeploy");
        let builder = self
            .service
            .request(
                Method::POST,
                &format!("/v1/projects/{}/deployments", project.id),
                None,
            )
            .json(&RedeployRequest { branch, commit_ref });
        let response: DeploymentResponse = self.service.send_json(builder).await?;
        Ok(response.id)
    }

    async fn deployment_status(&self, deployment_id: &str) -> Result<DeploymentState> {
        let builder = self
            .service
            .request(Method::GET, &format!("/v1/deployments/{deployment_id}"), None);
        let response: DeploymentResponse = self.service.send_json(builder).await?;
        let raw = response.state.unwrap_or_default();
        DeploymentState::parse(&raw).ok_or_else(|| {
            HealerError::collaborator(
                "platform",
                format!("unknown state '{raw}' for deployment {}", response.id),
            )
        })
    }
}

// ============================================================================
// Source control
// ============================================================================

#[derive(Debug, Serialize)]
struct CreateBranchRequest<'a> {
    name: &'a str,
    from: &'a str,
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    branch: &'a str,
    message: &'a str,
    files: Vec<CommitFile<'a>>,
}

#[derive(Debug, Serialize)]
struct CommitFile<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
}

/// Source-control host reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSourceControl {
    service: HttpService,
}

impl HttpSourceControl {
    pub fn new(config: &CollaboratorConfig) -> Result<Self> {
        Ok(Self {
            service: HttpService::new(
                "source_control",
                &config.source_control,
                Duration::from_secs(config.request_timeout_secs),
            )?,
        })
    }
}

#[async_trait]
impl SourceControl for HttpSourceControl {
    async fn create_branch(
        &self,
        project: &ProjectTarget,
        branch: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        debug!(repository = %project.repository, branch, "Creating branch");
        let builder = self
            .service
            .request(
                Method::POST,
                &format!("/v1/repos/{}/branches", project.repository),
                credentials,
            )
            .json(&CreateBranchRequest {
                name: branch,
                from: &project.base_branch,
            });
        match self.service.send(builder).await {
            Ok(_) => Ok(()),
            // branch left over from an earlier, interrupted attempt
            Err(HealerError::Http { status: 409 | 422, .. }) => {
                debug!(branch, "Branch already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn commit_files(
        &self,
        project: &ProjectTarget,
        branch: &str,
        edits: &[ProposedEdit],
        message: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        debug!(repository = %project.repository, branch, files = edits.len(), "Committing files");
        let files = edits
            .iter()
            .map(|e| CommitFile {
                path: &e.path,
                content: &e.new_content,
            })
            .collect();
        let builder = self
            .service
            .request(
                Method::POST,
                &format!("/v1/repos/{}/commits", project.repository),
                credentials,
            )
            .json(&CommitRequest {
                branch,
                message,
                files,
            });
        let response: CommitResponse = self.service.send_json(builder).await?;
        Ok(response.sha)
    }
}

// ============================================================================
// Codegen
// ============================================================================

#[derive(Debug, Serialize)]
struct FixRequest<'a> {
    prompt: String,
    context: &'a DiagnosticContext,
}

/// Code-generation service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFixGenerator {
    service: HttpService,
}

impl HttpFixGenerator {
    pub fn new(config: &CollaboratorConfig) -> Result<Self> {
        Ok(Self {
            service: HttpService::new(
                "codegen",
                &config.codegen,
                Duration::from_secs(config.request_timeout_secs),
            )?,
        })
    }
}

#[async_trait]
impl FixGenerator for HttpFixGenerator {
    async fn propose_fix(&self, context: &DiagnosticContext) -> Result<FixProposal> {
        debug!(
            project_id = %context.project_id,
            attempt = context.attempt_number,
            "Requesting fix proposal"
        );
        let builder = self
            .service
            .request(Method::POST, "/v1/fixes", None)
            .json(&FixRequest {
                prompt: context.render_prompt(),
                context,
            });
        self.service.send_json(builder).await
    }
}
