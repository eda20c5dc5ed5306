//! Scripted collaborators and a wired-up loop for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use deploy_healer::backoff::RetryConfig;
use deploy_healer::collaborators::{
    Collaborators, Credentials, DeploymentPlatform, FixGenerator, SecretsProvider, SourceControl,
};
use deploy_healer::error::{HealerError, Result};
use deploy_healer::guard::ConcurrencyGuard;
use deploy_healer::intake::Intake;
use deploy_healer::orchestrator::Orchestrator;
use deploy_healer::server::ServerState;
use deploy_healer::store::{MemoryStore, RemediationStore};
use deploy_healer::types::{DiagnosticContext, FixProposal};
use deploy_healer::worker::{CycleQueue, CycleRegistry, Worker};
use deploy_healer::{
    DeploymentState, FailureRecord, FailureStatus, HealerConfig, ProjectTarget, ProposedEdit,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const PROJECT: &str = "prj_1";
pub const DEFAULT_LOGS: &str = "Error: Module not found: Can't resolve './missing'";

// =============================================================================
// Scripted collaborators
// =============================================================================

/// Platform whose log fetches and redeploy outcomes are scripted.
pub struct FakePlatform {
    /// Popped per log fetch; `Err` text becomes a collaborator error
    pub logs: Mutex<VecDeque<std::result::Result<String, String>>>,
    /// Popped per redeploy; defaults to `ERROR`
    pub redeploy_outcomes: Mutex<VecDeque<DeploymentState>>,
    /// Deployment ids whose logs were requested, in order
    pub log_requests: Mutex<Vec<String>>,
    /// `(branch, commit_ref)` of each redeploy
    pub redeploys: Mutex<Vec<(String, String)>>,
    states: Mutex<HashMap<String, DeploymentState>>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            logs: Mutex::new(VecDeque::new()),
            redeploy_outcomes: Mutex::new(VecDeque::new()),
            log_requests: Mutex::new(Vec::new()),
            redeploys: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
        }
    }
}

impl FakePlatform {
    pub fn script_logs(&self, result: std::result::Result<&str, &str>) {
        self.logs
            .lock()
            .unwrap()
            .push_back(result.map(str::to_string).map_err(str::to_string));
    }

    pub fn script_redeploy(&self, state: DeploymentState) {
        self.redeploy_outcomes.lock().unwrap().push_back(state);
    }

    pub fn log_requests(&self) -> Vec<String> {
        self.log_requests.lock().unwrap().clone()
    }

    pub fn redeploy_count(&self) -> usize {
        self.redeploys.lock().unwrap().len()
    }
}

#[async_trait]
impl DeploymentPlatform for FakePlatform {
    async fn deployment_logs(
        &self,
        _project: &ProjectTarget,
        deployment_id: &str,
    ) -> Result<String> {
        self.log_requests
            .lock()
            .unwrap()
            .push(deployment_id.to_string());
        match self.logs.lock().unwrap().pop_front() {
            Some(Ok(logs)) => Ok(logs),
            Some(Err(message)) => Err(HealerError::collaborator("platform", message)),
            None => Ok(DEFAULT_LOGS.to_string()),
        }
    }

    async fn trigger_redeploy(
        &self,
        _project: &ProjectTarget,
        branch: &str,
        commit_ref: &str,
    ) -> Result<String> {
        let mut redeploys = self.redeploys.lock().unwrap();
        redeploys.push((branch.to_string(), commit_ref.to_string()));
        let id = format!("dpl_redeploy_{}", redeploys.len());
        let state = self
            .redeploy_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DeploymentState::Error);
        self.states.lock().unwrap().insert(id.clone(), state);
        Ok(id)
    }

    async fn deployment_status(&self, deployment_id: &str) -> Result<DeploymentState> {
        self.states
            .lock()
            .unwrap()
            .get(deployment_id)
            .copied()
            .ok_or_else(|| {
                HealerError::collaborator("platform", format!("unknown deployment {deployment_id}"))
            })
    }
}

/// Records every branch and commit.
#[derive(Default)]
pub struct FakeSourceControl {
    pub branches: Mutex<Vec<String>>,
    pub commits: Mutex<Vec<(String, Vec<ProposedEdit>)>>,
    /// Token seen by each commit
    pub tokens: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn create_branch(
        &self,
        _project: &ProjectTarget,
        branch: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<()> {
        self.branches.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn commit_files(
        &self,
        _project: &ProjectTarget,
        branch: &str,
        edits: &[ProposedEdit],
        _message: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        self.tokens
            .lock()
            .unwrap()
            .push(credentials.map(|c| c.expose().to_string()));
        let mut commits = self.commits.lock().unwrap();
        commits.push((branch.to_string(), edits.to_vec()));
        Ok(format!("sha{}", commits.len()))
    }
}

/// How the fake codegen behaves once its script runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenMode {
    /// Propose a safe one-file fix
    Safe,
    /// Never answer
    Hang,
    /// Panic inside the call
    Panic,
    /// Fail with a non-retryable error
    Fail,
}

/// Code generator with scripted proposals.
pub struct FakeCodegen {
    /// Popped before any proposal; lets a call fail once and then recover
    pub errors: Mutex<VecDeque<HealerError>>,
    pub proposals: Mutex<VecDeque<FixProposal>>,
    pub mode: Mutex<CodegenMode>,
    /// Context of every call, in order
    pub contexts: Mutex<Vec<DiagnosticContext>>,
}

impl Default for FakeCodegen {
    fn default() -> Self {
        Self {
            errors: Mutex::new(VecDeque::new()),
            proposals: Mutex::new(VecDeque::new()),
            mode: Mutex::new(CodegenMode::Safe),
            contexts: Mutex::new(Vec::new()),
        }
    }
}

impl FakeCodegen {
    pub fn script(&self, proposal: FixProposal) {
        self.proposals.lock().unwrap().push_back(proposal);
    }

    pub fn fail_next(&self, error: HealerError) {
        self.errors.lock().unwrap().push_back(error);
    }

    pub fn set_mode(&self, mode: CodegenMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn contexts(&self) -> Vec<DiagnosticContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl FixGenerator for FakeCodegen {
    async fn propose_fix(&self, context: &DiagnosticContext) -> Result<FixProposal> {
        self.contexts.lock().unwrap().push(context.clone());
        let error = self.errors.lock().unwrap().pop_front();
        if let Some(error) = error {
            return Err(error);
        }
        let scripted = self.proposals.lock().unwrap().pop_front();
        if let Some(proposal) = scripted {
            return Ok(proposal);
        }
        let mode = *self.mode.lock().unwrap();
        match mode {
            CodegenMode::Safe => Ok(safe_proposal()),
            CodegenMode::Hang => std::future::pending().await,
            CodegenMode::Panic => panic!("codegen exploded"),
            CodegenMode::Fail => Err(HealerError::collaborator(
                "codegen",
                "model refused the request",
            )),
        }
    }
}

/// Secrets provider that prefixes the ciphertext.
pub struct FakeSecrets;

#[async_trait]
impl SecretsProvider for FakeSecrets {
    async fn decrypt(&self, ciphertext: &str) -> Result<Credentials> {
        Ok(Credentials::new(format!("token-for-{ciphertext}")))
    }

    async fn encrypt(&self, credentials: &Credentials) -> Result<String> {
        Ok(format!("sealed-{}", credentials.expose().len()))
    }
}

// =============================================================================
// Proposals and events
// =============================================================================

pub fn safe_proposal() -> FixProposal {
    FixProposal {
        edits: vec![ProposedEdit::new(
            "src/index.ts",
            "export const handler = () => 'ok';\n",
        )],
        rationale: "restore the missing export".to_string(),
    }
}

pub fn dangerous_proposal() -> FixProposal {
    FixProposal {
        edits: vec![ProposedEdit::new(
            "src/index.ts",
            "const config = eval(process.argv[2]);\n",
        )],
        rationale: "load config dynamically".to_string(),
    }
}

pub fn failure_event(project_id: &str, deployment_id: &str) -> serde_json::Value {
    json!({
        "eventType": "deployment.error",
        "payload": {
            "project": { "id": project_id },
            "deployment": { "id": deployment_id, "state": "ERROR" }
        }
    })
}

pub fn test_config() -> HealerConfig {
    HealerConfig {
        retry: RetryConfig {
            max_retries: 1,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        },
        deploy_poll_interval_secs: 1,
        deploy_timeout_secs: 5,
        cycle_timeout_secs: 30,
        ..HealerConfig::default()
    }
}

pub fn test_project() -> ProjectTarget {
    ProjectTarget {
        encrypted_credentials: Some("sealed".to_string()),
        ..ProjectTarget::new(PROJECT, "acme/storefront")
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Intake, worker and scripted collaborators over one memory store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub platform: Arc<FakePlatform>,
    pub source_control: Arc<FakeSourceControl>,
    pub codegen: Arc<FakeCodegen>,
    pub intake: Intake,
    pub registry: CycleRegistry,
    pub worker: Arc<Worker>,
    pub shutdown: CancellationToken,
    worker_task: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: HealerConfig) -> Self {
        let store = Arc::new(MemoryStore::with_projects([test_project()]));
        let platform = Arc::new(FakePlatform::default());
        let source_control = Arc::new(FakeSourceControl::default());
        let codegen = Arc::new(FakeCodegen::default());
        let collaborators = Collaborators {
            platform: platform.clone(),
            source_control: source_control.clone(),
            codegen: codegen.clone(),
            secrets: Arc::new(FakeSecrets),
        };

        let dyn_store: Arc<dyn RemediationStore> = store.clone();
        let enabled = config.enabled;
        let capacity = config.queue_capacity;
        let orchestrator =
            Arc::new(Orchestrator::new(config, dyn_store.clone(), collaborators).unwrap());

        let shutdown = CancellationToken::new();
        let registry = CycleRegistry::default();
        let (queue, jobs) = CycleQueue::bounded(capacity);
        let worker = Arc::new(Worker::new(
            orchestrator,
            ConcurrencyGuard::new(dyn_store.clone()),
            registry.clone(),
            shutdown.clone(),
        ));
        let worker_task = tokio::spawn(worker.clone().run(jobs));

        let intake = Intake::new(enabled, dyn_store, platform.clone(), queue);

        Self {
            store,
            platform,
            source_control,
            codegen,
            intake,
            registry,
            worker,
            shutdown,
            worker_task: Some(worker_task),
        }
    }

    /// Server state sharing this harness's intake and store.
    pub fn server_state(&self, max_attempts: u32) -> ServerState {
        ServerState {
            intake: self.intake.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            max_attempts,
        }
    }

    pub async fn record(&self, failure_id: Uuid) -> FailureRecord {
        self.store.get_failure(failure_id).await.unwrap().unwrap()
    }

    pub async fn is_fixing(&self) -> bool {
        self.store.get_project(PROJECT).await.unwrap().unwrap().is_fixing
    }

    /// Wait until the record has left the running statuses and its guard is free.
    pub async fn settle(&self, failure_id: Uuid) -> FailureRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = self.record(failure_id).await;
                let running = matches!(
                    record.status,
                    FailureStatus::PendingAnalysis | FailureStatus::Fixing
                );
                if !running && !self.is_fixing().await {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cycle did not settle")
    }

    /// Wait until `count` cycles are live.
    pub async fn wait_for_live_cycles(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.registry.len().await != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cycle never started");
    }

    /// Cancel everything and wait for the worker to drain.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.worker_task.take() {
            task.await.unwrap();
        }
    }
}
