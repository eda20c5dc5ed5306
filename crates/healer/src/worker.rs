//! Cycle queue, worker and stale-guard sweeper.
//!
//! Intake never spawns cycles itself. It acquires the project guard, then
//! hands a [`CycleJob`] (which owns the [`GuardLease`]) to the bounded
//! [`CycleQueue`]. The [`Worker`] drains the queue and runs each cycle in
//! its own task, registered in a [`CycleRegistry`] with a cancellation token
//! and a supervisory deadline. The guard is released when the task ends,
//! whatever the outcome; a panicking cycle is caught and its record
//! interrupted.
//!
//! The sweeper resets guards that have been held past the stale timeout by
//! projects with no live cycle (for example after a process restart).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{HealerError, Result};
use crate::guard::{ConcurrencyGuard, GuardLease, RecoveredGuard};
use crate::orchestrator::{CycleControl, Orchestrator};

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Webhook,
    ManualRetry,
}

/// A scheduled cycle. Holds the project guard until it is dropped or released.
#[derive(Debug)]
pub struct CycleJob {
    pub failure_id: Uuid,
    pub trigger: TriggerSource,
    pub lease: GuardLease,
}

/// Sending half of the bounded cycle queue.
#[derive(Debug, Clone)]
pub struct CycleQueue {
    tx: mpsc::Sender<CycleJob>,
}

impl CycleQueue {
    /// Create a queue holding at most `capacity` pending jobs.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<CycleJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. On failure the job's guard is released.
    pub async fn enqueue(&self, job: CycleJob) -> Result<()> {
        let (job, reason) = match self.tx.try_send(job) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => (job, "queue is full"),
            Err(mpsc::error::TrySendError::Closed(job)) => (job, "worker has shut down"),
        };
        warn!(
            project_id = %job.lease.project_id(),
            failure_id = %job.failure_id,
            "Could not schedule remediation cycle: {reason}"
        );
        job.lease.release().await?;
        Err(HealerError::QueueUnavailable(reason.to_string()))
    }
}

/// A live cycle.
#[derive(Debug, Clone)]
pub struct CycleHandle {
    pub failure_id: Uuid,
    pub project_id: String,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

/// Serializable view of a live cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub failure_id: Uuid,
    pub project_id: String,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
}

/// Live cycles by failure id.
#[derive(Debug, Clone, Default)]
pub struct CycleRegistry {
    cycles: Arc<RwLock<HashMap<Uuid, CycleHandle>>>,
}

impl CycleRegistry {
    pub async fn insert(&self, handle: CycleHandle) {
        self.cycles.write().await.insert(handle.failure_id, handle);
    }

    pub async fn remove(&self, failure_id: Uuid) -> Option<CycleHandle> {
        self.cycles.write().await.remove(&failure_id)
    }

    pub async fn len(&self) -> usize {
        self.cycles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cycles.read().await.is_empty()
    }

    /// Projects with a live cycle
    pub async fn live_projects(&self) -> HashSet<String> {
        self.cycles
            .read()
            .await
            .values()
            .map(|h| h.project_id.clone())
            .collect()
    }

    pub async fn summaries(&self) -> Vec<CycleSummary> {
        let mut summaries: Vec<_> = self
            .cycles
            .read()
            .await
            .values()
            .map(|h| CycleSummary {
                failure_id: h.failure_id,
                project_id: h.project_id.clone(),
                trigger: h.trigger,
                started_at: h.started_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    /// Cancel one cycle. Returns false if it is not running.
    pub async fn cancel(&self, failure_id: Uuid) -> bool {
        match self.cycles.read().await.get(&failure_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        for handle in self.cycles.read().await.values() {
            handle.cancel.cancel();
        }
    }
}

/// Runs queued cycles and sweeps stale guards.
pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    guard: ConcurrencyGuard,
    registry: CycleRegistry,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        guard: ConcurrencyGuard,
        registry: CycleRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            guard,
            registry,
            shutdown,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &CycleRegistry {
        &self.registry
    }

    /// Drain `jobs` until shutdown, then cancel and await live cycles.
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::Receiver<CycleJob>) {
        let mut tasks = JoinSet::new();
        info!("Remediation worker started");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => {
                        let worker = Arc::clone(&self);
                        tasks.spawn(async move { worker.execute(job).await });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Cycle supervisor task failed: {e}");
                    }
                }
            }
        }

        // refuse new work and release the guards of jobs that never started
        jobs.close();
        while let Ok(job) = jobs.try_recv() {
            debug!(failure_id = %job.failure_id, "Dropping queued cycle on shutdown");
            if let Err(e) = job.lease.release().await {
                error!("Failed to release guard of queued cycle: {e}");
            }
        }

        self.registry.cancel_all().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Cycle supervisor task failed: {e}");
            }
        }
        info!("Remediation worker stopped");
    }

    /// Run one job to completion and release its guard.
    async fn execute(&self, job: CycleJob) {
        let CycleJob {
            failure_id,
            trigger,
            lease,
        } = job;
        let project_id = lease.project_id().to_string();
        let cancel = self.shutdown.child_token();
        let deadline = tokio::time::Instant::now() + self.orchestrator.config().cycle_timeout();

        self.registry
            .insert(CycleHandle {
                failure_id,
                project_id: project_id.clone(),
                trigger,
                started_at: Utc::now(),
                cancel: cancel.clone(),
            })
            .await;

        let orchestrator = Arc::clone(&self.orchestrator);
        let control = CycleControl::new(cancel, deadline);
        let cycle = tokio::spawn(async move { orchestrator.run_cycle(failure_id, control).await });

        match cycle.await {
            Ok(Ok(status)) => {
                debug!(
                    project_id = %project_id,
                    failure_id = %failure_id,
                    %status,
                    "Cycle task done"
                );
            }
            Ok(Err(e)) => {
                error!(project_id = %project_id, failure_id = %failure_id, "Cycle failed: {e}");
                self.interrupt(failure_id, &e.to_string()).await;
            }
            Err(join_error) => {
                error!(
                    project_id = %project_id,
                    failure_id = %failure_id,
                    "Cycle task aborted: {join_error}"
                );
                let reason = if join_error.is_panic() {
                    "remediation cycle panicked"
                } else {
                    "remediation cycle task was aborted"
                };
                self.interrupt(failure_id, reason).await;
            }
        }

        self.registry.remove(failure_id).await;
        if let Err(e) = lease.release().await {
            error!(project_id = %project_id, "Guard release after cycle failed: {e}");
        }
    }

    async fn interrupt(&self, failure_id: Uuid, reason: &str) {
        if let Err(e) = self.orchestrator.interrupt(failure_id, reason).await {
            error!(failure_id = %failure_id, "Could not mark record interrupted: {e}");
        }
    }

    /// One stale-guard sweep.
    pub async fn sweep_once(&self) -> Result<Vec<RecoveredGuard>> {
        let live = self.registry.live_projects().await;
        self.guard
            .recover_stale(self.orchestrator.config().stale_guard_timeout(), &live)
            .await
    }

    /// Sweep now and then every `interval` until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Stale-guard sweep failed: {e}");
                    }
                }
            }
        }
        debug!("Stale-guard sweeper stopped");
    }
}
