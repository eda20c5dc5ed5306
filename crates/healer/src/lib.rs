//! Deployment-failure remediation loop.
//!
//! Detects failed deployments (platform webhooks or manual retries), asks a
//! code-generation service for a fix, gates the proposal through the
//! [`validator`], commits it to a fresh branch and redeploys, until the
//! deployment is healthy or the attempt budget is spent.
//!
//! Layout:
//! - [`intake`] turns failure signals into queued cycles
//! - [`guard`] keeps at most one cycle per project
//! - [`worker`] runs queued cycles and recovers stale guards
//! - [`orchestrator`] is the per-failure state machine
//! - [`collaborators`] are the external services, behind traits
//! - [`store`] persists projects, failure records and fix attempts
//! - [`server`] exposes the HTTP surface

pub mod backoff;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod guard;
pub mod intake;
pub mod orchestrator;
pub mod server;
pub mod store;
pub mod types;
pub mod validator;
pub mod worker;

pub use config::HealerConfig;
pub use error::{HealerError, Result};
pub use types::{
    AttemptOutcome, DeploymentState, FailureRecord, FailureStatus, FixAttempt, ProjectTarget,
    ProposedEdit,
};
