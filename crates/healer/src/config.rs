//! Runtime configuration.
//!
//! Loaded from an optional JSON file; every field has a default so an empty
//! object (or no file at all) yields a working configuration. CLI flags are
//! applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::RetryConfig;
use crate::error::{HealerError, Result};
use crate::types::ProjectTarget;
use crate::validator::ValidatorPolicy;

/// Top-level configuration for the remediation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    /// Kill switch: when false, intake refuses to start any cycle
    pub enabled: bool,
    /// Fix attempts per failure record before giving up
    pub max_attempts: u32,
    /// Backoff for individual collaborator calls
    pub retry: RetryConfig,
    /// How often a redeploy is polled
    pub deploy_poll_interval_secs: u64,
    /// How long a redeploy may take before the attempt counts as failed
    pub deploy_timeout_secs: u64,
    /// Supervisory limit for one whole cycle
    pub cycle_timeout_secs: u64,
    /// Guards held longer than this with no live cycle are recovered
    pub stale_guard_timeout_secs: u64,
    /// Interval of the stale-guard sweep
    pub stale_sweep_interval_secs: u64,
    /// Bound of the cycle queue
    pub queue_capacity: usize,
    /// Prefix for fix branches
    pub branch_prefix: String,
    /// Change validator tunables
    pub validator: ValidatorPolicy,
    /// JSON file for durable state; in-memory when unset
    pub store_path: Option<PathBuf>,
    /// External service endpoints
    pub collaborators: CollaboratorConfig,
    /// Projects registered at startup
    pub projects: Vec<ProjectTarget>,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            retry: RetryConfig::default(),
            deploy_poll_interval_secs: 10,
            deploy_timeout_secs: 900,
            cycle_timeout_secs: 3600,
            stale_guard_timeout_secs: 5400,
            stale_sweep_interval_secs: 300,
            queue_capacity: 64,
            branch_prefix: "healer/fix".to_string(),
            validator: ValidatorPolicy::default(),
            store_path: None,
            collaborators: CollaboratorConfig::default(),
            projects: Vec::new(),
        }
    }
}

impl HealerConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(HealerError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.deploy_poll_interval_secs == 0 {
            return Err(HealerError::Config(
                "deploy_poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(HealerError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.stale_guard_timeout_secs <= self.cycle_timeout_secs {
            tracing::warn!(
                stale_guard_timeout_secs = self.stale_guard_timeout_secs,
                cycle_timeout_secs = self.cycle_timeout_secs,
                "Stale-guard timeout does not exceed the cycle timeout; \
                 live cycles are still protected by their handles"
            );
        }
        Ok(())
    }

    /// Never shorter than one second.
    #[must_use]
    pub fn deploy_poll_interval(&self) -> Duration {
        Duration::from_secs(self.deploy_poll_interval_secs.max(1))
    }

    #[must_use]
    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    #[must_use]
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    #[must_use]
    pub fn stale_guard_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_guard_timeout_secs)
    }

    #[must_use]
    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_secs)
    }
}

/// Endpoints of the HTTP collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub platform: ServiceEndpoint,
    pub source_control: ServiceEndpoint,
    pub codegen: ServiceEndpoint,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            platform: ServiceEndpoint::new("http://localhost:8081", "PLATFORM_TOKEN"),
            source_control: ServiceEndpoint::new("http://localhost:8082", "SCM_TOKEN"),
            codegen: ServiceEndpoint::new("http://localhost:8083", "CODEGEN_API_KEY"),
            request_timeout_secs: 60,
        }
    }
}

/// Base URL plus the environment variable holding its bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub token_env: Option<String>,
}

impl ServiceEndpoint {
    pub fn new(base_url: impl Into<String>, token_env: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token_env: Some(token_env.into()),
        }
    }

    /// Token read from the environment, if configured and set.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_yields_defaults() {
        let config: HealerConfig = serde_json::from_str("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.branch_prefix, "healer/fix");
        assert_eq!(config.validator.max_files, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("healer.json");
        std::fs::write(
            &path,
            r#"{
                "enabled": false,
                "max_attempts": 3,
                "retry": { "max_retries": 1 },
                "projects": [{ "id": "prj_1", "repository": "acme/site" }]
            }"#,
        )
        .unwrap();

        let config = HealerConfig::load(&path).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.projects.len(), 1);
        assert_eq!(config.projects[0].base_branch, "main");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = HealerConfig {
            max_attempts: 0,
            ..HealerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected_and_clamped() {
        let config = HealerConfig {
            deploy_poll_interval_secs: 0,
            ..HealerConfig::default()
        };
        assert!(matches!(config.validate(), Err(HealerError::Config(_))));
        assert_eq!(config.deploy_poll_interval(), Duration::from_secs(1));
    }
}
