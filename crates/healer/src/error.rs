//! Error types for the remediation loop.
//!
//! Every failure the loop can observe lands in [`HealerError`]. The variants
//! follow the remediation taxonomy:
//! - transient external failures (network, retryable HTTP statuses, overload)
//! - intake rejections (disabled, already fixing, unknown project)
//! - store and invariant failures
//! - cancellation and supervisory timeouts

use thiserror::Error;

/// HTTP statuses the backoff controller treats as transient.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Kind of transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused or reset by peer
    Connection,
    /// Request or connect timeout
    Timeout,
    /// Name resolution failed
    Dns,
    /// Anything else reported by the transport (body decode, redirect loop)
    Other,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Dns => write!(f, "dns"),
            Self::Other => write!(f, "transport"),
        }
    }
}

/// Errors produced by intake, the orchestrator and its collaborators.
#[derive(Error, Debug)]
pub enum HealerError {
    /// Kill switch is off; nothing was mutated
    #[error("Automatic remediation is disabled")]
    Disabled,

    /// Another cycle holds the project's guard; nothing was mutated
    #[error("A remediation cycle is already in progress for project '{project_id}'")]
    AlreadyFixing { project_id: String },

    /// Project is not registered
    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    /// Failure record does not exist
    #[error("Failure record '{0}' not found")]
    FailureNotFound(uuid::Uuid),

    /// Project has no failure record to retry
    #[error("Project '{project_id}' has no recorded failures")]
    NoFailureRecorded { project_id: String },

    /// Cycle queue is full or shut down; the guard was released
    #[error("Remediation queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Intake payload could not be normalized
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Collaborator answered with a non-success HTTP status
    #[error("{service} returned HTTP {status}: {body}")]
    Http {
        service: String,
        status: u16,
        body: String,
    },

    /// Transport-level failure talking to a collaborator
    #[error("{service} {kind} error: {message}")]
    Network {
        service: String,
        kind: NetworkErrorKind,
        message: String,
    },

    /// Collaborator explicitly reported it is overloaded
    #[error("{service} is overloaded")]
    Overloaded { service: String },

    /// Collaborator returned something unusable (bad payload, refused request)
    #[error("{service} error: {message}")]
    Collaborator { service: String, message: String },

    /// Configuration is unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence failure
    #[error("Store error: {0}")]
    Store(String),

    /// A lifecycle invariant would have been broken
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Cycle was cancelled at a suspension point
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, HealerError>;

impl HealerError {
    /// Build a collaborator error.
    pub fn collaborator(service: &str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            service: service.to_string(),
            message: message.into(),
        }
    }

    /// Classify a `reqwest` error for the given collaborator.
    pub fn from_reqwest(service: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Http {
                service: service.to_string(),
                status: status.as_u16(),
                body: String::new(),
            };
        }

        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            if is_dns_failure(err) {
                NetworkErrorKind::Dns
            } else {
                NetworkErrorKind::Connection
            }
        } else if err.is_request() {
            NetworkErrorKind::Connection
        } else {
            NetworkErrorKind::Other
        };

        Self::Network {
            service: service.to_string(),
            kind,
            message: err.to_string(),
        }
    }

    /// Whether the backoff controller may retry this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => RETRYABLE_STATUSES.contains(status),
            Self::Network { kind, .. } => !matches!(kind, NetworkErrorKind::Other),
            Self::Overloaded { .. } => true,
            _ => false,
        }
    }

    /// Stable category name for logs and API responses.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Http { .. } | Self::Network { .. } | Self::Overloaded { .. } => {
                if self.is_retryable() {
                    "transient_external"
                } else {
                    "external"
                }
            }
            Self::Collaborator { .. } => "external",
            Self::Disabled => "disabled",
            Self::AlreadyFixing { .. } => "concurrency_conflict",
            Self::ProjectNotFound(_)
            | Self::FailureNotFound(_)
            | Self::NoFailureRecorded { .. } => "not_found",
            Self::QueueUnavailable(_) => "unavailable",
            Self::InvalidEvent(_) => "invalid_event",
            Self::Config(_) => "config",
            Self::Store(_) | Self::Io(_) | Self::Json(_) => "store",
            Self::InvariantViolation(_) => "invariant",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<reqwest::Error> for HealerError {
    fn from(err: reqwest::Error) -> Self {
        Self::from_reqwest("http", &err)
    }
}

/// `reqwest` does not expose resolver failures directly; walk the source chain.
fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string().to_lowercase();
        if text.contains("dns") || text.contains("failed to lookup address") {
            return true;
        }
        source = inner.source();
    }
    false
}
