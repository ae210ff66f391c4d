//! Error taxonomy for the dispatch core.
//!
//! Each concern owns its own enum. Job-level errors never escape the worker
//! pool; guardrail errors carry enough classification for the retry layer
//! to decide whether another attempt is worthwhile.

use thiserror::Error;

/// Failures of the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[cfg(feature = "database")]
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Errors returned synchronously by `QueueFabric::dispatch`.
///
/// These are configuration errors, not job errors: nothing is enqueued.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("invalid dispatch options: {0}")]
    InvalidOptions(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised while executing a job. Every variant consumes a retry slot.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown job type '{job_type}' for agent '{agent}'")]
    UnknownJobType { agent: String, job_type: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error(transparent)]
    Guardrail(#[from] GuardrailError),
}

impl JobError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Transient(_) => true,
            JobError::Guardrail(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Handler(format!("{err:#}"))
    }
}

/// Classification of a compute-provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimited,
    Server,
    Client,
    Network,
}

/// Errors surfaced by the guardrail executor around a costed call.
#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error(
        "monthly budget exhausted for period {period}: spent ${spent:.2} of ${limit:.2} (agent '{agent}' is not critical)"
    )]
    BudgetExceeded {
        agent: String,
        period: String,
        spent: f64,
        limit: f64,
    },
    #[error("provider error ({kind:?}, status {status:?}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        status: Option<u16>,
        message: String,
    },
    #[error("spend ledger unavailable: {0}")]
    Store(#[from] StoreError),
}

impl GuardrailError {
    pub fn provider(kind: ProviderErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        GuardrailError::Provider {
            kind,
            status,
            message: message.into(),
        }
    }

    /// Classify an HTTP status code the way the provider retry policy expects.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => ProviderErrorKind::RateLimited,
            500..=599 => ProviderErrorKind::Server,
            _ => ProviderErrorKind::Client,
        };
        Self::provider(kind, Some(status), message)
    }

    /// Only rate limiting and server-side failures are retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GuardrailError::Provider {
                kind: ProviderErrorKind::RateLimited | ProviderErrorKind::Server,
                ..
            }
        )
    }

    pub fn is_budget(&self) -> bool {
        matches!(self, GuardrailError::BudgetExceeded { .. })
    }
}

/// Construction-time errors of the handler registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler registered for undeclared agent '{0}'")]
    UndeclaredAgent(String),
    #[error("agent '{0}' declared twice")]
    DuplicateAgent(String),
    #[error("duplicate handler for agent '{agent}' job type '{job_type}'")]
    DuplicateHandler { agent: String, job_type: String },
    #[error("agent '{agent}' declares job type '{job_type}' without a handler")]
    MissingHandler { agent: String, job_type: String },
    #[error("agent '{0}' has zero concurrency")]
    ZeroConcurrency(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(GuardrailError::from_status(429, "slow down").is_transient());
        assert!(GuardrailError::from_status(503, "unavailable").is_transient());
        assert!(!GuardrailError::from_status(400, "bad request").is_transient());
        assert!(!GuardrailError::provider(ProviderErrorKind::Network, None, "reset").is_transient());
    }

    #[test]
    fn budget_errors_are_never_transient() {
        let err = GuardrailError::BudgetExceeded {
            agent: "seo_demand_capture".into(),
            period: "2026-10".into(),
            spent: 500.0,
            limit: 500.0,
        };
        assert!(err.is_budget());
        assert!(!err.is_transient());
        assert!(!JobError::Guardrail(err).is_transient());
    }

    #[test]
    fn unknown_job_type_message() {
        let err = JobError::UnknownJobType {
            agent: "inbound_conversion".into(),
            job_type: "unregistered_type".into(),
        };
        assert!(err.to_string().contains("unknown job type"));
    }
}
