//! Error types for the AI queue.

use uuid::Uuid;

/// Top-level error type for the queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The row exists but is no longer in the state the writer expected.
    #[error("Conflict on {entity} {id}: expected {expected}, found {actual}")]
    Conflict {
        entity: String,
        id: String,
        expected: String,
        actual: String,
    },
}

/// Token bucket reservation errors.
///
/// A plain refusal (not enough units right now) is not an error; these
/// variants cover requests that can never be granted as stated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Requested {units} units exceeds bucket capacity {capacity}")]
    ExceedsCapacity { units: f64, capacity: f64 },

    #[error("Invalid unit cost: {units}")]
    InvalidCost { units: f64 },
}

/// Outcome of a failed handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Recoverable; the job is retried after the backoff delay.
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help; the job fails immediately.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Whether the dispatcher may retry the job.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Unknown job type: {job_type}")]
    UnknownType { job_type: String },
}

/// Result type alias for the queue.
pub type Result<T> = std::result::Result<T, Error>;
