//! Error taxonomy for the query pipeline and the feedback store.
//!
//! Application glue (config loading, server start-up) stays on `anyhow`; everything that the
//! orchestrator has to branch on is typed here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Class of an execution failure, derived from the backend's error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Syntax,
    ObjectNotFound,
    Permission,
    Timeout,
    Unknown,
}

impl ExecutionErrorKind {
    /// Classify a backend error message by substring.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("syntax") || lower.contains("parse") {
            Self::Syntax
        } else if lower.contains("not found")
            || lower.contains("does not exist")
            || lower.contains("no such")
        {
            Self::ObjectNotFound
        } else if lower.contains("permission")
            || lower.contains("access")
            || lower.contains("readonly")
            || lower.contains("not authorized")
        {
            Self::Permission
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("interrupted")
        {
            Self::Timeout
        } else {
            Self::Unknown
        }
    }

    /// Executability reward assigned to a failure of this class.
    pub fn penalty(&self) -> f64 {
        match self {
            Self::Syntax => -0.8,
            Self::ObjectNotFound => -0.6,
            Self::Permission => -0.3,
            Self::Timeout => -0.2,
            Self::Unknown => -0.5,
        }
    }

    /// Whether regenerating the query can plausibly fix the failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permission)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ExecutionErrorKind::classify(&message),
            message,
        }
    }

    pub fn timeout(seconds: u64) -> Self {
        Self {
            kind: ExecutionErrorKind::Timeout,
            message: format!("Query timed out after {} seconds", seconds),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("generation failed: {0}")]
pub struct GenerationError(pub String);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

/// Failure of one pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    /// Type name recorded on failed responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Execution(_) => "ExecutionError",
            Self::Generation(_) => "GenerationError",
            Self::Store(_) => "StoreError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Whether the repair loop may continue after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => e.kind.is_retryable(),
            Self::Generation(_) => true,
            Self::Validation(_) | Self::Store(_) | Self::Internal(_) => false,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Errors of the operations exposed to the transport.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
