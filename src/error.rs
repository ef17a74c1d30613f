//! Error types shared by the scheduler, population store and diversity layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::{ConfigError, TaskStatus};

/// Kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Candidate,
    Task,
    Evaluator,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Candidate => write!(f, "Candidate"),
            EntityKind::Task => write!(f, "Task"),
            EntityKind::Evaluator => write!(f, "Evaluator"),
        }
    }
}

/// Errors returned by core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },
    #[error("Cannot {operation} an empty population")]
    EmptyCollection { operation: &'static str },
    #[error("Unknown {kind} strategy: {name}")]
    UnknownStrategy { kind: &'static str, name: String },
    #[error("Task {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
    #[error("Failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub(crate) fn candidate_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: EntityKind::Candidate,
            id: id.into(),
        }
    }

    pub(crate) fn task_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: EntityKind::Task,
            id: id.into(),
        }
    }

    /// Whether this is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single evaluation. Attached to one task, never fatal to the
/// scheduler.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum EvaluationError {
    #[error("Evaluator failed: {0}")]
    Failed(String),
    #[error("Evaluation timed out after {elapsed_ms} ms (limit {limit_ms} ms)")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },
    #[error("Candidate {0} is no longer in the population")]
    CandidateMissing(String),
    #[error("Evaluator returned a non-finite fitness")]
    NonFinite,
}

impl EvaluationError {
    /// Whether the failure is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EvaluationError::Timeout { .. })
    }
}

/// Failure reported by an embedding or trace collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    #[error("Provider returned malformed output: {0}")]
    Malformed(String),
}

/// Failure to produce one prompt variant.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum MutationError {
    #[error("Variant generation failed: {0}")]
    Failed(String),
    #[error("Generated variant is empty")]
    EmptyVariant,
}
