//! Shared error model for the fleet controller.
//!
//! Every fallible boundary in the system — cloud calls, worker probes,
//! inbound requests — collapses into one of these variants so the HTTP
//! layer can map them to a status code without re-deriving the reason.

use thiserror::Error;

/// Disposition of a cloud provider call. Transient errors are retried on
/// the next reconciler tick; permanent errors require operator intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
#[error("cloud provider error ({kind:?}): {message}")]
pub struct CloudError {
    pub kind: CloudErrorKind,
    pub message: String,
}

impl CloudError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: CloudErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: CloudErrorKind::Permanent,
            message: message.into(),
        }
    }
}

/// Failure talking to a worker agent's `/status` or `/start-match`.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("timed out waiting for worker response")]
    Timeout,
    #[error("connection refused by worker")]
    ConnectionRefused,
    #[error("worker returned HTTP {0}")]
    HttpStatus(u16),
    #[error("malformed worker response: {0}")]
    Malformed(String),
    #[error("worker rejected start-match: {0}")]
    StartRejected(String),
}

/// Top-level error for the request handler / HTTP layer.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no VM available")]
    NoVmAvailable,

    #[error("match not found")]
    NotFound,

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn status_code(&self) -> u16 {
        match self {
            FleetError::InvalidRequest(_) => 400,
            FleetError::NoVmAvailable => 503,
            FleetError::NotFound => 404,
            FleetError::Worker(_) | FleetError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FleetError::InvalidRequest(_) => "InvalidRequest",
            FleetError::NoVmAvailable => "NoVmAvailable",
            FleetError::NotFound => "NotFound",
            FleetError::Worker(_) => "WorkerError",
            FleetError::Internal(_) => "Internal",
        }
    }
}
