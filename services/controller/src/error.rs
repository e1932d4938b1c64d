//! Error types for the controller.

use thiserror::Error;

/// Errors returned by the cluster store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// An object with this name already exists.
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    /// Optimistic update lost against a concurrent writer.
    #[error("conflict updating {name}: expected version {expected}, found {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// The store could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Errors returned by workload control calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    /// The store rejected the call.
    #[error(transparent)]
    Api(#[from] StoreError),

    /// The call did not complete in time.
    #[error("{operation} {name} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        name: String,
        timeout_ms: u64,
    },

    /// The object is not controlled by the job it is being managed for.
    #[error("object {name} is not controlled by job {job}")]
    InvalidOwner { name: String, job: String },
}

/// One create or delete call that failed during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOperation {
    pub operation: &'static str,
    pub name: String,
    pub error: ControlError,
}

impl std::fmt::Display for FailedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.operation, self.name, self.error)
    }
}

/// Errors that fail a reconciliation pass and requeue its key.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Some create/delete calls failed; their expectations were compensated.
    #[error("{} workload operation(s) failed: {}", .0.len(), format_failures(.0))]
    Workload(Vec<FailedOperation>),

    #[error("failed to encode rendezvous document: {0}")]
    RendezvousEncoding(#[from] serde_json::Error),
}

fn format_failures(failures: &[FailedOperation]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type ControllerResult<T> = Result<T, ControllerError>;
