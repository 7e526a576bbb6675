//! Service-level error taxonomy.

use crate::environment::EnvironmentError;
use crate::id::SessionId;

/// Coarse fault classes every transport has to keep apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NotFound,
    Validation,
    Internal,
}

/// Error returned by session and ephemeral operations.
///
/// A user program that exits nonzero is not an error; it comes back as an
/// [`ExecutionOutput`](crate::environment::ExecutionOutput).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed request, rejected before any environment is touched.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// `open` failed. Nothing was registered.
    #[error("environment setup failed: {0}")]
    EnvironmentSetup(#[source] EnvironmentError),

    /// The environment broke while running code.
    #[error("execution failed: {0}")]
    Execution(#[source] EnvironmentError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> FaultKind {
        match self {
            ServiceError::Validation(_) => FaultKind::Validation,
            ServiceError::SessionNotFound(_) => FaultKind::NotFound,
            ServiceError::EnvironmentSetup(_)
            | ServiceError::Execution(_)
            | ServiceError::Internal(_) => FaultKind::Internal,
        }
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            ServiceError::Internal("environment task panicked".to_string())
        } else {
            ServiceError::Internal(e.to_string())
        }
    }
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
