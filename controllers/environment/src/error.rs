//! Controller-specific error types.

use thiserror::Error;

/// Errors that can occur in the environment controller.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration file could not be loaded
    #[error(transparent)]
    Spec(#[from] envspec::SpecError),

    /// Invalid operator configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Namespace backing the environment does not exist
    #[error("Namespace {0} not found")]
    NamespaceNotFound(String),

    /// Actual state could not be reloaded; no deletions may proceed
    #[error("Cleanup pass aborted: {0}")]
    CleanupAborted(String),

    /// Orphaned service carries the delete-protection marker
    #[error("Refusing to delete protected service(s): {0}")]
    DeleteProtected(String),

    /// Manifest could not be built from the service description
    #[error("Cannot build manifest for service {service}: {reason}")]
    Manifest {
        /// Service the manifest belongs to
        service: String,
        /// Why construction failed
        reason: String,
    },
}
