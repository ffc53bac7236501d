//! Error types for the volume binder
//!
//! Provides the error taxonomy shared by the object store adapters, the
//! reconcilers, and the control loop. Reconcilers never propagate errors out
//! of the loop; every error path returns early and the next watch event or
//! resync tick delivers another attempt.

use thiserror::Error;

/// Unified error type for the binder
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Object Store Errors
    // =========================================================================
    /// An optimistic write lost the race; re-read and retry.
    #[error("write conflict on {kind}/{name}")]
    Conflict { kind: String, name: String },

    /// The object disappeared; an observation, not a failure.
    #[error("{kind}/{name} not found")]
    NotFound { kind: String, name: String },

    /// A create collided with an existing object of the same name.
    #[error("{kind}/{name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Network-ish trouble talking to the store; retry.
    #[error("transient store error: {0}")]
    Transient(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// No plugin configured for an operation the object requires.
    #[error("configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Conflicts are routine under concurrent controllers; the caller
    /// re-reads fresh state on the next pass.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Whether another reconciliation pass can make progress on this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Configuration(_))
    }

    /// Transient errors are store hiccups rather than state observations.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Kube(_))
    }
}

/// Result type alias for the binder
pub type Result<T> = std::result::Result<T, Error>;
