//! Error types for the Portage node agent
//!
//! Errors are structured with fields to aid debugging in production. Version
//! conflicts from optimistic-concurrency writes are a first-class condition
//! here, never a plain failure: accept paths read them as "another node won"
//! and update paths retry.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Portage operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Terminal failure reported by an exposer
    #[error("expose error for {name}: {message}")]
    Expose {
        /// Name of the record being exposed
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Data-path session failure
    #[error("data path error for {name}: {message}")]
    DataPath {
        /// Name of the record whose session failed
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Credential materialization failure
    #[error("credential error: {message}")]
    Credential {
        /// Description of what failed
        message: String,
    },

    /// A bounded retry loop ran out of time
    #[error("deadline exceeded while {operation}")]
    DeadlineExceeded {
        /// The operation that was being retried
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "sweeper")
        context: String,
    },
}

impl Error {
    /// Create an expose error for the given record
    pub fn expose(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Expose {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a data-path error for the given record
    pub fn data_path(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DataPath {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a credential error with the given message
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential {
            message: msg.into(),
        }
    }

    /// Create a deadline-exceeded error for the given operation
    pub fn deadline(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error is a version conflict from an optimistic write.
    ///
    /// Conflicts are expected under concurrency and never surfaced as
    /// failures; the caller either backs off (lost an accept race) or
    /// re-reads and retries (update paths).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409
        )
    }

    /// Whether this error is a 404 on the primary record
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// Check if this error is retryable
    ///
    /// Expose errors are terminal for the record (the record flips to
    /// Failed). Kubernetes errors other than 4xx are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Expose { .. } => false,
            Error::DataPath { .. } => true,
            Error::Credential { .. } => true,
            Error::DeadlineExceeded { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}
