//! Error types for the lbstack controller
//!
//! Errors carry the stack, resource, or object they concern so that a failed
//! reconcile can be traced back to the infrastructure it was touching. The
//! taxonomy drives two decisions: whether a converge step retries in place
//! (`is_retryable`) and whether the object is requeued or parked until it
//! changes (`is_validation`).

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for lbstack operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The desired-state object is internally inconsistent or references
    /// inputs that do not exist. Rebuilding without an object change
    /// reproduces the same error.
    #[error("validation error for {object}: {message}")]
    Validation {
        /// namespace/name of the offending object
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.ports[1]")
        field: Option<String>,
    },

    /// Infrastructure API failure
    #[error("cloud error during {operation} of {resource}: {message}")]
    Cloud {
        /// API operation that failed (list, create, update, delete, ...)
        operation: String,
        /// Logical or cloud identifier of the resource involved
        resource: String,
        /// Description of what failed
        message: String,
        /// Whether the failure is transient
        retryable: bool,
    },

    /// A dependency was never realized in this deploy cycle
    #[error("unresolved reference to {reference}")]
    UnresolvedReference {
        /// The reference that could not be resolved
        reference: String,
    },

    /// A live resource is still referenced by a surviving dependent
    #[error("refusing to delete {resource}: still referenced by {dependent}")]
    DependencyInUse {
        /// The resource whose deletion was deferred
        resource: String,
        /// The live resource that still points at it
        dependent: String,
    },

    /// One or more converge operations of a deploy failed
    #[error("deploy of {stack} failed with {} error(s): {}", .failures.len(), summarize(.failures))]
    Deploy {
        /// The stack ID being deployed
        stack: String,
        /// Every failure collected during the deploy
        failures: Vec<Error>,
    },

    /// The reconcile attempt exceeded its deadline
    #[error("reconcile attempt timed out after {seconds}s")]
    Timeout {
        /// Deadline that was exceeded
        seconds: u64,
    },

    /// The reconcile attempt was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "runner")
        context: String,
    },
}

fn summarize(failures: &[Error]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a transient cloud error
    pub fn cloud(
        operation: impl Into<String>,
        resource: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Cloud {
            operation: operation.into(),
            resource: resource.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a terminal cloud error (permissions, conflicts that cannot self-resolve)
    pub fn cloud_permanent(
        operation: impl Into<String>,
        resource: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Cloud {
            operation: operation.into(),
            resource: resource.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an unresolved reference error
    pub fn unresolved(reference: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            reference: reference.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
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

    /// Check if this error is retryable in place
    ///
    /// Validation and serialization errors require an input change. Reference
    /// resolution failures are terminal for the current attempt. Cloud errors
    /// carry their own classification. A deploy aggregate is retryable only
    /// when every collected failure is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, not found, conflict)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Cloud { retryable, .. } => *retryable,
            Error::UnresolvedReference { .. } => false,
            Error::DependencyInUse { .. } => true,
            Error::Deploy { failures, .. } => failures.iter().all(Error::is_retryable),
            Error::Timeout { .. } => true,
            Error::Cancelled => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error can only be fixed by changing the input object
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Get the object key if this error is associated with a specific object
    pub fn object(&self) -> Option<&str> {
        match self {
            Error::Validation { object, .. } => Some(object),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Deploy { stack, .. } => Some(stack),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
