//! Structured error types for the process engine.
//!
//! # The Containment Rule
//!
//! > **No `ProcessError` ever crosses the action boundary.**
//!
//! Every failure while resolving parameters or running a method is logged
//! and turned into "this action produced nothing". The state machine keeps
//! advancing; a batch is never aborted by one bad action.
//!
//! [`ErrorCategory`] decides how loudly a contained failure is reported:
//!
//! | Category | Cause | Level |
//! |---|---|---|
//! | `Configuration` | unregistered method, missing params | `warn` |
//! | `Resolution` | unresolvable reference, missing target | `error` |
//! | `Transform` | a transform function failed | `warn` |
//! | `Store` | the document store failed | `error` |
//! | `Internal` | a method panicked, undecodable document | `error` |

use std::fmt;

use thiserror::Error;

// =============================================================================
// Error Category
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Resolution,
    Transform,
    Store,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration_error"),
            ErrorCategory::Resolution => write!(f, "resolution_error"),
            ErrorCategory::Transform => write!(f, "transform_error"),
            ErrorCategory::Store => write!(f, "store_error"),
            ErrorCategory::Internal => write!(f, "internal_error"),
        }
    }
}

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the document store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage backend failed (timeout, connection, ...).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),

    /// A stored document did not match the model it was read as.
    #[error("failed to decode {class} document {id}: {source}")]
    Decode {
        class: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Process Error
// =============================================================================

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The step names a method no one registered.
    #[error("no method registered for {method_id}")]
    MethodNotRegistered { method_id: String },

    /// The method's required parameters were not all supplied.
    #[error("{method} is missing required params: {}", .missing.join(", "))]
    MissingParams {
        method: &'static str,
        missing: Vec<&'static str>,
    },

    /// A context reference produced no value and has no fallback.
    #[error("param '{param}' could not be resolved from '{key}' and has no fallback")]
    Unresolved { param: String, key: String },

    /// The execution's target document does not exist.
    #[error("target document {card} not found")]
    TargetNotFound { card: String },

    #[error("transform {function} failed: {reason}")]
    TransformFailed { function: String, reason: String },

    #[error("invalid {model} document: {source}")]
    InvalidDocument {
        model: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("method {method_id} panicked: {message}")]
    Panicked { method_id: String, message: String },
}

impl ProcessError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessError::MethodNotRegistered { .. } | ProcessError::MissingParams { .. } => {
                ErrorCategory::Configuration
            }
            ProcessError::Unresolved { .. } | ProcessError::TargetNotFound { .. } => {
                ErrorCategory::Resolution
            }
            ProcessError::TransformFailed { .. } => ErrorCategory::Transform,
            ProcessError::Store(_) => ErrorCategory::Store,
            ProcessError::InvalidDocument { .. } | ProcessError::Panicked { .. } => {
                ErrorCategory::Internal
            }
        }
    }

    pub(crate) fn missing(method: &'static str, missing: Vec<&'static str>) -> Self {
        ProcessError::MissingParams { method, missing }
    }
}

// =============================================================================
// Registry Error
// =============================================================================

/// Errors raised while wiring registries, never at dispatch time.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} already registered: {id}")]
    AlreadyRegistered { kind: &'static str, id: String },
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
