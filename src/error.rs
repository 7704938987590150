//! Error types for the Kestrel provisioning engine.
//!
//! Each stage of an apply cycle has its own error enum: configuration,
//! descriptor validation, graph construction, planning, provider calls,
//! state persistence, and execution. [`KestrelError`] wraps them all.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Kestrel provisioning engine.
#[derive(Debug, Error)]
pub enum KestrelError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Descriptor validation errors.
    #[error("{0}")]
    Model(#[from] ModelError),

    /// Dependency graph errors.
    #[error("Dependency graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// A required configuration key is absent.
    #[error("Missing required configuration key: {key}")]
    MissingConfig {
        /// Dotted path of the missing key.
        key: String,
    },

    /// A configuration value is present but unusable.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// Dotted path of the offending key.
        key: String,
        /// Why the value was rejected.
        message: String,
    },
}

/// A single invalid or missing descriptor field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Resource the problem belongs to.
    pub resource: String,
    /// Field path within the resource (e.g. `attributes.address_prefix`).
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}: {}", self.resource, self.field, self.message)
    }
}

/// Descriptor model errors.
#[derive(Debug, Error)]
pub enum ModelError {
    /// One or more descriptors failed validation. Every problem found is listed.
    #[error("Validation failed with {} error(s): {}", errors.len(), join_errors(errors))]
    Validation {
        /// All field errors found in a single pass.
        errors: Vec<FieldError>,
    },
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The reference graph contains a cycle.
    #[error("Reference cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Full cycle path; the first name is repeated at the end.
        path: Vec<String>,
    },

    /// A descriptor references a name that is not part of the desired set.
    #[error("Resource '{from}' references unknown resource '{to}'")]
    UnknownReference {
        /// The referencing resource.
        from: String,
        /// The missing target.
        to: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan would leave a dangling reference or an impossible change.
    #[error("Plan conflict on '{resource}': {message}")]
    Conflict {
        /// Resource at the centre of the conflict.
        resource: String,
        /// Description of the conflict.
        message: String,
    },
}

/// Provider API errors, classified as transient or permanent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limited by the provider.
    #[error("Rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds the provider asked us to wait.
        retry_after_secs: u64,
    },

    /// Transport-level failure.
    #[error("Network error: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The call did not complete in time.
    #[error("Operation timed out after {secs} seconds")]
    Timeout {
        /// Timeout that elapsed.
        secs: u64,
    },

    /// Provider-side failure (5xx).
    #[error("Provider server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// The resource does not exist.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Provider identifier that was looked up.
        id: String,
    },

    /// The provider refused the request (bad input, quota, auth).
    #[error("Request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// The provider returned something we could not understand.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State file could not be read or written.
    #[error("State file IO failed: {message}")]
    Io {
        /// Description of the IO failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The lock this process held was released or taken over elsewhere.
    #[error("State lock {lock_id} is no longer held by this process")]
    LockLost {
        /// Identifier of the lock that was lost.
        lock_id: String,
    },

    /// No applied record exists under the given name.
    #[error("Resource '{name}' is not in the state")]
    ResourceNotFound {
        /// Name that was looked up.
        name: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// The state file was written by a schema this build cannot read.
    #[error("Unsupported state version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version found in the file.
        found: u32,
        /// Versions this build can read.
        supported: String,
    },
}

/// Execution errors that abort a whole apply cycle.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The cycle was aborted before completing.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for Kestrel operations.
pub type Result<T> = std::result::Result<T, KestrelError>;

impl KestrelError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl ConfigError {
    /// Creates a missing-key error.
    #[must_use]
    pub fn missing(key: impl Into<String>) -> Self {
        Self::MissingConfig { key: key.into() }
    }

    /// Creates an invalid-value error.
    #[must_use]
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Returns true if the failure is likely to succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Network { .. } | Self::Timeout { .. } | Self::Server { .. }
        )
    }

    /// Returns the delay the provider asked for, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an IO error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(ProviderError::network("reset").is_transient());
        assert!(ProviderError::Timeout { secs: 5 }.is_transient());
        assert!(ProviderError::Server { status: 503, message: String::new() }.is_transient());
        assert!(!ProviderError::rejected(400, "bad sku").is_transient());
        assert!(!ProviderError::NotFound { id: String::from("x") }.is_transient());
    }

    #[test]
    fn test_cycle_message_names_full_path() {
        let err = GraphError::Cycle {
            path: vec![String::from("a"), String::from("b"), String::from("a")],
        };
        assert_eq!(err.to_string(), "Reference cycle detected: a -> b -> a");
    }

    #[test]
    fn test_validation_lists_every_error() {
        let err = ModelError::Validation {
            errors: vec![
                FieldError {
                    resource: String::from("sub1"),
                    field: String::from("attributes.address_prefix"),
                    message: String::from("is required"),
                },
                FieldError {
                    resource: String::from("sub1"),
                    field: String::from("references"),
                    message: String::from("must reference a vnet"),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 error(s)"));
        assert!(text.contains("address_prefix"));
        assert!(text.contains("must reference a vnet"));
    }
}
