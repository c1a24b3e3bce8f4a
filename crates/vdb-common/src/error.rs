//! Error types for the VerticaDB operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the database, pod or operation it relates to so a failed
//! reconcile pass can be traced back to the administrative call that broke it.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a VerticaDB spec
    #[error("validation error for {db}: {message}")]
    Validation {
        /// Name of the VerticaDB with invalid configuration
        db: String,
        /// Description of what's invalid
        message: String,
    },

    /// An administrative command returned a failure
    #[error("admin operation {operation} failed: {message}")]
    Admin {
        /// Operation that was dispatched (e.g. "add_node")
        operation: String,
        /// Output or reason reported by the admin tool
        message: String,
    },

    /// Adding nodes would exceed the node limit of the installed license
    #[error("license limit reached: {message}")]
    LicenseLimit {
        /// Message reported by the admin tool
        message: String,
    },

    /// License validation rejected the configured secret
    #[error("license validation failed for {db}: {message}")]
    License {
        /// Name of the VerticaDB
        db: String,
        /// Summary of why no license was accepted
        message: String,
    },

    /// A TLS cert rotation failed part way through
    #[error("tls cert rotation for {config} failed: {message}")]
    CertRotation {
        /// TLS config being rotated (httpsNMA, clientServer)
        config: String,
        /// Message reported by the admin tool
        message: String,
        /// Whether the failure happened after the new cert passed health polling
        after_health_polling: bool,
    },

    /// Running a command inside a pod failed
    #[error("exec in pod {pod} failed: {message}")]
    Exec {
        /// Pod the command ran in
        pod: String,
        /// Stderr or transport error
        message: String,
    },

    /// Gathering facts about a pod failed
    #[error("fact collection for {pod} failed: {message}")]
    FactCollection {
        /// Pod being inspected
        pod: String,
        /// Description of what failed
        message: String,
    },

    /// An optimistic update kept conflicting until retries ran out
    #[error("update of {resource} still conflicting after {attempts} attempts")]
    Conflict {
        /// Resource being updated
        resource: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where it failed
        context: String,
    },
}

impl Error {
    /// Create a validation error with no database context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            db: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific VerticaDB
    pub fn validation_for(db: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            db: db.into(),
            message: msg.into(),
        }
    }

    /// Create an admin operation failure
    pub fn admin(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Admin {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a license limit failure
    pub fn license_limit(msg: impl Into<String>) -> Self {
        Self::LicenseLimit {
            message: msg.into(),
        }
    }

    /// Create a license validation failure
    pub fn license(db: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::License {
            db: db.into(),
            message: msg.into(),
        }
    }

    /// Create a cert rotation failure
    pub fn cert_rotation(
        config: impl Into<String>,
        msg: impl Into<String>,
        after_health_polling: bool,
    ) -> Self {
        Self::CertRotation {
            config: config.into(),
            message: msg.into(),
            after_health_polling,
        }
    }

    /// Create a pod exec failure
    pub fn exec(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Exec {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create a fact collection failure
    pub fn fact_collection(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::FactCollection {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict-exhausted error
    pub fn conflict(resource: impl Into<String>, attempts: u32) -> Self {
        Self::Conflict {
            resource: resource.into(),
            attempts,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error
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

    /// True when the API server rejected a write because the object changed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True when the API server reported the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Conflicts are retried by the status store; other 4xx are not transient
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Validation { .. } => false,
            Error::Admin { .. } => true,
            Error::LicenseLimit { .. } => false,
            Error::License { .. } => false,
            Error::CertRotation { .. } => false,
            Error::Exec { .. } => true,
            Error::FactCollection { .. } => true,
            Error::Conflict { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// The database name this error relates to, if known
    pub fn db(&self) -> Option<&str> {
        match self {
            Error::Validation { db, .. } | Error::License { db, .. } => Some(db),
            _ => None,
        }
    }
}
