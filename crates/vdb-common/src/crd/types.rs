//! Shared types used across CRD definitions

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., DBInitialized, TLSConfigUpdateInProgress)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Shorthand for a condition with status True and no message
    pub fn truthy(type_: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::True, reason, "")
    }

    /// Shorthand for a condition with status False and no message
    pub fn falsy(type_: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::False, reason, "")
    }

    /// Whether the condition is currently True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Well-known condition types on a VerticaDB
pub mod conditions {
    /// The database has been created or revived
    pub const DB_INITIALIZED: &str = "DBInitialized";
    /// A TLS config change is being applied
    pub const TLS_CONFIG_UPDATE_IN_PROGRESS: &str = "TLSConfigUpdateInProgress";
    /// A cert rotation failed and the previous cert must be restored
    pub const TLS_CERT_ROLLBACK_NEEDED: &str = "TLSCertRollbackNeeded";
    /// The rollback after a failed cert rotation is being applied
    pub const TLS_CERT_ROLLBACK_IN_PROGRESS: &str = "TLSCertRollbackInProgress";
    /// The license secret holds at least one accepted license
    pub const LICENSE_VALID: &str = "LicenseValid";
}

/// Reasons recorded on `TLSCertRollbackNeeded`.
///
/// The reason is the only record of where a rotation failed, so the rollback
/// step reads it back to decide which sub-actions apply.
pub mod rollback_reasons {
    /// HTTPS rotation failed before the new cert was confirmed healthy
    pub const AFTER_HTTPS_CERT_ROTATION: &str = "RollbackAfterHTTPSCertRotation";
    /// HTTPS rotation failed after the new cert passed health polling
    pub const AFTER_HTTPS_CERT_HEALTH_POLLING: &str = "RollbackAfterHTTPSCertHealthPolling";
    /// Client-server rotation failed
    pub const AFTER_SERVER_CERT_ROTATION: &str = "RollbackAfterServerCertRotation";
}

/// Tri-state observation about a pod.
///
/// `Unknown` is distinct from `False`: it means the fact could not be
/// determined (pod not running, probe failed) and drives requeue behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TriState {
    /// Known to be true
    True,
    /// Known to be false
    False,
    /// Not determinable right now
    #[default]
    Unknown,
}

impl TriState {
    /// True only when the fact is known to be true
    pub fn is_true(self) -> bool {
        self == TriState::True
    }

    /// True only when the fact is known to be false
    pub fn is_false(self) -> bool {
        self == TriState::False
    }

    /// True when the fact could not be determined
    pub fn is_unknown(self) -> bool {
        self == TriState::Unknown
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        value.map(TriState::from).unwrap_or(TriState::Unknown)
    }
}

impl std::fmt::Display for TriState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
