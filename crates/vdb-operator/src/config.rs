//! Operator-wide settings shared by every reconcile pass

use std::time::Duration;

use vdb_common::FIELD_MANAGER;

/// Default interval between license revalidations
pub const DEFAULT_LICENSE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default delay used for `RequeueNow`
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Delay used by the error policy
pub const DEFAULT_ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Settings carried in the controller context
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// How long a license validation stays fresh
    pub license_check_interval: Duration,
    /// Delay used when a step asks to requeue right away
    pub requeue_delay: Duration,
    /// Delay used after a failed pass
    pub error_requeue_delay: Duration,
    /// Field manager recorded on writes
    pub field_manager: String,
    /// True when the operator only watches its own namespace
    pub namespace_scoped: bool,
    /// Name reported on events
    pub controller_name: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            license_check_interval: DEFAULT_LICENSE_CHECK_INTERVAL,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            error_requeue_delay: DEFAULT_ERROR_REQUEUE_DELAY,
            field_manager: FIELD_MANAGER.to_string(),
            namespace_scoped: false,
            controller_name: "verticadb-operator".to_string(),
        }
    }
}
