//! Kubernetes Event recording for the VerticaDB operator.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that reconcile steps can bracket every administrative operation with
//! events visible via `kubectl describe vdb`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "AddNodeStart")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Scale convergence
    /// Writing the install indicator to new pods has started
    pub const INSTALL_START: &str = "InstallStart";
    /// The install indicator was written to new pods
    pub const INSTALL_SUCCEEDED: &str = "InstallSucceeded";
    /// Writing the install indicator failed
    pub const INSTALL_FAILED: &str = "InstallFailed";
    /// Adding nodes to the database has started
    pub const ADD_NODE_START: &str = "AddNodeStart";
    /// Nodes were added to the database
    pub const ADD_NODE_SUCCEEDED: &str = "AddNodeSucceeded";
    /// Adding nodes failed because of the license node limit
    pub const ADD_NODE_LICENSE_FAIL: &str = "AddNodeLicenseFail";
    /// Adding nodes failed
    pub const ADD_NODE_FAILED: &str = "AddNodeFailed";
    /// Shard rebalance started after nodes were added
    pub const REBALANCE_SHARDS_START: &str = "RebalanceShardsStart";
    /// Shard rebalance finished
    pub const REBALANCE_SHARDS_SUCCEEDED: &str = "RebalanceShardsSucceeded";
    /// Removing nodes from the database has started
    pub const REMOVE_NODES_START: &str = "RemoveNodesStart";
    /// Nodes were removed from the database
    pub const REMOVE_NODES_SUCCEEDED: &str = "RemoveNodesSucceeded";
    /// Removing nodes failed
    pub const REMOVE_NODES_FAILED: &str = "RemoveNodesFailed";
    /// A statefulset was resized to match the subcluster size
    pub const SUBCLUSTER_SCALED: &str = "SubclusterScaled";

    // Sandboxes
    /// Moving a subcluster into a sandbox has started
    pub const SANDBOX_SUBCLUSTER_START: &str = "SandboxSubclusterStart";
    /// A subcluster was moved into a sandbox
    pub const SANDBOX_SUBCLUSTER_SUCCEEDED: &str = "SandboxSubclusterSucceeded";
    /// Moving a subcluster into a sandbox failed
    pub const SANDBOX_SUBCLUSTER_FAILED: &str = "SandboxSubclusterFailed";

    // Password
    /// The superuser password was changed
    pub const SUPERUSER_PASSWORD_UPDATE_SUCCEEDED: &str = "SuperuserPasswordSecretUpdateSucceeded";
    /// Changing the superuser password failed
    pub const SUPERUSER_PASSWORD_UPDATE_FAILED: &str = "SuperuserPasswordSecretUpdateFailed";

    // License
    /// At least one license key was accepted
    pub const LICENSE_VALIDATION_SUCCEEDED: &str = "LicenseValidationSucceeded";
    /// No license key was accepted
    pub const LICENSE_VALIDATION_FAIL: &str = "LicenseValidationFail";

    // TLS
    /// HTTPS cert rotation started
    pub const HTTPS_CERT_ROTATION_STARTED: &str = "HTTPSCertRotationStarted";
    /// HTTPS cert rotation finished
    pub const HTTPS_CERT_ROTATION_SUCCEEDED: &str = "HTTPSCertRotationSucceeded";
    /// HTTPS cert rotation failed
    pub const HTTPS_CERT_ROTATION_FAILED: &str = "HTTPSCertRotationFailed";
    /// Client-server TLS update started
    pub const CLIENT_SERVER_TLS_UPDATE_STARTED: &str = "ClientServerTLSUpdateStarted";
    /// Client-server TLS update finished
    pub const CLIENT_SERVER_TLS_UPDATE_SUCCEEDED: &str = "ClientServerTLSUpdateSucceeded";
    /// Client-server TLS update failed
    pub const CLIENT_SERVER_TLS_UPDATE_FAILED: &str = "ClientServerTLSUpdateFailed";
    /// Rollback after a failed cert rotation started
    pub const TLS_CERT_ROLLBACK_STARTED: &str = "TLSCertRollbackStarted";
    /// Rollback after a failed cert rotation finished
    pub const TLS_CERT_ROLLBACK_SUCCEEDED: &str = "TLSCertRollbackSucceeded";

    // Restart
    /// No node was up, so the database is being started
    pub const RESTART_STARTED: &str = "RestartStarted";
    /// Database start finished
    pub const RESTART_SUCCEEDED: &str = "RestartSucceeded";
    /// Database start failed
    pub const RESTART_FAILED: &str = "RestartFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Preparing pods to join the database
    pub const INSTALL: &str = "Install";
    /// Adding or removing nodes
    pub const SCALE: &str = "Scale";
    /// Moving subclusters between the main cluster and sandboxes
    pub const SANDBOX: &str = "Sandbox";
    /// Rotating credentials or certs
    pub const ROTATE: &str = "Rotate";
    /// Validating licenses
    pub const VALIDATE: &str = "Validate";
    /// Restarting the database
    pub const RESTART: &str = "Restart";
}
