//! Common types for the VerticaDB operator: CRDs, errors, events and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write the operator makes
pub const FIELD_MANAGER: &str = "vdb-operator";

/// Label carrying the owning VerticaDB name on every object the operator creates
pub const DATABASE_LABEL: &str = "vertica.com/database";

/// Label carrying the subcluster name on statefulsets and pods
pub const SUBCLUSTER_LABEL: &str = "vertica.com/subcluster-name";

/// Label carrying the sandbox name on statefulsets of sandboxed subclusters
pub const SANDBOX_LABEL: &str = "vertica.com/sandbox";

/// Label selecting sandbox config maps for the sandbox controller
pub const SANDBOX_CONFIGMAP_LABEL: &str = "vertica.com/watched-by-sandbox-controller";

/// Name of the container that runs the database server
pub const SERVER_CONTAINER: &str = "server";

/// Annotation that disables automatic rollback after a failed cert rotation
pub const DISABLE_TLS_ROLLBACK_ANNOTATION: &str =
    "vertica.com/disable-tls-rollback-after-cert-rotation";
