//! Custom Resource Definitions for the VerticaDB operator

mod types;
mod verticadb;

pub use types::{conditions, rollback_reasons, Condition, ConditionStatus, TriState};
pub use verticadb::{
    CommunalSpec, InitPolicy, LicenseInfo, LicenseStatus, PodSecurityIds, Sandbox, SandboxStatus,
    SandboxSubcluster, Subcluster, SubclusterPodStatus, SubclusterStatus, SubclusterType,
    TlsConfigName, TlsConfigSpec, TlsConfigStatus, VerticaDB, VerticaDBSpec, VerticaDBStatus,
    DEFAULT_DB_NAME, DEFAULT_SUPERUSER, DEFAULT_TLS_MODE,
};
