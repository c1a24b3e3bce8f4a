//! VerticaDB CRD
//!
//! A VerticaDB describes one database: the subclusters that make it up, the
//! sandboxes carved out of it, and the secrets (superuser password, license,
//! TLS certs) the operator keeps in sync with the running cluster.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{conditions, Condition, ConditionStatus};

/// Default database name when the spec omits one
pub const DEFAULT_DB_NAME: &str = "vertdb";

/// Default superuser when the spec omits one
pub const DEFAULT_SUPERUSER: &str = "dbadmin";

/// Default TLS mode for a TLS config
pub const DEFAULT_TLS_MODE: &str = "try_verify";

/// Spec for a VerticaDB.
///
/// Example:
/// ```yaml
/// apiVersion: vertica.com/v1
/// kind: VerticaDB
/// metadata:
///   name: vertdb
/// spec:
///   image: vertica/vertica-k8s:24.4.0
///   communal:
///     path: s3://bucket/db
///   subclusters:
///     - name: sc1
///       size: 3
///   sandboxes:
///     - name: sandbox1
///       subclusters:
///         - name: sc2
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "vertica.com",
    version = "v1",
    kind = "VerticaDB",
    plural = "verticadbs",
    shortname = "vdb",
    namespaced,
    status = "VerticaDBStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBSpec {
    /// Server image used by every subcluster not in a sandbox
    pub image: String,

    /// Name of the database inside the cluster
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// How the database comes into existence
    #[serde(default)]
    pub init_policy: InitPolicy,

    /// Database superuser. Defaults to `dbadmin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superuser_name: Option<String>,

    /// Communal storage; present for Eon mode databases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communal: Option<CommunalSpec>,

    /// Subclusters in manifest order
    #[serde(default)]
    pub subclusters: Vec<Subcluster>,

    /// Sandboxes carved out of the main cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sandboxes: Vec<Sandbox>,

    /// Secret holding the superuser password. Unset means no password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<String>,

    /// Secret whose keys each hold one license
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_secret: Option<String>,

    /// TLS used by the HTTPS service and node management agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_nma_tls: Option<TlsConfigSpec>,

    /// TLS used for client connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_server_tls: Option<TlsConfigSpec>,

    /// Service account for the server pods. Generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// UID and fsGroup the server runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityIds>,

    /// Fixed requeue interval in seconds. Overrides the operator default when > 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_time: Option<u32>,
}

fn default_db_name() -> String {
    DEFAULT_DB_NAME.to_string()
}

/// How the database is initialized
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InitPolicy {
    /// Create a new database
    #[default]
    Create,
    /// Revive from existing communal storage
    Revive,
    /// Only create the pods, never the database
    ScheduleOnly,
}

/// Communal storage location for Eon mode
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommunalSpec {
    /// Path to the communal location (s3://, gs://, ...)
    pub path: String,
}

/// Role of a subcluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubclusterType {
    /// Primary subcluster of the main cluster
    #[default]
    Primary,
    /// Secondary subcluster of the main cluster
    Secondary,
    /// Primary subcluster of a sandbox
    SandboxPrimary,
    /// Secondary subcluster of a sandbox
    SandboxSecondary,
}

impl SubclusterType {
    /// Primaries vote in quorum
    pub fn is_primary(self) -> bool {
        matches!(self, Self::Primary | Self::SandboxPrimary)
    }
}

/// A group of pods backed by one statefulset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subcluster {
    /// Name, unique within the database
    pub name: String,

    /// Desired number of pods
    #[serde(default)]
    pub size: i32,

    /// Primary or secondary
    #[serde(default, rename = "type")]
    pub type_: SubclusterType,
}

impl Subcluster {
    /// Whether this subcluster is a primary
    pub fn is_primary(&self) -> bool {
        self.type_.is_primary()
    }
}

/// A set of subclusters split off into their own isolated cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    /// Sandbox name
    pub name: String,

    /// Image for the sandbox. Defaults to the main cluster image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Subclusters moved into this sandbox
    #[serde(default)]
    pub subclusters: Vec<SandboxSubcluster>,
}

/// Reference to a subcluster from a sandbox
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SandboxSubcluster {
    /// Name of a subcluster in `spec.subclusters`
    pub name: String,
}

/// Desired TLS setup for one TLS config
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfigSpec {
    /// Whether TLS is on for this config. Unset means on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Secret holding tls.crt, tls.key and ca.crt
    #[serde(default)]
    pub secret: String,

    /// TLS mode (disable, enable, try_verify, verify_ca, verify_full)
    #[serde(default = "default_tls_mode")]
    pub mode: String,

    /// Secrets the operator may rotate through on its own
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_rotate_secrets: Vec<String>,
}

fn default_tls_mode() -> String {
    DEFAULT_TLS_MODE.to_string()
}

impl TlsConfigSpec {
    /// TLS is on unless explicitly disabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Security identity for the server container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurityIds {
    /// Group owning mounted volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,

    /// UID of the server process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
}

/// Names of the TLS configs a VerticaDB carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TlsConfigName {
    /// HTTPS service and node management agent
    HttpsNma,
    /// Client connections
    ClientServer,
}

impl TlsConfigName {
    /// Name recorded in `status.tlsConfigs`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HttpsNma => "httpsNMA",
            Self::ClientServer => "clientServer",
        }
    }

    /// Name of the server-side TLS config the admin tool updates
    pub fn server_config(self) -> &'static str {
        match self {
            Self::HttpsNma => "https",
            Self::ClientServer => "server",
        }
    }
}

impl std::fmt::Display for TlsConfigName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of a VerticaDB
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerticaDBStatus {
    /// Conditions, at most one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-subcluster progress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subclusters: Vec<SubclusterStatus>,

    /// Sandboxes that exist in the database
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sandboxes: Vec<SandboxStatus>,

    /// Password secret currently applied to the main cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<String>,

    /// Outcome of the last license validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_status: Option<LicenseStatus>,

    /// TLS secret and mode currently applied, per TLS config
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls_configs: Vec<TlsConfigStatus>,
}

/// Progress of one subcluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterStatus {
    /// Subcluster name
    pub name: String,

    /// Pods with the install indicator
    #[serde(default)]
    pub install_count: i32,

    /// Pods that have a node in the database
    #[serde(default)]
    pub added_to_db_count: i32,

    /// Pods whose node is up
    #[serde(default)]
    pub up_node_count: i32,

    /// Per-pod detail indexed by pod ordinal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detail: Vec<SubclusterPodStatus>,
}

/// Per-pod entry of a subcluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterPodStatus {
    /// Install indicator present
    #[serde(default)]
    pub installed: bool,

    /// Node exists in the database
    #[serde(default)]
    pub added_to_db: bool,

    /// Node name inside the database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnode_name: Option<String>,
}

/// A sandbox that exists in the database
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    /// Sandbox name
    pub name: String,

    /// Subclusters already moved in
    #[serde(default)]
    pub subclusters: Vec<String>,

    /// Password secret currently applied inside the sandbox
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<String>,
}

/// Outcome of license validation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LicenseStatus {
    /// Secret that was validated
    pub license_secret: String,

    /// One entry per license key in the secret
    #[serde(default)]
    pub licenses: Vec<LicenseInfo>,
}

impl LicenseStatus {
    /// True when any key was accepted
    pub fn any_valid(&self) -> bool {
        self.licenses.iter().any(|l| l.valid)
    }
}

/// Validation result for one license key
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LicenseInfo {
    /// Key within the license secret
    pub key: String,

    /// Whether the key was accepted
    #[serde(default)]
    pub valid: bool,

    /// sha256 of the license contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Applied state of one TLS config
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfigStatus {
    /// TLS config name (httpsNMA, clientServer)
    pub name: String,

    /// Secret in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Mode in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Last auto-rotate secret that failed to apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rotate_failed_secret: Option<String>,
}

impl VerticaDBStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether the condition of this type exists and is True
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(|c| c.is_true())
    }

    /// Set a condition, replacing any existing one of the same type.
    ///
    /// The transition time is kept when the status does not change.
    pub fn set_condition(&mut self, condition: Condition) {
        let mut condition = condition;
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    /// Status entry for a subcluster
    pub fn subcluster(&self, name: &str) -> Option<&SubclusterStatus> {
        self.subclusters.iter().find(|s| s.name == name)
    }

    /// Status entry for a subcluster, inserting an empty one if absent
    pub fn subcluster_mut(&mut self, name: &str) -> &mut SubclusterStatus {
        let idx = match self.subclusters.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.subclusters.push(SubclusterStatus {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.subclusters.len() - 1
            }
        };
        &mut self.subclusters[idx]
    }

    /// Status entry for a sandbox
    pub fn sandbox(&self, name: &str) -> Option<&SandboxStatus> {
        self.sandboxes.iter().find(|s| s.name == name)
    }

    /// Status entry for a sandbox, inserting an empty one if absent
    pub fn sandbox_mut(&mut self, name: &str) -> &mut SandboxStatus {
        let idx = match self.sandboxes.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sandboxes.push(SandboxStatus {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.sandboxes.len() - 1
            }
        };
        &mut self.sandboxes[idx]
    }

    /// The sandbox a subcluster currently lives in, if any
    pub fn sandbox_of(&self, subcluster: &str) -> Option<&str> {
        self.sandboxes
            .iter()
            .find(|sb| sb.subclusters.iter().any(|sc| sc == subcluster))
            .map(|sb| sb.name.as_str())
    }

    /// Applied state of a TLS config
    pub fn tls_config(&self, name: TlsConfigName) -> Option<&TlsConfigStatus> {
        self.tls_configs.iter().find(|t| t.name == name.as_str())
    }

    /// Applied state of a TLS config, inserting an empty one if absent
    pub fn tls_config_mut(&mut self, name: TlsConfigName) -> &mut TlsConfigStatus {
        let idx = match self.tls_configs.iter().position(|t| t.name == name.as_str()) {
            Some(idx) => idx,
            None => {
                self.tls_configs.push(TlsConfigStatus {
                    name: name.as_str().to_string(),
                    ..Default::default()
                });
                self.tls_configs.len() - 1
            }
        };
        &mut self.tls_configs[idx]
    }
}

impl VerticaDB {
    /// Namespace of the resource, empty for cluster-scoped lookups
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    /// `namespace/name`, used in log fields and cache keys
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name_any())
    }

    /// Database superuser
    pub fn superuser(&self) -> &str {
        self.spec
            .superuser_name
            .as_deref()
            .unwrap_or(DEFAULT_SUPERUSER)
    }

    /// Eon mode databases have a communal location
    pub fn is_eon(&self) -> bool {
        self.spec
            .communal
            .as_ref()
            .is_some_and(|c| !c.path.is_empty())
    }

    /// Whether a condition of this type exists and is True
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.is_condition_true(type_))
    }

    /// True once the database has been created or revived
    pub fn is_db_initialized(&self) -> bool {
        self.is_condition_true(conditions::DB_INITIALIZED)
    }

    /// Condition of this type, if present
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| s.condition(type_))
    }

    /// Status of a condition, `Unknown` when absent
    pub fn condition_status(&self, type_: &str) -> ConditionStatus {
        self.condition(type_).map(|c| c.status).unwrap_or_default()
    }

    /// Subcluster spec by name
    pub fn subcluster(&self, name: &str) -> Option<&Subcluster> {
        self.spec.subclusters.iter().find(|s| s.name == name)
    }

    /// Subcluster status by name
    pub fn subcluster_status(&self, name: &str) -> Option<&SubclusterStatus> {
        self.status.as_ref().and_then(|s| s.subcluster(name))
    }

    /// Sandbox spec by name
    pub fn sandbox(&self, name: &str) -> Option<&Sandbox> {
        self.spec.sandboxes.iter().find(|s| s.name == name)
    }

    /// Sandbox status by name
    pub fn sandbox_status(&self, name: &str) -> Option<&SandboxStatus> {
        self.status.as_ref().and_then(|s| s.sandbox(name))
    }

    /// Sandbox the spec assigns a subcluster to, if any
    pub fn desired_sandbox_of(&self, subcluster: &str) -> Option<&str> {
        self.spec
            .sandboxes
            .iter()
            .find(|sb| sb.subclusters.iter().any(|sc| sc.name == subcluster))
            .map(|sb| sb.name.as_str())
    }

    /// Sandbox a subcluster currently lives in according to status
    pub fn current_sandbox_of(&self, subcluster: &str) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.sandbox_of(subcluster))
    }

    /// Image a sandbox runs
    pub fn sandbox_image(&self, sandbox: &str) -> &str {
        self.sandbox(sandbox)
            .and_then(|sb| sb.image.as_deref())
            .unwrap_or(&self.spec.image)
    }

    /// Spec of a TLS config
    pub fn tls_spec(&self, name: TlsConfigName) -> Option<&TlsConfigSpec> {
        match name {
            TlsConfigName::HttpsNma => self.spec.https_nma_tls.as_ref(),
            TlsConfigName::ClientServer => self.spec.client_server_tls.as_ref(),
        }
    }

    /// Whether TLS is on for a config
    pub fn is_tls_enabled(&self, name: TlsConfigName) -> bool {
        self.tls_spec(name).is_some_and(|t| t.is_enabled())
    }

    /// TLS secret currently applied according to status
    pub fn tls_secret_in_use(&self, name: TlsConfigName) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.tls_config(name))
            .and_then(|t| t.secret.as_deref())
    }

    /// TLS mode currently applied according to status
    pub fn tls_mode_in_use(&self, name: TlsConfigName) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.tls_config(name))
            .and_then(|t| t.mode.as_deref())
    }

    /// Whether automatic rollback after a failed cert rotation is allowed
    pub fn is_tls_rollback_enabled(&self) -> bool {
        !self
            .annotations()
            .get(crate::DISABLE_TLS_ROLLBACK_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Password secret currently applied to the main cluster or a sandbox
    pub fn password_secret_in_use(&self, sandbox: Option<&str>) -> Option<&str> {
        let status = self.status.as_ref()?;
        match sandbox {
            None => status.password_secret.as_deref(),
            Some(sb) => status.sandbox(sb).and_then(|s| s.password_secret.as_deref()),
        }
    }

    /// Statefulset backing a subcluster
    pub fn statefulset_name(&self, subcluster: &str) -> String {
        format!("{}-{}", self.name_any(), subcluster)
    }

    /// Pod name for an ordinal of a subcluster
    pub fn pod_name(&self, subcluster: &str, index: i32) -> String {
        format!("{}-{}", self.statefulset_name(subcluster), index)
    }

    /// Config map carrying triggers for a sandbox
    pub fn sandbox_configmap_name(&self, sandbox: &str) -> String {
        format!("{}-{}", self.name_any(), sandbox)
    }

    /// Fixed requeue interval from the spec, if set to a positive value
    pub fn requeue_time(&self) -> Option<std::time::Duration> {
        self.spec
            .requeue_time
            .filter(|t| *t > 0)
            .map(|t| std::time::Duration::from_secs(u64::from(t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> VerticaDB {
        serde_yaml::from_str(yaml).expect("parse verticadb")
    }

    const SAMPLE: &str = r#"
apiVersion: vertica.com/v1
kind: VerticaDB
metadata:
  name: vertdb
  namespace: default
spec:
  image: vertica/vertica-k8s:24.4.0
  communal:
    path: s3://bucket/db
  subclusters:
    - name: sc1
      size: 3
    - name: sc2
      size: 1
      type: secondary
  sandboxes:
    - name: sandbox1
      subclusters:
        - name: sc2
  httpsNmaTls:
    secret: https-cert
"#;

    #[test]
    fn parses_defaults() {
        let vdb = parse(SAMPLE);
        assert_eq!(vdb.spec.db_name, DEFAULT_DB_NAME);
        assert_eq!(vdb.spec.init_policy, InitPolicy::Create);
        assert_eq!(vdb.superuser(), DEFAULT_SUPERUSER);
        assert!(vdb.is_eon());
        assert!(vdb.subcluster("sc1").is_some_and(|sc| sc.is_primary()));
        assert!(vdb.subcluster("sc2").is_some_and(|sc| !sc.is_primary()));
        assert_eq!(vdb.requeue_time(), None);
    }

    #[test]
    fn tls_defaults_to_enabled_with_try_verify() {
        let vdb = parse(SAMPLE);
        let tls = vdb.tls_spec(TlsConfigName::HttpsNma).expect("https tls");
        assert!(tls.is_enabled());
        assert_eq!(tls.mode, DEFAULT_TLS_MODE);
        assert!(!vdb.is_tls_enabled(TlsConfigName::ClientServer));
    }

    #[test]
    fn names_derive_from_the_resource() {
        let vdb = parse(SAMPLE);
        assert_eq!(vdb.statefulset_name("sc1"), "vertdb-sc1");
        assert_eq!(vdb.pod_name("sc1", 2), "vertdb-sc1-2");
        assert_eq!(vdb.sandbox_configmap_name("sandbox1"), "vertdb-sandbox1");
        assert_eq!(vdb.key(), "default/vertdb");
    }

    #[test]
    fn desired_and_current_sandbox_are_separate() {
        let mut vdb = parse(SAMPLE);
        assert_eq!(vdb.desired_sandbox_of("sc2"), Some("sandbox1"));
        assert_eq!(vdb.current_sandbox_of("sc2"), None);

        let mut status = VerticaDBStatus::default();
        status.sandbox_mut("sandbox1").subclusters.push("sc2".into());
        vdb.status = Some(status);
        assert_eq!(vdb.current_sandbox_of("sc2"), Some("sandbox1"));
        assert_eq!(vdb.sandbox_image("sandbox1"), "vertica/vertica-k8s:24.4.0");
    }

    #[test]
    fn set_condition_keeps_one_per_type() {
        let mut status = VerticaDBStatus::default();
        status.set_condition(Condition::truthy(conditions::LICENSE_VALID, "Valid"));
        let first_time = status.conditions[0].last_transition_time;

        // Same status keeps the transition time
        status.set_condition(Condition::truthy(conditions::LICENSE_VALID, "StillValid"));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].reason, "StillValid");
        assert_eq!(status.conditions[0].last_transition_time, first_time);

        status.set_condition(Condition::falsy(conditions::LICENSE_VALID, "Invalid"));
        assert_eq!(status.conditions.len(), 1);
        assert!(!status.is_condition_true(conditions::LICENSE_VALID));
    }

    #[test]
    fn status_entries_are_inserted_on_demand() {
        let mut status = VerticaDBStatus::default();
        status.subcluster_mut("sc1").install_count = 3;
        status.subcluster_mut("sc1").added_to_db_count = 2;
        assert_eq!(status.subclusters.len(), 1);
        assert_eq!(status.subcluster("sc1").map(|s| s.install_count), Some(3));

        status.tls_config_mut(TlsConfigName::HttpsNma).secret = Some("old".into());
        assert_eq!(
            status
                .tls_config(TlsConfigName::HttpsNma)
                .and_then(|t| t.secret.as_deref()),
            Some("old")
        );
        assert!(status.tls_config(TlsConfigName::ClientServer).is_none());
    }

    #[test]
    fn rollback_can_be_disabled_by_annotation() {
        let mut vdb = parse(SAMPLE);
        assert!(vdb.is_tls_rollback_enabled());
        vdb.metadata.annotations = Some(
            [(
                crate::DISABLE_TLS_ROLLBACK_ANNOTATION.to_string(),
                "true".to_string(),
            )]
            .into(),
        );
        assert!(!vdb.is_tls_rollback_enabled());
    }

    #[test]
    fn requeue_time_zero_means_unset() {
        let mut vdb = parse(SAMPLE);
        vdb.spec.requeue_time = Some(0);
        assert_eq!(vdb.requeue_time(), None);
        vdb.spec.requeue_time = Some(30);
        assert_eq!(vdb.requeue_time(), Some(std::time::Duration::from_secs(30)));
    }
}
