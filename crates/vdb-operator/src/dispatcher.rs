//! Administrative operations against a running database
//!
//! Every admin operation has its own options struct and a single error
//! return. [`VclusterDispatcher`] runs the admin CLI inside the initiator pod.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use vdb_common::crd::VerticaDB;
use vdb_common::{Error, Result, SERVER_CONTAINER};

use crate::pod_runner::{ExecOutput, PodRunner};

/// Path of the admin CLI inside the server image
pub const VCLUSTER_BIN: &str = "/opt/vertica/bin/vcluster";

/// Pod that runs an admin command, and the address the command targets
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Initiator {
    /// Pod to exec into
    pub pod_name: String,
    /// IP passed as `--hosts`
    pub ip: String,
}

/// Options for adding nodes to a subcluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddNodeOptions {
    /// Up pod that drives the operation
    pub initiator: Initiator,
    /// Subcluster receiving the nodes
    pub subcluster: String,
    /// Hosts to add, sorted by DNS name
    pub hosts: Vec<String>,
}

/// Options for removing nodes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoveNodeOptions {
    /// Up pod that drives the operation
    pub initiator: Initiator,
    /// Hosts to remove
    pub hosts: Vec<String>,
}

/// Options for rebalancing shards after a scale-out
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebalanceShardsOptions {
    /// Up pod that drives the operation
    pub initiator: Initiator,
    /// Subcluster to rebalance
    pub subcluster: String,
}

/// Options for moving a subcluster into a sandbox
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SandboxSubclusterOptions {
    /// Primary up pod of the main cluster
    pub initiator: Initiator,
    /// Primary up pod already in the sandbox, when the sandbox has members
    pub sandbox_initiator: Option<Initiator>,
    /// Subcluster being moved
    pub subcluster: String,
    /// Target sandbox
    pub sandbox: String,
}

/// Options for promoting a sandbox to a standalone main cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PromoteSandboxOptions {
    /// Up pod inside the sandbox
    pub initiator: Initiator,
    /// Sandbox to promote
    pub sandbox: String,
}

/// Which key/cert/CA the server should load
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSecretRef {
    /// Secret holding the material
    pub secret: String,
    /// Namespace of the secret
    pub namespace: String,
    /// Key for the private key
    pub key_field: String,
    /// Key for the certificate
    pub cert_field: String,
    /// Key for the CA bundle
    pub ca_field: String,
}

impl TlsSecretRef {
    /// Reference a kubernetes.io/tls secret using the standard keys
    pub fn standard(secret: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            namespace: namespace.into(),
            key_field: "tls.key".to_string(),
            cert_field: "tls.crt".to_string(),
            ca_field: "ca.crt".to_string(),
        }
    }

    /// JSON config the server uses to resolve a field from the secret
    pub fn secret_config(&self, field: &str) -> String {
        serde_json::json!({ "data-key": field, "namespace": self.namespace }).to_string()
    }
}

/// Options for rotating the certificates of a TLS config
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RotateTlsCertsOptions {
    /// Up pod that drives the operation
    pub initiator: Initiator,
    /// Server-side TLS config name (https, server)
    pub tls_config: String,
    /// New material
    pub secret: TlsSecretRef,
    /// TLS mode to apply with the new material
    pub mode: String,
    /// Whether to poll the new cert through the HTTPS service before finishing
    pub poll_health: bool,
}

/// Options for setting the mode of a TLS config without rotating certs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetTlsConfigOptions {
    /// Up pod that drives the operation
    pub initiator: Initiator,
    /// Server-side TLS config name (https, server)
    pub tls_config: String,
    /// Secret to associate, if any
    pub secret: Option<TlsSecretRef>,
    /// TLS mode to apply
    pub mode: String,
}

/// Options for validating one license
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckLicenseOptions {
    /// Running pod that performs the check
    pub initiator: Initiator,
    /// Base64 encoded license file
    pub license_base64: String,
    /// Reject Community Edition licenses
    pub ce_disallowed: bool,
}

/// Result of validating one license
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LicenseVerdict {
    /// The license was accepted
    Valid,
    /// The license was rejected
    Invalid(String),
    /// The license is a Community Edition license
    CommunityEdition(String),
}

/// Options for reading a configuration parameter
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetConfigParameterOptions {
    /// Up pod that drives the operation
    pub initiator: Initiator,
    /// Parameter name
    pub parameter: String,
    /// Scope (database, node name, ...)
    pub level: String,
}

/// Options for writing a configuration parameter
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetConfigParameterOptions {
    /// Up pod that drives the operation
    pub initiator: Initiator,
    /// Parameter name
    pub parameter: String,
    /// New value
    pub value: String,
    /// Scope (database, node name, ...)
    pub level: String,
}

/// Options for starting the database
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartDatabaseOptions {
    /// Running, installed pod that drives the start
    pub initiator: Initiator,
    /// Hosts to start
    pub hosts: Vec<String>,
    /// Sandbox to start, empty for the main cluster
    pub sandbox: String,
}

/// Administrative operations the reconcile steps dispatch
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Add nodes to the database.
    ///
    /// Returns [`Error::LicenseLimit`] when the license does not allow more nodes.
    async fn add_node(&self, vdb: &VerticaDB, opts: AddNodeOptions) -> Result<()>;

    /// Remove nodes from the database
    async fn remove_node(&self, vdb: &VerticaDB, opts: RemoveNodeOptions) -> Result<()>;

    /// Rebalance shards across a subcluster
    async fn rebalance_shards(&self, vdb: &VerticaDB, opts: RebalanceShardsOptions) -> Result<()>;

    /// Move a subcluster into a sandbox
    async fn sandbox_subcluster(&self, vdb: &VerticaDB, opts: SandboxSubclusterOptions)
        -> Result<()>;

    /// Promote a sandbox to a standalone cluster
    async fn promote_sandbox_to_main(
        &self,
        vdb: &VerticaDB,
        opts: PromoteSandboxOptions,
    ) -> Result<()>;

    /// Rotate the certificates of a TLS config.
    ///
    /// Failures are [`Error::CertRotation`] recording whether health polling
    /// of the new cert had already passed.
    async fn rotate_tls_certs(&self, vdb: &VerticaDB, opts: RotateTlsCertsOptions) -> Result<()>;

    /// Set the mode of a TLS config
    async fn set_tls_config(&self, vdb: &VerticaDB, opts: SetTlsConfigOptions) -> Result<()>;

    /// Validate one license
    async fn check_license(
        &self,
        vdb: &VerticaDB,
        opts: CheckLicenseOptions,
    ) -> Result<LicenseVerdict>;

    /// Read a configuration parameter
    async fn get_config_parameter(
        &self,
        vdb: &VerticaDB,
        opts: GetConfigParameterOptions,
    ) -> Result<String>;

    /// Write a configuration parameter
    async fn set_config_parameter(
        &self,
        vdb: &VerticaDB,
        opts: SetConfigParameterOptions,
    ) -> Result<()>;

    /// Start the database on the given hosts
    async fn start_database(&self, vdb: &VerticaDB, opts: StartDatabaseOptions) -> Result<()>;
}

/// Marker the admin CLI prints when the license node limit is hit
const LICENSE_LIMIT_MARKER: &str = "current license permits";

/// Marker the admin CLI prints for Community Edition licenses
const COMMUNITY_EDITION_MARKER: &str = "Community Edition";

/// Marker the admin CLI prints once the rotated cert passed health polling
const HEALTH_POLLING_PASSED_MARKER: &str = "new certificate is healthy";

/// Decodes the base64 license on stdin into a temporary file and appends
/// `--license-file <path>` to the command in `$@`
const LICENSE_FROM_STDIN: &str = r#"f=$(mktemp) && trap 'rm -f "$f"' EXIT && base64 -d > "$f" && "$@" --license-file "$f""#;

/// Dispatcher that runs the admin CLI in the initiator pod
pub struct VclusterDispatcher {
    runner: Arc<dyn PodRunner>,
}

impl VclusterDispatcher {
    /// Create a dispatcher using the given pod runner
    pub fn new(runner: Arc<dyn PodRunner>) -> Self {
        Self { runner }
    }

    fn base_command(vdb: &VerticaDB, subcommand: &str, initiator: &Initiator) -> Vec<String> {
        vec![
            VCLUSTER_BIN.to_string(),
            subcommand.to_string(),
            "--db-name".to_string(),
            vdb.spec.db_name.clone(),
            "--hosts".to_string(),
            initiator.ip.clone(),
        ]
    }

    /// Run a subcommand, returning stdout or the raw failure output
    async fn run(
        &self,
        vdb: &VerticaDB,
        subcommand: &str,
        initiator: &Initiator,
        args: Vec<String>,
    ) -> Result<std::result::Result<String, String>> {
        let mut command = Self::base_command(vdb, subcommand, initiator);
        command.extend(args);

        debug!(subcommand, pod = %initiator.pod_name, "dispatching admin command");
        let output = self
            .runner
            .exec(
                &vdb.namespace_or_default(),
                &initiator.pod_name,
                SERVER_CONTAINER,
                command,
            )
            .await?;
        Ok(admin_result(output))
    }

    async fn run_checked(
        &self,
        vdb: &VerticaDB,
        subcommand: &str,
        initiator: &Initiator,
        args: Vec<String>,
    ) -> Result<String> {
        self.run(vdb, subcommand, initiator, args)
            .await?
            .map_err(|msg| {
                warn!(subcommand, db = %vdb.name_any(), error = %msg, "admin command failed");
                Error::admin(subcommand, msg)
            })
    }
}

/// Stdout on success, otherwise whichever stream carries the failure
fn admin_result(output: ExecOutput) -> std::result::Result<String, String> {
    if output.success {
        Ok(output.stdout)
    } else if output.stderr.trim().is_empty() {
        Err(output.stdout)
    } else {
        Err(output.stderr)
    }
}

fn flag(name: &str, value: impl Into<String>) -> [String; 2] {
    [format!("--{name}"), value.into()]
}

fn tls_args(secret: &TlsSecretRef) -> Vec<String> {
    let mut args = Vec::new();
    args.extend(flag("tls-secret", secret.secret.clone()));
    args.extend(flag("key-config", secret.secret_config(&secret.key_field)));
    args.extend(flag("cert-config", secret.secret_config(&secret.cert_field)));
    args.extend(flag("ca-cert-config", secret.secret_config(&secret.ca_field)));
    args
}

#[async_trait]
impl Dispatcher for VclusterDispatcher {
    async fn add_node(&self, vdb: &VerticaDB, opts: AddNodeOptions) -> Result<()> {
        let mut args = Vec::new();
        args.extend(flag("new-hosts", opts.hosts.join(",")));
        args.extend(flag("subcluster", opts.subcluster.clone()));
        // Rebalance is its own step so a failure there does not undo the add
        args.push("--skip-rebalance-shards".to_string());

        match self.run(vdb, "add_node", &opts.initiator, args).await? {
            Ok(_) => {
                info!(subcluster = %opts.subcluster, hosts = ?opts.hosts, "nodes added");
                Ok(())
            }
            Err(msg) if msg.contains(LICENSE_LIMIT_MARKER) => Err(Error::license_limit(msg)),
            Err(msg) => Err(Error::admin("add_node", msg)),
        }
    }

    async fn remove_node(&self, vdb: &VerticaDB, opts: RemoveNodeOptions) -> Result<()> {
        let args = flag("remove", opts.hosts.join(",")).to_vec();
        self.run_checked(vdb, "remove_node", &opts.initiator, args)
            .await
            .map(|_| ())
    }

    async fn rebalance_shards(&self, vdb: &VerticaDB, opts: RebalanceShardsOptions) -> Result<()> {
        let args = flag("subcluster", opts.subcluster.clone()).to_vec();
        self.run_checked(vdb, "rebalance_shards", &opts.initiator, args)
            .await
            .map(|_| ())
    }

    async fn sandbox_subcluster(
        &self,
        vdb: &VerticaDB,
        opts: SandboxSubclusterOptions,
    ) -> Result<()> {
        let mut args = Vec::new();
        args.extend(flag("subcluster", opts.subcluster.clone()));
        args.extend(flag("sandbox", opts.sandbox.clone()));
        if let Some(sb) = &opts.sandbox_initiator {
            args.extend(flag("sandbox-hosts", sb.ip.clone()));
        }
        self.run_checked(vdb, "sandbox_subcluster", &opts.initiator, args)
            .await
            .map(|_| ())
    }

    async fn promote_sandbox_to_main(
        &self,
        vdb: &VerticaDB,
        opts: PromoteSandboxOptions,
    ) -> Result<()> {
        let args = flag("sandbox", opts.sandbox.clone()).to_vec();
        self.run_checked(vdb, "promote_sandbox", &opts.initiator, args)
            .await
            .map(|_| ())
    }

    async fn rotate_tls_certs(&self, vdb: &VerticaDB, opts: RotateTlsCertsOptions) -> Result<()> {
        let mut args = Vec::new();
        args.extend(flag("tls-config", opts.tls_config.clone()));
        args.extend(tls_args(&opts.secret));
        args.extend(flag("tls-mode", opts.mode.clone()));
        if opts.poll_health {
            args.push("--poll-health".to_string());
        }

        match self.run(vdb, "rotate_tls_certs", &opts.initiator, args).await? {
            Ok(_) => Ok(()),
            Err(msg) => {
                let after_health_polling = msg.contains(HEALTH_POLLING_PASSED_MARKER);
                Err(Error::cert_rotation(
                    opts.tls_config.clone(),
                    msg,
                    after_health_polling,
                ))
            }
        }
    }

    async fn set_tls_config(&self, vdb: &VerticaDB, opts: SetTlsConfigOptions) -> Result<()> {
        let mut args = Vec::new();
        args.extend(flag("tls-config", opts.tls_config.clone()));
        if let Some(secret) = &opts.secret {
            args.extend(tls_args(secret));
        }
        args.extend(flag("tls-mode", opts.mode.clone()));
        self.run_checked(vdb, "set_tls_config", &opts.initiator, args)
            .await
            .map(|_| ())
    }

    async fn check_license(
        &self,
        vdb: &VerticaDB,
        opts: CheckLicenseOptions,
    ) -> Result<LicenseVerdict> {
        // The license body goes on stdin, never on the command line
        let mut command = vec![
            "bash".to_string(),
            "-c".to_string(),
            LICENSE_FROM_STDIN.to_string(),
            "check_license".to_string(),
        ];
        command.extend(Self::base_command(vdb, "check_license", &opts.initiator));
        if opts.ce_disallowed {
            command.push("--ce-disallowed".to_string());
        }

        debug!(pod = %opts.initiator.pod_name, "dispatching license check");
        let output = self
            .runner
            .exec_with_input(
                &vdb.namespace_or_default(),
                &opts.initiator.pod_name,
                SERVER_CONTAINER,
                command,
                opts.license_base64.clone(),
            )
            .await?;
        let verdict = match admin_result(output) {
            Ok(out) if opts.ce_disallowed && out.contains(COMMUNITY_EDITION_MARKER) => {
                LicenseVerdict::CommunityEdition(out)
            }
            Ok(_) => LicenseVerdict::Valid,
            Err(msg) if msg.contains(COMMUNITY_EDITION_MARKER) => {
                LicenseVerdict::CommunityEdition(msg)
            }
            Err(msg) => LicenseVerdict::Invalid(msg),
        };
        Ok(verdict)
    }

    async fn get_config_parameter(
        &self,
        vdb: &VerticaDB,
        opts: GetConfigParameterOptions,
    ) -> Result<String> {
        let mut args = flag("config-parameter", opts.parameter.clone()).to_vec();
        if !opts.level.is_empty() {
            args.extend(flag("level", opts.level.clone()));
        }
        let out = self
            .run_checked(vdb, "get_config_parameter", &opts.initiator, args)
            .await?;
        Ok(out.trim().to_string())
    }

    async fn set_config_parameter(
        &self,
        vdb: &VerticaDB,
        opts: SetConfigParameterOptions,
    ) -> Result<()> {
        let mut args = Vec::new();
        args.extend(flag("config-parameter", opts.parameter.clone()));
        args.extend(flag("value", opts.value.clone()));
        if !opts.level.is_empty() {
            args.extend(flag("level", opts.level.clone()));
        }
        self.run_checked(vdb, "set_config_parameter", &opts.initiator, args)
            .await
            .map(|_| ())
    }

    async fn start_database(&self, vdb: &VerticaDB, opts: StartDatabaseOptions) -> Result<()> {
        let mut args = flag("start-hosts", opts.hosts.join(",")).to_vec();
        if !opts.sandbox.is_empty() {
            args.extend(flag("sandbox", opts.sandbox.clone()));
        }
        self.run_checked(vdb, "start_db", &opts.initiator, args)
            .await
            .map(|_| ())
    }
}
