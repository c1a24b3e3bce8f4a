//! VerticaDB operator - converges VerticaDB clusters toward their spec

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use vdb_common::crd::VerticaDB;
use vdb_common::retry::{retry_with_backoff, RetryConfig};
use vdb_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use vdb_common::{FIELD_MANAGER, SANDBOX_CONFIGMAP_LABEL};
use vdb_operator::config::ReconcilerConfig;
use vdb_operator::context::Context;
use vdb_operator::{controller, sandbox_controller};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Attempts at building the Kubernetes client before giving up
const API_CONNECT_ATTEMPTS: u32 = 5;

/// Kubernetes operator for VerticaDB clusters
#[derive(Parser, Debug)]
#[command(name = "vdb-operator", version, about, long_about = None)]
struct Cli {
    /// Print the VerticaDB CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log output format (json or text)
    #[arg(long, env = "VDB_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Seconds a license validation stays fresh
    #[arg(long, env = "VDB_LICENSE_CHECK_INTERVAL_SECS", default_value_t = 86_400)]
    license_check_interval_secs: u64,

    /// Seconds before a pass that asked to requeue runs again
    #[arg(long, env = "VDB_REQUEUE_DELAY_SECS", default_value_t = 1)]
    requeue_delay_secs: u64,

    /// Seconds before a failed pass runs again
    #[arg(long, env = "VDB_ERROR_REQUEUE_DELAY_SECS", default_value_t = 5)]
    error_requeue_delay_secs: u64,

    /// Field manager recorded on writes
    #[arg(long, env = "VDB_FIELD_MANAGER", default_value = FIELD_MANAGER)]
    field_manager: String,

    /// Only watch this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Controller name reported on events
    #[arg(long, env = "VDB_CONTROLLER_NAME", default_value = "verticadb-operator")]
    controller_name: String,
}

impl Cli {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            license_check_interval: Duration::from_secs(self.license_check_interval_secs),
            requeue_delay: Duration::from_secs(self.requeue_delay_secs),
            error_requeue_delay: Duration::from_secs(self.error_requeue_delay_secs),
            field_manager: self.field_manager.clone(),
            namespace_scoped: self.watch_namespace.is_some(),
            controller_name: self.controller_name.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&VerticaDB::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "vdb-operator".to_string(),
        format: cli.log_format,
    })?;

    run_controllers(&cli).await
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn run_controllers(cli: &Cli) -> anyhow::Result<()> {
    // The API server may still be coming up when the operator starts
    let client = retry_with_backoff(
        &RetryConfig::with_max_attempts(API_CONNECT_ATTEMPTS),
        "create_kube_client",
        Client::try_default,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let config = cli.reconciler_config();
    let ns = cli.watch_namespace.as_deref();
    tracing::info!(
        namespace = ns.unwrap_or("<all>"),
        license_check_interval = ?config.license_check_interval,
        "Starting VerticaDB operator"
    );
    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());

    let vdbs: Api<VerticaDB> = api(&client, ns);
    let statefulsets: Api<StatefulSet> = api(&client, ns);
    let config_maps: Api<ConfigMap> = api(&client, ns);

    tracing::info!("- VerticaDB controller");
    let vdb_ctrl = Controller::new(vdbs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(
            statefulsets,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx.clone())
        .for_each(log_reconcile_result("VerticaDB"));

    tracing::info!("- Sandbox controller");
    let sandbox_watch = WatcherConfig::default()
        .labels(&format!("{SANDBOX_CONFIGMAP_LABEL}=true"))
        .timeout(WATCH_TIMEOUT_SECS);
    let sandbox_ctrl = Controller::new(config_maps, sandbox_watch)
        .shutdown_on_signal()
        .run(
            sandbox_controller::reconcile,
            sandbox_controller::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("Sandbox"));

    tokio::join!(vdb_ctrl, sandbox_ctrl);
    tracing::info!("Controllers stopped");
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
