//! Install indicator writes
//!
//! A pod counts as installed once the per-database indicator file exists in
//! its config directory. Installs proceed in ordinal order so the installed
//! pods of a subcluster always form a prefix starting at index 0.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use vdb_common::crd::VerticaDB;
use vdb_common::events::{actions, reasons};
use vdb_common::{Error, Result, SERVER_CONTAINER};

use super::{is_schedule_only, pod_detail_mut, publish, recount};
use crate::context::Context;
use crate::podfacts::{install_indicator_path, PodFact, CONFIG_DIR};
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::update_status;

/// Writes the install indicator into running pods
pub struct InstallStep {
    ctx: Arc<Context>,
}

impl InstallStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn install_pod(&self, vdb: &VerticaDB, pod: &PodFact) -> Result<()> {
        let script = format!(
            "mkdir -p {CONFIG_DIR} && touch {}",
            install_indicator_path(vdb)
        );
        let output = self
            .ctx
            .runner
            .exec(
                &vdb.namespace_or_default(),
                &pod.name,
                SERVER_CONTAINER,
                vec!["bash".to_string(), "-c".to_string(), script],
            )
            .await?;
        if !output.success {
            return Err(Error::exec(&pod.name, output.stderr));
        }
        info!(pod = %pod.name, "install indicator written");
        Ok(())
    }
}

#[async_trait]
impl ReconcileStep for InstallStep {
    fn name(&self) -> &'static str {
        "install"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        if is_schedule_only(&pass.vdb) {
            return Ok(ReconcileOutcome::Done);
        }
        pass.collect().await?;

        let mut more_work = false;
        let mut targets: Vec<PodFact> = Vec::new();
        for sc in &pass.vdb.spec.subclusters {
            for pod in pass.facts.subcluster_pods(&sc.name) {
                if pod.pending_delete || pod.installed.is_true() {
                    continue;
                }
                if !pod.running || pod.installed.is_unknown() {
                    debug!(pod = %pod.name, "pod not ready for install");
                    more_work = true;
                    break;
                }
                targets.push(pod.clone());
            }
        }

        if targets.is_empty() {
            return Ok(ReconcileOutcome::requeue_if(more_work));
        }

        let names: Vec<&str> = targets.iter().map(|p| p.name.as_str()).collect();
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::INSTALL_START,
            actions::INSTALL,
            format!("Installing pods {}", names.join(", ")),
        )
        .await;
        let mut done: Vec<(String, i32)> = Vec::new();
        let mut failure = None;
        for pod in &targets {
            match self.install_pod(&pass.vdb, pod).await {
                Ok(()) => done.push((pod.subcluster.clone(), pod.pod_index)),
                Err(e) => {
                    publish(
                        &self.ctx,
                        &pass.vdb,
                        EventType::Warning,
                        reasons::INSTALL_FAILED,
                        actions::INSTALL,
                        format!("Failed to install pod {}: {e}", pod.name),
                    )
                    .await;
                    failure = Some(e);
                    break;
                }
            }
        }

        // Record whatever made it before reporting a failure
        if !done.is_empty() {
            update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| {
                for (sc, index) in &done {
                    let entry = status.subcluster_mut(sc);
                    pod_detail_mut(entry, *index).installed = true;
                    recount(entry);
                }
            })
            .await?;
            pass.invalidate();
        }
        if let Some(e) = failure {
            return Err(e);
        }
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::INSTALL_SUCCEEDED,
            actions::INSTALL,
            format!("Installed {} pods", done.len()),
        )
        .await;
        Ok(ReconcileOutcome::requeue_if(more_work))
    }
}
