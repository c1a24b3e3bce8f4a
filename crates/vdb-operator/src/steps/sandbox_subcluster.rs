//! Moving subclusters into sandboxes
//!
//! Subclusters are moved one at a time in manifest order. Status is written
//! after every move so a later failure leaves the completed moves recorded
//! and the next pass picks up where this one stopped. The first subcluster
//! placed in an empty sandbox becomes its primary, so a sandbox's members
//! never overtake an earlier member that is still waiting.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use vdb_common::events::{actions, reasons};
use vdb_common::Result;

use super::{is_schedule_only, publish};
use crate::context::Context;
use crate::dispatcher::{Initiator, SandboxSubclusterOptions};
use crate::podfacts::PodFact;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::{update_spec, update_status};

/// (subcluster, sandbox) pairs in manifest order
fn desired_moves(pass: &Pass) -> Vec<(String, String)> {
    pass.vdb
        .spec
        .sandboxes
        .iter()
        .flat_map(|sb| {
            sb.subclusters
                .iter()
                .map(move |sc| (sc.name.clone(), sb.name.clone()))
        })
        .collect()
}

/// Creates sandboxes and keeps their config maps in place
pub struct SandboxSubclusterStep {
    ctx: Arc<Context>,
}

impl SandboxSubclusterStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn backfill_images(&self, pass: &mut Pass) -> Result<()> {
        if pass.vdb.spec.sandboxes.iter().all(|sb| sb.image.is_some()) {
            return Ok(());
        }
        info!("backfilling sandbox images from the cluster image");
        update_spec(self.ctx.kube.as_ref(), &mut pass.vdb, |spec| {
            let image = spec.image.clone();
            for sb in &mut spec.sandboxes {
                sb.image.get_or_insert_with(|| image.clone());
            }
        })
        .await
    }

    /// Up primary inside a sandbox that already has members
    async fn sandbox_initiator(&self, pass: &Pass, sandbox: &str) -> Result<Option<Initiator>> {
        let mut facts = pass.facts.copy_for_sandbox(sandbox);
        facts.collect(&pass.vdb).await?;
        Ok(facts.find_initiator_in_sandbox().map(PodFact::initiator))
    }

    async fn record_move(&self, pass: &mut Pass, subcluster: &str, sandbox: &str) -> Result<()> {
        // A new sandbox starts out with the main cluster's password
        let main_secret = pass.vdb.password_secret_in_use(None).map(str::to_string);
        update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| {
            let entry = status.sandbox_mut(sandbox);
            if !entry.subclusters.iter().any(|sc| sc == subcluster) {
                entry.subclusters.push(subcluster.to_string());
            }
            if entry.password_secret.is_none() {
                entry.password_secret = main_secret.clone();
            }
        })
        .await
    }

    async fn move_subcluster(
        &self,
        pass: &mut Pass,
        opts: SandboxSubclusterOptions,
    ) -> Result<()> {
        let (subcluster, sandbox) = (opts.subcluster.clone(), opts.sandbox.clone());
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::SANDBOX_SUBCLUSTER_START,
            actions::SANDBOX,
            format!("Starting add subcluster {subcluster} to sandbox {sandbox}"),
        )
        .await;
        if let Err(e) = self.ctx.dispatcher.sandbox_subcluster(&pass.vdb, opts).await {
            publish(
                &self.ctx,
                &pass.vdb,
                EventType::Warning,
                reasons::SANDBOX_SUBCLUSTER_FAILED,
                actions::SANDBOX,
                format!("Failed to add subcluster {subcluster} to sandbox {sandbox}: {e}"),
            )
            .await;
            return Err(e);
        }
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::SANDBOX_SUBCLUSTER_SUCCEEDED,
            actions::SANDBOX,
            format!("Successfully added subcluster {subcluster} to sandbox {sandbox}"),
        )
        .await;
        self.record_move(pass, &subcluster, &sandbox).await?;
        pass.invalidate();
        Ok(())
    }
}

#[async_trait]
impl ReconcileStep for SandboxSubclusterStep {
    fn name(&self) -> &'static str {
        "sandbox-subcluster"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        if is_schedule_only(&pass.vdb) || !pass.vdb.is_eon() || pass.vdb.spec.sandboxes.is_empty() {
            return Ok(ReconcileOutcome::Done);
        }
        self.backfill_images(pass).await?;
        let sandboxes: Vec<String> = pass.vdb.spec.sandboxes.iter().map(|s| s.name.clone()).collect();
        for sb in &sandboxes {
            self.ctx.configmaps.reconcile(&pass.vdb, sb).await?;
        }
        if !pass.vdb.is_db_initialized() {
            info!("database not initialized, sandboxing deferred");
            return Ok(ReconcileOutcome::RequeueNow);
        }

        let mut requeue = false;
        // Sandboxes with an earlier member still waiting to move
        let mut blocked: HashSet<String> = HashSet::new();
        for (subcluster, sandbox) in desired_moves(pass) {
            pass.collect().await?;
            if pass.facts.subcluster_sandbox(&subcluster) == Some(sandbox.as_str()) {
                if pass.vdb.current_sandbox_of(&subcluster) != Some(sandbox.as_str()) {
                    self.record_move(pass, &subcluster, &sandbox).await?;
                }
                continue;
            }
            if pass.vdb.subcluster(&subcluster).is_none() {
                warn!(subcluster = %subcluster, sandbox = %sandbox, "sandbox names an unknown subcluster");
                continue;
            }
            if blocked.contains(&sandbox) {
                debug!(subcluster = %subcluster, sandbox = %sandbox, "waiting for an earlier member of the sandbox");
                continue;
            }

            let pods = pass.facts.subcluster_pods(&subcluster);
            if pods.is_empty() || pods.iter().any(|p| !p.up_node.is_true()) {
                info!(subcluster = %subcluster, sandbox = %sandbox, "subcluster has pods that are not up");
                requeue = true;
                blocked.insert(sandbox);
                continue;
            }
            let Some(initiator) = pass
                .facts
                .find_first_primary_up_pod(false, None)
                .map(PodFact::initiator)
            else {
                info!("no up primary in the main cluster to drive sandboxing");
                requeue = true;
                blocked.insert(sandbox);
                continue;
            };
            let sandbox_initiator = if pass.facts.is_sandbox_empty(&sandbox) {
                None
            } else {
                match self.sandbox_initiator(pass, &sandbox).await? {
                    Some(i) => Some(i),
                    None => {
                        info!(sandbox = %sandbox, "no up primary inside the sandbox");
                        requeue = true;
                        blocked.insert(sandbox);
                        continue;
                    }
                }
            };

            self.move_subcluster(
                pass,
                SandboxSubclusterOptions {
                    initiator,
                    sandbox_initiator,
                    subcluster,
                    sandbox,
                },
            )
            .await?;
        }
        Ok(ReconcileOutcome::requeue_if(requeue))
    }
}
