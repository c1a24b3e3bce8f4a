//! Adding installed pods to the database
//!
//! All pods of a subcluster that are installed but have no node yet are
//! added in one call. Convergence is monotonic: a pod that made it into the
//! database is never a candidate again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{info, warn};

use vdb_common::events::{actions, reasons};
use vdb_common::{Error, Result};

use super::{is_schedule_only, pod_detail_mut, publish, recount};
use crate::context::Context;
use crate::dispatcher::{AddNodeOptions, Initiator, RebalanceShardsOptions};
use crate::podfacts::PodFact;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::update_status;

/// Wait before retrying after the license refused more nodes
pub const LICENSE_LIMIT_REQUEUE: Duration = Duration::from_secs(30);

/// Adds installed pods that are not yet database nodes
pub struct AddNodeStep {
    ctx: Arc<Context>,
}

impl AddNodeStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Add `pods` of `subcluster`. `Ok(false)` means the license refused them.
    async fn add_pods(
        &self,
        pass: &mut Pass,
        initiator: Initiator,
        subcluster: &str,
        pods: &[PodFact],
    ) -> Result<bool> {
        let mut pods: Vec<&PodFact> = pods.iter().collect();
        pods.sort_by(|a, b| a.dns_name.cmp(&b.dns_name));
        let names: Vec<&str> = pods.iter().map(|p| p.name.as_str()).collect();
        let hosts: Vec<String> = pods.iter().map(|p| p.pod_ip.clone()).collect();

        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::ADD_NODE_START,
            actions::SCALE,
            format!("Adding pods {} to the database", names.join(", ")),
        )
        .await;

        let opts = AddNodeOptions {
            initiator: initiator.clone(),
            subcluster: subcluster.to_string(),
            hosts,
        };
        match self.ctx.dispatcher.add_node(&pass.vdb, opts).await {
            Ok(()) => {}
            Err(Error::LicenseLimit { message }) => {
                warn!(subcluster, %message, "license does not allow more nodes");
                publish(
                    &self.ctx,
                    &pass.vdb,
                    EventType::Warning,
                    reasons::ADD_NODE_LICENSE_FAIL,
                    actions::SCALE,
                    format!("Cannot add nodes to subcluster {subcluster}: {message}"),
                )
                .await;
                return Ok(false);
            }
            Err(e) => {
                publish(
                    &self.ctx,
                    &pass.vdb,
                    EventType::Warning,
                    reasons::ADD_NODE_FAILED,
                    actions::SCALE,
                    format!("Failed to add pods {}: {e}", names.join(", ")),
                )
                .await;
                return Err(e);
            }
        }

        info!(subcluster, pods = ?names, "nodes added");
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::ADD_NODE_SUCCEEDED,
            actions::SCALE,
            format!("Added pods {} to the database", names.join(", ")),
        )
        .await;

        let indexes: Vec<i32> = pods.iter().map(|p| p.pod_index).collect();
        update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| {
            let entry = status.subcluster_mut(subcluster);
            for index in &indexes {
                pod_detail_mut(entry, *index).added_to_db = true;
            }
            recount(entry);
        })
        .await?;
        pass.invalidate();

        if pass.vdb.is_eon() {
            self.rebalance(pass, initiator, subcluster).await?;
        }
        Ok(true)
    }

    async fn rebalance(&self, pass: &Pass, initiator: Initiator, subcluster: &str) -> Result<()> {
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::REBALANCE_SHARDS_START,
            actions::SCALE,
            format!("Rebalancing shards of subcluster {subcluster}"),
        )
        .await;
        self.ctx
            .dispatcher
            .rebalance_shards(
                &pass.vdb,
                RebalanceShardsOptions {
                    initiator,
                    subcluster: subcluster.to_string(),
                },
            )
            .await?;
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::REBALANCE_SHARDS_SUCCEEDED,
            actions::SCALE,
            format!("Shards of subcluster {subcluster} rebalanced"),
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl ReconcileStep for AddNodeStep {
    fn name(&self) -> &'static str {
        "add-node"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        if is_schedule_only(&pass.vdb) {
            return Ok(ReconcileOutcome::Done);
        }
        pass.collect().await?;

        let mut more_work = false;
        let subclusters: Vec<String> = pass.vdb.spec.subclusters.iter().map(|s| s.name.clone()).collect();
        for subcluster in &subclusters {
            let candidates: Vec<PodFact> = pass
                .facts
                .subcluster_pods(subcluster)
                .into_iter()
                .filter(|p| !p.pending_delete && !p.db_exists.is_true() && !p.up_node.is_true())
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }
            if candidates
                .iter()
                .any(|p| !p.running || !p.installed.is_true() || p.db_exists.is_unknown())
            {
                info!(subcluster = %subcluster, "pods not ready to be added yet");
                more_work = true;
                continue;
            }

            let Some(initiator) = pass.facts.find_first_up_pod(false, None).map(PodFact::initiator) else {
                info!("no up pod to drive add node");
                return Ok(ReconcileOutcome::RequeueNow);
            };
            if !self.add_pods(pass, initiator, subcluster, &candidates).await? {
                return Ok(ReconcileOutcome::RequeueAfter(LICENSE_LIMIT_REQUEUE));
            }
            pass.collect().await?;
        }
        Ok(ReconcileOutcome::requeue_if(more_work))
    }
}
