//! Statefulset replica counts
//!
//! Growing a subcluster only needs more replicas. Shrinking waits until every
//! pod being dropped has left the database.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use vdb_common::events::{actions, reasons};
use vdb_common::Result;

use super::publish;
use crate::context::Context;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};

/// Matches statefulset replicas to subcluster sizes
pub struct ScaleStatefulSetStep {
    ctx: Arc<Context>,
}

impl ScaleStatefulSetStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ReconcileStep for ScaleStatefulSetStep {
    fn name(&self) -> &'static str {
        "scale-statefulset"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        let ns = pass.vdb.namespace_or_default();
        let mut blocked = false;
        let subclusters = pass.vdb.spec.subclusters.clone();

        for sc in &subclusters {
            let name = pass.vdb.statefulset_name(&sc.name);
            if pass.vdb.current_sandbox_of(&sc.name).unwrap_or_default() != pass.facts.sandbox() {
                debug!(statefulset = %name, "subcluster belongs to another scope");
                continue;
            }
            let Some(sts) = self.ctx.kube.get_statefulset(&ns, &name).await? else {
                debug!(statefulset = %name, "statefulset not created yet");
                continue;
            };
            let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            if replicas == sc.size {
                continue;
            }

            if replicas > sc.size {
                pass.collect().await?;
                let still_in_db: Vec<String> = pass
                    .facts
                    .subcluster_pods(&sc.name)
                    .into_iter()
                    .filter(|p| p.pod_index >= sc.size && !p.db_exists.is_false())
                    .map(|p| p.name.clone())
                    .collect();
                if !still_in_db.is_empty() {
                    info!(statefulset = %name, pods = ?still_in_db, "waiting for nodes to leave before scaling down");
                    blocked = true;
                    continue;
                }
            }

            self.ctx.kube.scale_statefulset(&ns, &name, sc.size).await?;
            info!(statefulset = %name, from = replicas, to = sc.size, "statefulset scaled");
            publish(
                &self.ctx,
                &pass.vdb,
                EventType::Normal,
                reasons::SUBCLUSTER_SCALED,
                actions::SCALE,
                format!("Scaled subcluster {} from {replicas} to {} pods", sc.name, sc.size),
            )
            .await;
            pass.invalidate();
        }
        Ok(ReconcileOutcome::requeue_if(blocked))
    }
}
