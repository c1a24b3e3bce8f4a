//! Per-subcluster progress counters
//!
//! Copies what the facts confirm into `status.subclusters[]` and flips
//! `DBInitialized` once a primary reports the database. Facts that are
//! unknown leave the recorded detail untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use vdb_common::crd::{conditions, Condition, TriState, VerticaDB, VerticaDBStatus};
use vdb_common::Result;

use super::{pod_detail_mut, recount};
use crate::context::Context;
use crate::podfacts::PodFacts;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::update_status;

#[derive(Clone, Debug)]
struct ObservedPod {
    index: i32,
    installed: TriState,
    db_exists: TriState,
    up: bool,
    vnode_name: Option<String>,
}

#[derive(Clone, Debug)]
struct ObservedSubcluster {
    name: String,
    size: i32,
    pods: Vec<ObservedPod>,
}

fn observe(vdb: &VerticaDB, facts: &PodFacts) -> Vec<ObservedSubcluster> {
    // Sandboxed subclusters are counted by the sandbox's own pass
    vdb.spec
        .subclusters
        .iter()
        .filter(|sc| facts.is_in_scope(vdb, &sc.name))
        .map(|sc| ObservedSubcluster {
            name: sc.name.clone(),
            size: sc.size,
            pods: facts
                .subcluster_pods(&sc.name)
                .into_iter()
                .map(|p| ObservedPod {
                    index: p.pod_index,
                    installed: p.installed,
                    db_exists: p.db_exists,
                    up: p.up_node.is_true(),
                    vnode_name: p.vnode_name.clone(),
                })
                .collect(),
        })
        .collect()
}

fn apply(status: &mut VerticaDBStatus, observed: &[ObservedSubcluster], db_exists: bool) {
    for sc in observed {
        let entry = status.subcluster_mut(&sc.name);
        let rows = sc
            .pods
            .iter()
            .map(|p| p.index + 1)
            .max()
            .unwrap_or(0)
            .max(sc.size);
        entry.detail.truncate(usize::try_from(rows).unwrap_or_default());

        for pod in &sc.pods {
            let detail = pod_detail_mut(entry, pod.index);
            if !pod.installed.is_unknown() {
                detail.installed = pod.installed.is_true();
            }
            if !pod.db_exists.is_unknown() {
                detail.added_to_db = pod.db_exists.is_true();
            }
            if pod.vnode_name.is_some() {
                detail.vnode_name = pod.vnode_name.clone();
            }
        }
        entry.up_node_count = i32::try_from(sc.pods.iter().filter(|p| p.up).count()).unwrap_or(i32::MAX);
        recount(entry);
    }

    if db_exists && !status.is_condition_true(conditions::DB_INITIALIZED) {
        status.set_condition(Condition::truthy(conditions::DB_INITIALIZED, "Initialized"));
    }
}

/// Keeps `status.subclusters[]` in line with the pod facts
pub struct StatusStep {
    ctx: Arc<Context>,
}

impl StatusStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ReconcileStep for StatusStep {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        pass.collect().await?;
        let observed = observe(&pass.vdb, &pass.facts);
        let db_exists = pass.facts.does_db_exist();
        debug!(subclusters = observed.len(), db_exists, "refreshing subcluster status");

        update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| {
            apply(status, &observed, db_exists)
        })
        .await?;
        Ok(ReconcileOutcome::Done)
    }
}
