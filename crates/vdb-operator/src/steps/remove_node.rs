//! Removing nodes of pods that are about to be scaled away
//!
//! Pods whose ordinal is at or beyond the subcluster size are pending delete.
//! Their nodes leave the database before the statefulset shrinks. One pod
//! that cannot be judged yet only delays itself; the others are removed.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::info;

use vdb_common::events::{actions, reasons};
use vdb_common::Result;

use super::{is_schedule_only, pod_detail_mut, publish, recount};
use crate::context::Context;
use crate::dispatcher::RemoveNodeOptions;
use crate::podfacts::PodFact;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::update_status;

/// Removes database nodes of pending-delete pods
pub struct RemoveNodeStep {
    ctx: Arc<Context>,
}

impl RemoveNodeStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ReconcileStep for RemoveNodeStep {
    fn name(&self) -> &'static str {
        "remove-node"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        if is_schedule_only(&pass.vdb) {
            return Ok(ReconcileOutcome::Done);
        }
        pass.collect().await?;
        // Facts from an older spec may point at the wrong pods
        if pass.facts.vdb_resource_version() != pass.vdb.resource_version().as_deref() {
            info!("VerticaDB changed since facts were collected");
            return Ok(ReconcileOutcome::RequeueNow);
        }

        let mut requeue = false;
        let mut targets: Vec<PodFact> = Vec::new();
        for sc in &pass.vdb.spec.subclusters {
            for pod in pass.facts.subcluster_pods(&sc.name) {
                if !pod.pending_delete || pod.db_exists.is_false() {
                    continue;
                }
                if pod.db_exists.is_unknown() || !pod.running {
                    info!(pod = %pod.name, "cannot remove node of pod yet");
                    requeue = true;
                    continue;
                }
                targets.push(pod.clone());
            }
        }
        if targets.is_empty() {
            return Ok(ReconcileOutcome::requeue_if(requeue));
        }

        let Some(initiator) = pass.facts.find_pod_to_run_admin_cmd_any().map(PodFact::initiator)
        else {
            info!("no pod to drive remove node");
            return Ok(ReconcileOutcome::RequeueNow);
        };

        targets.sort_by(|a, b| a.dns_name.cmp(&b.dns_name));
        let names = targets
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::REMOVE_NODES_START,
            actions::SCALE,
            format!("Removing pods {names} from the database"),
        )
        .await;

        let opts = RemoveNodeOptions {
            initiator,
            hosts: targets.iter().map(|p| p.pod_ip.clone()).collect(),
        };
        if let Err(e) = self.ctx.dispatcher.remove_node(&pass.vdb, opts).await {
            publish(
                &self.ctx,
                &pass.vdb,
                EventType::Warning,
                reasons::REMOVE_NODES_FAILED,
                actions::SCALE,
                format!("Failed to remove pods {names}: {e}"),
            )
            .await;
            return Err(e);
        }
        info!(vdb = %pass.vdb.name_any(), pods = %names, "nodes removed");
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::REMOVE_NODES_SUCCEEDED,
            actions::SCALE,
            format!("Removed pods {names} from the database"),
        )
        .await;

        let removed: Vec<(String, i32)> = targets
            .iter()
            .map(|p| (p.subcluster.clone(), p.pod_index))
            .collect();
        update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| {
            for (sc, index) in &removed {
                let entry = status.subcluster_mut(sc);
                let detail = pod_detail_mut(entry, *index);
                detail.added_to_db = false;
                detail.vnode_name = None;
                recount(entry);
            }
        })
        .await?;
        pass.invalidate();
        Ok(ReconcileOutcome::requeue_if(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdb_common::crd::{SubclusterPodStatus, VerticaDBStatus};

    use crate::dispatcher::MockDispatcher;
    use crate::podfacts::{MockFactGatherer, PodFacts};
    use crate::testing::{
        pod_fact, running_fact, sample_vdb, stored_kube, stored_status, up_fact, FakeCluster,
        RecordingEventPublisher,
    };

    fn pending(mut fact: PodFact) -> PodFact {
        fact.pending_delete = true;
        fact
    }

    /// Size 2 with five ordinals recorded as database nodes
    fn shrunk_vdb() -> vdb_common::crd::VerticaDB {
        let mut vdb = sample_vdb("vertdb");
        vdb.spec.subclusters[0].size = 2;
        let mut status = VerticaDBStatus::default();
        let entry = status.subcluster_mut("sc1");
        entry.detail = vec![
            SubclusterPodStatus {
                installed: true,
                added_to_db: true,
                vnode_name: None,
            };
            5
        ];
        recount(entry);
        vdb.status = Some(status);
        vdb
    }

    #[tokio::test]
    async fn story_undecidable_pod_does_not_block_the_others() {
        let vdb = shrunk_vdb();
        let (kube, store) = stored_kube(vdb.clone());
        let cluster = FakeCluster::new(vec![
            up_fact("sc1", 0),
            up_fact("sc1", 1),
            pending(up_fact("sc1", 2)),
            // Stopped, database state unknown
            pending(pod_fact("sc1", 3)),
            // Never joined
            pending(running_fact("sc1", 4)),
        ]);
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_remove_node()
            .withf(|_, opts| {
                opts.hosts == vec!["10.0.0.3".to_string()] && opts.initiator.pod_name == "vertdb-sc1-0"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let events = RecordingEventPublisher::new();
        let ctx = Arc::new(
            Context::for_testing(Arc::new(kube))
                .with_dispatcher(Arc::new(dispatcher))
                .with_events(Arc::new(events.clone())),
        );

        let mut pass = cluster.pass(vdb);
        let outcome = RemoveNodeStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::RequeueNow);
        assert_eq!(
            events.reasons(),
            vec![reasons::REMOVE_NODES_START, reasons::REMOVE_NODES_SUCCEEDED]
        );
        let sc1 = stored_status(&store).subcluster("sc1").cloned().expect("sc1");
        assert!(!sc1.detail[2].added_to_db);
        assert!(sc1.detail[3].added_to_db);
        assert_eq!(sc1.added_to_db_count, 4);
        assert!(pass.facts.needs_collection());
    }

    #[tokio::test]
    async fn changed_resource_version_requeues() {
        let vdb = shrunk_vdb();
        let (kube, _) = stored_kube(vdb.clone());
        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_remove_node().never();
        let ctx = Arc::new(Context::for_testing(Arc::new(kube)).with_dispatcher(Arc::new(dispatcher)));

        let mut facts = PodFacts::new(Arc::new(MockFactGatherer::new()));
        facts.install(vec![up_fact("sc1", 0), pending(up_fact("sc1", 2))], Some("0"));
        let mut pass = Pass::new(vdb, facts);
        let outcome = RemoveNodeStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::RequeueNow);
    }

    #[tokio::test]
    async fn failure_keeps_status_and_reports() {
        let vdb = shrunk_vdb();
        let (kube, store) = stored_kube(vdb.clone());
        let cluster = FakeCluster::new(vec![up_fact("sc1", 0), pending(up_fact("sc1", 2))]);
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_remove_node()
            .returning(|_, _| Err(vdb_common::Error::admin("remove_node", "node is busy")));
        let events = RecordingEventPublisher::new();
        let ctx = Arc::new(
            Context::for_testing(Arc::new(kube))
                .with_dispatcher(Arc::new(dispatcher))
                .with_events(Arc::new(events.clone())),
        );

        let mut pass = cluster.pass(vdb);
        assert!(RemoveNodeStep::new(ctx).reconcile(&mut pass).await.is_err());
        assert_eq!(events.notes_for(reasons::REMOVE_NODES_FAILED).len(), 1);
        let sc1 = stored_status(&store).subcluster("sc1").cloned().expect("sc1");
        assert!(sc1.detail[2].added_to_db);
    }

    #[tokio::test]
    async fn nothing_pending_is_done() {
        let vdb = sample_vdb("vertdb");
        let (kube, _) = stored_kube(vdb.clone());
        let cluster = FakeCluster::new((0..3).map(|i| up_fact("sc1", i)).collect());
        let ctx = Arc::new(Context::for_testing(Arc::new(kube)));

        let mut pass = cluster.pass(vdb);
        let outcome = RemoveNodeStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Done);
    }
}
