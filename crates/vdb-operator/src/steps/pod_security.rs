//! Backfill of the server's UID and fsGroup
//!
//! Only runs before the database is initialized. On OpenShift the namespace
//! carries the id ranges the pods must run in; elsewhere fixed defaults apply.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use vdb_common::crd::PodSecurityIds;
use vdb_common::Result;

use crate::context::Context;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::update_spec;

/// UID used when nothing else applies
pub const DEFAULT_RUN_AS_USER: i64 = 5000;
/// fsGroup used when nothing else applies
pub const DEFAULT_FS_GROUP: i64 = 5000;
/// Namespace annotation with the supplemental group range
pub const OPENSHIFT_GROUP_RANGE_ANNOTATION: &str = "openshift.io/sa.scc.supplemental-groups";
/// Namespace annotation with the UID range
pub const OPENSHIFT_UID_RANGE_ANNOTATION: &str = "openshift.io/sa.scc.uid-range";

/// First id of an OpenShift range (`<first>/<size>` or `<first>-<last>`)
fn first_id(range: &str) -> Option<i64> {
    let first = range.split(['/', '-']).next()?;
    first.trim().parse().ok()
}

fn id_from(annotations: &BTreeMap<String, String>, key: &str, default: i64) -> i64 {
    annotations
        .get(key)
        .and_then(|v| first_id(v))
        .unwrap_or(default)
}

/// Fills in `spec.podSecurityContext` ids that are unset
pub struct PodSecurityStep {
    ctx: Arc<Context>,
}

impl PodSecurityStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Ids from the namespace, or the defaults
    async fn initial_ids(&self, namespace: &str) -> Result<(i64, i64)> {
        // A namespace scoped operator cannot read namespaces
        if self.ctx.config.namespace_scoped {
            debug!("namespace scoped, using default pod security ids");
            return Ok((DEFAULT_FS_GROUP, DEFAULT_RUN_AS_USER));
        }
        let annotations = self
            .ctx
            .kube
            .get_namespace(namespace)
            .await?
            .and_then(|ns| ns.metadata.annotations)
            .unwrap_or_default();
        Ok((
            id_from(&annotations, OPENSHIFT_GROUP_RANGE_ANNOTATION, DEFAULT_FS_GROUP),
            id_from(&annotations, OPENSHIFT_UID_RANGE_ANNOTATION, DEFAULT_RUN_AS_USER),
        ))
    }
}

#[async_trait]
impl ReconcileStep for PodSecurityStep {
    fn name(&self) -> &'static str {
        "pod-security"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        if pass.vdb.is_db_initialized() {
            return Ok(ReconcileOutcome::Done);
        }
        let current = pass.vdb.spec.pod_security_context.clone().unwrap_or_default();
        if current.fs_group.is_some() && current.run_as_user.is_some() {
            return Ok(ReconcileOutcome::Done);
        }

        let (fs_group, run_as_user) = self.initial_ids(&pass.vdb.namespace_or_default()).await?;
        info!(fs_group, run_as_user, "backfilling pod security context");
        update_spec(self.ctx.kube.as_ref(), &mut pass.vdb, |spec| {
            let psc = spec.pod_security_context.get_or_insert_with(PodSecurityIds::default);
            psc.fs_group.get_or_insert(fs_group);
            psc.run_as_user.get_or_insert(run_as_user);
        })
        .await?;
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;
    use rstest::rstest;

    use crate::config::ReconcilerConfig;
    use crate::testing::{initialized, sample_vdb, stored_kube};

    fn openshift_namespace() -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some("default".to_string()),
                annotations: Some(BTreeMap::from([
                    (
                        OPENSHIFT_GROUP_RANGE_ANNOTATION.to_string(),
                        "1000650000/10000".to_string(),
                    ),
                    (
                        OPENSHIFT_UID_RANGE_ANNOTATION.to_string(),
                        "1000660000-1000669999".to_string(),
                    ),
                ])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[rstest]
    #[case("1000650000/10000", Some(1000650000))]
    #[case("1000-2000", Some(1000))]
    #[case("garbage", None)]
    fn parses_openshift_ranges(#[case] range: &str, #[case] expected: Option<i64>) {
        assert_eq!(first_id(range), expected);
    }

    #[tokio::test]
    async fn story_openshift_ranges_seed_the_ids() {
        let vdb = sample_vdb("vertdb");
        let (mut kube, store) = stored_kube(vdb.clone());
        kube.expect_get_namespace()
            .returning(|_| Ok(Some(openshift_namespace())));
        let ctx = Arc::new(Context::for_testing(Arc::new(kube)));

        let mut pass = crate::testing::FakeCluster::default().pass(vdb);
        PodSecurityStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");

        let psc = store.lock().expect("lock").spec.pod_security_context.clone();
        assert_eq!(
            psc,
            Some(PodSecurityIds {
                fs_group: Some(1000650000),
                run_as_user: Some(1000660000),
            })
        );
    }

    #[tokio::test]
    async fn namespace_scoped_operator_uses_defaults_and_keeps_set_ids() {
        let mut vdb = sample_vdb("vertdb");
        vdb.spec.pod_security_context = Some(PodSecurityIds {
            fs_group: None,
            run_as_user: Some(7000),
        });
        let (mut kube, store) = stored_kube(vdb.clone());
        kube.expect_get_namespace().never();
        let ctx = Arc::new(
            Context::for_testing(Arc::new(kube)).with_config(ReconcilerConfig {
                namespace_scoped: true,
                ..Default::default()
            }),
        );

        let mut pass = crate::testing::FakeCluster::default().pass(vdb);
        PodSecurityStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");

        let psc = store.lock().expect("lock").spec.pod_security_context.clone();
        assert_eq!(
            psc,
            Some(PodSecurityIds {
                fs_group: Some(DEFAULT_FS_GROUP),
                run_as_user: Some(7000),
            })
        );
    }

    #[tokio::test]
    async fn initialized_database_is_left_alone() {
        let vdb = initialized(sample_vdb("vertdb"));
        let (mut kube, _) = stored_kube(vdb.clone());
        kube.expect_get_namespace().never();
        let ctx = Arc::new(Context::for_testing(Arc::new(kube)));

        let mut pass = crate::testing::FakeCluster::default().pass(vdb);
        let outcome = PodSecurityStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert!(pass.vdb.spec.pod_security_context.is_none());
    }
}
