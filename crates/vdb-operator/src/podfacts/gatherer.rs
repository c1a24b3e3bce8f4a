//! Fact gathering from the live cluster
//!
//! Pods are enumerated from each subcluster's statefulset. Every running pod
//! is probed with a small shell script whose YAML output is parsed into
//! [`GatherState`]; pods that are not running fall back to what status last
//! recorded for them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::{debug, instrument};

use vdb_common::crd::{Subcluster, TriState, VerticaDB};
use vdb_common::{Error, Result, SANDBOX_LABEL, SERVER_CONTAINER};

use super::{FactGatherer, FactScope, PodFact};
use crate::kube_client::KubeClient;
use crate::pod_runner::PodRunner;

/// Directory holding install indicators
pub const CONFIG_DIR: &str = "/opt/vertica/config";
/// Catalog mount
pub const CATALOG_PATH: &str = "/catalog";
/// Local data mount
pub const DATA_PATH: &str = "/data";
/// Depot mount
pub const DEPOT_PATH: &str = "/depot";
/// HTTPS TLS config written by the server once HTTPS TLS is applied
pub const HTTPS_TLS_CONFIG_FILE: &str = "/opt/vertica/config/https_certs/httpstls.json";

/// Install indicator path for a VerticaDB
pub fn install_indicator_path(vdb: &VerticaDB) -> String {
    format!(
        "{CONFIG_DIR}/install-indicator-{}",
        vdb.uid().unwrap_or_default()
    )
}

/// State reported by the gather script
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GatherState {
    /// Install indicator file exists
    pub install_indicator_exists: bool,
    /// A catalog directory for this database exists
    pub db_exists: bool,
    /// Node name derived from the catalog directory
    pub vnode_name: Option<String>,
    /// HTTPS health endpoint answered 200
    pub up_node: bool,
    /// Node reports READONLY state
    pub read_only: bool,
    /// Existence of well-known files
    pub file_exists: BTreeMap<String, bool>,
    /// Existence of well-known directories
    pub dir_exists: BTreeMap<String, bool>,
    /// Bytes used on the local data volume
    pub local_data_size: i64,
    /// Bytes used by the depot
    pub depot_size: i64,
    /// Shards this node subscribes to
    pub shard_subscriptions: i32,
}

impl GatherState {
    /// Parse the script output
    pub fn parse(pod: &str, output: &str) -> Result<Self> {
        serde_yaml::from_str(output)
            .map_err(|e| Error::fact_collection(pod, format!("cannot parse gather output: {e}")))
    }
}

fn gather_script(vdb: &VerticaDB) -> String {
    let indicator = install_indicator_path(vdb);
    let db = &vdb.spec.db_name;
    let su = vdb.superuser();
    format!(
        r#"
exists() {{ if [ -e "$1" ]; then echo true; else echo false; fi; }}
echo "installIndicatorExists: $(exists {indicator})"
catdir=$(ls -d {CATALOG_PATH}/{db}/v_*_catalog 2>/dev/null | head -1)
if [ -n "$catdir" ]; then
  echo "dbExists: true"
  echo "vnodeName: $(basename "$catdir" | sed 's/_catalog$//')"
else
  echo "dbExists: false"
fi
code=$(curl -sk -o /dev/null -w '%{{http_code}}' https://localhost:8443/v1/health 2>/dev/null)
if [ "$code" = "200" ]; then
  echo "upNode: true"
  ro=$(vsql -U {su} -tAc "select count(*) from nodes where node_name = local_node_name() and node_state = 'READONLY'" 2>/dev/null)
  if [ "$ro" = "1" ]; then echo "readOnly: true"; else echo "readOnly: false"; fi
  shards=$(vsql -U {su} -tAc "select count(*) from node_subscriptions where node_name = local_node_name() and shard_name <> 'replica'" 2>/dev/null)
  echo "shardSubscriptions: ${{shards:-0}}"
else
  echo "upNode: false"
fi
echo "localDataSize: $(df --output=used -B1 {DATA_PATH} 2>/dev/null | tail -1 | tr -d ' ' | grep . || echo 0)"
echo "depotSize: $(du -sb {DEPOT_PATH} 2>/dev/null | cut -f1 | grep . || echo 0)"
echo "fileExists:"
echo "  \"{HTTPS_TLS_CONFIG_FILE}\": $(exists {HTTPS_TLS_CONFIG_FILE})"
echo "dirExists:"
for d in {CATALOG_PATH} {DATA_PATH} {DEPOT_PATH}; do echo "  \"$d\": $(exists $d)"; done
"#
    )
}

fn server_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == SERVER_CONTAINER))
        .and_then(|c| c.state.as_ref())
        .is_some_and(|s| s.running.is_some())
}

fn server_image(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == SERVER_CONTAINER)?
        .image
        .clone()
}

/// Gathers facts by reading statefulsets and pods and probing running pods
pub struct ClusterFactGatherer {
    kube: Arc<dyn KubeClient>,
    runner: Arc<dyn PodRunner>,
}

impl ClusterFactGatherer {
    /// Create a gatherer
    pub fn new(kube: Arc<dyn KubeClient>, runner: Arc<dyn PodRunner>) -> Self {
        Self { kube, runner }
    }

    fn subcluster_sandbox(vdb: &VerticaDB, subcluster: &str, sts: Option<&StatefulSet>) -> String {
        vdb.current_sandbox_of(subcluster)
            .map(str::to_string)
            .or_else(|| sts.and_then(|s| s.labels().get(SANDBOX_LABEL).cloned()))
            .unwrap_or_default()
    }

    async fn gather_pod(
        &self,
        vdb: &VerticaDB,
        scope: &FactScope,
        subcluster: &Subcluster,
        sandbox: &str,
        index: i32,
    ) -> Result<PodFact> {
        let ns = vdb.namespace_or_default();
        let name = vdb.pod_name(&subcluster.name, index);
        let mut fact = PodFact {
            dns_name: format!("{name}.{}.{ns}", vdb.name_any()),
            name: name.clone(),
            subcluster: subcluster.name.clone(),
            sandbox: sandbox.to_string(),
            pod_index: index,
            image: if sandbox.is_empty() {
                vdb.spec.image.clone()
            } else {
                vdb.sandbox_image(sandbox).to_string()
            },
            is_primary: subcluster.is_primary(),
            pending_delete: index >= subcluster.size,
            up_node: TriState::False,
            ..Default::default()
        };

        let pod = self.kube.get_pod(&ns, &name).await?;
        if let Some(pod) = &pod {
            fact.exists = true;
            fact.running = server_running(pod);
            fact.pod_ip = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default();
            if let Some(image) = server_image(pod) {
                fact.image = image;
            }
        }

        if !fact.running {
            let recorded = vdb
                .subcluster_status(&subcluster.name)
                .and_then(|s| usize::try_from(index).ok().and_then(|i| s.detail.get(i)));
            if let Some(detail) = recorded {
                fact.installed = detail.installed.into();
                fact.db_exists = detail.added_to_db.into();
                fact.vnode_name = detail.vnode_name.clone();
            }
            return Ok(fact);
        }

        let script = gather_script(vdb);
        let output = match scope.su_password.as_deref().filter(|p| !p.is_empty()) {
            Some(pw) => {
                let command = vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    format!("read -r VSQL_PASSWORD && export VSQL_PASSWORD\n{script}"),
                ];
                self.runner
                    .exec_with_input(&ns, &name, SERVER_CONTAINER, command, format!("{pw}\n"))
                    .await?
            }
            None => {
                let command = vec!["bash".to_string(), "-c".to_string(), script];
                self.runner
                    .exec(&ns, &name, SERVER_CONTAINER, command)
                    .await?
            }
        };
        if !output.success {
            return Err(Error::fact_collection(&name, output.stderr));
        }
        let state = GatherState::parse(&name, &output.stdout)?;

        fact.installed = state.install_indicator_exists.into();
        fact.db_exists = state.db_exists.into();
        fact.up_node = state.up_node.into();
        fact.read_only = state.read_only;
        fact.vnode_name = state.vnode_name;
        fact.file_exists = state.file_exists;
        fact.dir_exists = state.dir_exists;
        fact.local_data_size = state.local_data_size;
        fact.depot_size = state.depot_size;
        fact.shard_subscriptions = state.shard_subscriptions;
        Ok(fact)
    }
}

#[async_trait]
impl FactGatherer for ClusterFactGatherer {
    #[instrument(skip(self, vdb, scope), fields(vdb = %vdb.name_any(), sandbox = %scope.sandbox))]
    async fn gather(&self, vdb: &VerticaDB, scope: &FactScope) -> Result<Vec<PodFact>> {
        let ns = vdb.namespace_or_default();
        let mut targets = Vec::new();

        for subcluster in &vdb.spec.subclusters {
            let sts = self
                .kube
                .get_statefulset(&ns, &vdb.statefulset_name(&subcluster.name))
                .await?;
            let sandbox = Self::subcluster_sandbox(vdb, &subcluster.name, sts.as_ref());
            // Sandbox scopes only see their own pods; the main scope sees all
            if !scope.sandbox.is_empty() && sandbox != scope.sandbox {
                continue;
            }
            let replicas = sts
                .as_ref()
                .and_then(|s| s.spec.as_ref())
                .and_then(|s| s.replicas)
                .unwrap_or(0);
            for index in 0..replicas.max(subcluster.size) {
                targets.push((subcluster, sandbox.clone(), index));
            }
        }

        debug!(pods = targets.len(), "probing pods");
        try_join_all(
            targets
                .iter()
                .map(|(sc, sandbox, index)| self.gather_pod(vdb, scope, sc, sandbox, *index)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::pod_runner::{ExecOutput, MockPodRunner};
    use crate::testing::{running_pod, sample_vdb, statefulset};
    use vdb_common::crd::{SubclusterPodStatus, SubclusterStatus, VerticaDBStatus};

    const UP_OUTPUT: &str = r#"
installIndicatorExists: true
dbExists: true
vnodeName: v_vertdb_node0001
upNode: true
readOnly: false
shardSubscriptions: 4
localDataSize: 1024
depotSize: 2048
fileExists:
  "/opt/vertica/config/https_certs/httpstls.json": true
dirExists:
  "/catalog": true
  "/data": true
  "/depot": false
"#;

    #[test]
    fn parses_gather_output() {
        let state = GatherState::parse("p", UP_OUTPUT).expect("parse");
        assert!(state.install_indicator_exists);
        assert!(state.up_node);
        assert_eq!(state.vnode_name.as_deref(), Some("v_vertdb_node0001"));
        assert_eq!(state.shard_subscriptions, 4);
        assert_eq!(state.file_exists.get(HTTPS_TLS_CONFIG_FILE), Some(&true));
        assert_eq!(state.dir_exists.get(DEPOT_PATH), Some(&false));
    }

    #[test]
    fn missing_fields_default_to_false() {
        let state = GatherState::parse("p", "installIndicatorExists: false\nupNode: false\n")
            .expect("parse");
        assert!(!state.db_exists);
        assert!(state.vnode_name.is_none());
    }

    #[test]
    fn garbage_output_is_a_collection_error() {
        let err = GatherState::parse("vertdb-sc1-0", "[[[").expect_err("should fail");
        assert!(matches!(err, Error::FactCollection { .. }));
    }

    #[test]
    fn script_probes_the_install_indicator_of_this_database() {
        let mut vdb = sample_vdb("vertdb");
        vdb.metadata.uid = Some("abc-123".to_string());
        let script = gather_script(&vdb);
        assert!(script.contains("/opt/vertica/config/install-indicator-abc-123"));
        assert!(script.contains("/catalog/vertdb/v_*_catalog"));
    }

    #[tokio::test]
    async fn story_scale_down_leaves_pending_delete_pods_and_stopped_pods_from_status() {
        // sc1 has size 2 but the statefulset still runs 3 replicas; pod 1 is stopped
        let mut vdb = sample_vdb("vertdb");
        vdb.spec.subclusters[0].size = 2;
        vdb.status = Some(VerticaDBStatus {
            subclusters: vec![SubclusterStatus {
                name: "sc1".to_string(),
                detail: vec![
                    SubclusterPodStatus::default(),
                    SubclusterPodStatus {
                        installed: true,
                        added_to_db: true,
                        vnode_name: Some("v_vertdb_node0002".to_string()),
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        });

        let mut kube = MockKubeClient::new();
        kube.expect_get_statefulset()
            .returning(|_, name| Ok(Some(statefulset(name, 3, None))));
        kube.expect_get_pod().returning(|_, name| {
            if name == "vertdb-sc1-1" {
                Ok(None)
            } else {
                Ok(Some(running_pod(name, "10.0.0.1")))
            }
        });
        let mut runner = MockPodRunner::new();
        runner
            .expect_exec()
            .times(2)
            .returning(|_, _, _, _| Ok(ExecOutput::ok(UP_OUTPUT)));

        let gatherer = ClusterFactGatherer::new(Arc::new(kube), Arc::new(runner));
        let mut facts = gatherer
            .gather(&vdb, &FactScope::default())
            .await
            .expect("gather");
        facts.sort_by_key(|p| p.pod_index);

        assert_eq!(facts.len(), 3);
        assert!(facts[0].up_node.is_true());
        assert_eq!(facts[0].dns_name, "vertdb-sc1-0.vertdb.default");

        assert!(!facts[1].exists);
        assert!(facts[1].installed.is_true());
        assert!(facts[1].db_exists.is_true());
        assert!(facts[1].up_node.is_false());

        assert!(facts[2].pending_delete);
        assert!(!facts[0].pending_delete);
    }

    #[tokio::test]
    async fn sandbox_scope_skips_main_cluster_subclusters() {
        let vdb = sample_vdb("vertdb");
        let mut kube = MockKubeClient::new();
        kube.expect_get_statefulset()
            .returning(|_, name| Ok(Some(statefulset(name, 3, None))));
        let gatherer = ClusterFactGatherer::new(Arc::new(kube), Arc::new(MockPodRunner::new()));

        let scope = FactScope {
            sandbox: "sandbox1".to_string(),
            su_password: None,
        };
        let facts = gatherer.gather(&vdb, &scope).await.expect("gather");
        assert!(facts.is_empty());
    }

    #[tokio::test]
    async fn sandbox_label_on_statefulset_places_pods() {
        let vdb = sample_vdb("vertdb");
        let mut kube = MockKubeClient::new();
        kube.expect_get_statefulset()
            .returning(|_, name| Ok(Some(statefulset(name, 1, Some("sandbox1")))));
        kube.expect_get_pod().returning(|_, _| Ok(None));
        let gatherer = ClusterFactGatherer::new(Arc::new(kube), Arc::new(MockPodRunner::new()));

        let scope = FactScope {
            sandbox: "sandbox1".to_string(),
            su_password: None,
        };
        let facts = gatherer.gather(&vdb, &scope).await.expect("gather");
        // size 3 wins over the single replica
        assert_eq!(facts.len(), 3);
        assert!(facts.iter().all(|p| p.sandbox == "sandbox1"));
    }

    #[tokio::test]
    async fn password_is_passed_on_stdin() {
        let vdb = sample_vdb("vertdb");
        let mut kube = MockKubeClient::new();
        kube.expect_get_statefulset()
            .returning(|_, name| Ok(Some(statefulset(name, 1, None))));
        kube.expect_get_pod()
            .returning(|_, name| Ok(Some(running_pod(name, "10.0.0.1"))));
        let mut runner = MockPodRunner::new();
        runner
            .expect_exec_with_input()
            .withf(|_, _, _, cmd, input| {
                cmd[2].starts_with("read -r VSQL_PASSWORD")
                    && !cmd.iter().any(|c| c.contains("s3cr3t"))
                    && input == "s3cr3t\n"
            })
            .times(3)
            .returning(|_, _, _, _, _| Ok(ExecOutput::ok(UP_OUTPUT)));
        runner.expect_exec().never();

        let gatherer = ClusterFactGatherer::new(Arc::new(kube), Arc::new(runner));
        let scope = FactScope {
            sandbox: String::new(),
            su_password: Some("s3cr3t".to_string()),
        };
        let facts = gatherer.gather(&vdb, &scope).await.expect("gather");
        assert_eq!(facts.len(), 3);
    }
}
