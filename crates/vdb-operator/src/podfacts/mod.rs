//! Observed state of database pods
//!
//! [`PodFacts`] is a per-pass snapshot, collected lazily on first use and
//! invalidated by any step that changes cluster topology. A snapshot is
//! scoped to the main cluster (`sandbox == ""`) or to one sandbox; finders
//! only consider pods of that scope and return them sorted by DNS name so
//! initiator selection is reproducible.

mod gatherer;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use vdb_common::crd::{TriState, VerticaDB};
use vdb_common::Result;

use crate::dispatcher::Initiator;

pub use gatherer::{install_indicator_path, ClusterFactGatherer, GatherState, CONFIG_DIR};

/// Facts about one pod
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodFact {
    /// Pod name
    pub name: String,
    /// Subcluster the pod belongs to
    pub subcluster: String,
    /// Sandbox the pod's subcluster is in, empty for the main cluster
    pub sandbox: String,
    /// Ordinal within the statefulset
    pub pod_index: i32,
    /// Fully qualified DNS name
    pub dns_name: String,
    /// Pod IP, empty when not scheduled
    pub pod_ip: String,
    /// Image the server container runs
    pub image: String,
    /// Whether the subcluster is a primary
    pub is_primary: bool,
    /// Whether the pod object exists
    pub exists: bool,
    /// Whether the server container is running
    pub running: bool,
    /// Ordinal is beyond the subcluster size
    pub pending_delete: bool,
    /// Install indicator present
    pub installed: TriState,
    /// A node for this pod exists in the database
    pub db_exists: TriState,
    /// The node is up
    pub up_node: TriState,
    /// The node is up but read-only
    pub read_only: bool,
    /// Node name inside the database
    pub vnode_name: Option<String>,
    /// Existence of well-known files
    pub file_exists: BTreeMap<String, bool>,
    /// Existence of well-known directories
    pub dir_exists: BTreeMap<String, bool>,
    /// Depot size in bytes
    pub depot_size: i64,
    /// Size of the local data volume in bytes
    pub local_data_size: i64,
    /// Number of shards the node subscribes to
    pub shard_subscriptions: i32,
}

impl PodFact {
    /// Initiator pointing at this pod
    pub fn initiator(&self) -> Initiator {
        Initiator {
            pod_name: self.name.clone(),
            ip: self.pod_ip.clone(),
        }
    }

    /// Up and able to take writes
    pub fn is_up_writable(&self) -> bool {
        self.up_node.is_true() && !self.read_only
    }
}

/// What a gather should cover
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FactScope {
    /// Sandbox to gather, empty for the main cluster
    pub sandbox: String,
    /// Superuser password used by in-pod probes
    pub su_password: Option<String>,
}

/// Source of pod facts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FactGatherer: Send + Sync {
    /// Gather facts for every pod of `vdb` relevant to `scope`
    async fn gather(&self, vdb: &VerticaDB, scope: &FactScope) -> Result<Vec<PodFact>>;
}

/// Snapshot of pod facts for one pass
pub struct PodFacts {
    detail: BTreeMap<String, PodFact>,
    vdb_resource_version: Option<String>,
    need_collection: bool,
    sandbox: String,
    su_password: Option<String>,
    gatherer: Arc<dyn FactGatherer>,
}

impl std::fmt::Debug for PodFacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodFacts")
            .field("sandbox", &self.sandbox)
            .field("need_collection", &self.need_collection)
            .field("pods", &self.detail.len())
            .finish()
    }
}

impl PodFacts {
    /// Empty snapshot for the main cluster
    pub fn new(gatherer: Arc<dyn FactGatherer>) -> Self {
        Self::for_sandbox(gatherer, "")
    }

    /// Empty snapshot scoped to one sandbox
    pub fn for_sandbox(gatherer: Arc<dyn FactGatherer>, sandbox: impl Into<String>) -> Self {
        Self {
            detail: BTreeMap::new(),
            vdb_resource_version: None,
            need_collection: true,
            sandbox: sandbox.into(),
            su_password: None,
            gatherer,
        }
    }

    /// Fresh, uncollected snapshot for a sandbox sharing this one's gatherer and password
    pub fn copy_for_sandbox(&self, sandbox: &str) -> Self {
        let mut copy = Self::for_sandbox(self.gatherer.clone(), sandbox);
        copy.su_password = self.su_password.clone();
        copy
    }

    /// Collect facts if the snapshot is stale
    pub async fn collect(&mut self, vdb: &VerticaDB) -> Result<()> {
        if !self.need_collection {
            return Ok(());
        }
        let scope = FactScope {
            sandbox: self.sandbox.clone(),
            su_password: self.su_password.clone(),
        };
        let pods = self.gatherer.gather(vdb, &scope).await?;
        debug!(db = %vdb.name_any(), sandbox = %self.sandbox, pods = pods.len(), "collected pod facts");

        self.detail = pods.into_iter().map(|p| (p.name.clone(), p)).collect();
        self.vdb_resource_version = vdb.resource_version();
        self.need_collection = false;
        Ok(())
    }

    /// Mark the snapshot stale so the next `collect` gathers again
    pub fn invalidate(&mut self) {
        self.need_collection = true;
    }

    /// Whether the next `collect` will gather
    pub fn needs_collection(&self) -> bool {
        self.need_collection
    }

    /// resourceVersion of the VerticaDB when facts were collected
    pub fn vdb_resource_version(&self) -> Option<&str> {
        self.vdb_resource_version.as_deref()
    }

    /// Sandbox this snapshot covers, empty for the main cluster
    pub fn sandbox(&self) -> &str {
        &self.sandbox
    }

    /// Superuser password known to this pass
    pub fn su_password(&self) -> Option<&str> {
        self.su_password.as_deref()
    }

    /// Replace the superuser password after a rotation
    pub fn set_su_password(&mut self, password: impl Into<String>) {
        self.su_password = Some(password.into());
    }

    /// Install facts directly without a gather
    #[cfg(test)]
    pub fn install(&mut self, pods: Vec<PodFact>, resource_version: Option<&str>) {
        self.detail = pods.into_iter().map(|p| (p.name.clone(), p)).collect();
        self.vdb_resource_version = resource_version.map(str::to_string);
        self.need_collection = false;
    }

    /// Lookup by pod name, regardless of scope
    pub fn get(&self, pod: &str) -> Option<&PodFact> {
        self.detail.get(pod)
    }

    /// Every gathered pod regardless of scope, sorted by DNS name
    pub fn all_pods(&self) -> Vec<&PodFact> {
        let mut pods: Vec<&PodFact> = self.detail.values().collect();
        pods.sort_by(|a, b| a.dns_name.cmp(&b.dns_name));
        pods
    }

    /// Pods in this snapshot's scope, sorted by DNS name
    pub fn pods(&self) -> Vec<&PodFact> {
        self.all_pods()
            .into_iter()
            .filter(|p| p.sandbox == self.sandbox)
            .collect()
    }

    /// In-scope pods of one subcluster ordered by pod index
    pub fn subcluster_pods(&self, subcluster: &str) -> Vec<&PodFact> {
        let mut pods: Vec<&PodFact> = self
            .detail
            .values()
            .filter(|p| p.subcluster == subcluster && p.sandbox == self.sandbox)
            .collect();
        pods.sort_by_key(|p| p.pod_index);
        pods
    }

    /// Whether `subcluster` belongs to this snapshot's scope.
    ///
    /// Gathered pods decide; a subcluster without any falls back to the
    /// sandbox status records for it.
    pub fn is_in_scope(&self, vdb: &VerticaDB, subcluster: &str) -> bool {
        let sandbox = self
            .subcluster_sandbox(subcluster)
            .or_else(|| vdb.current_sandbox_of(subcluster))
            .unwrap_or_default();
        sandbox == self.sandbox
    }

    /// First in-scope pod, by DNS name, matching `pred`
    pub fn find_first_pod_sorted<F>(&self, pred: F) -> Option<&PodFact>
    where
        F: Fn(&PodFact) -> bool,
    {
        self.pods().into_iter().find(|p| pred(p))
    }

    /// First up pod, optionally restricted to a subcluster
    pub fn find_first_up_pod(&self, allow_read_only: bool, subcluster: Option<&str>) -> Option<&PodFact> {
        self.find_first_pod_sorted(|p| {
            p.up_node.is_true()
                && (allow_read_only || !p.read_only)
                && subcluster.map_or(true, |sc| p.subcluster == sc)
        })
    }

    /// First up pod of a primary subcluster
    pub fn find_first_primary_up_pod(&self, allow_read_only: bool, subcluster: Option<&str>) -> Option<&PodFact> {
        self.find_first_pod_sorted(|p| {
            p.is_primary
                && p.up_node.is_true()
                && (allow_read_only || !p.read_only)
                && subcluster.map_or(true, |sc| p.subcluster == sc)
        })
    }

    /// First pod with a running server container
    pub fn find_running_pod(&self) -> Option<&PodFact> {
        self.find_first_pod_sorted(|p| p.running)
    }

    /// Pods with the install indicator; `running_only` drops stopped pods
    pub fn find_installed_pods(&self, running_only: bool) -> Vec<&PodFact> {
        self.pods()
            .into_iter()
            .filter(|p| p.installed.is_true() && (!running_only || p.running))
            .collect()
    }

    /// Pods whose node is up
    pub fn find_up_pods(&self) -> Vec<&PodFact> {
        self.pods()
            .into_iter()
            .filter(|p| p.up_node.is_true())
            .collect()
    }

    /// True when a primary pod reports the database exists
    pub fn does_db_exist(&self) -> bool {
        self.pods()
            .iter()
            .any(|p| p.is_primary && p.db_exists.is_true())
    }

    /// True when no gathered pod belongs to `sandbox`
    pub fn is_sandbox_empty(&self, sandbox: &str) -> bool {
        !self.detail.values().any(|p| p.sandbox == sandbox)
    }

    /// Up primary inside this snapshot's sandbox
    pub fn find_initiator_in_sandbox(&self) -> Option<&PodFact> {
        self.find_first_primary_up_pod(false, None)
    }

    /// Best pod to run an admin command on.
    ///
    /// Preference: up, writable and staying; up and writable; up; installed
    /// and running.
    pub fn find_pod_to_run_admin_cmd_any(&self) -> Option<&PodFact> {
        self.find_first_pod_sorted(|p| p.is_up_writable() && !p.pending_delete)
            .or_else(|| self.find_first_pod_sorted(|p| p.is_up_writable()))
            .or_else(|| self.find_first_pod_sorted(|p| p.up_node.is_true()))
            .or_else(|| self.find_first_pod_sorted(|p| p.installed.is_true() && p.running))
    }

    /// Sandbox a subcluster's pods report, `None` when no pod was gathered
    pub fn subcluster_sandbox(&self, subcluster: &str) -> Option<&str> {
        self.detail
            .values()
            .find(|p| p.subcluster == subcluster)
            .map(|p| p.sandbox.as_str())
    }
}
