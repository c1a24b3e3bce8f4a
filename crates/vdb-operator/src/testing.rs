//! Shared test fixtures

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStatus, ObjectReference, Pod,
    PodSpec, PodStatus, Secret,
};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;

use vdb_common::crd::{
    CommunalSpec, Subcluster, SubclusterType, TriState, VerticaDB, VerticaDBSpec, VerticaDBStatus,
};
use vdb_common::events::EventPublisher;
use vdb_common::{Error, Result, SANDBOX_LABEL, SERVER_CONTAINER};

use crate::kube_client::MockKubeClient;
use crate::podfacts::{FactGatherer, FactScope, PodFact, PodFacts};
use crate::sequencer::Pass;

/// Image every sample uses
pub const SAMPLE_IMAGE: &str = "vertica/vertica-k8s:24.4.0";

/// Eon mode VerticaDB in `default` with one primary subcluster `sc1` of size 3
pub fn sample_vdb(name: &str) -> VerticaDB {
    let mut vdb = VerticaDB::new(
        name,
        VerticaDBSpec {
            image: SAMPLE_IMAGE.to_string(),
            db_name: "vertdb".to_string(),
            communal: Some(CommunalSpec {
                path: "s3://bucket/db".to_string(),
            }),
            subclusters: vec![Subcluster {
                name: "sc1".to_string(),
                size: 3,
                type_: SubclusterType::Primary,
            }],
            ..Default::default()
        },
    );
    vdb.metadata.namespace = Some("default".to_string());
    vdb.metadata.uid = Some("uid-1234".to_string());
    vdb.metadata.resource_version = Some("1".to_string());
    vdb
}

/// Add a subcluster to a sample
pub fn with_subcluster(mut vdb: VerticaDB, name: &str, size: i32, type_: SubclusterType) -> VerticaDB {
    vdb.spec.subclusters.push(Subcluster {
        name: name.to_string(),
        size,
        type_,
    });
    vdb
}

/// Mark the sample as initialized
pub fn initialized(mut vdb: VerticaDB) -> VerticaDB {
    use vdb_common::crd::{conditions, Condition};
    vdb.status
        .get_or_insert_with(VerticaDBStatus::default)
        .set_condition(Condition::truthy(conditions::DB_INITIALIZED, "Initialized"));
    vdb
}

/// Secret holding a superuser password
pub fn password_secret(name: &str, password: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "password".to_string(),
            ByteString(password.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Secret with arbitrary keys
pub fn secret_with(name: &str, entries: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: Some(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Pod fact for a pod that exists but is not running
pub fn pod_fact(subcluster: &str, index: i32) -> PodFact {
    let name = format!("vertdb-{subcluster}-{index}");
    PodFact {
        dns_name: format!("{name}.vertdb.default"),
        name,
        subcluster: subcluster.to_string(),
        pod_index: index,
        pod_ip: format!("10.0.0.{}", index + 1),
        image: SAMPLE_IMAGE.to_string(),
        is_primary: true,
        exists: true,
        up_node: TriState::False,
        ..Default::default()
    }
}

/// Running pod with nothing installed
pub fn running_fact(subcluster: &str, index: i32) -> PodFact {
    PodFact {
        running: true,
        installed: TriState::False,
        db_exists: TriState::False,
        ..pod_fact(subcluster, index)
    }
}

/// Running, installed pod not yet in the database
pub fn installed_fact(subcluster: &str, index: i32) -> PodFact {
    PodFact {
        installed: TriState::True,
        ..running_fact(subcluster, index)
    }
}

/// Pod whose node is up
pub fn up_fact(subcluster: &str, index: i32) -> PodFact {
    PodFact {
        db_exists: TriState::True,
        up_node: TriState::True,
        ..installed_fact(subcluster, index)
    }
}

/// Same fact moved into a sandbox
pub fn in_sandbox(mut fact: PodFact, sandbox: &str) -> PodFact {
    fact.sandbox = sandbox.to_string();
    fact
}

/// Pod whose server container is running
pub fn running_pod(name: &str, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: SERVER_CONTAINER.to_string(),
                image: Some(SAMPLE_IMAGE.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: SERVER_CONTAINER.to_string(),
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Statefulset with a replica count and optional sandbox label
pub fn statefulset(name: &str, replicas: i32, sandbox: Option<&str>) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: sandbox.map(|sb| BTreeMap::from([(SANDBOX_LABEL.to_string(), sb.to_string())])),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// 409 from the API server
pub fn conflict_error() -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

fn bump(vdb: &mut VerticaDB) {
    let next = vdb
        .metadata
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    vdb.metadata.resource_version = Some(next.to_string());
}

/// Kube mock that serves one VerticaDB from a store and persists writes to it.
///
/// Further expectations for other methods can be added to the returned mock.
pub fn stored_kube(vdb: VerticaDB) -> (MockKubeClient, Arc<Mutex<VerticaDB>>) {
    let store = Arc::new(Mutex::new(vdb));
    let mut kube = MockKubeClient::new();

    let s = store.clone();
    kube.expect_get_vdb()
        .returning(move |_, _| Ok(Some(s.lock().expect("lock").clone())));

    let s = store.clone();
    kube.expect_replace_vdb_status().returning(move |vdb| {
        let mut stored = s.lock().expect("lock");
        stored.status = vdb.status.clone();
        bump(&mut stored);
        Ok(stored.clone())
    });

    let s = store.clone();
    kube.expect_replace_vdb().returning(move |vdb| {
        let mut stored = s.lock().expect("lock");
        stored.spec = vdb.spec.clone();
        stored.metadata.annotations = vdb.metadata.annotations.clone();
        bump(&mut stored);
        Ok(stored.clone())
    });

    (kube, store)
}

/// Status snapshot of a stored VerticaDB
pub fn stored_status(store: &Arc<Mutex<VerticaDB>>) -> VerticaDBStatus {
    store
        .lock()
        .expect("lock")
        .status
        .clone()
        .unwrap_or_default()
}

/// Captures status writes for later verification
#[derive(Clone, Default)]
pub struct StatusCapture {
    updates: Arc<Mutex<Vec<VerticaDBStatus>>>,
}

impl StatusCapture {
    /// Empty capture
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one write
    pub fn record(&self, status: VerticaDBStatus) {
        self.updates.lock().expect("lock").push(status);
    }

    /// Last recorded status
    pub fn last(&self) -> Option<VerticaDBStatus> {
        self.updates.lock().expect("lock").last().cloned()
    }

    /// Whether anything was written
    pub fn was_updated(&self) -> bool {
        !self.updates.lock().expect("lock").is_empty()
    }
}

/// One published event
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Normal or Warning
    pub type_: EventType,
    /// Reason string
    pub reason: String,
    /// Message
    pub note: Option<String>,
}

/// Event publisher that keeps everything it is given
#[derive(Clone, Default)]
pub struct RecordingEventPublisher {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingEventPublisher {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Reasons in publish order
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }

    /// Every recorded event
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("lock").clone()
    }

    /// Notes of events with the given reason
    pub fn notes_for(&self, reason: &str) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .filter(|e| e.reason == reason)
            .filter_map(|e| e.note.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().expect("lock").push(RecordedEvent {
            type_,
            reason: reason.to_string(),
            note,
        });
    }
}

/// Gatherer over a mutable list of facts.
///
/// Mocks of the runner or dispatcher can change the cluster through a clone
/// so the next collection sees the effect of an operation.
#[derive(Clone, Default)]
pub struct FakeCluster {
    pods: Arc<Mutex<Vec<PodFact>>>,
    gathers: Arc<Mutex<u32>>,
}

impl FakeCluster {
    /// Cluster with the given pods
    pub fn new(pods: Vec<PodFact>) -> Self {
        Self {
            pods: Arc::new(Mutex::new(pods)),
            gathers: Arc::new(Mutex::new(0)),
        }
    }

    /// Change one pod
    pub fn update(&self, pod: &str, f: impl FnOnce(&mut PodFact)) {
        if let Some(p) = self.pods.lock().expect("lock").iter_mut().find(|p| p.name == pod) {
            f(p);
        }
    }

    /// Change every pod
    pub fn update_all(&self, f: impl Fn(&mut PodFact)) {
        self.pods.lock().expect("lock").iter_mut().for_each(f);
    }

    /// Current pods
    pub fn pods(&self) -> Vec<PodFact> {
        self.pods.lock().expect("lock").clone()
    }

    /// Number of gathers so far
    pub fn gathers(&self) -> u32 {
        *self.gathers.lock().expect("lock")
    }

    /// Fact snapshot over this cluster
    pub fn facts(&self) -> PodFacts {
        PodFacts::new(Arc::new(self.clone()))
    }

    /// Pass over this cluster
    pub fn pass(&self, vdb: VerticaDB) -> Pass {
        Pass::new(vdb, self.facts())
    }
}

#[async_trait]
impl FactGatherer for FakeCluster {
    async fn gather(&self, _vdb: &VerticaDB, scope: &FactScope) -> Result<Vec<PodFact>> {
        *self.gathers.lock().expect("lock") += 1;
        let pods = self.pods();
        Ok(if scope.sandbox.is_empty() {
            pods
        } else {
            pods.into_iter()
                .filter(|p| p.sandbox == scope.sandbox)
                .collect()
        })
    }
}
