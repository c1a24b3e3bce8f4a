//! Per-sandbox config maps
//!
//! Each sandbox gets a config map that names its VerticaDB and sandbox and
//! carries trigger annotations for the sandbox controller. The VerticaDB
//! controller owns its labels and data; annotations managed by the trigger
//! channel (and the operator version stamp) are preserved on every update.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use vdb_common::crd::VerticaDB;
use vdb_common::retry::{retry_if, RetryConfig};
use vdb_common::{Error, Result, DATABASE_LABEL, SANDBOX_CONFIGMAP_LABEL, SANDBOX_LABEL};

use crate::kube_client::KubeClient;
use crate::trigger::{is_trigger_annotation, Trigger, TriggerAction, TriggerSink};

/// Data key naming the VerticaDB
pub const VDB_NAME_KEY: &str = "verticaDBName";
/// Data key naming the sandbox
pub const SANDBOX_NAME_KEY: &str = "sandboxName";
/// Annotation recording the operator version that last touched the map
pub const OPERATOR_VERSION_ANNOTATION: &str = "vertica.com/operator-version";

fn is_managed_annotation(key: &str) -> bool {
    key == OPERATOR_VERSION_ANNOTATION || is_trigger_annotation(key)
}

/// Desired config map for a sandbox
pub fn build_config_map(vdb: &VerticaDB, sandbox: &str) -> ConfigMap {
    let labels = BTreeMap::from([
        (DATABASE_LABEL.to_string(), vdb.name_any()),
        (SANDBOX_LABEL.to_string(), sandbox.to_string()),
        (SANDBOX_CONFIGMAP_LABEL.to_string(), "true".to_string()),
    ]);
    let data = BTreeMap::from([
        (VDB_NAME_KEY.to_string(), vdb.name_any()),
        (SANDBOX_NAME_KEY.to_string(), sandbox.to_string()),
    ]);
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(vdb.sandbox_configmap_name(sandbox)),
            namespace: vdb.namespace(),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(
                OPERATOR_VERSION_ANNOTATION.to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            )])),
            owner_references: vdb.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// VerticaDB and sandbox a config map points at
pub fn config_map_target(cm: &ConfigMap) -> Option<(String, String)> {
    let data = cm.data.as_ref()?;
    let vdb = data.get(VDB_NAME_KEY).filter(|v| !v.is_empty())?;
    let sandbox = data.get(SANDBOX_NAME_KEY).filter(|v| !v.is_empty())?;
    Some((vdb.clone(), sandbox.clone()))
}

fn unmanaged_annotations(cm: &ConfigMap) -> BTreeMap<String, String> {
    cm.annotations()
        .iter()
        .filter(|(k, _)| !is_managed_annotation(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn needs_update(existing: &ConfigMap, desired: &ConfigMap) -> bool {
    existing.labels() != desired.labels()
        || existing.data != desired.data
        || unmanaged_annotations(existing) != unmanaged_annotations(desired)
        || existing.metadata.owner_references != desired.metadata.owner_references
}

/// Creates and updates sandbox config maps and writes triggers into them
pub struct SandboxConfigMapManager {
    kube: Arc<dyn KubeClient>,
}

impl SandboxConfigMapManager {
    /// Create a manager
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }

    /// Make the config map of `sandbox` match its desired form
    pub async fn reconcile(&self, vdb: &VerticaDB, sandbox: &str) -> Result<ConfigMap> {
        let ns = vdb.namespace_or_default();
        let mut desired = build_config_map(vdb, sandbox);
        let name = desired.name_any();

        let Some(existing) = self.kube.get_config_map(&ns, &name).await? else {
            info!(configmap = %name, sandbox, "creating sandbox config map");
            return self.kube.create_config_map(&ns, &desired).await;
        };
        if !needs_update(&existing, &desired) {
            debug!(configmap = %name, "sandbox config map up to date");
            return Ok(existing);
        }

        // Managed annotations come from the live object
        let annotations = desired.annotations_mut();
        for (k, v) in existing.annotations() {
            if is_managed_annotation(k) {
                annotations.insert(k.clone(), v.clone());
            }
        }
        desired.metadata.resource_version = existing.resource_version();
        info!(configmap = %name, sandbox, "updating sandbox config map");
        self.kube.replace_config_map(&ns, &desired).await
    }

    /// Remove `trigger` from the config map if it is still the recorded one
    pub async fn clear_trigger(&self, cm: &ConfigMap, trigger: &Trigger) -> Result<()> {
        let ns = cm.namespace().unwrap_or_default();
        let name = cm.name_any();
        let (ns, name) = (&ns, &name);
        let kube = self.kube.as_ref();

        retry_if(
            &RetryConfig::on_conflict(),
            "clear_trigger",
            |e: &Error| e.is_conflict(),
            || async move {
                let Some(mut current) = kube.get_config_map(ns, name).await? else {
                    return Ok(());
                };
                if trigger.clear(current.annotations_mut()) {
                    kube.replace_config_map(ns, &current).await?;
                    debug!(configmap = %name, action = %trigger.action, "trigger cleared");
                }
                Ok(())
            },
        )
        .await
    }
}

#[async_trait]
impl TriggerSink for SandboxConfigMapManager {
    async fn fire(&self, vdb: &VerticaDB, sandbox: &str, action: TriggerAction) -> Result<Trigger> {
        let ns = vdb.namespace_or_default();
        let name = vdb.sandbox_configmap_name(sandbox);
        let trigger = Trigger::new(action);
        let (ns, name, trigger_ref) = (&ns, &name, &trigger);

        retry_if(
            &RetryConfig::on_conflict(),
            "fire_trigger",
            |e: &Error| e.is_conflict(),
            || async move {
                let mut current = match self.kube.get_config_map(ns, name).await? {
                    Some(cm) => cm,
                    None => self.reconcile(vdb, sandbox).await?,
                };
                trigger_ref.write(current.annotations_mut());
                self.kube.replace_config_map(ns, &current).await
            },
        )
        .await?;

        info!(configmap = %name, action = %action, trigger = %trigger.id, "trigger written");
        Ok(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::testing::{conflict_error, sample_vdb};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn config_map_names_its_target() {
        let cm = build_config_map(&sample_vdb("vertdb"), "sandbox1");
        assert_eq!(cm.name_any(), "vertdb-sandbox1");
        assert_eq!(
            config_map_target(&cm),
            Some(("vertdb".to_string(), "sandbox1".to_string()))
        );
        assert_eq!(
            cm.labels().get(SANDBOX_CONFIGMAP_LABEL).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn config_map_without_target_is_ignored() {
        assert_eq!(config_map_target(&ConfigMap::default()), None);
    }

    #[tokio::test]
    async fn missing_config_map_is_created() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_config_map().returning(|_, _| Ok(None));
        kube.expect_create_config_map()
            .times(1)
            .returning(|_, cm| Ok(cm.clone()));
        let manager = SandboxConfigMapManager::new(Arc::new(kube));
        manager
            .reconcile(&sample_vdb("vertdb"), "sandbox1")
            .await
            .expect("reconcile");
    }

    #[tokio::test]
    async fn trigger_annotations_do_not_cause_updates() {
        let vdb = sample_vdb("vertdb");
        let mut existing = build_config_map(&vdb, "sandbox1");
        Trigger::new(TriggerAction::PasswordChange).write(existing.annotations_mut());
        existing
            .annotations_mut()
            .insert(OPERATOR_VERSION_ANNOTATION.to_string(), "0.0.1".to_string());

        let mut kube = MockKubeClient::new();
        kube.expect_get_config_map()
            .returning(move |_, _| Ok(Some(existing.clone())));
        kube.expect_replace_config_map().never();
        let manager = SandboxConfigMapManager::new(Arc::new(kube));
        manager.reconcile(&vdb, "sandbox1").await.expect("reconcile");
    }

    #[tokio::test]
    async fn update_carries_managed_annotations_over() {
        let vdb = sample_vdb("vertdb");
        let mut existing = build_config_map(&vdb, "sandbox1");
        existing.data = Some(BTreeMap::new());
        let trigger = Trigger::new(TriggerAction::PasswordChange);
        trigger.write(existing.annotations_mut());

        let written = Arc::new(Mutex::new(None));
        let w = written.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_get_config_map()
            .returning(move |_, _| Ok(Some(existing.clone())));
        kube.expect_replace_config_map().times(1).returning(move |_, cm| {
            *w.lock().expect("lock") = Some(cm.clone());
            Ok(cm.clone())
        });
        let manager = SandboxConfigMapManager::new(Arc::new(kube));
        manager.reconcile(&vdb, "sandbox1").await.expect("reconcile");

        let cm = written.lock().expect("lock").clone().expect("written");
        assert_eq!(Trigger::pending(cm.annotations()), vec![trigger]);
        assert_eq!(config_map_target(&cm).map(|t| t.1), Some("sandbox1".to_string()));
    }

    #[tokio::test]
    async fn fire_retries_on_conflict() {
        let vdb = sample_vdb("vertdb");
        let existing = build_config_map(&vdb, "sandbox1");
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let mut kube = MockKubeClient::new();
        kube.expect_get_config_map()
            .returning(move |_, _| Ok(Some(existing.clone())));
        kube.expect_replace_config_map().returning(move |_, cm| {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(conflict_error())
            } else {
                Ok(cm.clone())
            }
        });
        let manager = SandboxConfigMapManager::new(Arc::new(kube));
        let trigger = manager
            .fire(&vdb, "sandbox1", TriggerAction::PasswordChange)
            .await
            .expect("fire");
        assert_eq!(trigger.action, TriggerAction::PasswordChange);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_only_removes_the_matching_trigger() {
        let vdb = sample_vdb("vertdb");
        let mut live = build_config_map(&vdb, "sandbox1");
        let newer = Trigger::new(TriggerAction::PasswordChange);
        newer.write(live.annotations_mut());

        let mut kube = MockKubeClient::new();
        kube.expect_get_config_map()
            .returning(move |_, _| Ok(Some(live.clone())));
        kube.expect_replace_config_map().never();
        let manager = SandboxConfigMapManager::new(Arc::new(kube));

        let acted_on = Trigger::new(TriggerAction::PasswordChange);
        manager
            .clear_trigger(&build_config_map(&vdb, "sandbox1"), &acted_on)
            .await
            .expect("clear");
    }
}
