//! Kubernetes API access for the reconcile steps
//!
//! Everything a step reads or writes in the API server goes through
//! [`KubeClient`] so steps can be tested against mocks.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use vdb_common::crd::VerticaDB;
use vdb_common::{Error, Result};

/// Trait abstracting Kubernetes client operations for VerticaDB reconciliation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a VerticaDB by name
    async fn get_vdb(&self, namespace: &str, name: &str) -> Result<Option<VerticaDB>>;

    /// Replace a VerticaDB spec and metadata.
    ///
    /// The write carries the object's resourceVersion, so a stale copy fails
    /// with a 409 conflict.
    async fn replace_vdb(&self, vdb: &VerticaDB) -> Result<VerticaDB>;

    /// Replace the status of a VerticaDB, guarded by its resourceVersion
    async fn replace_vdb_status(&self, vdb: &VerticaDB) -> Result<VerticaDB>;

    /// Get a Secret by name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Get a ConfigMap by name
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<ConfigMap>;

    /// Replace a ConfigMap, guarded by its resourceVersion
    async fn replace_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<ConfigMap>;

    /// Get a Namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Get a ServiceAccount by name
    async fn get_service_account(&self, namespace: &str, name: &str)
        -> Result<Option<ServiceAccount>>;

    /// Find the first ServiceAccount matching a label selector
    async fn find_service_account(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<ServiceAccount>>;

    /// Create a ServiceAccount
    async fn create_service_account(
        &self,
        namespace: &str,
        sa: &ServiceAccount,
    ) -> Result<ServiceAccount>;

    /// Find the first Role matching a label selector
    async fn find_role(&self, namespace: &str, selector: &str) -> Result<Option<Role>>;

    /// Create a Role
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role>;

    /// Find the first RoleBinding matching a label selector
    async fn find_role_binding(&self, namespace: &str, selector: &str)
        -> Result<Option<RoleBinding>>;

    /// Create a RoleBinding
    async fn create_role_binding(&self, namespace: &str, rb: &RoleBinding) -> Result<RoleBinding>;

    /// Get a StatefulSet by name
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    /// Set the replica count of a StatefulSet
    async fn scale_statefulset(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Get a Pod by name
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
}

/// Production implementation backed by a kube [`Client`]
pub struct KubeClientImpl {
    client: Client,
    field_manager: String,
}

impl KubeClientImpl {
    /// Create a client that records writes under `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn vdb_namespace(vdb: &VerticaDB) -> Result<String> {
    vdb.namespace()
        .ok_or_else(|| Error::validation_for(vdb.name_any(), "VerticaDB has no namespace"))
}

async fn first_matching<K>(api: Api<K>, selector: &str) -> Result<Option<K>>
where
    K: Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    let list = api.list(&ListParams::default().labels(selector)).await?;
    Ok(list.items.into_iter().next())
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_vdb(&self, namespace: &str, name: &str) -> Result<Option<VerticaDB>> {
        Ok(self.api::<VerticaDB>(namespace).get_opt(name).await?)
    }

    async fn replace_vdb(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        let ns = vdb_namespace(vdb)?;
        Ok(self
            .api::<VerticaDB>(&ns)
            .replace(&vdb.name_any(), &self.post_params(), vdb)
            .await?)
    }

    async fn replace_vdb_status(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        let ns = vdb_namespace(vdb)?;
        // resourceVersion in a merge patch makes the write conditional
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": vdb.resource_version() },
            "status": vdb.status,
        });
        Ok(self
            .api::<VerticaDB>(&ns)
            .patch_status(
                &vdb.name_any(),
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.api::<ConfigMap>(namespace).get_opt(name).await?)
    }

    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<ConfigMap> {
        Ok(self
            .api::<ConfigMap>(namespace)
            .create(&self.post_params(), cm)
            .await?)
    }

    async fn replace_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<ConfigMap> {
        Ok(self
            .api::<ConfigMap>(namespace)
            .replace(&cm.name_any(), &self.post_params(), cm)
            .await?)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        Ok(self.api::<ServiceAccount>(namespace).get_opt(name).await?)
    }

    async fn find_service_account(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<ServiceAccount>> {
        first_matching(self.api::<ServiceAccount>(namespace), selector).await
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        sa: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        Ok(self
            .api::<ServiceAccount>(namespace)
            .create(&self.post_params(), sa)
            .await?)
    }

    async fn find_role(&self, namespace: &str, selector: &str) -> Result<Option<Role>> {
        first_matching(self.api::<Role>(namespace), selector).await
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role> {
        Ok(self
            .api::<Role>(namespace)
            .create(&self.post_params(), role)
            .await?)
    }

    async fn find_role_binding(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<RoleBinding>> {
        first_matching(self.api::<RoleBinding>(namespace), selector).await
    }

    async fn create_role_binding(&self, namespace: &str, rb: &RoleBinding) -> Result<RoleBinding> {
        Ok(self
            .api::<RoleBinding>(namespace)
            .create(&self.post_params(), rb)
            .await?)
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.api::<StatefulSet>(namespace).get_opt(name).await?)
    }

    async fn scale_statefulset(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.api::<StatefulSet>(namespace)
            .patch(
                name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.api::<Pod>(namespace).get_opt(name).await?)
    }
}
