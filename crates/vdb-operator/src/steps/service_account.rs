//! ServiceAccount and RBAC for the database pods
//!
//! The pods read secrets (password, TLS, license) through the admin tool, so
//! they need an account bound to a role that can `get` and `list` secrets.
//! Objects are found by the database label; missing ones are created with a
//! generated name and owned by the VerticaDB. Existing objects are not touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::info;

use vdb_common::crd::VerticaDB;
use vdb_common::{Result, DATABASE_LABEL};

use crate::context::Context;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};

fn selector(vdb: &VerticaDB) -> String {
    format!("{DATABASE_LABEL}={}", vdb.name_any())
}

fn owned_meta(vdb: &VerticaDB, name: Option<String>, generate: &str) -> ObjectMeta {
    ObjectMeta {
        generate_name: name
            .is_none()
            .then(|| format!("{}-{generate}-", vdb.name_any())),
        name,
        namespace: vdb.namespace(),
        labels: Some(BTreeMap::from([(DATABASE_LABEL.to_string(), vdb.name_any())])),
        owner_references: vdb.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// ServiceAccount created for a VerticaDB
pub fn build_service_account(vdb: &VerticaDB) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_meta(vdb, vdb.spec.service_account_name.clone(), "sa"),
        ..Default::default()
    }
}

/// Role granting read access to secrets
pub fn build_role(vdb: &VerticaDB) -> Role {
    Role {
        metadata: owned_meta(vdb, None, "role"),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            verbs: vec!["get".to_string(), "list".to_string()],
            ..Default::default()
        }]),
    }
}

/// Binding of `role` to `sa`
pub fn build_role_binding(vdb: &VerticaDB, sa: &ServiceAccount, role: &Role) -> RoleBinding {
    RoleBinding {
        metadata: owned_meta(vdb, None, "rolebinding"),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role.name_any(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: sa.name_any(),
            namespace: sa.namespace(),
            ..Default::default()
        }]),
    }
}

/// Ensures the pods' ServiceAccount, Role and RoleBinding exist
pub struct ServiceAccountStep {
    ctx: Arc<Context>,
}

impl ServiceAccountStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn ensure_service_account(&self, vdb: &VerticaDB, ns: &str) -> Result<ServiceAccount> {
        let kube = self.ctx.kube.as_ref();
        let existing = match &vdb.spec.service_account_name {
            Some(name) => kube.get_service_account(ns, name).await?,
            None => kube.find_service_account(ns, &selector(vdb)).await?,
        };
        if let Some(sa) = existing {
            return Ok(sa);
        }
        let sa = kube.create_service_account(ns, &build_service_account(vdb)).await?;
        info!(serviceaccount = %sa.name_any(), "service account created");
        Ok(sa)
    }

    async fn ensure_role(&self, vdb: &VerticaDB, ns: &str) -> Result<Role> {
        let kube = self.ctx.kube.as_ref();
        if let Some(role) = kube.find_role(ns, &selector(vdb)).await? {
            return Ok(role);
        }
        let role = kube.create_role(ns, &build_role(vdb)).await?;
        info!(role = %role.name_any(), "role created");
        Ok(role)
    }
}

#[async_trait]
impl ReconcileStep for ServiceAccountStep {
    fn name(&self) -> &'static str {
        "service-account"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        let vdb = &pass.vdb;
        let ns = vdb.namespace_or_default();
        let sa = self.ensure_service_account(vdb, &ns).await?;
        let role = self.ensure_role(vdb, &ns).await?;

        let kube = self.ctx.kube.as_ref();
        if kube.find_role_binding(&ns, &selector(vdb)).await?.is_none() {
            let rb = kube
                .create_role_binding(&ns, &build_role_binding(vdb, &sa, &role))
                .await?;
            info!(rolebinding = %rb.name_any(), "role binding created");
        }
        Ok(ReconcileOutcome::Done)
    }
}
