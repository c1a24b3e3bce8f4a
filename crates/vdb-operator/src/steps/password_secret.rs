//! Superuser password rotation
//!
//! The main cluster and every sandbox carry their own record of the password
//! secret in use. The VerticaDB controller rotates the main cluster and asks
//! the sandbox controller, through a trigger, to rotate each sandbox that is
//! still on an older secret.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use vdb_common::crd::VerticaDB;
use vdb_common::events::{actions, reasons};
use vdb_common::Result;

use super::publish;
use crate::cache::{load_password, PasswordKey};
use crate::context::Context;
use crate::pod_runner::exec_vsql;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::update_status;
use crate::trigger::TriggerAction;

/// Password of the secret a scope currently uses, read through the cache.
///
/// Falls back to the spec secret before anything is recorded. `None` when no
/// secret is configured or it does not exist.
pub async fn scope_password(
    ctx: &Context,
    vdb: &VerticaDB,
    sandbox: Option<&str>,
) -> Result<Option<String>> {
    let secret = vdb
        .password_secret_in_use(sandbox)
        .or(vdb.spec.password_secret.as_deref());
    let Some(secret) = secret else {
        return Ok(None);
    };
    let key = PasswordKey::for_scope(vdb, sandbox, secret);
    load_password(ctx.kube.as_ref(), ctx.passwords.as_ref(), &key, false).await
}

fn alter_user_sql(user: &str, password: &str) -> String {
    format!(
        "ALTER USER \"{}\" IDENTIFIED BY '{}'",
        user.replace('"', "\"\""),
        password.replace('\'', "''")
    )
}

/// Applies `spec.passwordSecret` to the database of the pass's scope
pub struct PasswordSecretStep {
    ctx: Arc<Context>,
}

impl PasswordSecretStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn record(&self, pass: &mut Pass, sandbox: Option<&str>, secret: &str) -> Result<()> {
        update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| match sandbox {
            None => status.password_secret = Some(secret.to_string()),
            Some(sb) => status.sandbox_mut(sb).password_secret = Some(secret.to_string()),
        })
        .await
    }

    /// Run the statement on an up pod of the scope. `false` when none is up.
    async fn alter_password(&self, pass: &mut Pass, sandbox: Option<&str>, password: &str) -> Result<bool> {
        pass.collect().await?;
        let Some(pod) = pass.facts.find_first_up_pod(false, None).map(|p| p.name.clone()) else {
            return Ok(false);
        };

        let vdb = &pass.vdb;
        let result = exec_vsql(
            self.ctx.runner.as_ref(),
            &vdb.namespace_or_default(),
            &pod,
            vdb.superuser(),
            pass.facts.su_password(),
            &alter_user_sql(vdb.superuser(), password),
        )
        .await;
        let scope = sandbox.map(|sb| format!(" in sandbox {sb}")).unwrap_or_default();
        if let Err(e) = result {
            publish(
                &self.ctx,
                vdb,
                EventType::Warning,
                reasons::SUPERUSER_PASSWORD_UPDATE_FAILED,
                actions::ROTATE,
                format!("Superuser password update failed{scope}"),
            )
            .await;
            return Err(e);
        }
        publish(
            &self.ctx,
            vdb,
            EventType::Normal,
            reasons::SUPERUSER_PASSWORD_UPDATE_SUCCEEDED,
            actions::ROTATE,
            format!("Superuser password update succeeded{scope}"),
        )
        .await;
        info!(vdb = %vdb.name_any(), pod = %pod, sandbox = ?sandbox, "superuser password updated");
        Ok(true)
    }

    async fn notify_sandboxes(&self, vdb: &VerticaDB, secret: &str) {
        for sb in &vdb.spec.sandboxes {
            let outdated = vdb
                .sandbox_status(&sb.name)
                .is_some_and(|s| s.password_secret.as_deref() != Some(secret));
            if !outdated {
                continue;
            }
            match self
                .ctx
                .triggers
                .fire(vdb, &sb.name, TriggerAction::PasswordChange)
                .await
            {
                Ok(trigger) => info!(sandbox = %sb.name, trigger = %trigger.id, "sandbox password change requested"),
                Err(e) => warn!(sandbox = %sb.name, error = %e, "failed to request sandbox password change"),
            }
        }
    }
}

#[async_trait]
impl ReconcileStep for PasswordSecretStep {
    fn name(&self) -> &'static str {
        "password-secret"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        if !pass.vdb.is_db_initialized() {
            return Ok(ReconcileOutcome::Done);
        }
        let Some(desired) = pass.vdb.spec.password_secret.clone() else {
            debug!("no password secret configured");
            return Ok(ReconcileOutcome::Done);
        };
        let scope = pass.facts.sandbox().to_string();
        let sandbox = Some(scope.as_str()).filter(|s| !s.is_empty());

        let Some(recorded) = pass.vdb.password_secret_in_use(sandbox).map(str::to_string) else {
            // The database was created with the spec secret
            self.record(pass, sandbox, &desired).await?;
            return Ok(ReconcileOutcome::Done);
        };
        if recorded == desired {
            return Ok(ReconcileOutcome::Done);
        }

        let key = PasswordKey::for_scope(&pass.vdb, sandbox, desired.as_str());
        let Some(password) =
            load_password(self.ctx.kube.as_ref(), self.ctx.passwords.as_ref(), &key, true).await?
        else {
            info!(secret = %desired, "password secret not found");
            return Ok(ReconcileOutcome::RequeueNow);
        };

        if self.ctx.passwords.current(&key.namespace, &key.name).as_deref() == Some(password.as_str()) {
            warn!(from = %recorded, to = %desired, "new password secret holds the current password");
        } else if !self.alter_password(pass, sandbox, &password).await? {
            info!("no up pod to change the superuser password on");
            return Ok(ReconcileOutcome::RequeueNow);
        }

        self.ctx.passwords.set(key, password.clone());
        pass.facts.set_su_password(password);
        self.record(pass, sandbox, &desired).await?;

        if sandbox.is_none() {
            self.notify_sandboxes(&pass.vdb, &desired).await;
        }
        Ok(ReconcileOutcome::Done)
    }
}
