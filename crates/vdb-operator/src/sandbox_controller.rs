//! Sandbox controller
//!
//! Watches the per-sandbox config maps. A pass runs the sandbox-scoped steps
//! against the VerticaDB the map names and, once they settle, consumes the
//! triggers that were pending when the pass started.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use vdb_common::{Error, Result};

use crate::context::Context;
use crate::controller::action_for;
use crate::podfacts::PodFacts;
use crate::sandbox_configmap::config_map_target;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep, Sequencer};
use crate::steps::{scope_password, PasswordSecretStep};
use crate::trigger::Trigger;

/// Steps of one sandbox pass, in run order
pub fn build_sandbox_steps(ctx: &Arc<Context>) -> Vec<Box<dyn ReconcileStep>> {
    vec![Box::new(PasswordSecretStep::new(ctx.clone()))]
}

/// Converge one sandbox
#[instrument(
    skip(cm, ctx),
    fields(configmap = %cm.name_any(), namespace = %cm.namespace().unwrap_or_default())
)]
pub async fn reconcile(cm: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action> {
    let Some((vdb_name, sandbox)) = config_map_target(&cm) else {
        warn!("config map does not name a verticadb and sandbox");
        return Ok(Action::await_change());
    };
    let ns = cm.namespace().unwrap_or_default();
    let Some(vdb) = ctx.kube.get_vdb(&ns, &vdb_name).await? else {
        debug!(vdb = %vdb_name, "verticadb not found");
        return Ok(Action::await_change());
    };
    if vdb.sandbox(&sandbox).is_none() {
        debug!(vdb = %vdb_name, sandbox = %sandbox, "sandbox no longer in spec");
        return Ok(Action::await_change());
    }

    let cm = ctx.configmaps.reconcile(&vdb, &sandbox).await?;
    let pending = Trigger::pending(cm.annotations());

    let mut facts = PodFacts::for_sandbox(ctx.gatherer.clone(), sandbox.clone());
    if let Some(password) = scope_password(&ctx, &vdb, Some(sandbox.as_str())).await? {
        facts.set_su_password(password);
    }
    let mut pass = Pass::new(vdb, facts);
    let outcome = Sequencer::new(build_sandbox_steps(&ctx)).run(&mut pass).await?;

    if outcome == ReconcileOutcome::Done {
        for trigger in &pending {
            ctx.configmaps.clear_trigger(&cm, trigger).await?;
            info!(sandbox = %sandbox, action = %trigger.action, trigger = %trigger.id, "trigger consumed");
        }
    }
    Ok(action_for(&pass.vdb, outcome, &ctx.config))
}

/// Requeue after a failed sandbox pass
pub fn error_policy(cm: Arc<ConfigMap>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        configmap = %cm.name_any(),
        namespace = %cm.namespace().unwrap_or_default(),
        "sandbox reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue_delay)
}
