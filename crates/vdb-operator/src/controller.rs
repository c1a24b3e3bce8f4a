//! VerticaDB controller
//!
//! Every reconcile builds a fresh [`Pass`] and runs the fixed step list
//! against it. Steps report a [`ReconcileOutcome`]; the controller maps it to
//! a requeue [`Action`].

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use vdb_common::crd::{TlsConfigName, VerticaDB};
use vdb_common::{Error, Result};

use crate::config::ReconcilerConfig;
use crate::context::Context;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep, Sequencer};
use crate::steps::{
    scope_password, AddNodeStep, InstallStep, LicenseValidationStep, PasswordSecretStep,
    PodSecurityStep, RemoveNodeStep, SandboxSubclusterStep, ScaleStatefulSetStep,
    ServiceAccountStep, StatusStep, TlsRollbackStep, TlsUpdateStep,
};

/// Steps of one main-cluster pass, in run order
pub fn build_steps(ctx: &Arc<Context>) -> Vec<Box<dyn ReconcileStep>> {
    vec![
        Box::new(StatusStep::new(ctx.clone())),
        Box::new(PodSecurityStep::new(ctx.clone())),
        Box::new(ServiceAccountStep::new(ctx.clone())),
        Box::new(TlsRollbackStep::new(ctx.clone())),
        Box::new(RemoveNodeStep::new(ctx.clone())),
        Box::new(ScaleStatefulSetStep::new(ctx.clone())),
        Box::new(InstallStep::new(ctx.clone())),
        Box::new(AddNodeStep::new(ctx.clone())),
        // Refresh after the topology work above
        Box::new(StatusStep::new(ctx.clone())),
        Box::new(SandboxSubclusterStep::new(ctx.clone())),
        Box::new(PasswordSecretStep::new(ctx.clone())),
        Box::new(LicenseValidationStep::new(ctx.clone())),
        Box::new(TlsUpdateStep::new(ctx.clone(), TlsConfigName::HttpsNma)),
        Box::new(TlsUpdateStep::new(ctx.clone(), TlsConfigName::ClientServer)),
    ]
}

/// Requeue action for the outcome of a pass.
///
/// A positive `spec.requeueTime` replaces every requeue delay and keeps a
/// settled database on a periodic schedule.
pub fn action_for(vdb: &VerticaDB, outcome: ReconcileOutcome, config: &ReconcilerConfig) -> Action {
    let fixed = vdb.requeue_time();
    match outcome {
        ReconcileOutcome::Done => fixed.map_or_else(Action::await_change, Action::requeue),
        ReconcileOutcome::RequeueNow => Action::requeue(fixed.unwrap_or(config.requeue_delay)),
        ReconcileOutcome::RequeueAfter(delay) => Action::requeue(fixed.unwrap_or(delay)),
    }
}

/// Converge one VerticaDB
#[instrument(
    skip(vdb, ctx),
    fields(vdb = %vdb.name_any(), namespace = %vdb.namespace_or_default())
)]
pub async fn reconcile(vdb: Arc<VerticaDB>, ctx: Arc<Context>) -> Result<Action> {
    if vdb.metadata.deletion_timestamp.is_some() {
        debug!("verticadb is being deleted");
        return Ok(Action::await_change());
    }

    let mut facts = ctx.new_facts();
    if let Some(password) = scope_password(&ctx, &vdb, None).await? {
        facts.set_su_password(password);
    }
    let mut pass = Pass::new(vdb.as_ref().clone(), facts);
    let mut sequencer = Sequencer::new(build_steps(&ctx));
    let outcome = sequencer.run(&mut pass).await?;

    let action = action_for(&pass.vdb, outcome, &ctx.config);
    info!(?outcome, ?action, "reconcile pass finished");
    Ok(action)
}

/// Requeue after a failed pass
pub fn error_policy(vdb: Arc<VerticaDB>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        vdb = %vdb.name_any(),
        namespace = %vdb.namespace_or_default(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue_delay)
}
