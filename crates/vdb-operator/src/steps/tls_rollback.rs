//! Rollback after a failed cert rotation
//!
//! Restores the last TLS config recorded in status. Every target is read
//! from status, so a pass interrupted at any point redoes the remaining
//! sub-actions on the next run.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use vdb_common::crd::{conditions, rollback_reasons, Condition, TlsConfigName, VerticaDB};
use vdb_common::events::{actions, reasons};
use vdb_common::Result;

use super::{publish, rotate_tls};
use crate::context::Context;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::{update_condition, update_spec, update_status};

/// TLS config a rollback reason refers to
fn rolled_back_config(reason: &str) -> TlsConfigName {
    if reason == rollback_reasons::AFTER_SERVER_CERT_ROTATION {
        TlsConfigName::ClientServer
    } else {
        TlsConfigName::HttpsNma
    }
}

fn rollback_reason(vdb: &VerticaDB) -> Option<String> {
    vdb.condition(conditions::TLS_CERT_ROLLBACK_NEEDED)
        .filter(|c| c.is_true())
        .map(|c| c.reason.clone())
}

/// One rollback sub-action, run in [`ROLLBACK_ORDER`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RollbackAction {
    MarkInProgress,
    RerotateCerts,
    ResetUpdateInProgress,
    SetFailedSecret,
    RevertSpec,
    ClearConditions,
}

const ROLLBACK_ORDER: [RollbackAction; 6] = [
    RollbackAction::MarkInProgress,
    RollbackAction::RerotateCerts,
    RollbackAction::ResetUpdateInProgress,
    RollbackAction::SetFailedSecret,
    RollbackAction::RevertSpec,
    RollbackAction::ClearConditions,
];

/// What a rollback pass works on
struct Rollback {
    reason: String,
    name: TlsConfigName,
}

impl RollbackAction {
    /// Whether the action still has work to do
    fn applies(self, vdb: &VerticaDB, rollback: &Rollback) -> bool {
        let name = rollback.name;
        match self {
            Self::MarkInProgress => !vdb.is_condition_true(conditions::TLS_CERT_ROLLBACK_IN_PROGRESS),
            // Nodes may already serve the new cert once health polling started
            Self::RerotateCerts => {
                rollback.reason == rollback_reasons::AFTER_HTTPS_CERT_HEALTH_POLLING
                    && vdb.tls_secret_in_use(name).is_some()
                    && vdb.tls_mode_in_use(name).is_some()
            }
            Self::ResetUpdateInProgress => {
                vdb.is_condition_true(conditions::TLS_CONFIG_UPDATE_IN_PROGRESS)
            }
            // Once the spec is reverted the failed secret is gone from it
            Self::SetFailedSecret => vdb.tls_spec(name).is_some_and(|spec| {
                !spec.auto_rotate_secrets.is_empty()
                    && vdb.tls_secret_in_use(name) != Some(spec.secret.as_str())
            }),
            Self::RevertSpec | Self::ClearConditions => true,
        }
    }
}

/// Reverts the TLS config after a failed rotation
pub struct TlsRollbackStep {
    ctx: Arc<Context>,
}

impl TlsRollbackStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn run_action(
        &self,
        action: RollbackAction,
        pass: &mut Pass,
        rollback: &Rollback,
    ) -> Result<ReconcileOutcome> {
        let name = rollback.name;
        match action {
            RollbackAction::MarkInProgress => {
                update_condition(
                    self.ctx.kube.as_ref(),
                    &mut pass.vdb,
                    Condition::truthy(conditions::TLS_CERT_ROLLBACK_IN_PROGRESS, rollback.reason.clone()),
                )
                .await?;
                publish(
                    &self.ctx,
                    &pass.vdb,
                    EventType::Normal,
                    reasons::TLS_CERT_ROLLBACK_STARTED,
                    actions::ROTATE,
                    format!("Rolling back {name} TLS config after a failed rotation"),
                )
                .await;
            }
            RollbackAction::RerotateCerts => {
                let secret = pass.vdb.tls_secret_in_use(name).unwrap_or_default().to_string();
                let mode = pass.vdb.tls_mode_in_use(name).unwrap_or_default().to_string();
                return rotate_tls(&self.ctx, pass, name, &secret, &mode).await;
            }
            RollbackAction::ResetUpdateInProgress => {
                update_condition(
                    self.ctx.kube.as_ref(),
                    &mut pass.vdb,
                    Condition::falsy(conditions::TLS_CONFIG_UPDATE_IN_PROGRESS, "RolledBack"),
                )
                .await?;
            }
            RollbackAction::SetFailedSecret => {
                let failed = pass.vdb.tls_spec(name).map(|spec| spec.secret.clone());
                update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| {
                    status.tls_config_mut(name).auto_rotate_failed_secret = failed.clone();
                })
                .await?;
            }
            RollbackAction::RevertSpec => self.revert_spec(pass, name).await?,
            RollbackAction::ClearConditions => {
                update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| {
                    status.set_condition(Condition::falsy(
                        conditions::TLS_CERT_ROLLBACK_IN_PROGRESS,
                        "Completed",
                    ));
                    status.set_condition(Condition::falsy(
                        conditions::TLS_CERT_ROLLBACK_NEEDED,
                        "Completed",
                    ));
                })
                .await?;
            }
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn revert_spec(&self, pass: &mut Pass, name: TlsConfigName) -> Result<()> {
        let secret = pass.vdb.tls_secret_in_use(name).map(str::to_string);
        let mode = pass.vdb.tls_mode_in_use(name).map(str::to_string);
        info!(config = %name, secret = ?secret, mode = ?mode, "reverting tls spec");
        update_spec(self.ctx.kube.as_ref(), &mut pass.vdb, |spec| {
            let tls = match name {
                TlsConfigName::HttpsNma => spec.https_nma_tls.as_mut(),
                TlsConfigName::ClientServer => spec.client_server_tls.as_mut(),
            };
            let Some(tls) = tls else { return };
            if let Some(secret) = &secret {
                tls.secret = secret.clone();
            }
            if let Some(mode) = &mode {
                tls.mode = mode.clone();
            }
        })
        .await
    }
}

#[async_trait]
impl ReconcileStep for TlsRollbackStep {
    fn name(&self) -> &'static str {
        "tls-rollback"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        let Some(reason) = rollback_reason(&pass.vdb) else {
            return Ok(ReconcileOutcome::Done);
        };
        if !pass.vdb.is_tls_rollback_enabled() {
            info!(reason = %reason, "tls rollback disabled by annotation");
            return Ok(ReconcileOutcome::Done);
        }
        let rollback = Rollback {
            name: rolled_back_config(&reason),
            reason,
        };

        for action in ROLLBACK_ORDER {
            if !action.applies(&pass.vdb, &rollback) {
                debug!(?action, "rollback action not needed");
                continue;
            }
            let outcome = self.run_action(action, pass, &rollback).await?;
            if outcome.is_abort() {
                info!(?action, ?outcome, "rollback paused");
                return Ok(outcome);
            }
        }

        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::TLS_CERT_ROLLBACK_SUCCEEDED,
            actions::ROTATE,
            format!("Rolled back {} TLS config", rollback.name),
        )
        .await;
        Ok(ReconcileOutcome::Done)
    }
}
