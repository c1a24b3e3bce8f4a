//! TLS config updates
//!
//! One step per TLS config. A change is classified against what status
//! records as applied: a mode-only change uses the lighter set-config call,
//! anything touching the secret rotates the certs. A failed rotation marks
//! the database for rollback and stops further TLS work until the rollback
//! step has restored the last good config.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::info;

use vdb_common::crd::{
    conditions, rollback_reasons, Condition, ConditionStatus, TlsConfigName, TlsConfigSpec,
    VerticaDB,
};
use vdb_common::events::{actions, reasons};
use vdb_common::{Error, Result};

use super::publish;
use crate::context::Context;
use crate::dispatcher::{
    Initiator, RotateTlsCertsOptions, SetTlsConfigOptions, StartDatabaseOptions, TlsSecretRef,
};
use crate::podfacts::PodFact;
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::{update_condition, update_status};

/// How the desired TLS config differs from the applied one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsChange {
    /// Nothing to apply
    None,
    /// Only the mode changed
    ModeOnly,
    /// Only the secret changed
    CertOnly,
    /// Both changed
    ModeAndCert,
}

impl TlsChange {
    fn rotates_cert(self) -> bool {
        matches!(self, Self::CertOnly | Self::ModeAndCert)
    }
}

/// Classify the pending change of a TLS config
pub fn classify(vdb: &VerticaDB, name: TlsConfigName) -> TlsChange {
    let (Some(spec), Some(secret)) = (vdb.tls_spec(name), vdb.tls_secret_in_use(name)) else {
        return TlsChange::None;
    };
    let cert = spec.secret != secret;
    let mode = vdb
        .tls_mode_in_use(name)
        .map_or(true, |m| !m.eq_ignore_ascii_case(&spec.mode));
    match (mode, cert) {
        (false, false) => TlsChange::None,
        (true, false) => TlsChange::ModeOnly,
        (false, true) => TlsChange::CertOnly,
        (true, true) => TlsChange::ModeAndCert,
    }
}

fn is_pending(vdb: &VerticaDB, name: TlsConfigName) -> bool {
    vdb.is_tls_enabled(name) && classify(vdb, name) != TlsChange::None
}

fn other(name: TlsConfigName) -> TlsConfigName {
    match name {
        TlsConfigName::HttpsNma => TlsConfigName::ClientServer,
        TlsConfigName::ClientServer => TlsConfigName::HttpsNma,
    }
}

/// (started, succeeded, failed) event reasons
fn event_reasons(name: TlsConfigName) -> (&'static str, &'static str, &'static str) {
    match name {
        TlsConfigName::HttpsNma => (
            reasons::HTTPS_CERT_ROTATION_STARTED,
            reasons::HTTPS_CERT_ROTATION_SUCCEEDED,
            reasons::HTTPS_CERT_ROTATION_FAILED,
        ),
        TlsConfigName::ClientServer => (
            reasons::CLIENT_SERVER_TLS_UPDATE_STARTED,
            reasons::CLIENT_SERVER_TLS_UPDATE_SUCCEEDED,
            reasons::CLIENT_SERVER_TLS_UPDATE_FAILED,
        ),
    }
}

fn rollback_reason(name: TlsConfigName, error: &Error) -> &'static str {
    match (name, error) {
        (
            TlsConfigName::HttpsNma,
            Error::CertRotation {
                after_health_polling: true,
                ..
            },
        ) => rollback_reasons::AFTER_HTTPS_CERT_HEALTH_POLLING,
        (TlsConfigName::HttpsNma, _) => rollback_reasons::AFTER_HTTPS_CERT_ROTATION,
        (TlsConfigName::ClientServer, _) => rollback_reasons::AFTER_SERVER_CERT_ROTATION,
    }
}

/// Up pod to drive a TLS change, starting the database when nothing is up
async fn up_initiator(ctx: &Context, pass: &mut Pass) -> Result<Option<Initiator>> {
    pass.collect().await?;
    if let Some(pod) = pass.facts.find_first_up_pod(true, None) {
        return Ok(Some(pod.initiator()));
    }

    let installed = pass.facts.find_installed_pods(true);
    let Some(first) = installed.first() else {
        return Ok(None);
    };
    let opts = StartDatabaseOptions {
        initiator: first.initiator(),
        hosts: installed.iter().map(|p| p.pod_ip.clone()).collect(),
        sandbox: pass.facts.sandbox().to_string(),
    };
    info!(hosts = ?opts.hosts, "no up pod, starting the database");
    publish(
        ctx,
        &pass.vdb,
        EventType::Normal,
        reasons::RESTART_STARTED,
        actions::RESTART,
        format!("Starting database on {} pods", opts.hosts.len()),
    )
    .await;
    if let Err(e) = ctx.dispatcher.start_database(&pass.vdb, opts).await {
        publish(
            ctx,
            &pass.vdb,
            EventType::Warning,
            reasons::RESTART_FAILED,
            actions::RESTART,
            format!("Failed to start database: {e}"),
        )
        .await;
        return Err(e);
    }
    publish(
        ctx,
        &pass.vdb,
        EventType::Normal,
        reasons::RESTART_SUCCEEDED,
        actions::RESTART,
        "Database started",
    )
    .await;

    pass.invalidate();
    pass.collect().await?;
    Ok(pass.facts.find_first_up_pod(true, None).map(PodFact::initiator))
}

/// Rotate the certs of `name` to `secret` and `mode`.
///
/// Emits the bracketing events but leaves status alone; callers record the
/// outcome. Returns `RequeueNow` when no pod could be brought up.
pub async fn rotate_tls(
    ctx: &Context,
    pass: &mut Pass,
    name: TlsConfigName,
    secret: &str,
    mode: &str,
) -> Result<ReconcileOutcome> {
    let Some(initiator) = up_initiator(ctx, pass).await? else {
        info!(config = %name, "no pod up for cert rotation");
        return Ok(ReconcileOutcome::RequeueNow);
    };
    rotate_certs(ctx, pass, name, secret, mode, initiator).await?;
    Ok(ReconcileOutcome::Done)
}

/// The rotation call itself, through `initiator`
async fn rotate_certs(
    ctx: &Context,
    pass: &Pass,
    name: TlsConfigName,
    secret: &str,
    mode: &str,
    initiator: Initiator,
) -> Result<()> {
    let (started, succeeded, failed) = event_reasons(name);
    publish(
        ctx,
        &pass.vdb,
        EventType::Normal,
        started,
        actions::ROTATE,
        format!("Rotating {name} certs to secret {secret}"),
    )
    .await;

    let opts = RotateTlsCertsOptions {
        initiator,
        tls_config: name.server_config().to_string(),
        secret: TlsSecretRef::standard(secret, pass.vdb.namespace_or_default()),
        mode: mode.to_string(),
        poll_health: name == TlsConfigName::HttpsNma,
    };
    if let Err(e) = ctx.dispatcher.rotate_tls_certs(&pass.vdb, opts).await {
        publish(
            ctx,
            &pass.vdb,
            EventType::Warning,
            failed,
            actions::ROTATE,
            format!("Failed to rotate {name} certs: {e}"),
        )
        .await;
        return Err(e);
    }
    publish(
        ctx,
        &pass.vdb,
        EventType::Normal,
        succeeded,
        actions::ROTATE,
        format!("Rotated {name} certs to secret {secret}"),
    )
    .await;
    info!(config = %name, secret, mode, "tls certs rotated");
    Ok(())
}

/// Applies one TLS config
pub struct TlsUpdateStep {
    ctx: Arc<Context>,
    name: TlsConfigName,
}

impl TlsUpdateStep {
    /// Create the step for `name`
    pub fn new(ctx: Arc<Context>, name: TlsConfigName) -> Self {
        Self { ctx, name }
    }

    async fn record(&self, pass: &mut Pass, secret: &str, mode: &str) -> Result<()> {
        let name = self.name;
        update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| {
            let entry = status.tls_config_mut(name);
            entry.secret = Some(secret.to_string());
            entry.mode = Some(mode.to_string());
        })
        .await
    }

    async fn set_in_progress(&self, pass: &mut Pass, on: bool) -> Result<()> {
        if pass.vdb.is_condition_true(conditions::TLS_CONFIG_UPDATE_IN_PROGRESS) == on {
            return Ok(());
        }
        let condition = if on {
            Condition::truthy(conditions::TLS_CONFIG_UPDATE_IN_PROGRESS, "InProgress")
        } else {
            Condition::falsy(conditions::TLS_CONFIG_UPDATE_IN_PROGRESS, "Completed")
        };
        update_condition(self.ctx.kube.as_ref(), &mut pass.vdb, condition).await
    }

    /// First config once the database exists
    async fn initial_config(
        &self,
        pass: &mut Pass,
        spec: &TlsConfigSpec,
    ) -> Result<ReconcileOutcome> {
        let Some(initiator) = up_initiator(&self.ctx, pass).await? else {
            return Ok(ReconcileOutcome::RequeueNow);
        };
        let opts = SetTlsConfigOptions {
            initiator,
            tls_config: self.name.server_config().to_string(),
            secret: Some(TlsSecretRef::standard(&spec.secret, pass.vdb.namespace_or_default())),
            mode: spec.mode.clone(),
        };
        self.ctx.dispatcher.set_tls_config(&pass.vdb, opts).await?;
        info!(config = %self.name, secret = %spec.secret, "initial tls config applied");
        self.record(pass, &spec.secret, &spec.mode).await?;
        Ok(ReconcileOutcome::Done)
    }

    async fn apply_mode(&self, pass: &Pass, mode: &str, initiator: Initiator) -> Result<()> {
        let (started, succeeded, failed) = event_reasons(self.name);
        let name = self.name;
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            started,
            actions::ROTATE,
            format!("Setting {name} TLS mode to {mode}"),
        )
        .await;
        let opts = SetTlsConfigOptions {
            initiator,
            tls_config: name.server_config().to_string(),
            secret: None,
            mode: mode.to_string(),
        };
        if let Err(e) = self.ctx.dispatcher.set_tls_config(&pass.vdb, opts).await {
            publish(
                &self.ctx,
                &pass.vdb,
                EventType::Warning,
                failed,
                actions::ROTATE,
                format!("Failed to set {name} TLS mode: {e}"),
            )
            .await;
            return Err(e);
        }
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            succeeded,
            actions::ROTATE,
            format!("Set {name} TLS mode to {mode}"),
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl ReconcileStep for TlsUpdateStep {
    fn name(&self) -> &'static str {
        match self.name {
            TlsConfigName::HttpsNma => "https-tls-update",
            TlsConfigName::ClientServer => "client-server-tls-update",
        }
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        let vdb = &pass.vdb;
        if !vdb.is_tls_enabled(self.name)
            || !vdb.is_db_initialized()
            || vdb.is_condition_true(conditions::TLS_CERT_ROLLBACK_NEEDED)
        {
            return Ok(ReconcileOutcome::Done);
        }
        let Some(spec) = vdb.tls_spec(self.name).cloned() else {
            return Ok(ReconcileOutcome::Done);
        };
        if vdb.tls_secret_in_use(self.name).is_none() {
            return self.initial_config(pass, &spec).await;
        }

        let change = classify(vdb, self.name);
        if change == TlsChange::None {
            // Left over from a pass that recorded its change but stopped early
            if !is_pending(vdb, other(self.name)) {
                self.set_in_progress(pass, false).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }

        info!(config = %self.name, change = ?change, "applying tls config change");
        self.set_in_progress(pass, true).await?;
        // A failed restart has not touched the certs, so it does not need a rollback
        let Some(initiator) = up_initiator(&self.ctx, pass).await? else {
            info!(config = %self.name, "no pod up for tls update");
            return Ok(ReconcileOutcome::RequeueNow);
        };
        let result = if change.rotates_cert() {
            rotate_certs(&self.ctx, pass, self.name, &spec.secret, &spec.mode, initiator).await
        } else {
            self.apply_mode(pass, &spec.mode, initiator).await
        };
        if let Err(e) = result {
            let condition = Condition::new(
                conditions::TLS_CERT_ROLLBACK_NEEDED,
                ConditionStatus::True,
                rollback_reason(self.name, &e),
                e.to_string(),
            );
            update_condition(self.ctx.kube.as_ref(), &mut pass.vdb, condition).await?;
            return Err(e);
        }

        self.record(pass, &spec.secret, &spec.mode).await?;
        if !is_pending(&pass.vdb, other(self.name)) {
            self.set_in_progress(pass, false).await?;
        }
        Ok(ReconcileOutcome::Done)
    }
}
