//! License validation
//!
//! Every key of the license secret is checked on its own. One accepted key is
//! enough, but a Community Edition key fails the whole secret. The outcome is
//! persisted and revalidated when the secret changes or the check interval
//! elapses.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use vdb_common::crd::{conditions, Condition, ConditionStatus, LicenseInfo, LicenseStatus, VerticaDB};
use vdb_common::events::{actions, reasons};
use vdb_common::{Error, Result};

use super::publish;
use crate::context::Context;
use crate::dispatcher::{CheckLicenseOptions, LicenseVerdict};
use crate::sequencer::{Pass, ReconcileOutcome, ReconcileStep};
use crate::status::update_status;

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Result of checking every key of a secret
#[derive(Debug, Default)]
struct Validation {
    licenses: Vec<LicenseInfo>,
    community_edition: Vec<String>,
    rejected: Vec<String>,
}

impl Validation {
    fn valid_count(&self) -> usize {
        self.licenses.iter().filter(|l| l.valid).count()
    }

    fn passed(&self) -> bool {
        self.community_edition.is_empty() && self.valid_count() > 0
    }
}

/// Validates the licenses in `spec.licenseSecret`
pub struct LicenseValidationStep {
    ctx: Arc<Context>,
}

impl LicenseValidationStep {
    /// Create the step
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn is_due(&self, vdb: &VerticaDB, secret: &str) -> bool {
        let recorded = vdb.status.as_ref().and_then(|s| s.license_status.as_ref());
        if recorded.map_or(true, |l| l.license_secret != secret) {
            return true;
        }
        let Some(last) = self
            .ctx
            .timestamps
            .get(&vdb.namespace_or_default(), &vdb.name_any())
        else {
            return true;
        };
        // A clock that went backwards counts as not elapsed
        (Utc::now() - last)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= self.ctx.config.license_check_interval)
    }

    fn failure_message(secret: &str, validation: &Validation) -> String {
        if !validation.community_edition.is_empty() {
            return format!(
                "Community Edition license found in secret {secret} (keys {}); Community Edition is not allowed",
                validation.community_edition.join(", ")
            );
        }
        format!("no valid Vertica license found in secret {secret}")
    }

    async fn validate(&self, pass: &mut Pass, secret_name: &str) -> Result<ReconcileOutcome> {
        let ns = pass.vdb.namespace_or_default();
        let Some(secret) = self.ctx.kube.get_secret(&ns, secret_name).await? else {
            info!(secret = %secret_name, "license secret not found");
            return Ok(ReconcileOutcome::RequeueNow);
        };
        pass.collect().await?;
        let Some(initiator) = pass.facts.find_running_pod().map(|p| p.initiator()) else {
            info!("no running pod to validate licenses on");
            return Ok(ReconcileOutcome::RequeueNow);
        };

        let mut validation = Validation::default();
        for (key, bytes) in secret.data.unwrap_or_default() {
            debug!(key = %key, secret = %secret_name, "validating license");
            let opts = CheckLicenseOptions {
                initiator: initiator.clone(),
                license_base64: STANDARD.encode(&bytes.0),
                ce_disallowed: true,
            };
            let verdict = self.ctx.dispatcher.check_license(&pass.vdb, opts).await?;
            let valid = verdict == LicenseVerdict::Valid;
            match verdict {
                LicenseVerdict::Valid => {}
                LicenseVerdict::Invalid(msg) => {
                    warn!(key = %key, error = %msg, "license rejected");
                    validation.rejected.push(key.clone());
                }
                LicenseVerdict::CommunityEdition(msg) => {
                    warn!(key = %key, error = %msg, "Community Edition license rejected");
                    validation.community_edition.push(key.clone());
                }
            }
            validation.licenses.push(LicenseInfo {
                digest: valid.then(|| digest(&bytes.0)),
                key,
                valid,
            });
        }

        let passed = validation.passed();
        let message = Self::failure_message(secret_name, &validation);
        let condition = if passed {
            Condition::truthy(conditions::LICENSE_VALID, "LicenseValidated")
        } else {
            Condition::new(
                conditions::LICENSE_VALID,
                ConditionStatus::False,
                "NoValidLicense",
                message.clone(),
            )
        };
        let license_status = LicenseStatus {
            license_secret: secret_name.to_string(),
            licenses: validation.licenses.clone(),
        };
        update_status(self.ctx.kube.as_ref(), &mut pass.vdb, |status| {
            status.license_status = Some(license_status.clone());
            // Transition time survives when only the reason or message moved
            status.set_condition(condition.clone());
        })
        .await?;
        self.ctx
            .timestamps
            .set(&ns, &pass.vdb.name_any(), Utc::now());

        if !passed {
            publish(
                &self.ctx,
                &pass.vdb,
                EventType::Warning,
                reasons::LICENSE_VALIDATION_FAIL,
                actions::VALIDATE,
                message.clone(),
            )
            .await;
            return Err(Error::license(pass.vdb.name_any(), message));
        }

        info!(
            secret = %secret_name,
            valid = validation.valid_count(),
            rejected = ?validation.rejected,
            "license secret validated"
        );
        publish(
            &self.ctx,
            &pass.vdb,
            EventType::Normal,
            reasons::LICENSE_VALIDATION_SUCCEEDED,
            actions::VALIDATE,
            format!(
                "{} valid Vertica license(s) found in secret {secret_name}",
                validation.valid_count()
            ),
        )
        .await;
        Ok(ReconcileOutcome::Done)
    }
}

#[async_trait]
impl ReconcileStep for LicenseValidationStep {
    fn name(&self) -> &'static str {
        "license-validation"
    }

    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        let Some(secret) = pass.vdb.spec.license_secret.clone().filter(|s| !s.is_empty()) else {
            return Ok(ReconcileOutcome::Done);
        };
        if self.is_due(&pass.vdb, &secret) {
            return self.validate(pass, &secret).await;
        }

        // Until revalidation, a recorded failure keeps failing the pass
        match pass.vdb.condition(conditions::LICENSE_VALID) {
            Some(c) if !c.is_true() => Err(Error::license(pass.vdb.name_any(), c.message.clone())),
            _ => Ok(ReconcileOutcome::Done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::dispatcher::MockDispatcher;
    use crate::testing::{
        sample_vdb, secret_with, stored_kube, stored_status, up_fact, FakeCluster,
        RecordingEventPublisher,
    };

    /// sha256 of "abc"
    const ABC_DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn licensed_vdb() -> VerticaDB {
        let mut vdb = sample_vdb("vertdb");
        vdb.spec.license_secret = Some("license".to_string());
        vdb
    }

    fn serving_secret(kube: &mut crate::kube_client::MockKubeClient, entries: &'static [(&'static str, &'static str)]) {
        kube.expect_get_secret()
            .withf(|ns, name| ns == "default" && name == "license")
            .returning(move |_, name| Ok(Some(secret_with(name, entries))));
    }

    /// Dispatcher judging each license by its decoded content
    fn judging_dispatcher(calls: Arc<AtomicU32>) -> MockDispatcher {
        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_check_license().returning(move |_, opts| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert!(opts.ce_disallowed);
            let content = STANDARD.decode(&opts.license_base64).unwrap_or_default();
            Ok(match content.as_slice() {
                b"abc" => LicenseVerdict::Valid,
                b"community" => LicenseVerdict::CommunityEdition("Community Edition license".to_string()),
                _ => LicenseVerdict::Invalid("license expired".to_string()),
            })
        });
        dispatcher
    }

    fn cluster() -> FakeCluster {
        FakeCluster::new(vec![up_fact("sc1", 0)])
    }

    #[tokio::test]
    async fn story_community_edition_key_fails_and_stays_failed() {
        let vdb = licensed_vdb();
        let (mut kube, store) = stored_kube(vdb.clone());
        serving_secret(&mut kube, &[("ce.dat", "community")]);
        let calls = Arc::new(AtomicU32::new(0));
        let events = RecordingEventPublisher::new();
        let ctx = Arc::new(
            Context::for_testing(Arc::new(kube))
                .with_dispatcher(Arc::new(judging_dispatcher(calls.clone())))
                .with_events(Arc::new(events.clone())),
        );
        let mut step = LicenseValidationStep::new(ctx.clone());

        let mut pass = cluster().pass(vdb);
        let err = step.reconcile(&mut pass).await.expect_err("community edition");
        assert!(matches!(err, Error::License { .. }));

        let status = stored_status(&store);
        let licenses = status.license_status.clone().expect("license status");
        assert_eq!(licenses.licenses.iter().filter(|l| l.valid).count(), 0);
        assert!(!status.is_condition_true(conditions::LICENSE_VALID));
        let notes = events.notes_for(reasons::LICENSE_VALIDATION_FAIL);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("Community Edition"));
        assert!(ctx.timestamps.get("default", "vertdb").is_some());

        // Gate closed: the recorded failure is returned without another check
        assert!(step.reconcile(&mut pass).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_valid_key_is_enough() {
        let vdb = licensed_vdb();
        let (mut kube, store) = stored_kube(vdb.clone());
        serving_secret(&mut kube, &[("good.dat", "abc"), ("old.dat", "expired")]);
        let events = RecordingEventPublisher::new();
        let ctx = Arc::new(
            Context::for_testing(Arc::new(kube))
                .with_dispatcher(Arc::new(judging_dispatcher(Arc::default())))
                .with_events(Arc::new(events.clone())),
        );

        let mut pass = cluster().pass(vdb);
        let outcome = LicenseValidationStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Done);

        let status = stored_status(&store);
        let licenses = status.license_status.clone().expect("license status").licenses;
        assert_eq!(
            licenses,
            vec![
                LicenseInfo {
                    key: "good.dat".to_string(),
                    valid: true,
                    digest: Some(ABC_DIGEST.to_string()),
                },
                LicenseInfo {
                    key: "old.dat".to_string(),
                    valid: false,
                    digest: None,
                },
            ]
        );
        assert!(status.is_condition_true(conditions::LICENSE_VALID));
        assert_eq!(events.reasons(), vec![reasons::LICENSE_VALIDATION_SUCCEEDED]);
    }

    #[tokio::test]
    async fn revalidates_only_after_the_interval() {
        let mut vdb = licensed_vdb();
        vdb.status = Some(vdb_common::crd::VerticaDBStatus {
            license_status: Some(LicenseStatus {
                license_secret: "license".to_string(),
                licenses: Vec::new(),
            }),
            ..Default::default()
        });
        let (mut kube, _) = stored_kube(vdb.clone());
        serving_secret(&mut kube, &[("good.dat", "abc")]);
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = Arc::new(
            Context::for_testing(Arc::new(kube))
                .with_dispatcher(Arc::new(judging_dispatcher(calls.clone()))),
        );
        let mut step = LicenseValidationStep::new(ctx.clone());
        let mut pass = cluster().pass(vdb);

        ctx.timestamps.set("default", "vertdb", Utc::now() - Duration::hours(1));
        step.reconcile(&mut pass).await.expect("fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        ctx.timestamps.set("default", "vertdb", Utc::now() - Duration::hours(25));
        step.reconcile(&mut pass).await.expect("stale");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_secret_is_validated_right_away() {
        let mut vdb = licensed_vdb();
        vdb.status = Some(vdb_common::crd::VerticaDBStatus {
            license_status: Some(LicenseStatus {
                license_secret: "old-license".to_string(),
                licenses: Vec::new(),
            }),
            ..Default::default()
        });
        let (mut kube, store) = stored_kube(vdb.clone());
        serving_secret(&mut kube, &[("good.dat", "abc")]);
        let ctx = Arc::new(
            Context::for_testing(Arc::new(kube))
                .with_dispatcher(Arc::new(judging_dispatcher(Arc::default()))),
        );
        ctx.timestamps.set("default", "vertdb", Utc::now());

        let mut pass = cluster().pass(vdb);
        LicenseValidationStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");
        assert_eq!(
            stored_status(&store).license_status.map(|l| l.license_secret),
            Some("license".to_string())
        );
    }

    #[tokio::test]
    async fn revalidation_rewrites_a_stale_failure_message() {
        let mut vdb = licensed_vdb();
        let mut status = vdb_common::crd::VerticaDBStatus {
            license_status: Some(LicenseStatus {
                license_secret: "old-license".to_string(),
                licenses: Vec::new(),
            }),
            ..Default::default()
        };
        status.set_condition(Condition::new(
            conditions::LICENSE_VALID,
            ConditionStatus::False,
            "NoValidLicense",
            "no valid Vertica license found in secret old-license",
        ));
        let recorded_at = status.conditions[0].last_transition_time;
        vdb.status = Some(status);
        let (mut kube, store) = stored_kube(vdb.clone());
        serving_secret(&mut kube, &[("ce.dat", "community")]);
        let ctx = Arc::new(
            Context::for_testing(Arc::new(kube))
                .with_dispatcher(Arc::new(judging_dispatcher(Arc::default()))),
        );

        let mut pass = cluster().pass(vdb);
        let err = LicenseValidationStep::new(ctx).reconcile(&mut pass).await.expect_err("still failing");
        assert!(matches!(err, Error::License { .. }));

        let status = stored_status(&store);
        let condition = status.condition(conditions::LICENSE_VALID).expect("condition").clone();
        assert_eq!(condition.status, ConditionStatus::False);
        assert!(condition.message.contains("Community Edition"));
        assert!(condition.message.contains("secret license"));
        assert_eq!(condition.last_transition_time, recorded_at);
    }

    #[tokio::test]
    async fn missing_secret_or_pod_requeues() {
        let vdb = licensed_vdb();
        let (mut kube, _) = stored_kube(vdb.clone());
        kube.expect_get_secret().returning(|_, _| Ok(None));
        let ctx = Arc::new(Context::for_testing(Arc::new(kube)));
        let mut pass = cluster().pass(vdb.clone());
        let outcome = LicenseValidationStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::RequeueNow);

        let (mut kube, _) = stored_kube(vdb.clone());
        serving_secret(&mut kube, &[("good.dat", "abc")]);
        let ctx = Arc::new(Context::for_testing(Arc::new(kube)));
        let mut pass = FakeCluster::default().pass(vdb);
        let outcome = LicenseValidationStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::RequeueNow);
    }

    #[tokio::test]
    async fn no_license_secret_is_done() {
        let ctx = Arc::new(Context::for_testing(Arc::new(crate::kube_client::MockKubeClient::new())));
        let mut pass = cluster().pass(sample_vdb("vertdb"));
        let outcome = LicenseValidationStep::new(ctx).reconcile(&mut pass).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Done);
    }
}
