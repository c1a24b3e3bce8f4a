//! Optimistic read-modify-write of VerticaDB status and spec
//!
//! Every write re-reads the object, applies a pure mutation to the fresh copy
//! and writes it back under the fresh resourceVersion. A 409 restarts the
//! cycle; after [`RetryConfig::on_conflict`] is exhausted the update fails
//! with [`Error::Conflict`]. The caller's copy is replaced with what the API
//! server returned so later steps in the pass see the new state.

use kube::ResourceExt;
use tracing::debug;

use vdb_common::crd::{Condition, VerticaDB, VerticaDBSpec, VerticaDBStatus};
use vdb_common::retry::{retry_if, RetryConfig};
use vdb_common::{Error, Result};

use crate::kube_client::KubeClient;

async fn fetch(kube: &dyn KubeClient, namespace: &str, name: &str) -> Result<VerticaDB> {
    kube.get_vdb(namespace, name)
        .await?
        .ok_or_else(|| Error::validation_for(name, "VerticaDB no longer exists"))
}

fn exhausted(vdb: &VerticaDB, config: &RetryConfig, e: Error) -> Error {
    if e.is_conflict() {
        Error::conflict(format!("verticadb/{}", vdb.key()), config.max_attempts)
    } else {
        e
    }
}

/// Apply `mutate` to the status of `vdb` and persist it.
///
/// `mutate` may run several times and must derive the new status only from
/// the one it is given. A mutation that changes nothing skips the write.
pub async fn update_status<F>(kube: &dyn KubeClient, vdb: &mut VerticaDB, mutate: F) -> Result<()>
where
    F: Fn(&mut VerticaDBStatus) + Send + Sync,
{
    let config = RetryConfig::on_conflict();
    let ns = vdb.namespace_or_default();
    let name = vdb.name_any();
    let (ns, name, mutate) = (&ns, &name, &mutate);

    let result = retry_if(
        &config,
        "update_status",
        |e: &Error| e.is_conflict(),
        || async move {
            let mut current = fetch(kube, ns, name).await?;
            let before = current.status.clone();
            let mut status = current.status.take().unwrap_or_default();
            mutate(&mut status);
            if before.as_ref() == Some(&status) {
                current.status = Some(status);
                return Ok(current);
            }
            current.status = Some(status);
            kube.replace_vdb_status(&current).await
        },
    )
    .await;

    let updated = result.map_err(|e| exhausted(vdb, &config, e))?;
    debug!(vdb = %name, "status updated");
    *vdb = updated;
    Ok(())
}

/// Apply `mutate` to the spec of `vdb` and persist it.
///
/// Only used for the backfills the operator owns (sandbox images, pod
/// security ids, TLS reversion during rollback).
pub async fn update_spec<F>(kube: &dyn KubeClient, vdb: &mut VerticaDB, mutate: F) -> Result<()>
where
    F: Fn(&mut VerticaDBSpec) + Send + Sync,
{
    let config = RetryConfig::on_conflict();
    let ns = vdb.namespace_or_default();
    let name = vdb.name_any();
    let (ns, name, mutate) = (&ns, &name, &mutate);

    let result = retry_if(
        &config,
        "update_spec",
        |e: &Error| e.is_conflict(),
        || async move {
            let mut current = fetch(kube, ns, name).await?;
            let before = current.spec.clone();
            mutate(&mut current.spec);
            if current.spec == before {
                return Ok(current);
            }
            kube.replace_vdb(&current).await
        },
    )
    .await;

    let updated = result.map_err(|e| exhausted(vdb, &config, e))?;
    debug!(vdb = %name, "spec updated");
    *vdb = updated;
    Ok(())
}

/// Set one condition
pub async fn update_condition(
    kube: &dyn KubeClient,
    vdb: &mut VerticaDB,
    condition: Condition,
) -> Result<()> {
    update_status(kube, vdb, move |status| {
        status.set_condition(condition.clone())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::kube_client::MockKubeClient;
    use crate::testing::{conflict_error, sample_vdb, stored_kube, StatusCapture};
    use vdb_common::crd::{conditions, SandboxStatus};

    #[tokio::test]
    async fn story_mutation_applies_to_fresh_copy() {
        // Another writer already recorded sandbox1; our mutation must keep it
        let mut fresh = sample_vdb("vertdb");
        fresh.status = Some(VerticaDBStatus {
            sandboxes: vec![SandboxStatus {
                name: "sandbox1".to_string(),
                subclusters: vec!["sc2".to_string()],
                password_secret: None,
            }],
            ..Default::default()
        });
        let (kube, store) = stored_kube(fresh);
        let mut stale = sample_vdb("vertdb");

        update_status(&kube, &mut stale, |s| {
            s.password_secret = Some("su-secret".to_string())
        })
        .await
        .expect("update");

        let stored = store.lock().expect("lock").clone();
        let status = stored.status.expect("status");
        assert_eq!(status.sandboxes.len(), 1);
        assert_eq!(status.password_secret.as_deref(), Some("su-secret"));
        assert_eq!(
            stale.status.and_then(|s| s.password_secret),
            Some("su-secret".to_string())
        );
    }

    #[tokio::test]
    async fn conflict_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let capture = StatusCapture::new();
        let mut kube = MockKubeClient::new();
        kube.expect_get_vdb()
            .returning(|_, name| Ok(Some(sample_vdb(name))));
        let (a, c) = (attempts.clone(), capture.clone());
        kube.expect_replace_vdb_status().returning(move |vdb| {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(conflict_error());
            }
            c.record(vdb.status.clone().unwrap_or_default());
            Ok(vdb.clone())
        });

        let mut vdb = sample_vdb("vertdb");
        update_condition(
            &kube,
            &mut vdb,
            Condition::truthy(conditions::DB_INITIALIZED, "Initialized"),
        )
        .await
        .expect("update");

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(capture
            .last()
            .is_some_and(|s| s.is_condition_true(conditions::DB_INITIALIZED)));
        assert!(vdb.is_db_initialized());
    }

    #[tokio::test]
    async fn exhausted_conflicts_surface_as_conflict_error() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_vdb()
            .returning(|_, name| Ok(Some(sample_vdb(name))));
        kube.expect_replace_vdb_status()
            .times(5)
            .returning(|_| Err(conflict_error()));

        let mut vdb = sample_vdb("vertdb");
        let err = update_status(&kube, &mut vdb, |s| s.password_secret = Some("x".to_string()))
            .await
            .expect_err("should give up");
        assert!(matches!(err, Error::Conflict { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_vdb().returning(|_, name| {
            let mut vdb = sample_vdb(name);
            vdb.status = Some(VerticaDBStatus {
                password_secret: Some("x".to_string()),
                ..Default::default()
            });
            Ok(Some(vdb))
        });
        kube.expect_replace_vdb_status().never();

        let mut vdb = sample_vdb("vertdb");
        update_status(&kube, &mut vdb, |s| s.password_secret = Some("x".to_string()))
            .await
            .expect("update");
    }

    #[tokio::test]
    async fn spec_backfill_goes_through_replace() {
        let (kube, store) = stored_kube(sample_vdb("vertdb"));
        let mut vdb = sample_vdb("vertdb");
        update_spec(&kube, &mut vdb, |spec| {
            spec.service_account_name = Some("vertica-sa".to_string())
        })
        .await
        .expect("update");

        let stored = store.lock().expect("lock").clone();
        assert_eq!(stored.spec.service_account_name.as_deref(), Some("vertica-sa"));
    }

    #[tokio::test]
    async fn deleted_resource_is_not_retried() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_vdb().times(1).returning(|_, _| Ok(None));
        let mut vdb = sample_vdb("vertdb");
        let err = update_status(&kube, &mut vdb, |_| {})
            .await
            .expect_err("should fail");
        assert!(matches!(err, Error::Validation { .. }));
    }
}
