//! Reconcile steps of the VerticaDB controller
//!
//! Each step owns one concern and runs against the shared [`Pass`]. Steps read
//! the desired spec, consult the pod facts (collecting them if stale), perform
//! at most one corrective operation per target set and persist what they
//! confirmed through the status store.
//!
//! [`Pass`]: crate::sequencer::Pass

mod add_node;
mod install;
mod license_validation;
mod password_secret;
mod pod_security;
mod remove_node;
mod sandbox_subcluster;
mod scale_statefulset;
mod service_account;
mod status;
mod tls_rollback;
mod tls_update;

pub use add_node::AddNodeStep;
pub use install::InstallStep;
pub use license_validation::LicenseValidationStep;
pub use password_secret::{scope_password, PasswordSecretStep};
pub use pod_security::PodSecurityStep;
pub use remove_node::RemoveNodeStep;
pub use sandbox_subcluster::SandboxSubclusterStep;
pub use scale_statefulset::ScaleStatefulSetStep;
pub use service_account::ServiceAccountStep;
pub use status::StatusStep;
pub use tls_rollback::TlsRollbackStep;
pub use tls_update::{rotate_tls, TlsUpdateStep};

use kube::runtime::events::EventType;
use kube::Resource;

use vdb_common::crd::{InitPolicy, SubclusterPodStatus, SubclusterStatus, VerticaDB};

use crate::context::Context;

/// Publish an event on the VerticaDB
pub(crate) async fn publish(
    ctx: &Context,
    vdb: &VerticaDB,
    type_: EventType,
    reason: &str,
    action: &str,
    note: impl Into<String>,
) {
    ctx.events
        .publish(&vdb.object_ref(&()), type_, reason, action, Some(note.into()))
        .await;
}

/// Scale steps leave pods alone when the operator only schedules them
pub(crate) fn is_schedule_only(vdb: &VerticaDB) -> bool {
    vdb.spec.init_policy == InitPolicy::ScheduleOnly
}

/// Detail row of a pod ordinal, growing the list as needed
pub(crate) fn pod_detail_mut(status: &mut SubclusterStatus, index: i32) -> &mut SubclusterPodStatus {
    let idx = usize::try_from(index).unwrap_or_default();
    if status.detail.len() <= idx {
        status.detail.resize_with(idx + 1, SubclusterPodStatus::default);
    }
    &mut status.detail[idx]
}

/// Recompute the counters of a subcluster from its detail rows
pub(crate) fn recount(status: &mut SubclusterStatus) {
    status.install_count = count(&status.detail, |d| d.installed);
    status.added_to_db_count = count(&status.detail, |d| d.added_to_db);
}

fn count(detail: &[SubclusterPodStatus], pred: impl Fn(&SubclusterPodStatus) -> bool) -> i32 {
    i32::try_from(detail.iter().filter(|d| pred(d)).count()).unwrap_or(i32::MAX)
}
