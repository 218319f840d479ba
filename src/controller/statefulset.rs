//! Nested StatefulSet reconciler.
//!
//! Owns the rolling-update protocol for host StatefulSets: create missing
//! sets and await readiness, update changed sets, recreate on data loss, and
//! report the skip/abort sentinels to the host reconciler. Spec equality is
//! decided by the settings digest stamped on the pod template plus the
//! replica count, so server-side defaulting never causes spurious updates.

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use tracing::{debug, info, warn};

use crate::controller::context::{Context, ReconcileCx};
use crate::controller::error::{Error, Result};
use crate::controller::kube::{create, delete_if_exists, update};
use crate::controller::poller::{PollerOptions, poll};
use crate::controller::task::Task;
use crate::model::topology::{Host, Installation};
use crate::resources::common::{ANNOTATION_SETTINGS_DIGEST, statefulset_name};

/// Options for one StatefulSet reconcile.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatefulSetReconcileOptions {
    /// Delete and recreate instead of updating. Set after data loss.
    pub force_recreate: bool,
}

/// Build the desired StatefulSet and store it on the host runtime.
///
/// `shutdown` produces a zero-replica set, the first phase of a forced
/// restart.
pub fn prepare_host_statefulset(task: &Task, host: &Host, shutdown: bool) {
    let desired = task.creator.stateful_set(host, shutdown);
    host.with_runtime(|r| r.desired_statefulset = Some(desired));
}

/// Whether the host must be restarted through the two-phase shutdown path
/// rather than a plain rolling update.
pub fn should_force_restart(chi: &Installation, host: &Host) -> bool {
    chi.reconciling.force_restart && host.attributes().is_modify()
}

/// Reconcile the host's StatefulSet toward the prepared desired state.
///
/// Returns `Error::CrudIgnore` when the live set already matches, and
/// `Error::CrudAbort` on create/update failures that the rolling protocol
/// cannot resolve.
pub async fn reconcile_statefulset(
    cx: &ReconcileCx,
    ctx: &Context,
    host: &Host,
    options: &StatefulSetReconcileOptions,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let kube = ctx.kube();
    let api = kube.stateful_sets(&host.address.namespace);
    let name = statefulset_name(host);

    let cur = kube.get_host_statefulset(host).await?;
    host.with_runtime(|r| r.cur_statefulset = cur.clone());

    let desired = host
        .with_runtime(|r| r.desired_statefulset.clone())
        .ok_or_else(|| Error::MissingField("desired StatefulSet".to_string()))?;

    match cur {
        None => {
            info!(statefulset = %name, host = %host.name, "creating StatefulSet");
            if let Err(e) = create(&api, &desired).await {
                warn!(statefulset = %name, error = %e, "FAILED to create StatefulSet");
                return Err(Error::CrudAbort);
            }
            wait_statefulset_ready(cx, ctx, host, &desired).await
        }
        Some(cur) => {
            if options.force_recreate {
                info!(statefulset = %name, host = %host.name, "recreating StatefulSet");
                delete_if_exists(&api, &name).await?;
                wait_statefulset_deleted(cx, ctx, host).await?;
                if let Err(e) = create(&api, &desired).await {
                    warn!(statefulset = %name, error = %e, "FAILED to recreate StatefulSet");
                    return Err(Error::CrudAbort);
                }
                return wait_statefulset_ready(cx, ctx, host, &desired).await;
            }

            if statefulset_specs_equal(&cur, &desired) {
                debug!(statefulset = %name, host = %host.name, "StatefulSet unchanged");
                return Err(Error::CrudIgnore);
            }

            info!(statefulset = %name, host = %host.name, "updating StatefulSet");
            let mut updated = desired.clone();
            updated.metadata.resource_version = cur.metadata.resource_version.clone();
            if let Err(e) = update(&api, &name, &updated).await {
                warn!(statefulset = %name, error = %e, "FAILED to update StatefulSet");
                return Err(Error::CrudAbort);
            }
            wait_statefulset_ready(cx, ctx, host, &desired).await
        }
    }
}

/// Live and desired sets are equal when their settings digests and replica
/// counts match. Server-defaulted fields are deliberately not compared.
pub fn statefulset_specs_equal(cur: &StatefulSet, desired: &StatefulSet) -> bool {
    template_digest(cur) == template_digest(desired) && replicas(cur) == replicas(desired)
}

fn template_digest(sts: &StatefulSet) -> Option<String> {
    sts.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(ANNOTATION_SETTINGS_DIGEST)
        .cloned()
}

fn replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

/// Await the rolling update: all desired replicas present and ready.
async fn wait_statefulset_ready(
    cx: &ReconcileCx,
    ctx: &Context,
    host: &Host,
    desired: &StatefulSet,
) -> Result<()> {
    let desired_replicas = replicas(desired);
    let kube = ctx.kube();
    let subject = format!("StatefulSet {} ready", statefulset_name(host));

    poll(cx, &subject, &PollerOptions::default(), || {
        let kube = kube.clone();
        async move {
            match kube.get_host_statefulset(host).await {
                Ok(Some(sts)) => {
                    let status = sts.status.unwrap_or_default();
                    let generation_observed =
                        sts.metadata.generation == status.observed_generation;
                    generation_observed
                        && status.replicas == desired_replicas
                        && status.ready_replicas.unwrap_or(0) == desired_replicas
                }
                _ => false,
            }
        }
    })
    .await
}

/// Await full deletion before recreation.
async fn wait_statefulset_deleted(cx: &ReconcileCx, ctx: &Context, host: &Host) -> Result<()> {
    let kube = ctx.kube();
    let subject = format!("StatefulSet {} deleted", statefulset_name(host));
    let options = PollerOptions {
        interval: Duration::from_secs(3),
        timeout: Duration::from_secs(120),
    };

    poll(cx, &subject, &options, || {
        let kube = kube.clone();
        async move { matches!(kube.get_host_statefulset(host).await, Ok(None)) }
    })
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::resources::factory::Creator;
    use crate::resources::test_support::{operator, test_installation};

    fn fixtures() -> (Arc<crate::model::topology::Installation>, Task) {
        let chi = Arc::new(test_installation("demo", 1, 2));
        let task = Task::new(Creator::new(chi.clone(), operator()));
        (chi, task)
    }

    #[test]
    fn test_prepare_stores_desired_statefulset() {
        let (chi, task) = fixtures();
        let host = chi.hosts()[0].clone();

        prepare_host_statefulset(&task, &host, false);
        let desired = host.with_runtime(|r| r.desired_statefulset.clone()).unwrap();
        assert_eq!(desired.spec.as_ref().unwrap().replicas, Some(1));

        prepare_host_statefulset(&task, &host, true);
        let desired = host.with_runtime(|r| r.desired_statefulset.clone()).unwrap();
        assert_eq!(desired.spec.as_ref().unwrap().replicas, Some(0));
    }

    #[test]
    fn test_specs_equal_by_digest_and_replicas() {
        let (chi, task) = fixtures();
        let host = chi.hosts()[0].clone();

        let a = task.creator.stateful_set(&host, false);
        let b = task.creator.stateful_set(&host, false);
        assert!(statefulset_specs_equal(&a, &b));

        // Shutdown variant differs in replicas only.
        let shutdown = task.creator.stateful_set(&host, true);
        assert!(!statefulset_specs_equal(&a, &shutdown));
    }

    #[test]
    fn test_digest_change_breaks_equality() {
        let (chi, task) = fixtures();
        let host = chi.hosts()[0].clone();

        let a = task.creator.stateful_set(&host, false);
        let mut b = task.creator.stateful_set(&host, false);
        b.spec
            .as_mut()
            .unwrap()
            .template
            .metadata
            .as_mut()
            .unwrap()
            .annotations
            .as_mut()
            .unwrap()
            .insert(ANNOTATION_SETTINGS_DIGEST.to_string(), "other".to_string());
        assert!(!statefulset_specs_equal(&a, &b));
    }

    #[test]
    fn test_force_restart_requires_flag_and_modify() {
        let (chi, _task) = fixtures();
        let host = chi.hosts()[0].clone();

        // No force_restart flag in the spec.
        assert!(!should_force_restart(&chi, &host));

        host.with_attributes(|a| a.set_modify());
        assert!(!should_force_restart(&chi, &host));
    }
}
