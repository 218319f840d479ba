//! Single-host reconciliation state machine.
//!
//! Drives one ClickHouse replica through the full update protocol:
//! exclude from traffic, drain, update config, detect data loss, reconcile
//! the StatefulSet and volumes, await ClickHouse readiness, migrate tables,
//! include back, report progress. Hosts within one shard run through this
//! sequentially; hosts on different shards may run concurrently.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::controller::chi;
use crate::controller::context::{
    Context, EVENT_ACTION_PROGRESS, EVENT_ACTION_RECONCILE, EVENT_REASON_PROGRESS_HOSTS_COMPLETED,
    EVENT_REASON_RECONCILE_COMPLETED, EVENT_REASON_RECONCILE_FAILED,
    EVENT_REASON_RECONCILE_STARTED, ReconcileCx,
};
use crate::controller::error::Result;
use crate::controller::labeler;
use crate::controller::objects;
use crate::controller::poller::{PollerOptions, poll};
use crate::controller::schemer::{
    MigrateTableOptions, UNKNOWN_VERSION, VersionOptions, record_host_version,
};
use crate::controller::statefulset::{
    StatefulSetReconcileOptions, prepare_host_statefulset, reconcile_statefulset,
    should_force_restart,
};
use crate::controller::storage;
use crate::controller::task::Task;
use crate::model::registry::ObjectKind;
use crate::model::topology::{Host, HostLifecycle, Installation};
use crate::resources::common::statefulset_name;

/// Reconcile one host.
pub async fn reconcile_host(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
    host: &Host,
) -> Result<()> {
    if cx.cancelled() {
        debug!(host = %host.name, "task is done");
        return Ok(());
    }

    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .host_reconcile_started(&chi.namespace, &chi.name);
    }
    let start_time = Instant::now();
    host.set_lifecycle(HostLifecycle::Reconciling);

    // The first host brackets the installation entry service: a stopped
    // installation loses it up front, a running one gets it back once the
    // first host finished.
    let first = host.is_first_in_installation();
    if first {
        chi::reconcile_chi_service_preliminary(cx, ctx, chi).await;
    }

    let result = match reconcile_host_main(cx, ctx, task, chi, host).await {
        Ok(()) => {
            host.set_lifecycle(HostLifecycle::Completed);

            let (completed, total) = chi.with_status(|status| {
                status.host_completed();
                (status.hosts_completed_count, status.hosts_count)
            });
            ctx.publish_normal_event(
                chi,
                EVENT_REASON_PROGRESS_HOSTS_COMPLETED,
                EVENT_ACTION_PROGRESS,
                Some(format!(
                    "{EVENT_REASON_PROGRESS_HOSTS_COMPLETED}: {completed} of {total}"
                )),
            )
            .await;

            let _ = chi::update_chi_status(ctx, chi).await;

            if let Some(health) = &ctx.health_state {
                health.metrics.host_reconcile_completed(
                    &chi.namespace,
                    &chi.name,
                    start_time.elapsed().as_secs_f64(),
                );
            }
            Ok(())
        }
        Err(e) => {
            host.set_lifecycle(HostLifecycle::Failed);
            if let Some(health) = &ctx.health_state {
                health
                    .metrics
                    .host_reconcile_error(&chi.namespace, &chi.name);
            }
            warn!(host = %host.name, error = %e, "reconcile host interrupted with an error");
            Err(e)
        }
    };

    // Deferred counterpart of the preliminary call above: runs after every
    // other step of this host, success or failure.
    if first {
        let _ = chi::reconcile_chi_service_final(cx, ctx, task, chi).await;
    }

    result
}

async fn reconcile_host_main(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
    host: &Host,
) -> Result<()> {
    let mut sts_options = StatefulSetReconcileOptions::default();
    let mut migrate_options = MigrateTableOptions::default();

    // Probe what is running before touching anything; the reconcile-started
    // event goes out regardless of the probe outcome.
    let version = get_host_clickhouse_version(
        ctx,
        chi,
        host,
        VersionOptions {
            skip_new: true,
            skip_stopped_ancestor: true,
            ..Default::default()
        },
    )
    .await;
    ctx.publish_normal_event(
        chi,
        EVENT_REASON_RECONCILE_STARTED,
        EVENT_ACTION_RECONCILE,
        Some(match &version {
            Ok(v) => format!("reconcile host {} started, version: {v}", host.name),
            Err(_) => format!("reconcile host {} started, version: {UNKNOWN_VERSION}", host.name),
        }),
    )
    .await;

    prepare_host_statefulset(task, host, false);

    // Wait for in-flight queries only when the host actually left the
    // cluster; otherwise new queries keep arriving and the wait is unbounded.
    if exclude_host(cx, ctx, chi, host).await {
        let _ = complete_queries(cx, ctx, host).await;
    }

    reconcile_host_config_map(cx, ctx, task, chi, host).await?;

    let _ = storage::set_has_data(ctx, host).await;

    info!(host = %host.name, "reconcile PVCs and check possible data loss");
    if let Err(e) = storage::reconcile_host_pvcs(cx, ctx, host).await {
        if e.is_data_loss() {
            // Existing volumes are gone: recreate the StatefulSet and run
            // table migration from scratch.
            sts_options.force_recreate = true;
            migrate_options = MigrateTableOptions {
                force_migrate: true,
                drop_replica: true,
            };
            info!(host = %host.name, "data loss detected, will force migrate");
        } else {
            warn!(host = %host.name, error = %e, "PVC pre-check failed");
        }
    }

    reconcile_host_statefulset(cx, ctx, task, chi, host, &sts_options).await?;

    // Polish volumes the StatefulSet just created.
    let _ = storage::reconcile_host_pvcs(cx, ctx, host).await;

    let _ = reconcile_host_service(cx, ctx, task, chi, host).await;

    host.with_attributes(|a| a.unset_add());

    // The service may need a moment after creation before ClickHouse is
    // reachable; tables cannot migrate until it is.
    match poll_host_for_version(cx, ctx, chi, host).await {
        Ok(version) => {
            info!(host = %host.name, version = %version, "host is alive before table migration");
        }
        Err(e) => {
            warn!(host = %host.name, error = %e, "host not confirmed alive before table migration");
        }
    }
    let _ = migrate_tables(cx, ctx, host, &migrate_options).await;

    include_host(cx, ctx, chi, host).await?;

    let version = poll_host_for_version(cx, ctx, chi, host).await;
    ctx.publish_normal_event(
        chi,
        EVENT_REASON_RECONCILE_COMPLETED,
        EVENT_ACTION_RECONCILE,
        Some(match &version {
            Ok(v) => format!("reconcile host {} completed, version: {v}", host.name),
            Err(_) => format!(
                "reconcile host {} completed, version: {UNKNOWN_VERSION}",
                host.name
            ),
        }),
    )
    .await;

    Ok(())
}

/// Probe the live ClickHouse version, honoring the skip options. A
/// successful probe records the parsed version on the host runtime.
pub async fn get_host_clickhouse_version(
    ctx: &Context,
    chi: &Installation,
    host: &Host,
    options: VersionOptions,
) -> Result<String> {
    let ancestor_stopped = chi.get_ancestor().is_some_and(|a| a.stopped);
    if let Some(reason) = options.should_skip(host, ancestor_stopped) {
        return Ok(reason.to_string());
    }

    match ctx.schemer.host_clickhouse_version(host).await {
        Ok(version) => {
            info!(host = %host.name, version = %version, "got ClickHouse version");
            record_host_version(host, &version);
            Ok(version)
        }
        Err(e) => {
            warn!(host = %host.name, error = %e, "failed to get ClickHouse version");
            Err(e)
        }
    }
}

/// Poll until the host answers the version query.
pub async fn poll_host_for_version(
    cx: &ReconcileCx,
    ctx: &Context,
    chi: &Installation,
    host: &Host,
) -> Result<String> {
    let found: Mutex<Option<String>> = Mutex::new(None);
    let subject = format!("ClickHouse version on host {}", host.name);

    poll(cx, &subject, &PollerOptions::default(), || {
        let found = &found;
        async move {
            match get_host_clickhouse_version(
                ctx,
                chi,
                host,
                VersionOptions {
                    skip_stopped: true,
                    ..Default::default()
                },
            )
            .await
            {
                Ok(version) => {
                    *found.lock().unwrap_or_else(|e| e.into_inner()) = Some(version);
                    true
                }
                Err(_) => {
                    warn!(host = %host.name, "host is NOT alive");
                    false
                }
            }
        }
    })
    .await?;

    Ok(found
        .into_inner()
        .unwrap_or_else(|e| e.into_inner())
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string()))
}

/// A host leaves traffic only when taking it out is both meaningful and
/// safe: it existed before, the installation is running, something about it
/// will change, and a sibling replica remains to serve the shard.
pub fn should_exclude(chi: &Installation, host: &Host) -> bool {
    if host.is_new() || chi.stopped {
        return false;
    }
    if host.replicas_in_shard <= 1 {
        return false;
    }
    host.attributes().is_modify() || should_force_restart(chi, host)
}

/// Take the host out of traffic. Returns whether exclusion happened.
async fn exclude_host(cx: &ReconcileCx, ctx: &Context, chi: &Installation, host: &Host) -> bool {
    if cx.cancelled() || !should_exclude(chi, host) {
        return false;
    }

    info!(host = %host.name, "excluding host from cluster");
    if let Err(e) = labeler::delete_label_ready_on_pod(cx, ctx, host).await {
        warn!(host = %host.name, error = %e, "failed to delete ready label");
    }
    if let Err(e) = labeler::delete_annotation_ready_on_service(cx, ctx, host).await {
        warn!(host = %host.name, error = %e, "failed to delete ready annotation");
    }
    true
}

/// Bring the host back into traffic. Fatal on failure: a host that cannot
/// rejoin the cluster is not reconciled.
async fn include_host(cx: &ReconcileCx, ctx: &Context, chi: &Installation, host: &Host) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }
    if chi.stopped {
        // Stopped installations have no traffic to include into.
        return Ok(());
    }

    info!(host = %host.name, "including host into cluster");
    labeler::append_label_ready_on_pod(cx, ctx, host).await?;
    labeler::append_annotation_ready_on_service(cx, ctx, host).await?;
    Ok(())
}

/// Wait for in-flight queries to finish after exclusion. Best-effort: a
/// stubborn long-running query must not wedge the reconcile.
async fn complete_queries(cx: &ReconcileCx, ctx: &Context, host: &Host) -> Result<()> {
    let subject = format!("queries drained on host {}", host.name);
    let options = PollerOptions {
        interval: Duration::from_secs(5),
        timeout: Duration::from_secs(120),
    };
    poll(cx, &subject, &options, || async {
        matches!(ctx.schemer.active_queries_count(host).await, Ok(0))
    })
    .await
}

async fn reconcile_host_config_map(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
    host: &Host,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let config_map = task.creator.config_map_host(host);
    let name = config_map.metadata.name.clone().unwrap_or_default();
    let result = objects::reconcile_config_map(cx, ctx, chi, &config_map).await;
    task.register_outcome(ObjectKind::ConfigMapHost, &chi.namespace, &name, &result);
    result
}

/// Reconcile the host's StatefulSet, restarting through zero replicas first
/// when a forced restart is required.
async fn reconcile_host_statefulset(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
    host: &Host,
    options: &StatefulSetReconcileOptions,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let version = get_host_clickhouse_version(
        ctx,
        chi,
        host,
        VersionOptions {
            skip_new: true,
            skip_stopped_ancestor: true,
            ..Default::default()
        },
    )
    .await
    .unwrap_or_else(|_| UNKNOWN_VERSION.to_string());
    info!(host = %host.name, version = %version, "reconcile StatefulSet start");

    if should_force_restart(chi, host) {
        // First rolling phase: scale to zero, then bring the desired set up.
        info!(host = %host.name, "shutting host down due to force restart");
        prepare_host_statefulset(task, host, true);
        let _ = reconcile_statefulset(cx, ctx, host, &StatefulSetReconcileOptions::default()).await;
        if let Some(health) = &ctx.health_state {
            health
                .metrics
                .host_reconcile_restart(&chi.namespace, &chi.name);
        }
    }

    prepare_host_statefulset(task, host, false);
    let result = reconcile_statefulset(cx, ctx, host, options).await;

    let name = statefulset_name(host);
    match result {
        Ok(()) => {
            task.register_reconciled(ObjectKind::StatefulSet, &chi.namespace, &name);
            Ok(())
        }
        Err(e) if e.is_ignore() => {
            // Pretend nothing happened in case of ignore.
            task.register_failed(ObjectKind::StatefulSet, &chi.namespace, &name);
            Ok(())
        }
        Err(e) => {
            task.register_failed(ObjectKind::StatefulSet, &chi.namespace, &name);
            chi.with_status(|status| {
                status.host_failed();
                status.push_error(format!("failed to reconcile StatefulSet for host {}", host.name));
            });
            ctx.publish_warning_event(
                chi,
                EVENT_REASON_RECONCILE_FAILED,
                EVENT_ACTION_RECONCILE,
                Some(format!("failed to reconcile StatefulSet for host {}", host.name)),
            )
            .await;
            Err(e)
        }
    }
}

async fn reconcile_host_service(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
    host: &Host,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    // The factory may omit the service; that is not a problem.
    let Some(service) = task.creator.service_host(host) else {
        return Ok(());
    };
    let name = service.metadata.name.clone().unwrap_or_default();
    let result = objects::reconcile_service(cx, ctx, chi, &service).await;
    task.register_outcome(ObjectKind::ServiceHost, &chi.namespace, &name, &result);
    result
}

/// Delegate table migration to the schemer.
async fn migrate_tables(
    cx: &ReconcileCx,
    ctx: &Context,
    host: &Host,
    options: &MigrateTableOptions,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }
    if host.is_stopped() {
        return Ok(());
    }

    if let Err(e) = ctx.schemer.migrate_tables(host, options).await {
        warn!(host = %host.name, error = %e, "table migration failed");
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::resources::test_support::{test_installation, test_stopped_installation};

    #[test]
    fn test_should_exclude_requires_sibling_and_change() {
        let chi = test_installation("demo", 1, 2);
        let host = chi.hosts()[0].clone();

        // No pending change: no exclusion.
        assert!(!should_exclude(&chi, &host));

        // Modified host with a sibling replica is excluded.
        host.with_attributes(|a| a.set_modify());
        assert!(should_exclude(&chi, &host));
    }

    #[test]
    fn test_should_exclude_skips_new_hosts() {
        let chi = test_installation("demo", 1, 2);
        let host = chi.hosts()[0].clone();
        host.with_attributes(|a| {
            a.set_new();
            a.set_modify();
        });
        assert!(!should_exclude(&chi, &host));
    }

    #[test]
    fn test_should_exclude_skips_lone_replica() {
        let chi = test_installation("demo", 2, 1);
        let host = chi.hosts()[0].clone();
        host.with_attributes(|a| a.set_modify());
        assert!(!should_exclude(&chi, &host));
    }

    #[test]
    fn test_should_exclude_skips_stopped_installation() {
        let chi = test_stopped_installation("demo", 1, 2);
        let host = chi.hosts()[0].clone();
        host.with_attributes(|a| a.set_modify());
        assert!(!should_exclude(&chi, &host));
    }
}
