//! Top-level installation reconciliation.
//!
//! The pipeline for one pass: generation gating, normalization against the
//! recorded ancestor, action plan, preliminary aux objects, clusters, shard
//! fan-out with a canary first shard, final aux objects, then cleanup and
//! completion marking. Traversal order is fixed and short-circuits on the
//! first error.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::controller::context::{
    Context, EVENT_ACTION_RECONCILE, EVENT_REASON_RECONCILE_COMPLETED,
    EVENT_REASON_RECONCILE_FAILED, EVENT_REASON_RECONCILE_STARTED, FIELD_MANAGER,
    ReconcileCx, ReconcileRuntimeConfig,
};
use crate::controller::error::{Error, Result};
use crate::controller::host::reconcile_host;
use crate::controller::kube::{delete_if_exists, list_labeled};
use crate::controller::objects;
use crate::controller::poller::{PollerOptions, poll};
use crate::controller::task::Task;
use crate::controller::zookeeper;
use crate::crd::{ClickHouseInstallation, ClusterSecretSource};
use crate::model::action_plan::ActionPlan;
use crate::model::normalizer::normalize;
use crate::model::registry::{ApiKind, ObjectKind};
use crate::model::topology::{Cluster, Installation, Shard};
use crate::resources::common::{LABEL_APP_NAME, LABEL_APP_VALUE, LABEL_CHI, chi_service_name};
use crate::resources::configmaps::CommonConfigOptions;
use crate::resources::factory::Creator;

/// Options travelling from the top of the pass into the shard fan-out.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReconcileShardsAndHostsOptions {
    /// Every host is newly added; no live service is being mutated, so
    /// maximal concurrency is safe.
    pub full_fan_out: bool,
}

/// Run one reconcile pass for an installation.
pub async fn reconcile_chi(
    cx: &ReconcileCx,
    ctx: &Arc<Context>,
    cr: &ClickHouseInstallation,
) -> Result<()> {
    if cx.cancelled() {
        debug!("task is done");
        return Ok(());
    }

    let namespace = cr.namespace().unwrap_or_else(|| "default".to_string());
    let name = cr.name_any();
    let ancestor = ctx.get_ancestor(&namespace, &name);

    // Idempotence gate: an ancestor from a completed pass with the same
    // generation means nothing structural changed.
    if is_generation_the_same(ancestor.as_deref(), cr) {
        info!(chi = %format!("{namespace}/{name}"), "generation unchanged, nothing to do");
        return Ok(());
    }

    if let Some(health) = &ctx.health_state {
        health.metrics.chi_init_zero_values(&namespace, &name);
        health.metrics.chi_reconcile_started(&namespace, &name);
    }
    let start_time = Instant::now();

    if ancestor.is_some() {
        info!(chi = %format!("{namespace}/{name}"), "has ancestor, using it as the base for reconcile");
    } else {
        info!(chi = %format!("{namespace}/{name}"), "has no ancestor, using empty base for reconcile");
    }

    // Normalization is pure; the ancestor is recorded on the new tree.
    let new = normalize(cr, ancestor.clone());
    let old = ancestor;

    let plan = ActionPlan::new(old.as_deref(), &new);
    if !plan.has_actions_to_do() {
        info!(chi = %new.namespace_name(), "action plan has no actions, nothing to do");
        return Ok(());
    }

    if cx.cancelled() {
        debug!("task is done");
        return Ok(());
    }

    let task = Arc::new(Task::new(Creator::new(new.clone(), ctx.operator.clone())));
    mark_reconcile_start(ctx, &new, &plan).await;
    if let Some(health) = &ctx.health_state {
        health.exclude_from_monitoring(&new.namespace, &new.name);
    }

    match reconcile(cx, ctx, &task, &new).await {
        Err(e) => {
            error!(chi = %new.namespace_name(), error = %e, "FAILED to reconcile CHI");
            ctx.publish_warning_event(
                &new,
                EVENT_REASON_RECONCILE_FAILED,
                EVENT_ACTION_RECONCILE,
                Some(format!("reconcile failed: {e}")),
            )
            .await;
            mark_reconcile_completed_unsuccessfully(ctx, &new, &e).await;
            if e.is_abort()
                && let Some(health) = &ctx.health_state
            {
                health.metrics.chi_reconcile_aborted(&new.namespace, &new.name);
            }
            Err(e)
        }
        Ok(()) => {
            if cx.cancelled() {
                debug!("task is done");
                return Ok(());
            }
            clean(cx, ctx, &task, &new).await;
            drop_replicas(cx, ctx, &plan).await;
            if let Some(health) = &ctx.health_state {
                health.add_to_monitoring(&new.namespace, &new.name);
            }
            wait_for_ip_addresses(cx, ctx, &new).await;
            finalize_reconcile_and_mark_completed(ctx, &new).await;
            ctx.set_ancestor(new.clone());

            if let Some(health) = &ctx.health_state {
                health.metrics.chi_reconcile_completed(
                    &new.namespace,
                    &new.name,
                    start_time.elapsed().as_secs_f64(),
                );
            }
            Ok(())
        }
    }
}

/// Structural idempotence: equal generations with a completed ancestor mean
/// no work. A missing ancestor (first reconcile, or right after finalizer
/// installation) always proceeds.
pub fn is_generation_the_same(ancestor: Option<&Installation>, cr: &ClickHouseInstallation) -> bool {
    match ancestor {
        Some(old) => old.generation == cr.metadata.generation.unwrap_or(0),
        None => false,
    }
}

/// The main recursion over the installation tree.
async fn reconcile(
    cx: &ReconcileCx,
    ctx: &Arc<Context>,
    task: &Arc<Task>,
    chi: &Arc<Installation>,
) -> Result<()> {
    if cx.cancelled() {
        debug!("task is done");
        return Ok(());
    }

    let counters = chi.count_attributes();
    let options = ReconcileShardsAndHostsOptions {
        full_fan_out: counters.add_only(),
    };
    if options.full_fan_out {
        info!(chi = %chi.namespace_name(), "enabling full fan-out mode");
    }

    reconcile_chi_aux_objects_preliminary(cx, ctx, task, chi).await?;
    for cluster in &chi.clusters {
        reconcile_cluster(cx, ctx, task, chi, cluster).await?;
    }
    // The fan-out runs once over the full installation-wide shard list, so
    // there is a single canary and concurrency is sized off the total.
    reconcile_shards_and_hosts(cx, ctx, task, chi, chi.shards(), &options).await?;
    reconcile_chi_aux_objects_final(cx, ctx, task, chi).await
}

/// Preliminary aux objects: the common and users config maps must exist
/// before any pod starts. Errors here are logged, not fatal.
async fn reconcile_chi_aux_objects_preliminary(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
) -> Result<()> {
    if cx.cancelled() {
        debug!("task is done");
        return Ok(());
    }

    // Common config without host entries yet.
    {
        let _guard = chi.runtime.common_config_lock.lock().await;
        let options = CommonConfigOptions { exclude_hosts: true };
        if let Err(e) = reconcile_chi_config_map_common(cx, ctx, task, chi, Some(&options)).await {
            error!(chi = %chi.namespace_name(), error = %e, "failed to reconcile config map common");
        }
    }

    if let Err(e) = reconcile_chi_config_map_users(cx, ctx, task, chi).await {
        error!(chi = %chi.namespace_name(), error = %e, "failed to reconcile config map users");
    }

    Ok(())
}

/// Final aux objects: rewrite the common config with everything that only
/// became known once the hosts are up.
async fn reconcile_chi_aux_objects_final(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
) -> Result<()> {
    if cx.cancelled() {
        debug!("task is done");
        return Ok(());
    }

    let _guard = chi.runtime.common_config_lock.lock().await;
    reconcile_chi_config_map_common(cx, ctx, task, chi, None).await
}

async fn reconcile_chi_config_map_common(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
    options: Option<&CommonConfigOptions>,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let config_map = task.creator.config_map_common(options);
    let name = config_map.metadata.name.clone().unwrap_or_default();
    let result = objects::reconcile_config_map(cx, ctx, chi, &config_map).await;
    task.register_outcome(ObjectKind::ConfigMapCommon, &chi.namespace, &name, &result);
    result
}

async fn reconcile_chi_config_map_users(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let config_map = task.creator.config_map_users();
    let name = config_map.metadata.name.clone().unwrap_or_default();
    let result = objects::reconcile_config_map(cx, ctx, chi, &config_map).await;
    task.register_outcome(ObjectKind::ConfigMapUsers, &chi.namespace, &name, &result);
    result
}

/// First stage of the installation entry service: a stopped installation
/// must have no entry point.
pub async fn reconcile_chi_service_preliminary(cx: &ReconcileCx, ctx: &Context, chi: &Installation) {
    if cx.cancelled() {
        return;
    }
    if chi.stopped {
        let api = ctx.kube().services(&chi.namespace);
        let _ = delete_if_exists(&api, &chi_service_name(chi)).await;
    }
}

/// Second stage: create the entry point for a running installation.
pub async fn reconcile_chi_service_final(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
) -> Result<()> {
    if cx.cancelled() || chi.stopped {
        return Ok(());
    }

    let Some(service) = task.creator.service_cr() else {
        return Ok(());
    };
    let name = service.metadata.name.clone().unwrap_or_default();
    let result = objects::reconcile_service(cx, ctx, chi, &service).await;
    task.register_outcome(ObjectKind::ServiceCr, &chi.namespace, &name, &result);
    result
}

/// Cluster-scoped objects: service, optional auto-secret, PDB, Zookeeper
/// root path.
async fn reconcile_cluster(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
    cluster: &Cluster,
) -> Result<()> {
    if cx.cancelled() {
        debug!("task is done");
        return Ok(());
    }

    if let Some(service) = task.creator.service_cluster(cluster) {
        let name = service.metadata.name.clone().unwrap_or_default();
        let result = objects::reconcile_service(cx, ctx, chi, &service).await;
        task.register_outcome(ObjectKind::ServiceCluster, &chi.namespace, &name, &result);
    }

    if cluster.secret_source == ClusterSecretSource::Auto
        && let Some(secret) = task.creator.cluster_auto_secret(cluster)
    {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let result = objects::reconcile_secret(cx, ctx, chi, &secret).await;
        task.register_outcome(ObjectKind::ClusterAutoSecret, &chi.namespace, &name, &result);
    }

    let pdb = task.creator.pod_disruption_budget(cluster);
    let name = pdb.metadata.name.clone().unwrap_or_default();
    let result = objects::reconcile_pdb(cx, ctx, chi, &pdb).await;
    task.register_outcome(ObjectKind::Pdb, &chi.namespace, &name, &result);

    zookeeper::reconcile_root_path(ctx.zookeeper.as_deref(), cluster).await;
    Ok(())
}

/// How many shard workers the fan-out may use.
pub fn reconcile_shards_workers_num(
    shards_count: usize,
    full_fan_out: bool,
    config: &ReconcileRuntimeConfig,
) -> usize {
    let available_workers = config.reconcile_shards_threads_number as f64;
    if full_fan_out {
        // For full fan-out scenarios use all available workers.
        // Always allow at least 1 worker.
        return available_workers.max(1.0) as usize;
    }

    // For non-full fan-out scenarios respect the max concurrency percentage.
    // Always allow at least 1 worker.
    let percent = config.reconcile_shards_max_concurrency_percent as f64;
    let max_allowed_workers = ((percent / 100.0) * shards_count as f64).round().max(1.0);
    available_workers.min(max_allowed_workers).max(1.0) as usize
}

/// Cohort index ranges: disjoint, in order, covering `start..total`, each at
/// most `workers` wide.
pub fn cohort_ranges(total: usize, start: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let mut ranges = Vec::new();
    let mut cohort_start = start;
    while cohort_start < total {
        let cohort_end = (cohort_start + workers).min(total);
        ranges.push(cohort_start..cohort_end);
        cohort_start = cohort_end;
    }
    ranges
}

/// Fan shards out with a sequential canary and bounded cohorts.
///
/// Operates on the full installation-wide shard list: one canary for the
/// whole CHI, and cohort width computed from the total shard count.
async fn reconcile_shards_and_hosts(
    cx: &ReconcileCx,
    ctx: &Arc<Context>,
    task: &Arc<Task>,
    chi: &Arc<Installation>,
    shards: Vec<(Arc<Cluster>, Arc<Shard>)>,
    options: &ReconcileShardsAndHostsOptions,
) -> Result<()> {
    if shards.is_empty() {
        return Ok(());
    }

    let start_shard = if options.full_fan_out {
        // For full fan-out scenarios start concurrent processing from the
        // very beginning.
        info!("full fan-out requested");
        0
    } else {
        // Process the first shard separately. It is an early indicator of
        // whether the reconcile would fail, and for large clusters a small
        // price to pay before the concurrent fan-out.
        info!("starting first shard separately");
        let (cluster, shard) = &shards[0];
        if let Err(e) = reconcile_shard_with_hosts(cx, ctx, task, chi, cluster, shard).await {
            warn!(error = %e, "first shard failed, skipping rest of shards");
            return Err(e);
        }
        1
    };

    let workers_num = reconcile_shards_workers_num(shards.len(), options.full_fan_out, &ctx.config);
    info!(workers = workers_num, "starting rest of shards");

    for range in cohort_ranges(shards.len(), start_shard, workers_num) {
        let mut cohort = JoinSet::new();
        for (cluster, shard) in shards[range].iter().cloned() {
            let cx = cx.clone();
            let ctx = ctx.clone();
            let task = task.clone();
            let chi = chi.clone();
            cohort.spawn(async move {
                reconcile_shard_with_hosts(&cx, &ctx, &task, &chi, &cluster, &shard).await
            });
        }

        // Join the whole cohort before deciding; first error wins.
        let mut first_error: Option<Error> = None;
        while let Some(joined) = cohort.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_error) => {
                    error!(error = %join_error, "shard worker panicked");
                    if first_error.is_none() {
                        first_error = Some(Error::CrudAbort);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            warn!(error = %e, "skipping rest of shards due to an error");
            return Err(e);
        }
    }
    Ok(())
}

/// Shard objects first, then its hosts strictly in order: they are replicas
/// of one another and must not be disrupted in parallel.
async fn reconcile_shard_with_hosts(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
    cluster: &Cluster,
    shard: &Shard,
) -> Result<()> {
    reconcile_shard(cx, ctx, task, chi, cluster, shard).await?;
    for host in &shard.hosts {
        reconcile_host(cx, ctx, task, chi, host).await?;
    }
    Ok(())
}

async fn reconcile_shard(
    cx: &ReconcileCx,
    ctx: &Context,
    task: &Task,
    chi: &Installation,
    cluster: &Cluster,
    shard: &Shard,
) -> Result<()> {
    if cx.cancelled() {
        debug!("task is done");
        return Ok(());
    }

    // The factory may omit the shard service.
    let Some(service) = task.creator.service_shard(cluster, shard) else {
        return Ok(());
    };
    let name = service.metadata.name.clone().unwrap_or_default();
    let result = objects::reconcile_service(cx, ctx, chi, &service).await;
    task.register_outcome(ObjectKind::ServiceShard, &chi.namespace, &name, &result);
    result
}

/// Label selector matching every object this operator manages for one
/// installation.
fn chi_object_selector(chi_name: &str) -> String {
    format!("{LABEL_APP_NAME}={LABEL_APP_VALUE},{LABEL_CHI}={chi_name}")
}

/// Delete objects labeled for the installation that this pass did not
/// produce. Volumes are deliberately left alone.
async fn clean(cx: &ReconcileCx, ctx: &Context, task: &Task, chi: &Installation) {
    if cx.cancelled() {
        debug!("task is done");
        return;
    }

    let selector = chi_object_selector(&chi.name);
    let kube = ctx.kube();

    clean_kind(task, ApiKind::Service, &kube.services(&chi.namespace), &selector).await;
    clean_kind(task, ApiKind::ConfigMap, &kube.config_maps(&chi.namespace), &selector).await;
    clean_kind(task, ApiKind::Secret, &kube.secrets(&chi.namespace), &selector).await;
    clean_kind(task, ApiKind::Pdb, &kube.pdbs(&chi.namespace), &selector).await;
    clean_kind(task, ApiKind::StatefulSet, &kube.stateful_sets(&chi.namespace), &selector).await;
}

async fn clean_kind<K>(task: &Task, kind: ApiKind, api: &Api<K>, selector: &str)
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let list = match list_labeled(api, selector).await {
        Ok(list) => list,
        Err(e) => {
            warn!(kind = ?kind, error = %e, "cleanup list failed");
            return;
        }
    };

    for obj in list.items {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_default();
        if task.is_registered(kind, &namespace, &name) {
            continue;
        }
        info!(kind = ?kind, object = %format!("{namespace}/{name}"), "deleting stranded object");
        if let Err(e) = delete_if_exists(api, &name).await {
            warn!(kind = ?kind, object = %name, error = %e, "cleanup delete failed");
        }
    }
}

/// Remove every managed object of an installation. Used on resource
/// deletion.
pub async fn delete_installation_objects(ctx: &Context, namespace: &str, chi_name: &str) {
    let selector = chi_object_selector(chi_name);
    let kube = ctx.kube();
    // An empty registry makes cleanup delete everything that matches.
    let chi = normalize(&placeholder_cr(namespace, chi_name), None);
    let task = Task::new(Creator::new(chi, ctx.operator.clone()));

    clean_kind(&task, ApiKind::StatefulSet, &kube.stateful_sets(namespace), &selector).await;
    clean_kind(&task, ApiKind::Service, &kube.services(namespace), &selector).await;
    clean_kind(&task, ApiKind::ConfigMap, &kube.config_maps(namespace), &selector).await;
    clean_kind(&task, ApiKind::Secret, &kube.secrets(namespace), &selector).await;
    clean_kind(&task, ApiKind::Pdb, &kube.pdbs(namespace), &selector).await;
}

fn placeholder_cr(namespace: &str, name: &str) -> ClickHouseInstallation {
    ClickHouseInstallation {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Default::default(),
        status: None,
    }
}

/// Drop replication metadata of hosts removed by the plan. Best-effort.
async fn drop_replicas(cx: &ReconcileCx, ctx: &Context, plan: &ActionPlan) {
    for host in plan.removed_hosts() {
        if cx.cancelled() {
            debug!("task is done");
            return;
        }
        match ctx.schemer.drop_replica(host).await {
            Ok(()) => info!(host = %host.name, "dropped replica"),
            Err(e) => warn!(host = %host.name, error = %e, "failed to drop replica"),
        }
    }
}

/// Wait until every host pod reports an IP address. Best-effort.
async fn wait_for_ip_addresses(cx: &ReconcileCx, ctx: &Context, chi: &Installation) {
    if chi.stopped {
        return;
    }

    let kube = ctx.kube();
    let hosts = chi.hosts();
    let options = PollerOptions {
        interval: Duration::from_secs(3),
        timeout: Duration::from_secs(60),
    };

    let result = poll(cx, "host pod IP addresses", &options, || {
        let kube = kube.clone();
        let hosts = &hosts;
        async move {
            for host in hosts {
                let has_ip = matches!(
                    kube.get_host_pod(host).await,
                    Ok(Some(pod)) if pod.status.as_ref().and_then(|s| s.pod_ip.as_ref()).is_some()
                );
                if !has_ip {
                    return false;
                }
            }
            true
        }
    })
    .await;

    if let Err(e) = result {
        warn!(chi = %chi.namespace_name(), error = %e, "not all host pods have IP addresses");
    }
}

async fn mark_reconcile_start(ctx: &Context, chi: &Installation, plan: &ActionPlan) {
    let counters = plan.counters();
    chi.with_status(|status| {
        status.status = "InProgress".to_string();
        status.hosts_completed_count = 0;
        status.push_action(format!(
            "reconcile started: add {}, modify {}, remove {}",
            counters.add, counters.modify, counters.remove
        ));
    });
    ctx.publish_normal_event(
        chi,
        EVENT_REASON_RECONCILE_STARTED,
        EVENT_ACTION_RECONCILE,
        Some(format!("reconcile started for {}", chi.namespace_name())),
    )
    .await;
    let _ = update_chi_status(ctx, chi).await;
}

async fn mark_reconcile_completed_unsuccessfully(ctx: &Context, chi: &Installation, error: &Error) {
    chi.with_status(|status| {
        status.status = "Aborted".to_string();
        status.push_error(format!("reconcile failed: {error}"));
    });
    let _ = update_chi_status(ctx, chi).await;
}

async fn finalize_reconcile_and_mark_completed(ctx: &Context, chi: &Installation) {
    chi.with_status(|status| {
        status.status = "Completed".to_string();
        status.observed_generation = Some(chi.generation);
        status.push_action("reconcile completed".to_string());
    });
    let _ = update_chi_status(ctx, chi).await;
    ctx.publish_normal_event(
        chi,
        EVENT_REASON_RECONCILE_COMPLETED,
        EVENT_ACTION_RECONCILE,
        Some(format!("reconcile completed for {}", chi.namespace_name())),
    )
    .await;
}

/// Persist the in-memory status to the CHI subresource. Only the fields this
/// operator owns are patched, so concurrent writers of ancillary fields are
/// not clobbered.
pub async fn update_chi_status(ctx: &Context, chi: &Installation) -> Result<()> {
    let api: Api<ClickHouseInstallation> = Api::namespaced(ctx.client.clone(), &chi.namespace);
    let status = chi.status_snapshot();
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &chi.name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
