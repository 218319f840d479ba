//! Per-object reconcilers.
//!
//! Every kind follows the same shape, get then upsert, but the fallback
//! ladder differs per kind:
//! - ConfigMap: update, and create on NotFound even when NotFound shows up
//!   mid-update.
//! - Service: update, else delete-and-recreate. Some service fields are
//!   immutable, so a failed update is resolved by replacement.
//! - Secret: an existing secret is authoritative and never updated in place.
//! - PodDisruptionBudget: update with ResourceVersion propagation; update
//!   failures are logged and swallowed.

use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use tracing::{error, info, warn};

use crate::controller::context::{
    Context, EVENT_ACTION_RECONCILE, EVENT_ACTION_UPDATE, EVENT_REASON_RECONCILE_FAILED,
    EVENT_REASON_UPDATE_FAILED, ReconcileCx,
};
use crate::controller::error::{Error, Result};
use crate::controller::kube::{create, delete_if_exists, get_opt, update};
use crate::model::topology::Installation;

fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Result<String> {
    meta.name
        .clone()
        .ok_or_else(|| Error::MissingField("metadata.name".to_string()))
}

/// Reconcile a ConfigMap belonging to the installation.
pub async fn reconcile_config_map(
    cx: &ReconcileCx,
    ctx: &Context,
    chi: &Installation,
    config_map: &ConfigMap,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let name = object_name(&config_map.metadata)?;
    let api = ctx.kube().config_maps(&chi.namespace);

    let result = match get_opt(&api, &name).await? {
        Some(cur) => {
            let mut desired = config_map.clone();
            desired.metadata.resource_version = cur.metadata.resource_version.clone();
            match update(&api, &name, &desired).await {
                Ok(_) => Ok(()),
                // The map can vanish mid-update; fall through to create.
                Err(e) if e.is_not_found() => create(&api, config_map).await.map(|_| ()),
                Err(e) => Err(e),
            }
        }
        None => create(&api, config_map).await.map(|_| ()),
    };

    if let Err(e) = &result {
        error!(
            config_map = %name,
            chi = %chi.namespace_name(),
            error = %e,
            "FAILED to reconcile ConfigMap"
        );
        ctx.publish_warning_event(
            chi,
            EVENT_REASON_RECONCILE_FAILED,
            EVENT_ACTION_RECONCILE,
            Some(format!("failed to reconcile ConfigMap {name}")),
        )
        .await;
    }

    result
}

/// Reconcile a Service belonging to the installation.
pub async fn reconcile_service(
    cx: &ReconcileCx,
    ctx: &Context,
    chi: &Installation,
    service: &Service,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let name = object_name(&service.metadata)?;
    let api = ctx.kube().services(&chi.namespace);

    let result = match get_opt(&api, &name).await? {
        Some(cur) => {
            info!(service = %name, chi = %chi.namespace_name(), "Service found, will try to update");
            let mut desired = service.clone();
            desired.metadata.resource_version = cur.metadata.resource_version.clone();
            // ClusterIP is immutable; carry the allocated address over.
            if let (Some(desired_spec), Some(cur_spec)) = (desired.spec.as_mut(), cur.spec.as_ref())
                && desired_spec.cluster_ip.is_none()
            {
                desired_spec.cluster_ip = cur_spec.cluster_ip.clone();
            }
            match update(&api, &name, &desired).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    if e.is_not_found() {
                        info!(service = %name, chi = %chi.namespace_name(), "Service vanished mid-update, will recreate");
                    } else {
                        warn!(service = %name, chi = %chi.namespace_name(), error = %e, "Service update failed, will recreate");
                        ctx.publish_warning_event(
                            chi,
                            EVENT_REASON_UPDATE_FAILED,
                            EVENT_ACTION_UPDATE,
                            Some(format!("failed to update Service {name}")),
                        )
                        .await;
                    }
                    delete_if_exists(&api, &name).await?;
                    create(&api, service).await.map(|_| ())
                }
            }
        }
        None => create(&api, service).await.map(|_| ()),
    };

    if let Err(e) = &result {
        error!(
            service = %name,
            chi = %chi.namespace_name(),
            error = %e,
            "FAILED to reconcile Service"
        );
        ctx.publish_warning_event(
            chi,
            EVENT_REASON_RECONCILE_FAILED,
            EVENT_ACTION_RECONCILE,
            Some(format!("failed to reconcile Service {name}")),
        )
        .await;
    }

    result
}

/// Reconcile a Secret belonging to the installation.
pub async fn reconcile_secret(
    cx: &ReconcileCx,
    ctx: &Context,
    chi: &Installation,
    secret: &Secret,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let name = object_name(&secret.metadata)?;
    let api = ctx.kube().secrets(&chi.namespace);

    // An existing secret is up to date by definition; it is never rewritten.
    if get_opt(&api, &name).await?.is_some() {
        return Ok(());
    }

    delete_if_exists(&api, &name).await?;
    let result = create(&api, secret).await.map(|_| ());

    if let Err(e) = &result {
        error!(
            secret = %name,
            chi = %chi.namespace_name(),
            error = %e,
            "FAILED to reconcile Secret"
        );
        ctx.publish_warning_event(
            chi,
            EVENT_REASON_RECONCILE_FAILED,
            EVENT_ACTION_RECONCILE,
            Some(format!("failed to reconcile Secret {name}")),
        )
        .await;
    }

    result
}

/// Reconcile a PodDisruptionBudget.
///
/// Update failures are logged but not propagated; a stale PDB is not worth
/// aborting the pass over. Create failures still surface.
pub async fn reconcile_pdb(
    cx: &ReconcileCx,
    ctx: &Context,
    chi: &Installation,
    pdb: &PodDisruptionBudget,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let name = object_name(&pdb.metadata)?;
    let api = ctx.kube().pdbs(&chi.namespace);

    match get_opt(&api, &name).await? {
        Some(cur) => {
            let mut desired = pdb.clone();
            desired.metadata.resource_version = cur.metadata.resource_version.clone();
            match update(&api, &name, &desired).await {
                Ok(_) => {
                    info!(pdb = %name, chi = %chi.namespace_name(), "PDB updated");
                }
                Err(e) => {
                    error!(pdb = %name, chi = %chi.namespace_name(), error = %e, "FAILED to update PDB");
                }
            }
            Ok(())
        }
        None => match create(&api, pdb).await {
            Ok(_) => {
                info!(pdb = %name, chi = %chi.namespace_name(), "PDB created");
                Ok(())
            }
            Err(e) => {
                error!(pdb = %name, chi = %chi.namespace_name(), error = %e, "FAILED to create PDB");
                Err(e)
            }
        },
    }
}
