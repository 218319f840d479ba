//! Ready label/annotation management and operator self-labeling.
//!
//! The ready label on a host pod and the ready annotation on its service
//! reflect cluster membership: present while the host takes traffic, absent
//! while it is excluded. Installation-level services select on the label, so
//! flipping it is what actually drains or restores traffic.
//!
//! The self-labeler is a one-shot bootstrap helper: it stamps the operator's
//! own pod, the owning ReplicaSet, and the owning Deployment with the
//! operator build identity.

use tracing::{error, info, warn};

use crate::controller::context::{Context, ReconcileCx};
use crate::controller::error::{Error, Result};
use crate::controller::kube::{get_opt, update};
use crate::model::topology::Host;
use crate::resources::common::{
    append_ready_annotation, append_ready_label, delete_ready_annotation, delete_ready_label,
    operator_labels, pod_name,
};

/// Environment variables identifying the operator's own pod.
pub const OPERATOR_POD_NAME: &str = "OPERATOR_POD_NAME";
pub const OPERATOR_POD_NAMESPACE: &str = "OPERATOR_POD_NAMESPACE";

/// Stamp the ready label on the host's pod.
pub async fn append_label_ready_on_pod(cx: &ReconcileCx, ctx: &Context, host: &Host) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let api = ctx.kube().pods(&host.address.namespace);
    let name = pod_name(host);
    let Some(mut pod) = get_opt(&api, &name).await? else {
        error!(host = %host.name, "FAIL get pod for ready label");
        return Err(Error::MissingField(format!(
            "pod {}/{}",
            host.address.namespace, name
        )));
    };

    if append_ready_label(&mut pod.metadata) {
        update(&api, &name, &pod).await?;
    }
    Ok(())
}

/// Remove the ready label from the host's pod. Absence is the goal, so a
/// missing pod is success.
pub async fn delete_label_ready_on_pod(cx: &ReconcileCx, ctx: &Context, host: &Host) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let api = ctx.kube().pods(&host.address.namespace);
    let name = pod_name(host);
    // Pod may be missing when the StatefulSet runs zero replicas because the
    // installation is stopped.
    let Some(mut pod) = get_opt(&api, &name).await? else {
        return Ok(());
    };

    if delete_ready_label(&mut pod.metadata) {
        update(&api, &name, &pod).await?;
    }
    Ok(())
}

/// Stamp the ready annotation on the host's service.
pub async fn append_annotation_ready_on_service(
    cx: &ReconcileCx,
    ctx: &Context,
    host: &Host,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let kube = ctx.kube();
    let Some(mut service) = kube.get_host_service(host).await? else {
        error!(host = %host.name, "FAIL get service for ready annotation");
        return Err(Error::MissingField(format!(
            "service {}/{}",
            host.address.namespace, host.name
        )));
    };

    if append_ready_annotation(&mut service.metadata) {
        let api = kube.services(&host.address.namespace);
        let name = service
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| host.name.clone());
        update(&api, &name, &service).await?;
    }
    Ok(())
}

/// Remove the ready annotation from the host's service. Missing service is
/// success.
pub async fn delete_annotation_ready_on_service(
    cx: &ReconcileCx,
    ctx: &Context,
    host: &Host,
) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let kube = ctx.kube();
    let Some(mut service) = kube.get_host_service(host).await? else {
        return Ok(());
    };

    if delete_ready_annotation(&mut service.metadata) {
        let api = kube.services(&host.address.namespace);
        let name = service
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| host.name.clone());
        update(&api, &name, &service).await?;
    }
    Ok(())
}

/// Find the name of an owner of the given kind.
pub fn owner_of_kind(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    kind: &str,
) -> Option<String> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.kind == kind)
        .map(|owner| owner.name.clone())
}

/// Label the operator's own pod, its ReplicaSet, and its Deployment with the
/// operator build identity.
///
/// The pod is owned by a ReplicaSet which is owned by a Deployment; each is
/// labeled in that order, and a break anywhere in the chain is an error
/// naming the offending resource.
pub async fn label_operator_pod_tree(ctx: &Context) -> Result<()> {
    let name = std::env::var(OPERATOR_POD_NAME).unwrap_or_default();
    let namespace = std::env::var(OPERATOR_POD_NAMESPACE).unwrap_or_default();
    if name.is_empty() || namespace.is_empty() {
        error!("failed to read {OPERATOR_POD_NAME}/{OPERATOR_POD_NAMESPACE} env vars");
        return Err(Error::OperatorPodNotSpecified);
    }
    info!(namespace = %namespace, pod = %name, "labeling operator pod tree");

    let kube = ctx.kube();
    let labels = operator_labels(&ctx.operator);

    // Pod
    let pods = kube.pods(&namespace);
    let mut pod = get_opt(&pods, &name)
        .await?
        .ok_or_else(|| Error::LabelResource(format!("Pod {namespace}/{name}")))?;
    pod.metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(labels.clone());
    let pod = update(&pods, &name, &pod).await?;

    // ReplicaSet
    let rs_name = owner_of_kind(&pod.metadata, "ReplicaSet")
        .ok_or_else(|| Error::LabelResource(format!("ReplicaSet for Pod {namespace}/{name}")))?;
    let replica_sets = kube.replica_sets(&namespace);
    let mut replica_set = get_opt(&replica_sets, &rs_name)
        .await?
        .ok_or_else(|| Error::LabelResource(format!("ReplicaSet {namespace}/{rs_name}")))?;
    replica_set
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(labels.clone());
    let replica_set = update(&replica_sets, &rs_name, &replica_set).await?;

    // Deployment
    let deploy_name = owner_of_kind(&replica_set.metadata, "Deployment").ok_or_else(|| {
        Error::LabelResource(format!("Deployment for ReplicaSet {namespace}/{rs_name}"))
    })?;
    let deployments = kube.deployments(&namespace);
    let mut deployment = get_opt(&deployments, &deploy_name)
        .await?
        .ok_or_else(|| Error::LabelResource(format!("Deployment {namespace}/{deploy_name}")))?;
    deployment
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .extend(labels);
    if let Err(e) = update(&deployments, &deploy_name, &deployment).await {
        warn!(deployment = %deploy_name, error = %e, "failed to label Deployment");
        return Err(e);
    }

    Ok(())
}
